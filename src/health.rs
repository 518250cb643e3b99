use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, StatusCode, Uri};
use log::debug;
use std::{cmp, error::Error as _, fmt, io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
  sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
  time::{self, Instant, MissedTickBehavior},
};

const HEALTH_PATH: &str = "/health";
const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
  #[error("cause=http-error code={}", .0.as_u16())]
  Http(StatusCode),
  #[error("cause=network code={0}")]
  Network(String),
}

/// Outcome of one probe against one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
  pub backend: String,
  pub available: bool,
  pub error: Option<ProbeError>,
}

impl HealthEvent {
  fn from_probe(backend: String, result: Result<(), ProbeError>) -> HealthEvent {
    match result {
      Ok(()) => HealthEvent {
        backend,
        available: true,
        error: None,
      },
      Err(error) => HealthEvent {
        backend,
        available: false,
        error: Some(error),
      },
    }
  }
}

pub type HealthEvents = UnboundedReceiver<HealthEvent>;

#[async_trait]
pub trait Probe: Send + Sync {
  async fn probe(&self, backend: &str) -> Result<(), ProbeError>;
}

/// Issues `GET http://<backend>/health`; any 2xx counts as healthy.
pub struct HttpProbe {
  client: Client<HttpConnector, Body>,
}

impl HttpProbe {
  pub fn new() -> HttpProbe {
    HttpProbe { client: Client::new() }
  }
}

#[async_trait]
impl Probe for HttpProbe {
  async fn probe(&self, backend: &str) -> Result<(), ProbeError> {
    let uri: Uri = format!("http://{}{}", backend, HEALTH_PATH)
      .parse()
      .map_err(|_| ProbeError::Network("invalid-address".into()))?;
    let response = self
      .client
      .get(uri)
      .await
      .map_err(|e| ProbeError::Network(network_code(&e)))?;

    if response.status().is_success() {
      Ok(())
    } else {
      Err(ProbeError::Http(response.status()))
    }
  }
}

/// Short tag for a transport failure, preferring the kind of the underlying io error.
pub fn network_code(error: &hyper::Error) -> String {
  let mut source = error.source();
  while let Some(cause) = source {
    if let Some(io_error) = cause.downcast_ref::<io::Error>() {
      return format!("{:?}", io_error.kind());
    }
    source = cause.source();
  }

  if error.is_timeout() {
    "timeout".into()
  } else if error.is_closed() || error.is_incomplete_message() {
    "closed".into()
  } else if error.is_connect() {
    "connect".into()
  } else {
    "unknown".into()
  }
}

/// Probes the backends batch by batch: one batch per tick, so that the whole pool is covered once per period.
pub struct HealthChecker {
  batches: Vec<Vec<String>>,
  tick: Duration,
  probe: Arc<dyn Probe>,
}

impl fmt::Debug for HealthChecker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HealthChecker")
      .field("batches", &self.batches)
      .field("tick", &self.tick)
      .finish()
  }
}

impl HealthChecker {
  pub fn new(servers: &[String], period: Duration, parallelism: usize) -> HealthChecker {
    HealthChecker::with_probe(servers, period, parallelism, Arc::new(HttpProbe::new()))
  }

  pub fn with_probe(servers: &[String], period: Duration, parallelism: usize, probe: Arc<dyn Probe>) -> HealthChecker {
    let batches = batch(servers, parallelism);
    let tick = tick_interval(period, batches.len());
    HealthChecker { batches, tick, probe }
  }

  pub fn batches(&self) -> &[Vec<String>] {
    &self.batches
  }

  pub fn tick_interval(&self) -> Duration {
    self.tick
  }

  /// Starts the schedule on the current tokio runtime. The returned receiver is the only subscriber;
  /// dropping it stops the schedule at its next tick.
  pub fn run(self) -> HealthEvents {
    let (sender, receiver) = unbounded_channel();
    if !self.batches.is_empty() {
      tokio::spawn(self.schedule(sender));
    }
    receiver
  }

  async fn schedule(self, sender: UnboundedSender<HealthEvent>) {
    // the first batch is probed one tick after start, not immediately
    let mut ticker = time::interval_at(Instant::now() + self.tick, self.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for (index, batch) in self.batches.iter().enumerate().cycle() {
      ticker.tick().await;
      if sender.is_closed() {
        debug!("type=health-check message=\"listener is gone, stopping\"");
        return;
      }

      debug!("type=health-check message=\"probing batch\" batch={} servers={:?}", index, batch);
      for backend in batch {
        let probe = self.probe.clone();
        let sender = sender.clone();
        let backend = backend.clone();
        // probes are not awaited here: a slow backend must not delay the next tick
        tokio::spawn(async move {
          let result = probe.probe(&backend).await;
          let _ = sender.send(HealthEvent::from_probe(backend, result));
        });
      }
    }
  }
}

fn batch(servers: &[String], parallelism: usize) -> Vec<Vec<String>> {
  servers
    .chunks(cmp::max(parallelism, 1))
    .map(<[String]>::to_vec)
    .collect()
}

fn tick_interval(period: Duration, batch_count: usize) -> Duration {
  if batch_count == 0 {
    return period;
  }
  let millis = period.as_millis() / batch_count as u128;
  cmp::max(Duration::from_millis(millis as u64), MIN_TICK)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{spawn_backend, unused_address};
  use hyper::Response;
  use std::collections::HashSet;

  struct FakeProbe {
    unhealthy: HashSet<String>,
  }

  impl FakeProbe {
    fn healthy() -> Arc<FakeProbe> {
      Arc::new(FakeProbe {
        unhealthy: HashSet::new(),
      })
    }
  }

  #[async_trait]
  impl Probe for FakeProbe {
    async fn probe(&self, backend: &str) -> Result<(), ProbeError> {
      if self.unhealthy.contains(backend) {
        Err(ProbeError::Http(StatusCode::INTERNAL_SERVER_ERROR))
      } else {
        Ok(())
      }
    }
  }

  fn pool(size: usize) -> Vec<String> {
    (1..=size).map(|port| format!("127.0.0.1:{}", 8080 + port)).collect()
  }

  #[test]
  fn nine_servers_form_three_batches_in_order() {
    let servers = pool(9);
    let checker = HealthChecker::with_probe(&servers, Duration::from_millis(10_000), 3, FakeProbe::healthy());

    assert_eq!(
      checker.batches(),
      &[servers[0..3].to_vec(), servers[3..6].to_vec(), servers[6..9].to_vec()]
    );
    assert_eq!(checker.tick_interval(), Duration::from_millis(3333));
  }

  #[test]
  fn last_batch_holds_the_remainder() {
    let servers = pool(7);
    let checker = HealthChecker::with_probe(&servers, Duration::from_millis(10_000), 3, FakeProbe::healthy());

    let sizes: Vec<_> = checker.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(checker.tick_interval(), Duration::from_millis(3333));
  }

  #[test]
  fn small_pool_is_a_single_batch_ticking_at_the_full_period() {
    let servers = pool(2);
    let checker = HealthChecker::with_probe(&servers, Duration::from_millis(10_000), 3, FakeProbe::healthy());

    assert_eq!(checker.batches().len(), 1);
    assert_eq!(checker.tick_interval(), Duration::from_millis(10_000));
  }

  #[test]
  fn tick_interval_never_reaches_zero() {
    let checker = HealthChecker::with_probe(&pool(9), Duration::from_millis(2), 3, FakeProbe::healthy());

    assert_eq!(checker.tick_interval(), Duration::from_millis(1));
  }

  #[test]
  fn probe_error_descriptors() {
    assert_eq!(
      ProbeError::Http(StatusCode::SERVICE_UNAVAILABLE).to_string(),
      "cause=http-error code=503"
    );
    assert_eq!(
      ProbeError::Network("ConnectionRefused".into()).to_string(),
      "cause=network code=ConnectionRefused"
    );
  }

  #[tokio::test(start_paused = true)]
  async fn batches_are_probed_one_per_tick_in_a_cycle() {
    let servers = pool(9);
    let checker = HealthChecker::with_probe(&servers, Duration::from_millis(10_000), 3, FakeProbe::healthy());
    let batches = checker.batches().to_vec();
    let start = Instant::now();
    let mut events = checker.run();

    for (tick, batch_index) in [0, 1, 2, 0, 1].iter().enumerate() {
      let mut probed = Vec::new();
      for _ in 0..3 {
        let event = events.recv().await.unwrap();
        assert!(event.available);
        probed.push(event.backend);
      }
      probed.sort();

      assert_eq!(probed, batches[*batch_index]);
      assert_eq!(Instant::now() - start, Duration::from_millis(3333) * (tick as u32 + 1));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn failed_probes_report_unavailable_with_cause() {
    let servers = pool(2);
    let probe = Arc::new(FakeProbe {
      unhealthy: vec![servers[1].clone()].into_iter().collect(),
    });
    let mut events = HealthChecker::with_probe(&servers, Duration::from_millis(1000), 3, probe).run();

    let mut received = vec![events.recv().await.unwrap(), events.recv().await.unwrap()];
    received.sort_by(|a, b| a.backend.cmp(&b.backend));

    assert_eq!(
      received,
      vec![
        HealthEvent {
          backend: servers[0].clone(),
          available: true,
          error: None,
        },
        HealthEvent {
          backend: servers[1].clone(),
          available: false,
          error: Some(ProbeError::Http(StatusCode::INTERNAL_SERVER_ERROR)),
        },
      ]
    );
  }

  struct HangingProbe;

  #[async_trait]
  impl Probe for HangingProbe {
    async fn probe(&self, backend: &str) -> Result<(), ProbeError> {
      if backend.ends_with(":8081") {
        futures::future::pending::<()>().await;
      }
      Ok(())
    }
  }

  #[tokio::test(start_paused = true)]
  async fn hanging_probe_does_not_stall_the_schedule() {
    let servers = pool(2);
    let mut events = HealthChecker::with_probe(&servers, Duration::from_millis(1000), 1, Arc::new(HangingProbe)).run();

    // only the second backend ever reports, once per cycle
    for _ in 0..3 {
      assert_eq!(events.recv().await.unwrap().backend, servers[1]);
    }
  }

  #[tokio::test]
  async fn http_probe_accepts_success_status() {
    let address = spawn_backend(|request| {
      assert_eq!(request.uri().path(), "/health");
      Response::new(Body::from("OK"))
    })
    .await;

    assert_eq!(HttpProbe::new().probe(&address.to_string()).await, Ok(()));
  }

  #[tokio::test]
  async fn http_probe_rejects_error_status() {
    let address = spawn_backend(|_| {
      let mut response = Response::new(Body::from("Bad Gateway"));
      *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
      response
    })
    .await;

    assert_eq!(
      HttpProbe::new().probe(&address.to_string()).await,
      Err(ProbeError::Http(StatusCode::INTERNAL_SERVER_ERROR))
    );
  }

  #[tokio::test]
  async fn http_probe_reports_network_errors() {
    let result = HttpProbe::new().probe(&unused_address().to_string()).await;

    assert_eq!(result, Err(ProbeError::Network("ConnectionRefused".into())));
  }
}
