use crate::{
  configuration::BalancerConfig,
  error_response::{internal_server_error, service_unavailable},
  health::{network_code, HealthChecker, HealthEvent, HealthEvents},
  listeners::{AcceptorProducer, Http, Https},
  load_balancing::{self, LoadBalancingStrategy},
  server, tls,
};
use hyper::{client::HttpConnector, Body, Client, Request, Response, Uri};
use log::{debug, error, info, warn};
use std::{
  io,
  net::{Ipv4Addr, SocketAddr},
  sync::Arc,
};
use tokio_rustls::rustls::ServerConfig;

/// Owns the strategy, the health check schedule and the listener configuration.
///
/// Must be created inside a tokio runtime: construction starts the health checker and the task that
/// applies its events to the strategy.
pub struct Balancer {
  port: u16,
  tls_config: Option<ServerConfig>,
  dispatcher: Arc<Dispatcher>,
}

impl Balancer {
  pub fn new(config: BalancerConfig) -> Result<Balancer, io::Error> {
    let tls_config = match &config.tls {
      Some(tls) => Some(tls::server_config(&tls.cert, &tls.key)?),
      None => None,
    };

    let strategy = load_balancing::create(config.strategy, &config.servers);
    let checker = HealthChecker::new(
      &config.servers,
      config.health_check_interval,
      config.health_check_parallelism,
    );
    debug!(
      "type=health-check message=\"scheduled\" batches={} tick={}ms",
      checker.batches().len(),
      checker.tick_interval().as_millis()
    );
    tokio::spawn(apply_health_events(checker.run(), strategy.clone()));

    Ok(Balancer {
      port: config.port,
      tls_config,
      dispatcher: Arc::new(Dispatcher::new(strategy)),
    })
  }

  pub async fn listen(self) -> Result<(), io::Error> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));

    match self.tls_config {
      None => {
        let acceptor = Http.produce_acceptor(address).await?;
        info!("server running on port :{}", acceptor.local_addr().port());
        server::create(acceptor, self.dispatcher).await
      }
      Some(tls_config) => {
        let acceptor = Https { tls_config }.produce_acceptor(address).await?;
        info!("server running on port :{} (https)", acceptor.local_addr().port());
        server::create(acceptor, self.dispatcher).await
      }
    }
  }
}

async fn apply_health_events(mut events: HealthEvents, strategy: Arc<dyn LoadBalancingStrategy>) {
  while let Some(event) = events.recv().await {
    on_health_event(strategy.as_ref(), &event);
  }
}

fn on_health_event(strategy: &dyn LoadBalancingStrategy, event: &HealthEvent) {
  if !event.available {
    let cause = event.error.as_ref().map(ToString::to_string).unwrap_or_default();
    info!(
      "type=health-check message=\"server is unavailable\" server={} {}",
      event.backend, cause
    );
  }
  strategy.toggle(&event.backend, event.available);
}

/// The per-request path: select a backend, forward, relay. Never retries on another backend.
#[derive(Debug)]
pub struct Dispatcher {
  strategy: Arc<dyn LoadBalancingStrategy>,
  client: Client<HttpConnector, Body>,
}

impl Dispatcher {
  pub fn new(strategy: Arc<dyn LoadBalancingStrategy>) -> Dispatcher {
    Dispatcher {
      strategy,
      client: Client::new(),
    }
  }

  pub async fn dispatch(&self, request: Request<Body>) -> Response<Body> {
    let path_and_query = request.uri().path_and_query().map_or("/", |p| p.as_str());

    let selection = match self.strategy.select(path_and_query) {
      Ok(selection) => selection,
      Err(e) => {
        error!("type=balancing message=\"{}\"", e);
        return service_unavailable();
      }
    };

    let backend_uri: Uri = match selection.target.parse() {
      Ok(uri) => uri,
      Err(e) => {
        error!(
          "type=internal message=\"couldn't parse server URL\" err={} url={}",
          e, selection.target
        );
        return internal_server_error();
      }
    };

    let method = request.method().clone();
    match self.client.request(backend_request(request, backend_uri)).await {
      Ok(response) => {
        let status = response.status().as_u16();
        if status >= 500 {
          self.strategy.toggle(&selection.backend, false);
        }
        if status >= 400 {
          warn!("type=request method={} code={} url={}", method, status, selection.target);
        }
        response
      }
      Err(e) => {
        error!(
          "type=request method={} code={} url={}",
          method,
          network_code(&e),
          selection.target
        );
        self.strategy.toggle(&selection.backend, false);
        service_unavailable()
      }
    }
  }
}

fn backend_request(request: Request<Body>, backend_uri: Uri) -> Request<Body> {
  let (parts, body) = request.into_parts();
  let mut backend_request = Request::new(body);
  *backend_request.method_mut() = parts.method;
  *backend_request.uri_mut() = backend_uri;
  *backend_request.headers_mut() = parts.headers;
  backend_request
}
