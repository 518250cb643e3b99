use crate::configuration::StrategyKind;
use log::warn;
use std::sync::Arc;
use thiserror::Error;

pub mod round_robin;

use round_robin::RoundRobin;

/// The backend picked for a request together with the absolute URL the request is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
  pub backend: String,
  pub target: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("there are no servers available")]
pub struct NoBackendAvailable;

/// Selection contract shared by the request handlers, the health check listener and the upstream error path.
///
/// Implementations must be safe to call concurrently from all three. `toggle` is idempotent: enabling a backend
/// that is already in rotation, or disabling one that is not, changes nothing.
pub trait LoadBalancingStrategy: std::fmt::Debug + Send + Sync {
  fn select(&self, path_and_query: &str) -> Result<Selection, NoBackendAvailable>;

  fn toggle(&self, backend: &str, available: bool);
}

pub fn create(kind: StrategyKind, servers: &[String]) -> Arc<dyn LoadBalancingStrategy> {
  match kind {
    StrategyKind::RoundRobin => {}
    StrategyKind::WeightedRoundRobin | StrategyKind::IpHash => {
      warn!("type=balancing message=\"strategy {} is not implemented, using round-robin\"", kind);
    }
  }
  Arc::new(RoundRobin::new(servers.iter().cloned()))
}
