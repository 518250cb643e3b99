use super::{LoadBalancingStrategy, NoBackendAvailable, Selection};
use std::{collections::VecDeque, sync::Mutex};

const SCHEME: &str = "http";

/// Rotating queue of available backends: the front is picked, then moved to the back.
#[derive(Debug)]
pub struct RoundRobin {
  queue: Mutex<VecDeque<String>>,
}

impl RoundRobin {
  pub fn new<I>(servers: I) -> RoundRobin
  where
    I: IntoIterator<Item = String>,
  {
    let mut queue = VecDeque::new();
    for server in servers {
      if !queue.contains(&server) {
        queue.push_back(server);
      }
    }
    RoundRobin {
      queue: Mutex::new(queue),
    }
  }

  #[cfg(test)]
  fn rotation(&self) -> Vec<String> {
    self.queue.lock().unwrap().iter().cloned().collect()
  }
}

impl LoadBalancingStrategy for RoundRobin {
  fn select(&self, path_and_query: &str) -> Result<Selection, NoBackendAvailable> {
    // ok to unwrap - the lock is only poisoned if another holder panicked
    let mut queue = self.queue.lock().unwrap();
    let backend = queue.pop_front().ok_or(NoBackendAvailable)?;
    let target = format!("{}://{}{}", SCHEME, backend, path_and_query);
    queue.push_back(backend.clone());
    Ok(Selection { backend, target })
  }

  fn toggle(&self, backend: &str, available: bool) {
    let mut queue = self.queue.lock().unwrap();
    if available {
      if !queue.iter().any(|server| server == backend) {
        queue.push_back(backend.to_string());
      }
    } else {
      queue.retain(|server| server != backend);
    }
  }
}
