use balancer::Balancer;
use clap::Parser;
use configuration::{Args, BalancerConfig};
use log::{error, info};
use std::process::ExitCode;

mod balancer;
mod configuration;
mod error_response;
mod health;
mod listeners;
mod load_balancing;
mod logging;
mod server;
#[cfg(test)]
mod test_support;
mod tls;

#[tokio::main]
async fn main() -> ExitCode {
  let args = Args::parse();

  if let Err(e) = logging::initialize() {
    eprintln!("{}", e);
    return ExitCode::FAILURE;
  }

  let config = match BalancerConfig::load(args) {
    Ok(config) => config,
    Err(e) => {
      error!("{}", e);
      return ExitCode::FAILURE;
    }
  };
  info!(
    "balancing {} servers over {:?} with {} strategy, health check every {}ms",
    config.servers.len(),
    config.protocol,
    config.strategy,
    config.health_check_interval.as_millis()
  );

  let result = match Balancer::new(config) {
    Ok(balancer) => balancer.listen().await,
    Err(e) => Err(e),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("{}", e);
      ExitCode::FAILURE
    }
  }
}
