use clap::Parser;
use hyper::http::uri::Authority;
use log::info;
use serde::Deserialize;
use std::{
  collections::HashSet,
  fmt, fs, io,
  path::{Path, PathBuf},
  str::FromStr,
  time::Duration,
};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: u64 = 10_000;
pub const DEFAULT_HEALTH_CHECK_PARALLELISM: usize = 3;

const CERTIFICATE_EXTENSIONS: [&str; 3] = ["crt", "cer", "pem"];
const KEY_EXTENSIONS: [&str; 1] = ["key"];

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("could not read configuration file '{}': {source}", .path.display())]
  Read { path: PathBuf, source: io::Error },
  #[error("could not parse configuration file '{}': {source}", .path.display())]
  Parse { path: PathBuf, source: toml::de::Error },
  #[error("parameter '--servers' is required")]
  MissingServers,
  #[error("invalid server '{0}', expected host:port")]
  InvalidServer(String),
  #[error("server '{0}' is listed more than once")]
  DuplicateServer(String),
  #[error("--check-interval must be greater than zero")]
  ZeroInterval,
  #[error("--check-parallelism must be greater than zero")]
  ZeroParallelism,
  #[error("provide --cert-dir or --cert and --key for https configuration")]
  MissingTlsMaterial,
  #[error("no {kind} file found in '{}'", .dir.display())]
  IncompleteCertDir { dir: PathBuf, kind: &'static str },
  #[error("unknown strategy '{0}'")]
  UnknownStrategy(String),
  #[error("--protocol should be 'http' or 'https', got '{0}'")]
  UnknownProtocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StrategyKind {
  #[serde(rename = "round-robin", alias = "rrobin")]
  RoundRobin,
  #[serde(rename = "weighted-round-robin", alias = "wrobin")]
  WeightedRoundRobin,
  #[serde(rename = "ip-hash", alias = "ip")]
  IpHash,
}

impl Default for StrategyKind {
  fn default() -> Self {
    StrategyKind::RoundRobin
  }
}

impl FromStr for StrategyKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "rrobin" | "round-robin" => Ok(StrategyKind::RoundRobin),
      "wrobin" | "weighted-round-robin" => Ok(StrategyKind::WeightedRoundRobin),
      "ip" | "ip-hash" => Ok(StrategyKind::IpHash),
      _ => Err(ConfigError::UnknownStrategy(s.to_string())),
    }
  }
}

impl fmt::Display for StrategyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StrategyKind::RoundRobin => write!(f, "round-robin"),
      StrategyKind::WeightedRoundRobin => write!(f, "weighted-round-robin"),
      StrategyKind::IpHash => write!(f, "ip-hash"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  Http,
  Https,
}

impl Default for Protocol {
  fn default() -> Self {
    Protocol::Http
  }
}

impl FromStr for Protocol {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "http" => Ok(Protocol::Http),
      "https" => Ok(Protocol::Https),
      _ => Err(ConfigError::UnknownProtocol(s.to_string())),
    }
  }
}

/// Command line of the balancer. Every value may also come from the `--config` TOML file; the command line wins.
#[derive(Debug, Default, Parser)]
#[clap(author, version, about)]
pub struct Args {
  /// Comma separated list of backends, e.g. localhost:8081,localhost:8082
  #[clap(short, long)]
  pub servers: Option<String>,

  /// Port to listen on [default: 80]
  #[clap(short, long)]
  pub port: Option<u16>,

  /// rrobin, wrobin or ip [default: rrobin]
  #[clap(long)]
  pub strategy: Option<StrategyKind>,

  /// Milliseconds in which every backend is probed once [default: 10000]
  #[clap(short = 'i', long)]
  pub check_interval: Option<u64>,

  /// Backends probed together on one tick [default: 3]
  #[clap(long)]
  pub check_parallelism: Option<usize>,

  /// http or https [default: http]
  #[clap(long)]
  pub protocol: Option<Protocol>,

  /// Directory containing the .crt and .key files
  #[clap(long, parse(from_os_str))]
  pub cert_dir: Option<PathBuf>,

  #[clap(long, parse(from_os_str))]
  pub cert: Option<PathBuf>,

  #[clap(long, parse(from_os_str))]
  pub key: Option<PathBuf>,

  /// TOML configuration file
  #[clap(short, long, parse(from_os_str))]
  pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct FileConfig {
  servers: Option<Vec<String>>,
  port: Option<u16>,
  strategy: Option<StrategyKind>,
  health_check_interval: Option<u64>,
  health_check_parallelism: Option<usize>,
  protocol: Option<Protocol>,
  cert_dir: Option<PathBuf>,
  cert: Option<PathBuf>,
  key: Option<PathBuf>,
}

impl FileConfig {
  fn read(path: &Path) -> Result<FileConfig, ConfigError> {
    let toml_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config = toml::from_str(&toml_str).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    info!("Successfully parsed configuration file {}", path.display());
    Ok(config)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
  pub cert: PathBuf,
  pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerConfig {
  pub servers: Vec<String>,
  pub port: u16,
  pub strategy: StrategyKind,
  pub health_check_interval: Duration,
  pub health_check_parallelism: usize,
  pub protocol: Protocol,
  pub tls: Option<TlsConfig>,
}

impl BalancerConfig {
  pub fn new(servers: Vec<String>) -> BalancerConfig {
    BalancerConfig {
      servers,
      port: DEFAULT_PORT,
      strategy: StrategyKind::default(),
      health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL),
      health_check_parallelism: DEFAULT_HEALTH_CHECK_PARALLELISM,
      protocol: Protocol::default(),
      tls: None,
    }
  }

  pub fn load(args: Args) -> Result<BalancerConfig, ConfigError> {
    let file = match &args.config {
      Some(path) => FileConfig::read(path)?,
      None => FileConfig::default(),
    };
    BalancerConfig::merge(args, file)
  }

  fn merge(args: Args, file: FileConfig) -> Result<BalancerConfig, ConfigError> {
    let servers = match args.servers {
      Some(servers) => split_servers(&servers),
      None => file.servers.unwrap_or_default(),
    };
    validate_servers(&servers)?;

    let interval = args
      .check_interval
      .or(file.health_check_interval)
      .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL);
    if interval == 0 {
      return Err(ConfigError::ZeroInterval);
    }

    let parallelism = args
      .check_parallelism
      .or(file.health_check_parallelism)
      .unwrap_or(DEFAULT_HEALTH_CHECK_PARALLELISM);
    if parallelism == 0 {
      return Err(ConfigError::ZeroParallelism);
    }

    let protocol = args.protocol.or(file.protocol).unwrap_or_default();
    let tls = match protocol {
      Protocol::Http => None,
      Protocol::Https => Some(resolve_tls(
        args.cert.or(file.cert),
        args.key.or(file.key),
        args.cert_dir.or(file.cert_dir),
      )?),
    };

    Ok(BalancerConfig {
      servers,
      port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
      strategy: args.strategy.or(file.strategy).unwrap_or_default(),
      health_check_interval: Duration::from_millis(interval),
      health_check_parallelism: parallelism,
      protocol,
      tls,
    })
  }
}

fn split_servers(servers: &str) -> Vec<String> {
  servers
    .split(',')
    .map(str::trim)
    .filter(|server| !server.is_empty())
    .map(String::from)
    .collect()
}

fn validate_servers(servers: &[String]) -> Result<(), ConfigError> {
  if servers.is_empty() {
    return Err(ConfigError::MissingServers);
  }

  let mut seen = HashSet::new();
  for server in servers {
    let authority = Authority::from_str(server).map_err(|_| ConfigError::InvalidServer(server.clone()))?;
    if authority.port_u16().is_none() || authority.as_str().contains('@') {
      return Err(ConfigError::InvalidServer(server.clone()));
    }
    if !seen.insert(server.as_str()) {
      return Err(ConfigError::DuplicateServer(server.clone()));
    }
  }
  Ok(())
}

fn resolve_tls(cert: Option<PathBuf>, key: Option<PathBuf>, cert_dir: Option<PathBuf>) -> Result<TlsConfig, ConfigError> {
  let (cert, key) = match (cert, key, cert_dir) {
    (Some(cert), Some(key), _) => (cert, key),
    (cert, key, Some(dir)) => {
      let cert = match cert {
        Some(cert) => cert,
        None => find_in_dir(&dir, &CERTIFICATE_EXTENSIONS, "certificate")?,
      };
      let key = match key {
        Some(key) => key,
        None => find_in_dir(&dir, &KEY_EXTENSIONS, "key")?,
      };
      (cert, key)
    }
    _ => return Err(ConfigError::MissingTlsMaterial),
  };
  Ok(TlsConfig { cert, key })
}

fn find_in_dir(dir: &Path, extensions: &[&str], kind: &'static str) -> Result<PathBuf, ConfigError> {
  let incomplete = || ConfigError::IncompleteCertDir {
    dir: dir.to_path_buf(),
    kind,
  };
  let entries = fs::read_dir(dir).map_err(|_| incomplete())?;

  let mut candidates: Vec<PathBuf> = entries
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.path())
    .filter(|path| path.is_file())
    .filter(|path| {
      path
        .extension()
        .and_then(|extension| extension.to_str())
        .map_or(false, |extension| extensions.contains(&extension))
    })
    .collect();
  candidates.sort();
  candidates.into_iter().next().ok_or_else(incomplete)
}
