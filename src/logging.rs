use log::{info, warn, LevelFilter};
use log4rs::{
  append::console::ConsoleAppender,
  config::{runtime::ConfigErrors, Appender, Root},
  encode::pattern::PatternEncoder,
  Config,
};
use thiserror::Error;

const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;
const PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {l}: {m}{n}";

#[derive(Debug, Error)]
pub enum LoggingError {
  #[error("invalid logging configuration: {0}")]
  Config(#[from] ConfigErrors),
  #[error("logger already initialized: {0}")]
  Init(#[from] log::SetLoggerError),
}

pub fn initialize() -> Result<log4rs::Handle, LoggingError> {
  let log_level = std::env::var("LOG_LEVEL").ok();
  let level_filter = log_level
    .as_deref()
    .and_then(parse_level_filter)
    .unwrap_or(DEFAULT_LEVEL);

  let stdout = ConsoleAppender::builder()
    .encoder(Box::new(PatternEncoder::new(PATTERN)))
    .build();
  let config = Config::builder()
    .appender(Appender::builder().build("stdout", Box::new(stdout)))
    .build(Root::builder().appender("stdout").build(level_filter))?;

  let handle = log4rs::init_config(config)?;
  if let Some(log_level) = log_level.filter(|level| parse_level_filter(level).is_none()) {
    warn!("Invalid log level {}, falling back to {}", log_level, DEFAULT_LEVEL);
  }
  info!("Logging Level: {}", &level_filter);
  Ok(handle)
}

fn parse_level_filter(str: &str) -> Option<LevelFilter> {
  match str.to_lowercase().as_str() {
    "off" => Some(LevelFilter::Off),
    "error" => Some(LevelFilter::Error),
    "warn" => Some(LevelFilter::Warn),
    "info" => Some(LevelFilter::Info),
    "debug" => Some(LevelFilter::Debug),
    "trace" => Some(LevelFilter::Trace),
    _ => None,
  }
}
