use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
  AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Clone, Debug)]
pub struct Config {
  pub listen_addr: SocketAddr,
  pub resolver: ResolverConfig,
  pub extractor: ExtractorConfig,
  pub delivery: DeliveryConfig,
  pub orchestrator: OrchestratorConfig,
}

#[derive(Clone, Debug)]
pub struct ResolverConfig {
  /// Prefix for content references given as a bare path.
  pub site_base_url: String,
  /// Substrings identifying a delivery-host url.
  pub delivery_hosts: Vec<String>,
  pub media_extensions: Vec<String>,
  pub request_timeout: Duration,
  pub session_grace: Duration,
  pub session_poll_interval: Duration,
  pub session_poll_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct ExtractorConfig {
  pub referer: String,
  /// Hosts whose download buttons lead to another page instead of a file.
  pub intermediary_hosts: Vec<String>,
  pub hop_concurrency: usize,
}

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
  pub manifest_name: String,
  pub upstream_host: String,
  pub manifest_timeout: Duration,
  pub segment_timeout: Duration,
  pub segment_attempts: u32,
  pub segment_backoff: Duration,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
  pub program: String,
  pub args: Vec<String>,
  pub host: String,
  pub base_port: u16,
  pub startup_timeout: Duration,
  /// Command listing the members of a remote archive, if archives are
  /// supported at all.
  pub archive_helper: Option<Vec<String>>,
  pub control_host: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
      resolver: ResolverConfig::default(),
      extractor: ExtractorConfig::default(),
      delivery: DeliveryConfig::default(),
      orchestrator: OrchestratorConfig::default(),
    }
  }
}

impl Default for ResolverConfig {
  fn default() -> Self {
    Self {
      site_base_url: "https://new1.hdhub4u.fo".into(),
      delivery_hosts: strings(&["hubcdn.fans", "hubcloud"]),
      media_extensions: strings(&[
        ".mkv", ".mp4", ".avi", ".mov", ".flv", ".wmv", ".webm", ".m3u8",
      ]),
      request_timeout: Duration::from_secs(30),
      session_grace: Duration::from_secs(2),
      session_poll_interval: Duration::from_secs(1),
      session_poll_attempts: 15,
    }
  }
}

impl Default for ExtractorConfig {
  fn default() -> Self {
    Self {
      referer: "https://google.com".into(),
      intermediary_hosts: strings(&[
        "gamerxyt.com",
        "pixel.hubcdn",
        "pixlor-downloads",
      ]),
      hop_concurrency: 8,
    }
  }
}

impl Default for DeliveryConfig {
  fn default() -> Self {
    Self {
      manifest_name: "stream.m3u8".into(),
      upstream_host: "127.0.0.1".into(),
      manifest_timeout: Duration::from_secs(15),
      segment_timeout: Duration::from_secs(60),
      segment_attempts: 3,
      segment_backoff: Duration::from_secs(1),
    }
  }
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      program: "python".into(),
      args: strings(&["src/python/stream_proxy.py"]),
      host: "0.0.0.0".into(),
      base_port: 8000,
      startup_timeout: Duration::from_secs(120),
      archive_helper: None,
      control_host: "127.0.0.1".into(),
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let mut config = Config::default();

    if let Some(addr) = env_parse::<SocketAddr>("LISTEN_ADDR")? {
      config.listen_addr = addr;
    }
    if let Some(url) = env_string("SITE_BASE_URL") {
      config.resolver.site_base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(secs) = env_parse::<u64>("UPSTREAM_TIMEOUT_SECS")? {
      config.resolver.request_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = env_parse::<u64>("SESSION_GRACE_MS")? {
      config.resolver.session_grace = Duration::from_millis(ms);
    }
    if let Some(ms) = env_parse::<u64>("SESSION_POLL_INTERVAL_MS")? {
      config.resolver.session_poll_interval = Duration::from_millis(ms);
    }
    if let Some(attempts) = env_parse::<u32>("SESSION_POLL_ATTEMPTS")? {
      anyhow::ensure!(attempts > 0, "SESSION_POLL_ATTEMPTS must be positive");
      config.resolver.session_poll_attempts = attempts;
    }
    if let Some(n) = env_parse::<usize>("HOP_CONCURRENCY")? {
      anyhow::ensure!(n > 0, "HOP_CONCURRENCY must be positive");
      config.extractor.hop_concurrency = n;
    }
    if let Some(program) = env_string("DELIVERY_PROGRAM") {
      config.orchestrator.program = program;
    }
    if let Some(args) = env_string("DELIVERY_ARGS") {
      config.orchestrator.args = split_words(&args);
    }
    if let Some(host) = env_string("DELIVERY_HOST") {
      config.orchestrator.host = host;
    }
    if let Some(port) = env_parse::<u16>("DELIVERY_BASE_PORT")? {
      config.orchestrator.base_port = port;
    }
    if let Some(secs) = env_parse::<u64>("DELIVERY_STARTUP_TIMEOUT_SECS")? {
      config.orchestrator.startup_timeout = Duration::from_secs(secs);
    }
    if let Some(helper) = env_string("ARCHIVE_HELPER") {
      config.orchestrator.archive_helper = Some(split_words(&helper));
    }

    Ok(config)
  }
}

fn env_string(key: &str) -> Option<String> {
  std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  env_string(key)
    .map(|s| s.trim().parse::<T>())
    .transpose()
    .with_context(|| format!("invalid value for {key}"))
}

fn split_words(s: &str) -> Vec<String> {
  s.split_whitespace().map(str::to_string).collect()
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_defaults_carry_fixed_policies() {
    let config = Config::default();
    assert_eq!(config.orchestrator.startup_timeout, Duration::from_secs(120));
    assert_eq!(config.delivery.manifest_timeout, Duration::from_secs(15));
    assert_eq!(config.delivery.segment_timeout, Duration::from_secs(60));
    assert_eq!(config.delivery.segment_attempts, 3);
    assert_eq!(config.resolver.session_grace, Duration::from_secs(2));
  }

  #[test]
  fn test_split_words() {
    assert_eq!(
      split_words(" helper.py  list "),
      vec!["helper.py".to_string(), "list".to_string()]
    );
  }
}
