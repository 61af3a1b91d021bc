use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_true() -> bool {
  true
}

fn is_true(value: &bool) -> bool {
  *value
}

/// The on-disk gateway configuration (§6). Non-`apps` keys round-trip verbatim through `extra`
/// so that the admin collaborator can carry fields this crate doesn't know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
  pub email: String,
  #[serde(rename = "agreeToTerms")]
  pub agree_to_terms: bool,
  #[serde(rename = "adminToken", default, skip_serializing_if = "Option::is_none")]
  pub admin_token: Option<String>,
  pub acme: AcmeSettings,
  pub apps: Vec<AppConfig>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeSettings {
  #[serde(rename = "directoryUrl")]
  pub directory_url: String,
  #[serde(rename = "configDir")]
  pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
  Http,
  Https,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
  pub scheme: UpstreamScheme,
  pub host: String,
  pub port: u16,
  #[serde(rename = "rejectUnauthorized", default = "default_true", skip_serializing_if = "is_true")]
  pub reject_unauthorized: bool,
}

/// One configured App (§3). `upstream`/`port`/`static_dir` are mutually exclusive at request
/// time; [`AppConfig::request_target`] turns the three optional fields into the explicit sum
/// type the routing layer actually matches on, per the "no dynamic shapes" design note.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
  pub host: String,
  #[serde(default)]
  pub alt_names: Vec<String>,
  #[serde(default)]
  pub preserve_host: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub upstream: Option<UpstreamConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub port: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub static_dir: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cwd: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub health_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub health_interval_ms: Option<u64>,
  #[serde(default)]
  pub disabled: bool,
  #[serde(default = "default_true")]
  pub auto_restart: bool,
  #[serde(default = "default_true")]
  pub auto_install: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_logs: Option<u32>,
}

/// A resolved proxy backend address, carrying no optionality once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUpstream {
  pub scheme: UpstreamScheme,
  pub host: String,
  pub port: u16,
  pub reject_unauthorized: bool,
}

/// The explicit sum type §4.9's "static branch" vs "proxy branch" routing decides between.
pub enum RequestTarget<'a> {
  Static(&'a Path),
  Proxy(ResolvedUpstream),
}

impl AppConfig {
  /// Lowercased, stable certificate/routing identity for this app.
  pub fn host_key(&self) -> String {
    self.host.to_ascii_lowercase()
  }

  pub fn health_interval(&self) -> Duration {
    Duration::from_millis(self.health_interval_ms.unwrap_or(15_000))
  }

  /// §3's `maxLogs`, default 500 (spec.md:117).
  pub fn max_logs(&self) -> usize {
    self.max_logs.unwrap_or(500) as usize
  }

  /// Resolves the explicit static-vs-proxy branch. `None` means the app has neither a
  /// `staticDir` nor a usable upstream/port, which is a configuration error caught at
  /// validation time rather than at request time.
  pub fn request_target(&self) -> Option<RequestTarget<'_>> {
    if let Some(static_dir) = &self.static_dir {
      return Some(RequestTarget::Static(static_dir));
    }
    if let Some(upstream) = &self.upstream {
      return Some(RequestTarget::Proxy(ResolvedUpstream {
        scheme: upstream.scheme,
        host: upstream.host.clone(),
        port: upstream.port,
        reject_unauthorized: upstream.reject_unauthorized,
      }));
    }
    if let Some(port) = self.port {
      return Some(RequestTarget::Proxy(ResolvedUpstream {
        scheme: UpstreamScheme::Http,
        host: "127.0.0.1".to_string(),
        port,
        reject_unauthorized: true,
      }));
    }
    None
  }
}

#[derive(Debug)]
pub enum ConfigError {
  DuplicateHost(String),
  NoRequestTarget(String),
  InvalidPort(String),
}

impl std::fmt::Display for ConfigError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConfigError::DuplicateHost(host) => write!(f, "duplicate host \"{host}\" in configuration"),
      ConfigError::NoRequestTarget(host) => write!(f, "app \"{host}\" has neither staticDir, upstream, nor port"),
      ConfigError::InvalidPort(host) => write!(f, "app \"{host}\" has an invalid port 0"),
    }
  }
}

impl std::error::Error for ConfigError {}

/// Validates invariants (I1), (I2)-adjacent port sanity, and the static/proxy mutual-exclusion
/// rule. Surfaced synchronously to the control-plane caller per §7; never affects already
/// running traffic.
pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
  let mut seen_hosts = HashSet::new();
  for app in &config.apps {
    let key = app.host_key();
    if !seen_hosts.insert(key.clone()) {
      return Err(ConfigError::DuplicateHost(app.host.clone()));
    }
    if app.request_target().is_none() {
      return Err(ConfigError::NoRequestTarget(app.host.clone()));
    }
    if app.port == Some(0) {
      return Err(ConfigError::InvalidPort(app.host.clone()));
    }
  }
  Ok(())
}

/// Loads and validates the configuration file.
pub async fn load_config(path: &Path) -> Result<GatewayConfig> {
  let contents = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
  let config: GatewayConfig =
    serde_json::from_str(&contents).with_context(|| format!("failed to parse configuration file at {}", path.display()))?;
  validate(&config).with_context(|| "configuration failed validation")?;
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_app(host: &str) -> AppConfig {
    AppConfig {
      host: host.to_string(),
      alt_names: Vec::new(),
      preserve_host: false,
      upstream: None,
      port: Some(3000),
      static_dir: None,
      cwd: None,
      start: None,
      health_url: None,
      health_interval_ms: None,
      disabled: false,
      auto_restart: true,
      auto_install: true,
      max_logs: None,
    }
  }

  #[test]
  fn duplicate_hosts_are_case_insensitively_rejected() {
    let config = GatewayConfig {
      email: "ops@example.com".to_string(),
      agree_to_terms: true,
      admin_token: None,
      acme: AcmeSettings {
        directory_url: "https://acme.example.com/directory".to_string(),
        config_dir: PathBuf::from("/tmp/certs"),
      },
      apps: vec![sample_app("App.Example.com"), sample_app("app.example.com")],
      extra: Map::new(),
    };
    assert!(matches!(validate(&config), Err(ConfigError::DuplicateHost(_))));
  }

  #[test]
  fn app_without_any_target_is_rejected() {
    let mut app = sample_app("example.com");
    app.port = None;
    assert!(matches!(app.request_target(), None));
  }

  #[test]
  fn max_logs_defaults_to_500_and_honors_override() {
    let mut app = sample_app("example.com");
    assert_eq!(app.max_logs(), 500);
    app.max_logs = Some(50);
    assert_eq!(app.max_logs(), 50);
  }

  #[test]
  fn port_shorthand_resolves_to_loopback_http() {
    let app = sample_app("example.com");
    match app.request_target() {
      Some(RequestTarget::Proxy(upstream)) => {
        assert_eq!(upstream.host, "127.0.0.1");
        assert_eq!(upstream.port, 3000);
        assert_eq!(upstream.scheme, UpstreamScheme::Http);
      }
      _ => panic!("expected a proxy target"),
    }
  }
}
