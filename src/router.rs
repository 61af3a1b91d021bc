use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::AppConfig;
use crate::util::strip_port;

/// C7 — case-insensitive host → app lookup table. Config is the single source of truth; this
/// router is rebuilt wholesale on every config mutation rather than patched incrementally, which
/// keeps "rename a host" and "remove then re-add" trivially correct at the cost of a full map
/// replace per change (cheap at the app counts this gateway targets).
///
/// Reads happen on every TLS handshake and every proxied request, so the map lives behind a
/// plain `std::sync::RwLock` rather than an async one — lookups never hold the lock across an
/// await point.
pub struct HostRouter {
  apps: RwLock<HashMap<String, Arc<AppConfig>>>,
}

impl HostRouter {
  pub fn new() -> Arc<Self> {
    Arc::new(Self { apps: RwLock::new(HashMap::new()) })
  }

  /// Replaces the entire routing table. Called once after config load and again after any
  /// successful config mutation (§4.7's "add/update/remove" operations).
  pub fn set_apps(&self, apps: Vec<AppConfig>) {
    let mut map = HashMap::with_capacity(apps.len());
    for app in apps {
      let key = app.host_key();
      map.insert(key, Arc::new(app));
    }
    *self.apps.write().unwrap() = map;
  }

  /// Looks up the app for an inbound `Host`/SNI value, stripping any `:port` suffix and
  /// lowercasing first.
  pub fn lookup(&self, host: &str) -> Option<Arc<AppConfig>> {
    let key = strip_port(host).to_ascii_lowercase();
    self.apps.read().unwrap().get(&key).cloned()
  }

  pub fn all(&self) -> Vec<Arc<AppConfig>> {
    self.apps.read().unwrap().values().cloned().collect()
  }

  /// Every configured app's primary host plus its `altNames`, for the certificate orchestrator's
  /// combined-SAN computation (§4.4 step 2). Cheap snapshot copy; called once per `ensureCert`.
  pub fn all_hosts_and_alt_names(&self) -> Vec<(String, Vec<String>)> {
    self
      .apps
      .read()
      .unwrap()
      .values()
      .map(|app| (app.host.clone(), app.alt_names.clone()))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::AppConfig;

  fn app(host: &str) -> AppConfig {
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
  fn lookup_is_case_insensitive_and_ignores_port() {
    let router = HostRouter::new();
    router.set_apps(vec![app("App.Example.com")]);
    assert!(router.lookup("app.example.com:8443").is_some());
    assert!(router.lookup("APP.EXAMPLE.COM").is_some());
    assert!(router.lookup("other.example.com").is_none());
  }

  #[test]
  fn set_apps_replaces_wholesale() {
    let router = HostRouter::new();
    router.set_apps(vec![app("a.example.com")]);
    router.set_apps(vec![app("b.example.com")]);
    assert!(router.lookup("a.example.com").is_none());
    assert!(router.lookup("b.example.com").is_some());
  }
}
