use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use http_body_util::Empty;
use hyper::body::Bytes;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, timeout};

use crate::config::AppConfig;
use crate::events::{EventBus, GatewayEvent};
use crate::supervisor::HealthState;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const READINESS_GATE_CAP: Duration = Duration::from_secs(15);

/// C6 — periodically probes each app's `healthUrl` and republishes state changes on the event
/// bus. Also exposes a bounded "wait until healthy or 15s elapse" gate that C9 consults before
/// proxying the app's first request after a (re)start.
pub struct HealthMonitor {
  bus: EventBus,
  client: Client<HttpConnector, Empty<Bytes>>,
  states: RwLock<HashMap<String, watch::Sender<HealthState>>>,
}

impl HealthMonitor {
  pub fn new(bus: EventBus) -> Arc<Self> {
    Arc::new(Self {
      bus,
      client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
      states: RwLock::new(HashMap::new()),
    })
  }

  /// Starts (or restarts) probing `app`. Calling this again for the same host replaces the prior
  /// probe loop the next time it wakes, since the new `watch` channel it installs makes the old
  /// loop's sender a no-op once dropped below — in practice callers only do this once per app.
  pub async fn start_probing(self: &Arc<Self>, app: Arc<AppConfig>) {
    let Some(health_url) = app.health_url.clone() else {
      return;
    };
    let host = app.host_key();
    let (sender, _receiver) = watch::channel(HealthState::Unknown);
    self.states.write().await.insert(host.clone(), sender.clone());

    let this = self.clone();
    let interval_duration = app.health_interval();
    tokio::spawn(async move {
      let mut ticker = interval(interval_duration);
      loop {
        ticker.tick().await;
        if sender.is_closed() {
          break;
        }
        let new_state = this.probe(&health_url).await;
        let changed = *sender.borrow() != new_state;
        sender.send_replace(new_state);
        if changed {
          this.bus.publish(GatewayEvent::AppHealth { host: host.clone(), health: new_state });
        }
      }
    });
  }

  async fn probe(&self, health_url: &str) -> HealthState {
    let Ok(uri) = health_url.parse::<Uri>() else {
      return HealthState::Unhealthy;
    };

    let Some(response) = self.send_probe_request(uri.clone()).await else {
      return HealthState::Unhealthy;
    };

    // §4.6: follow at most one redirect before judging the result.
    if response.status().is_redirection() {
      let location = response
        .headers()
        .get(hyper::header::LOCATION)
        .and_then(|value| value.to_str().ok());
      let Some(target) = location.and_then(|location| resolve_redirect_target(&uri, location)) else {
        return HealthState::Unhealthy;
      };
      let Some(response) = self.send_probe_request(target).await else {
        return HealthState::Unhealthy;
      };
      return status_to_health(response.status().as_u16());
    }

    status_to_health(response.status().as_u16())
  }

  async fn send_probe_request(&self, uri: Uri) -> Option<hyper::Response<hyper::body::Incoming>> {
    let request = hyper::Request::builder().method(hyper::Method::GET).uri(uri).body(Empty::new()).ok()?;
    match timeout(DEFAULT_PROBE_TIMEOUT, self.client.request(request)).await {
      Ok(Ok(response)) => Some(response),
      _ => None,
    }
  }

  pub async fn stop_probing(&self, host: &str) {
    self.states.write().await.remove(host);
  }

  pub async fn current_state(&self, host: &str) -> HealthState {
    match self.states.read().await.get(host) {
      Some(sender) => *sender.borrow(),
      None => HealthState::Unknown,
    }
  }

  /// Blocks up to [`READINESS_GATE_CAP`] for `host` to report healthy, returning whether it did.
  /// Apps without a `healthUrl` are always considered ready immediately (§4.6: health probing is
  /// optional); §4.9 step 2 turns a `false` return into a 502 readiness-timeout response.
  pub async fn wait_until_ready(&self, host: &str) -> bool {
    let Some(mut receiver) = self.states.read().await.get(host).map(|sender| sender.subscribe()) else {
      return true;
    };
    timeout(READINESS_GATE_CAP, async {
      loop {
        if *receiver.borrow() == HealthState::Healthy {
          return;
        }
        if receiver.changed().await.is_err() {
          return;
        }
      }
    })
    .await
    .is_ok()
  }
}

fn status_to_health(status: u16) -> HealthState {
  if (200..400).contains(&status) {
    HealthState::Healthy
  } else {
    HealthState::Unhealthy
  }
}

/// Resolves a `Location` header against the request URI it came from. Handles an absolute URL
/// (the common case for a health check redirecting cross-origin) and a path-only relative
/// location (resolved against the original URI's scheme and authority).
fn resolve_redirect_target(original: &Uri, location: &str) -> Option<Uri> {
  if let Ok(absolute) = location.parse::<Uri>() {
    if absolute.scheme().is_some() {
      return Some(absolute);
    }
  }

  let scheme = original.scheme_str()?;
  let authority = original.authority()?.as_str();
  let path_and_query = if location.starts_with('/') { location.to_string() } else { format!("/{location}") };
  format!("{scheme}://{authority}{path_and_query}").parse::<Uri>().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn probe_rejects_unparseable_url() {
    let monitor = HealthMonitor::new(EventBus::new());
    assert_eq!(monitor.probe("::not a uri::").await, HealthState::Unhealthy);
  }

  #[test]
  fn resolve_redirect_target_accepts_absolute_location() {
    let original: Uri = "http://127.0.0.1:9000/health".parse().unwrap();
    let resolved = resolve_redirect_target(&original, "https://other.example/status").unwrap();
    assert_eq!(resolved, "https://other.example/status".parse::<Uri>().unwrap());
  }

  #[test]
  fn resolve_redirect_target_resolves_relative_path_against_original_authority() {
    let original: Uri = "http://127.0.0.1:9000/health".parse().unwrap();
    let resolved = resolve_redirect_target(&original, "/healthz").unwrap();
    assert_eq!(resolved, "http://127.0.0.1:9000/healthz".parse::<Uri>().unwrap());
  }

  #[tokio::test]
  async fn wait_until_ready_returns_immediately_without_health_url() {
    let monitor = HealthMonitor::new(EventBus::new());
    let ready = tokio::time::timeout(Duration::from_millis(50), monitor.wait_until_ready("no-such-host"))
      .await
      .expect("should not block when the host has no registered probe");
    assert!(ready);
  }
}
