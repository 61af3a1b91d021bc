use tokio::sync::broadcast;

use crate::supervisor::HealthState;

/// One entry of the supervisor's ring-buffered per-host log, echoed onto the event bus so the
/// admin collaborator can stream it live.
#[derive(Debug, Clone)]
pub struct LogLine {
  pub stream: LogStream,
  pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
  Stdout,
  Stderr,
}

/// The stable event stream of §4.10. `Subscribe(kind, handler) -> cancel` from the design notes
/// is rendered the idiomatic way: `subscribe()` returns a `broadcast::Receiver`, and dropping it
/// is the cancellation — there is no separate handler/cancel-token pair to manage.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
  AppAdded { host: String },
  AppUpdated { host: String },
  AppRemoved { host: String },
  AppStart { host: String },
  AppStop { host: String },
  AppExit { host: String, code: Option<i32> },
  AppLog { host: String, line: LogLine },
  AppHealth { host: String, health: HealthState },
  ConfigSaved,
}

/// Process-wide event bus. Cheap to clone; every subscriber gets its own receiver and missed
/// messages are reported as a lag rather than silently dropped (the default for
/// `tokio::sync::broadcast`).
#[derive(Clone)]
pub struct EventBus {
  sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
  pub fn new() -> Self {
    let (sender, _) = broadcast::channel(1024);
    Self { sender }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
    self.sender.subscribe()
  }

  pub fn publish(&self, event: GatewayEvent) {
    // No receivers is the common case at startup before the router/cert orchestrator have
    // subscribed; that's not an error.
    let _ = self.sender.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}
