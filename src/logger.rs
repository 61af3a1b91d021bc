use async_channel::{Receiver, Sender};

use crate::log::LogMessage;

/// The handle every component holds to emit log lines. Cloned freely; cheap (one `async_channel`
/// sender per process).
pub type Logger = Sender<LogMessage>;

/// Spawns the single task that owns the receiving end of the log channel and fans messages out
/// to stdout/stderr. Returns the sender half that the rest of the process clones.
pub fn spawn_logger() -> Logger {
  let (tx, rx) = async_channel::unbounded();
  tokio::spawn(drain(rx));
  tx
}

async fn drain(rx: Receiver<LogMessage>) {
  while let Ok(message) = rx.recv().await {
    let (message, is_error) = message.get_message();
    if is_error {
      eprintln!("{message}");
    } else {
      println!("{message}");
    }
  }
}

/// Convenience for logging a line tagged with the host it concerns, matching the shape most
/// call sites in the supervisor and certificate orchestrator want.
pub fn log_host(logger: &Logger, host: &str, message: impl AsRef<str>, is_error: bool) {
  logger
    .send_blocking(LogMessage::new(format!("[{host}] {}", message.as_ref()), is_error))
    .unwrap_or_default();
}
