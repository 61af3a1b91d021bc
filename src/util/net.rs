use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::sleep;

const BIND_RETRY_ATTEMPTS: u32 = 10;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Binds `addr`, retrying up to [`BIND_RETRY_ATTEMPTS`] times with a fixed delay. Shared by every
/// listener so a port briefly held by the previous process instance isn't a fatal startup error.
pub async fn bind_with_retry(addr: SocketAddr) -> std::io::Result<TcpListener> {
  let mut attempt = 0;
  loop {
    match TcpListener::bind(addr).await {
      Ok(listener) => return Ok(listener),
      Err(err) if attempt + 1 < BIND_RETRY_ATTEMPTS => {
        attempt += 1;
        sleep(BIND_RETRY_DELAY).await;
        let _ = err;
      }
      Err(err) => return Err(err),
    }
  }
}
