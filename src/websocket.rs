use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_tungstenite::{tungstenite::Message as ServerMessage, HyperWebsocket};
use tokio_tungstenite::tungstenite::Message as ClientMessage;

use crate::config::{ResolvedUpstream, UpstreamScheme};
use crate::logger::{log_host, Logger};

/// True when the request carries the `Upgrade: websocket` handshake headers (same host→app
/// lookup as any other request, so the only branch point C9 needs is here).
pub fn is_upgrade_request(req: &Request<Incoming>) -> bool {
  hyper_tungstenite::is_upgrade_request(req)
}

/// Accepts the inbound WebSocket upgrade, dials the upstream as a WebSocket client on the same
/// path, and pumps frames bidirectionally until either side closes. Runs as a detached task; the
/// handshake response returned to the inbound client is produced synchronously by
/// `hyper_tungstenite::upgrade`, matching the non-WS proxy branch's "respond immediately, stream
/// afterward" shape.
pub fn upgrade(
  mut req: Request<Incoming>,
  upstream: ResolvedUpstream,
  app_host: String,
  logger: Logger,
) -> Result<Response<Full<Bytes>>> {
  let (response, websocket) = hyper_tungstenite::upgrade(&mut req, None).context("failed to upgrade to WebSocket")?;
  let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();

  tokio::spawn(async move {
    if let Err(err) = pump(websocket, upstream, path_and_query).await {
      log_host(&logger, &app_host, format!("websocket proxy error: {err}"), true);
    }
  });

  let (parts, _incoming_body) = response.into_parts();
  Ok(Response::from_parts(parts, Full::new(Bytes::new())))
}

async fn pump(websocket: HyperWebsocket, upstream: ResolvedUpstream, path_and_query: String) -> Result<()> {
  let client_ws = websocket.await.context("inbound websocket handshake failed")?;

  let scheme = match upstream.scheme {
    UpstreamScheme::Http => "ws",
    UpstreamScheme::Https => "wss",
  };
  let upstream_url = format!("{scheme}://{}:{}{path_and_query}", upstream.host, upstream.port);
  let (upstream_ws, _response) = tokio_tungstenite::connect_async(&upstream_url)
    .await
    .with_context(|| format!("failed to connect upstream websocket at {upstream_url}"))?;

  let (mut client_write, mut client_read) = client_ws.split();
  let (mut upstream_write, mut upstream_read) = upstream_ws.split();

  let client_to_upstream = async {
    while let Some(message) = client_read.next().await {
      let message = message?;
      if upstream_write.send(convert_to_client(message)).await.is_err() {
        break;
      }
    }
    Ok::<_, tokio_tungstenite::tungstenite::Error>(())
  };

  let upstream_to_client = async {
    while let Some(message) = upstream_read.next().await {
      let message = message?;
      if client_write.send(convert_to_server(message)).await.is_err() {
        break;
      }
    }
    Ok::<_, tokio_tungstenite::tungstenite::Error>(())
  };

  let _ = tokio::join!(client_to_upstream, upstream_to_client);
  Ok(())
}

fn convert_to_client(message: ServerMessage) -> ClientMessage {
  match message {
    ServerMessage::Text(text) => ClientMessage::Text(text),
    ServerMessage::Binary(data) => ClientMessage::Binary(data),
    ServerMessage::Ping(data) => ClientMessage::Ping(data),
    ServerMessage::Pong(data) => ClientMessage::Pong(data),
    ServerMessage::Close(frame) => ClientMessage::Close(frame),
    ServerMessage::Frame(_) => ClientMessage::Close(None),
  }
}

fn convert_to_server(message: ClientMessage) -> ServerMessage {
  match message {
    ClientMessage::Text(text) => ServerMessage::Text(text),
    ClientMessage::Binary(data) => ServerMessage::Binary(data),
    ClientMessage::Ping(data) => ServerMessage::Ping(data),
    ClientMessage::Pong(data) => ServerMessage::Pong(data),
    ClientMessage::Close(frame) => ServerMessage::Close(frame),
    ClientMessage::Frame(_) => ServerMessage::Close(None),
  }
}
