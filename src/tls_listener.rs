use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_rustls::LazyConfigAcceptor;

use crate::config::RequestTarget;
use crate::delegate::DelegateOutcome;
use crate::logger::log_host;
use crate::proxy::{bad_gateway, box_body, forward, rewrite_response};
use crate::state::GatewayState;
use crate::static_files;
use crate::util::bind_with_retry;
use crate::websocket;

const DEFAULT_SNI_FALLBACK: &str = "localhost";

/// C9 — the HTTPS listener: peeks each connection's SNI before completing the TLS handshake so
/// the per-host certificate context (C4) can be resolved asynchronously, then serves HTTP/1.1
/// over the now-established `TlsStream`, routing to a static directory, a reverse-proxied
/// upstream, or a proxied WebSocket upgrade depending on the matched app.
///
/// A synchronous `ResolvesServerCert` can't await C4's certificate orchestration, so this uses
/// `LazyConfigAcceptor` to split the handshake into "read ClientHello" / "finish with a
/// `ServerConfig` built from it" instead.
pub async fn serve(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
  let addr = SocketAddr::from(([0, 0, 0, 0], port));
  let listener = bind_with_retry(addr).await.map_err(|err| anyhow::anyhow!("failed to bind {addr}: {err}"))?;
  log_host(&state.logger, "https", format!("listening on {addr}"), false);

  loop {
    let (stream, peer) = match listener.accept().await {
      Ok(pair) => pair,
      Err(err) => {
        log_host(&state.logger, "https", format!("accept failed: {err}"), true);
        continue;
      }
    };

    let state = state.clone();
    tokio::spawn(async move {
      if let Err(err) = handle_connection(state.clone(), stream, peer).await {
        log_host(&state.logger, "https", format!("connection from {peer} failed: {err}"), true);
      }
    });
  }
}

async fn handle_connection(state: Arc<GatewayState>, stream: tokio::net::TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
  let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
  tokio::pin!(acceptor);

  let start = acceptor.as_mut().await?;
  let client_hello = start.client_hello();
  let servername = client_hello.server_name().unwrap_or(DEFAULT_SNI_FALLBACK).to_ascii_lowercase();

  // §9 "SNI failure policy": only a servername the router actually knows about is worth
  // orchestrating a certificate for. Anything else (an attacker probing arbitrary SNI values, a
  // client that never sent one) gets the prebuilt `localhost` fallback directly, with no call
  // into C4 — so no ACME issuance, no combined-cert regeneration, and no per-hostname lock ever
  // gets created for a name no app configured.
  let context = if state.router.lookup(&servername).is_some() {
    state.cert_orchestrator.get_context(&servername).await?
  } else {
    state.default_tls_context.clone()
  };
  let tls_stream = start.into_stream(context.server_config).await?;

  let io = TokioIo::new(tls_stream);
  let service = service_fn(move |req| {
    let state = state.clone();
    async move { handle_request_catching_panics(state, req, peer.ip()).await }
  });

  http1::Builder::new().serve_connection(io, service).with_upgrades().await?;
  Ok(())
}

/// §7: "nothing in the request path may crash the process; panics... originating inside a
/// per-request handler are caught at the handler boundary and converted to 5xx." Tokio's
/// per-task isolation already keeps a handler panic from taking down the process, but without
/// this it just drops the connection instead of answering with a response.
async fn handle_request_catching_panics(
  state: Arc<GatewayState>,
  req: Request<Incoming>,
  client_ip: std::net::IpAddr,
) -> Result<Response<http_body_util::combinators::BoxBody<Bytes, hyper::Error>>, Infallible> {
  let host_tag = req.headers().get(hyper::header::HOST).and_then(|value| value.to_str().ok()).unwrap_or("unknown").to_string();
  match AssertUnwindSafe(handle_request(state.clone(), req, client_ip)).catch_unwind().await {
    Ok(result) => result,
    Err(_panic) => {
      log_host(&state.logger, &host_tag, "panic in request handler, responding 500", true);
      Ok(box_body(internal_error()))
    }
  }
}

async fn handle_request(state: Arc<GatewayState>, req: Request<Incoming>, client_ip: std::net::IpAddr) -> Result<Response<http_body_util::combinators::BoxBody<Bytes, hyper::Error>>, Infallible> {
  if let Some(delegate) = &state.delegate {
    if let DelegateOutcome::Handled(response) = delegate.handle(&req).await {
      return Ok(box_body(response));
    }
  }

  let host_header = req
    .headers()
    .get(hyper::header::HOST)
    .and_then(|value| value.to_str().ok())
    .unwrap_or_default()
    .to_string();

  let Some(app) = state.router.lookup(&host_header) else {
    return Ok(box_body(not_found()));
  };

  // §3: `disabled` only means "supervisor refuses start" — the router still matches the host.
  // A disabled app with a `start` command falls through to the not-running 503 below once the
  // supervisor has refused it; a disabled app with `staticDir`/`upstream` and no `start` command
  // is fully servable and must not be turned into a 404 here.
  let app_host = app.host_key();

  // §4.9 step 1: a supervised app that isn't running yet can't serve anything, websocket
  // upgrades included.
  if app.start.is_some() && !state.supervisor.is_running(&app_host).await {
    return Ok(box_body(service_unavailable()));
  }

  let Some(target) = app.request_target() else {
    return Ok(box_body(not_found()));
  };

  // WebSocket upgrades reuse the same host lookup and upstream derivation but explicitly skip
  // the health gate (§4.9's "WebSocket upgrade" paragraph: "no health gate required").
  if let RequestTarget::Proxy(upstream) = &target {
    if websocket::is_upgrade_request(&req) {
      return match websocket::upgrade(req, upstream.clone(), app_host.clone(), state.logger.clone()) {
        Ok(response) => Ok(box_body(response)),
        Err(err) => {
          log_host(&state.logger, &app_host, format!("websocket upgrade failed: {err}"), true);
          Ok(box_body(bad_gateway()))
        }
      };
    }
  }

  // §4.9 step 2: give a configured health check up to 15s to report healthy before proxying.
  if app.health_url.is_some() && !state.health.wait_until_ready(&app_host).await {
    return Ok(box_body(health_timeout()));
  }

  match target {
    RequestTarget::Static(root) => {
      let response = static_files::serve(root, req.uri().path()).await;
      Ok(box_body(response))
    }
    RequestTarget::Proxy(upstream) => {
      let boxed_request = req.map(|body| body.map_err(|err| err).boxed());
      match forward(&state.proxy_clients, &upstream, boxed_request, app.preserve_host, client_ip).await {
        Ok(response) => {
          let rewritten = rewrite_response(response, &upstream, &app_host, state.https_port);
          let (parts, body) = rewritten.into_parts();
          Ok(Response::from_parts(parts, body.map_err(|err| err).boxed()))
        }
        Err(err) => {
          log_host(&state.logger, &app_host, format!("proxy request failed: {err}"), true);
          Ok(box_body(bad_gateway()))
        }
      }
    }
  }
}

fn not_found() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::NOT_FOUND)
    .body(Full::new(Bytes::from_static(b"no app configured for this host")))
    .unwrap()
}

fn service_unavailable() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::SERVICE_UNAVAILABLE)
    .body(Full::new(Bytes::from_static(b"App process not running")))
    .unwrap()
}

fn health_timeout() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::BAD_GATEWAY)
    .body(Full::new(Bytes::from_static(b"App did not become healthy within 15 seconds")))
    .unwrap()
}

fn internal_error() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::INTERNAL_SERVER_ERROR)
    .body(Full::new(Bytes::from_static(b"internal server error")))
    .unwrap()
}
