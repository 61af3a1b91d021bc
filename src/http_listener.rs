use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use crate::acme::ChallengeTable;
use crate::delegate::{DelegateOutcome, RequestDelegate};
use crate::logger::{log_host, Logger};
use crate::util::bind_with_retry;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// C8 — the plaintext port: answers ACME HTTP-01 challenges and 301-redirects everything else to
/// HTTPS. Shares nothing with C9 except the `ChallengeTable`.
pub struct HttpListener {
  port: u16,
  https_port: u16,
  challenges: ChallengeTable,
  logger: Logger,
  delegate: Option<Arc<dyn RequestDelegate>>,
}

impl HttpListener {
  pub fn new(port: u16, https_port: u16, challenges: ChallengeTable, logger: Logger, delegate: Option<Arc<dyn RequestDelegate>>) -> Self {
    Self { port, https_port, challenges, logger, delegate }
  }

  pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
    let listener = bind_with_retry(addr).await.map_err(|err| anyhow::anyhow!("failed to bind {addr}: {err}"))?;
    log_host(&self.logger, "http", format!("listening on {addr}"), false);

    loop {
      let (stream, peer) = match listener.accept().await {
        Ok(pair) => pair,
        Err(err) => {
          log_host(&self.logger, "http", format!("accept failed: {err}"), true);
          continue;
        }
      };

      let this = self.clone();
      tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
          let this = this.clone();
          async move { this.handle(req).await }
        });
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
          log_host(&this.logger, "http", format!("connection from {peer} failed: {err}"), true);
        }
      });
    }
  }

  async fn handle(&self, req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if let Some(delegate) = &self.delegate {
      if let DelegateOutcome::Handled(response) = delegate.handle(&req).await {
        return Ok(response);
      }
    }

    let path = req.uri().path();

    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
      return Ok(self.respond_to_challenge(token).await);
    }

    Ok(self.redirect_to_https(&req))
  }

  async fn respond_to_challenge(&self, token: &str) -> Response<Full<Bytes>> {
    match self.challenges.get(token).await {
      Some(key_authorization) => Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(key_authorization)))
        .unwrap(),
      None => Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
        .unwrap(),
    }
  }

  fn redirect_to_https(&self, req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let host = req
      .headers()
      .get(hyper::header::HOST)
      .and_then(|value| value.to_str().ok())
      .unwrap_or("localhost");
    let host = crate::util::strip_port(host);

    let location = if self.https_port == 443 {
      format!("https://{host}{}", req.uri())
    } else {
      format!("https://{host}:{}{}", self.https_port, req.uri())
    };

    Response::builder()
      .status(StatusCode::MOVED_PERMANENTLY)
      .header(hyper::header::LOCATION, location)
      .body(Full::new(Bytes::new()))
      .unwrap()
  }
}
