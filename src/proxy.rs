use std::sync::Arc;

use anyhow::{anyhow, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::config::ResolvedUpstream;

type ProxyBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// The two upstream clients C9 needs: one that verifies upstream TLS certs (the default) and one
/// that doesn't, for apps configured with `rejectUnauthorized: false` (self-signed upstreams on
/// loopback are common enough in this gateway's target deployments to warrant the escape hatch).
pub struct ProxyClients {
  verifying: Client<HttpsConnector<HttpConnector>, ProxyBody>,
  insecure: Client<HttpsConnector<HttpConnector>, ProxyBody>,
}

impl ProxyClients {
  pub fn new() -> Result<Self> {
    let verifying_connector = HttpsConnectorBuilder::new()
      .with_native_roots()?
      .https_or_http()
      .enable_http1()
      .build();
    let insecure_connector = HttpsConnectorBuilder::new()
      .with_tls_config(insecure_tls_config())
      .https_or_http()
      .enable_http1()
      .build();

    Ok(Self {
      verifying: Client::builder(TokioExecutor::new()).build(verifying_connector),
      insecure: Client::builder(TokioExecutor::new()).build(insecure_connector),
    })
  }

  fn client_for(&self, reject_unauthorized: bool) -> &Client<HttpsConnector<HttpConnector>, ProxyBody> {
    if reject_unauthorized {
      &self.verifying
    } else {
      &self.insecure
    }
  }
}

fn insecure_tls_config() -> rustls::ClientConfig {
  rustls::ClientConfig::builder()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer<'_>,
    _intermediates: &[rustls_pki_types::CertificateDer<'_>],
    _server_name: &rustls_pki_types::ServerName<'_>,
    _ocsp_response: &[u8],
    _now: rustls_pki_types::UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    rustls::crypto::CryptoProvider::get_default()
      .expect("default crypto provider installed at startup")
      .signature_verification_algorithms
      .supported_schemes()
  }
}

/// Forwards `req` to `upstream`, rewriting the request the way a reverse proxy must (§4.9):
/// `X-Forwarded-*` headers are added/appended, and the `Host` header either passes through
/// unchanged (`preserveHost`) or is rewritten to the upstream's own host:port.
pub async fn forward(
  clients: &ProxyClients,
  upstream: &ResolvedUpstream,
  mut req: Request<ProxyBody>,
  preserve_host: bool,
  client_addr: std::net::IpAddr,
) -> Result<Response<hyper::body::Incoming>> {
  let original_host = req
    .headers()
    .get(hyper::header::HOST)
    .and_then(|value| value.to_str().ok())
    .unwrap_or_default()
    .to_string();

  let uri = build_upstream_uri(upstream, req.uri())?;
  *req.uri_mut() = uri;

  let headers = req.headers_mut();
  if !preserve_host {
    let host_value = format!("{}:{}", upstream.host, upstream.port);
    headers.insert(hyper::header::HOST, HeaderValue::from_str(&host_value)?);
  }

  append_forwarded_for(headers, client_addr)?;
  headers.insert(
    HeaderName::from_static("x-forwarded-proto"),
    HeaderValue::from_static("https"),
  );
  if !original_host.is_empty() {
    headers.insert(
      HeaderName::from_static("x-forwarded-host"),
      HeaderValue::from_str(&original_host)?,
    );
  }

  let client = clients.client_for(upstream.reject_unauthorized);
  client.request(req).await.map_err(|err| anyhow!("upstream request failed: {err}"))
}

fn build_upstream_uri(upstream: &ResolvedUpstream, original: &Uri) -> Result<Uri> {
  let path_and_query = original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  let scheme = match upstream.scheme {
    crate::config::UpstreamScheme::Http => "http",
    crate::config::UpstreamScheme::Https => "https",
  };
  format!("{scheme}://{}:{}{path_and_query}", upstream.host, upstream.port)
    .parse::<Uri>()
    .map_err(|err| anyhow!("invalid upstream URI: {err}"))
}

fn append_forwarded_for(headers: &mut hyper::HeaderMap, client_addr: std::net::IpAddr) -> Result<()> {
  let name = HeaderName::from_static("x-forwarded-for");
  let appended = match headers.get(&name).and_then(|value| value.to_str().ok()) {
    Some(existing) => format!("{existing}, {client_addr}"),
    None => client_addr.to_string(),
  };
  headers.insert(name, HeaderValue::from_str(&appended)?);
  Ok(())
}

/// Rewrites an upstream response before it goes back to the client (§4.9): a `Location` header
/// pointing at the upstream's own `host:port` is rewritten to the externally visible
/// `app_host[:https_port]` ("callback-port injection" — the upstream only knows its own loopback
/// port, not the gateway's public HTTPS port), and any `Set-Cookie` `Domain=` attribute is
/// stripped so the browser scopes the cookie to the host it actually talked to.
pub fn rewrite_response(mut response: Response<hyper::body::Incoming>, upstream: &ResolvedUpstream, app_host: &str, https_port: u16) -> Response<hyper::body::Incoming> {
  if let Some(location) = response.headers().get(hyper::header::LOCATION).cloned() {
    if let Ok(location_str) = location.to_str() {
      if let Some(rewritten) = rewrite_location(location_str, upstream, app_host, https_port) {
        if let Ok(value) = HeaderValue::from_str(&rewritten) {
          response.headers_mut().insert(hyper::header::LOCATION, value);
        }
      }
    }
  }

  let cookie_values: Vec<HeaderValue> = response
    .headers()
    .get_all(hyper::header::SET_COOKIE)
    .iter()
    .cloned()
    .collect();
  if !cookie_values.is_empty() {
    response.headers_mut().remove(hyper::header::SET_COOKIE);
    for value in cookie_values {
      if let Ok(as_str) = value.to_str() {
        if let Ok(stripped) = HeaderValue::from_str(&strip_cookie_domain(as_str)) {
          response.headers_mut().append(hyper::header::SET_COOKIE, stripped);
        }
      }
    }
  }

  response
}

/// §4.9's Location rewrite: resolves `location` against the upstream (relative locations are
/// implicitly same-origin as the upstream), rewrites it to the public host/port when its host is
/// the upstream's own host or a loopback alias, and — in both the rewritten and untouched-host
/// cases — injects the incoming request's port into a `callback` query parameter whose own host
/// matches the public host and lacks a port (property 6, property 7, scenario S3).
fn rewrite_location(location: &str, upstream: &ResolvedUpstream, app_host: &str, incoming_port: u16) -> Option<String> {
  let public_authority = public_authority(app_host, incoming_port);

  let host_rewritten = match location.parse::<Uri>() {
    Ok(uri) => rewrite_location_uri(&uri, upstream, &public_authority),
    Err(_) => fallback_prefix_rewrite(location, upstream, &public_authority),
  };

  let base = host_rewritten.unwrap_or_else(|| location.to_string());
  let with_callback = inject_callback_port(&base, app_host, incoming_port);

  if with_callback == location {
    None
  } else {
    Some(with_callback)
  }
}

fn public_authority(app_host: &str, port: u16) -> String {
  if port == 443 {
    app_host.to_string()
  } else {
    format!("{app_host}:{port}")
  }
}

/// A relative Location (no authority) is implicitly same-origin with the upstream it came from,
/// so it's always an "internal" rewrite target.
fn rewrite_location_uri(uri: &Uri, upstream: &ResolvedUpstream, public_authority: &str) -> Option<String> {
  let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  match uri.host() {
    None => Some(format!("https://{public_authority}{path_and_query}")),
    Some(host) if is_upstream_or_loopback_host(host, upstream) => Some(format!("https://{public_authority}{path_and_query}")),
    Some(_) => None,
  }
}

fn is_upstream_or_loopback_host(host: &str, upstream: &ResolvedUpstream) -> bool {
  let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
  host == upstream.host.to_ascii_lowercase() || matches!(host.as_str(), "127.0.0.1" | "localhost" | "::1")
}

/// Malformed-URL fallback (§4.9): a literal prefix replacement against every scheme/loopback-alias
/// combination an upstream redirect could plausibly use.
fn fallback_prefix_rewrite(location: &str, upstream: &ResolvedUpstream, public_authority: &str) -> Option<String> {
  for host_candidate in [upstream.host.as_str(), "127.0.0.1", "localhost", "::1"] {
    for scheme in ["http", "https"] {
      let prefix = format!("{scheme}://{host_candidate}:{}", upstream.port);
      if let Some(rest) = location.strip_prefix(&prefix) {
        return Some(format!("https://{public_authority}{rest}"));
      }
    }
  }
  None
}

/// Finds a `callback` query parameter, and if its value is itself a URL whose host equals the
/// public host and has no explicit port, rewrites it in place to carry `incoming_port`. Leaves
/// `location` byte-for-byte unchanged if there's no such parameter, so callers can detect "nothing
/// changed" with a plain string comparison (needed for property 7's idempotence check).
fn inject_callback_port(location: &str, app_host: &str, incoming_port: u16) -> String {
  let Some(query_start) = location.find('?') else {
    return location.to_string();
  };
  let (before_query, rest) = location.split_at(query_start);
  let rest = &rest[1..];
  let (query, fragment) = match rest.find('#') {
    Some(idx) => (&rest[..idx], &rest[idx..]),
    None => (rest, ""),
  };

  let mut changed = false;
  let mut pairs = Vec::new();
  for pair in query.split('&') {
    if pair.is_empty() {
      continue;
    }
    let mut parts = pair.splitn(2, '=');
    let key = parts.next().unwrap_or("");
    let value = parts.next();

    if key == "callback" {
      if let Some(value) = value {
        let decoded = urlencoding::decode(value).map(|c| c.into_owned()).unwrap_or_else(|_| value.to_string());
        if let Some(injected) = inject_port_into_callback_url(&decoded, app_host, incoming_port) {
          pairs.push(format!("callback={}", urlencoding::encode(&injected)));
          changed = true;
          continue;
        }
      }
    }
    pairs.push(pair.to_string());
  }

  if !changed {
    return location.to_string();
  }
  format!("{before_query}?{}{fragment}", pairs.join("&"))
}

fn inject_port_into_callback_url(callback: &str, app_host: &str, incoming_port: u16) -> Option<String> {
  let uri: Uri = callback.parse().ok()?;
  let host = uri.host()?;
  if !host.eq_ignore_ascii_case(app_host) || uri.port_u16().is_some() {
    return None;
  }
  let scheme = uri.scheme_str().unwrap_or("https");
  let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  Some(format!("{scheme}://{host}:{incoming_port}{path_and_query}"))
}

fn strip_cookie_domain(set_cookie: &str) -> String {
  set_cookie
    .split(';')
    .map(str::trim)
    .filter(|attribute| !attribute.to_ascii_lowercase().starts_with("domain="))
    .collect::<Vec<_>>()
    .join("; ")
}

pub fn bad_gateway() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::BAD_GATEWAY)
    .body(Full::new(Bytes::from_static(b"bad gateway")))
    .unwrap()
}

pub fn box_body(response: Response<Full<Bytes>>) -> Response<ProxyBody> {
  response.map(|body| body.map_err(|never| match never {}).boxed())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::UpstreamScheme;

  fn upstream() -> ResolvedUpstream {
    ResolvedUpstream { scheme: UpstreamScheme::Http, host: "127.0.0.1".to_string(), port: 3000, reject_unauthorized: true }
  }

  #[test]
  fn rewrites_location_pointing_at_upstream() {
    let rewritten = rewrite_location("http://127.0.0.1:3000/dashboard", &upstream(), "app.example.com", 4443);
    assert_eq!(rewritten, Some("https://app.example.com:4443/dashboard".to_string()));
  }

  #[test]
  fn leaves_unrelated_location_untouched() {
    assert_eq!(rewrite_location("https://other.example.com/x", &upstream(), "app.example.com", 443), None);
  }

  #[test]
  fn strips_domain_attribute_only() {
    let stripped = strip_cookie_domain("session=abc; Domain=internal.local; Path=/; HttpOnly");
    assert_eq!(stripped, "session=abc; Path=/; HttpOnly");
  }

  #[test]
  fn rewrites_location_and_injects_callback_port() {
    // Scenario S3.
    let rewritten = rewrite_location(
      "http://127.0.0.1:3000/done?callback=https://app.example.com/next",
      &upstream(),
      "app.example.com",
      4443,
    );
    assert_eq!(
      rewritten,
      Some("https://app.example.com:4443/done?callback=https%3A%2F%2Fapp.example.com%3A4443%2Fnext".to_string())
    );
  }

  #[test]
  fn rewriting_twice_is_idempotent() {
    // Property 7.
    let once = rewrite_location(
      "http://127.0.0.1:3000/done?callback=https://app.example.com/next",
      &upstream(),
      "app.example.com",
      4443,
    )
    .unwrap();
    let twice = rewrite_location(&once, &upstream(), "app.example.com", 4443);
    assert_eq!(twice, None, "second rewrite should be a no-op, matching the first result byte-for-byte");
  }

  #[test]
  fn callback_injection_applies_to_external_locations_too() {
    let rewritten = rewrite_location(
      "https://other.example.com/x?callback=https://app.example.com/y",
      &upstream(),
      "app.example.com",
      4443,
    );
    assert_eq!(
      rewritten,
      Some("https://other.example.com/x?callback=https%3A%2F%2Fapp.example.com%3A4443%2Fy".to_string())
    );
  }

  #[test]
  fn callback_with_existing_port_is_left_alone() {
    // Only the host rewrite applies; the callback value already carries a port, so it round-trips
    // byte-for-byte rather than being re-encoded.
    let rewritten = rewrite_location(
      "http://127.0.0.1:3000/done?callback=https://app.example.com:9999/next",
      &upstream(),
      "app.example.com",
      4443,
    );
    assert_eq!(rewritten, Some("https://app.example.com:4443/done?callback=https://app.example.com:9999/next".to_string()));
  }

  #[test]
  fn relative_location_is_treated_as_upstream_origin() {
    let rewritten = rewrite_location("/profile", &upstream(), "app.example.com", 443);
    assert_eq!(rewritten, Some("https://app.example.com/profile".to_string()));
  }

  #[test]
  fn localhost_alias_is_rewritten_like_the_upstream_host() {
    let rewritten = rewrite_location("http://localhost:3000/page", &upstream(), "app.example.com", 443);
    assert_eq!(rewritten, Some("https://app.example.com/page".to_string()));
  }
}
