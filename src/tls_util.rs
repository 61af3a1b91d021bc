use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;

/// A certificate resolver resolving one certified key, regardless of the requested SNI name.
///
/// The TLS listener picks the record *before* the rustls handshake continues (see
/// `tls_listener::accept`, which uses a `LazyConfigAcceptor` to read the ClientHello first),
/// so by the time a `rustls::ServerConfig` is built the certificate is already known.
#[derive(Debug)]
pub struct OneCertifiedKeyResolver {
  certified_key: Arc<CertifiedKey>,
}

impl OneCertifiedKeyResolver {
  /// Creates a certificate resolver with a certified key
  pub fn new(certified_key: Arc<CertifiedKey>) -> Self {
    Self { certified_key }
  }
}

impl ResolvesServerCert for OneCertifiedKeyResolver {
  fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
    Some(self.certified_key.clone())
  }
}
