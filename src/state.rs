use std::sync::Arc;

use crate::cert_orchestrator::{CertOrchestrator, TlsContext};
use crate::delegate::RequestDelegate;
use crate::health::HealthMonitor;
use crate::logger::Logger;
use crate::proxy::ProxyClients;
use crate::router::HostRouter;
use crate::supervisor::Supervisor;

/// Everything C9's per-connection service closures need, bundled so `tls_listener` doesn't have
/// to thread five separate `Arc`s through every function signature.
pub struct GatewayState {
  pub router: Arc<HostRouter>,
  pub cert_orchestrator: Arc<CertOrchestrator>,
  pub health: Arc<HealthMonitor>,
  pub supervisor: Arc<Supervisor>,
  pub proxy_clients: Arc<ProxyClients>,
  pub logger: Logger,
  pub https_port: u16,
  /// The SNI fallback context for hostnames the router doesn't recognize (§9 "SNI failure
  /// policy"). Built once at startup so an unmatched SNI never has to call into C4.
  pub default_tls_context: TlsContext,
  /// §6's "Control-plane hook": consulted before core routing by both listeners. `None` unless
  /// an admin collaborator installs one; the core never constructs one itself.
  pub delegate: Option<Arc<dyn RequestDelegate>>,
}
