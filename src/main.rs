mod acme;
mod cert_orchestrator;
mod cert_store;
mod config;
mod delegate;
mod events;
mod health;
mod http_listener;
mod log;
mod logger;
mod proxy;
mod router;
mod self_signed;
mod state;
mod static_files;
mod supervisor;
mod tls_listener;
mod tls_util;
mod util;
mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::acme::{AcmeClient, ChallengeTable};
use crate::cert_orchestrator::CertOrchestrator;
use crate::cert_store::CertStore;
use crate::config::load_config;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::logger::{log_host, spawn_logger};
use crate::proxy::ProxyClients;
use crate::router::HostRouter;
use crate::state::GatewayState;
use crate::supervisor::Supervisor;

const DEFAULT_CONFIG_PATH: &str = "./gateway.json";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_HTTPS_PORT: u16 = 4443;

#[global_allocator]
static GLOBAL_ALLOCATOR: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "hostgate", about = "Host-routed HTTPS reverse proxy with per-host certificate lifecycle management")]
struct Cli {
  /// Path to the gateway configuration file.
  #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
  config: PathBuf,
}

fn env_port(name: &str, default: u16) -> u16 {
  std::env::var(name).ok().and_then(|value| value.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();
  let logger = spawn_logger();

  if let Err(err) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
    log_host(&logger, "startup", format!("failed to install default rustls crypto provider: {err:?}"), true);
    std::process::exit(1);
  }

  let config = match load_config(&cli.config).await {
    Ok(config) => config,
    Err(err) => {
      log_host(&logger, "startup", format!("failed to load configuration from {}: {err:#}", cli.config.display()), true);
      std::process::exit(1);
    }
  };

  let http_port = env_port("GATEWAY_HTTP_PORT", DEFAULT_HTTP_PORT);
  let https_port = env_port("GATEWAY_HTTPS_PORT", DEFAULT_HTTPS_PORT);
  let _admin_token = std::env::var("GATEWAY_ADMIN_TOKEN").ok().or_else(|| config.admin_token.clone());

  // Initialization order matters for correctness, not just convenience: the cert store must
  // exist before anything asks the orchestrator for a context, the router must be populated
  // before either listener accepts a connection, and the event bus must have its first
  // subscribers (the orchestrator, the health monitor) attached before the router publishes
  // anything derived from config.
  let cert_store = CertStore::new(config.acme.config_dir.clone());
  if let Err(err) = cert_store.ensure_dir().await {
    log_host(&logger, "startup", format!("failed to initialize certificate storage: {err:#}"), true);
    std::process::exit(1);
  }

  let challenges = ChallengeTable::new();
  let acme_client = AcmeClient::new(config.acme.directory_url.clone(), config.email.clone(), challenges.clone());

  let router = HostRouter::new();
  router.set_apps(config.apps.clone());

  let bus = EventBus::new();
  let cert_orchestrator = CertOrchestrator::new(cert_store, acme_client, router.clone(), logger.clone());
  cert_orchestrator.spawn_ttl_sweeper();
  cert_orchestrator.spawn_reissue_on_events(&bus);

  // §9 "SNI failure policy": built once up front so the HTTPS listener never has to call into
  // the orchestrator for a servername the router doesn't recognize.
  let default_tls_context = match cert_orchestrator.bootstrap_default_context().await {
    Ok(context) => context,
    Err(err) => {
      log_host(&logger, "startup", format!("failed to build default TLS context: {err:#}"), true);
      std::process::exit(1);
    }
  };

  let health = HealthMonitor::new(bus.clone());
  let supervisor = Supervisor::new(bus.clone(), logger.clone());

  for app in router.all() {
    if let Err(err) = supervisor.supervise(app.clone()).await {
      log_host(&logger, &app.host_key(), format!("failed to start: {err:#}"), true);
    }
    health.start_probing(app).await;
  }

  let proxy_clients = Arc::new(ProxyClients::new()?);

  let state = Arc::new(GatewayState {
    router,
    cert_orchestrator,
    health,
    supervisor,
    proxy_clients,
    logger: logger.clone(),
    https_port,
    default_tls_context,
    delegate: None,
  });

  let http_task = tokio::spawn({
    let logger = logger.clone();
    let listener = Arc::new(http_listener::HttpListener::new(http_port, https_port, challenges, logger, None));
    async move { listener.serve().await }
  });
  let https_task = tokio::spawn(tls_listener::serve(state.clone(), https_port));

  tokio::select! {
    result = http_task => {
      if let Err(err) = result {
        log_host(&logger, "startup", format!("HTTP listener task panicked: {err}"), true);
      }
    }
    result = https_task => {
      if let Err(err) = result {
        log_host(&logger, "startup", format!("HTTPS listener task panicked: {err}"), true);
      }
    }
    _ = shutdown_signal() => {
      log_host(&logger, "startup", "received shutdown signal, stopping children", false);
    }
  }

  // §5: shutdown closes both listeners (already gone once `tokio::select!` returns, since the
  // non-selected branches are dropped), then terminates all supervised children, then exits.
  state.supervisor.shutdown_all().await;

  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    let _ = tokio::signal::ctrl_c().await;
  };

  #[cfg(unix)]
  let terminate = async {
    let Ok(mut signal) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
      std::future::pending::<()>().await;
      return;
    };
    signal.recv().await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {}
    _ = terminate => {}
  }
}
