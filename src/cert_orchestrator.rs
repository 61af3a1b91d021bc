use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig as RustlsServerConfig;
use tokio::sync::{broadcast, Mutex, RwLock};
use x509_parser::pem::parse_x509_pem;

use crate::acme::AcmeClient;
use crate::cert_store::{parse_cert, CertStore};
use crate::events::{EventBus, GatewayEvent};
use crate::logger::{log_host, Logger};
use crate::router::HostRouter;
use crate::self_signed;
use crate::tls_util::OneCertifiedKeyResolver;
use crate::util::{is_local_like, wildcard_base, TtlCache};

const LOCAL_GATEWAY_NAME: &str = "local-gateway";
const DEFAULT_FALLBACK_HOST: &str = "localhost";
const TTL_CACHE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
const TTL_CACHE_MAX_ENTRIES: usize = 100;
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const NEAR_EXPIRY_REUSE_THRESHOLD: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// A resolved TLS context ready to terminate a handshake, plus the expiry the TTL cache uses for
/// eviction bookkeeping.
#[derive(Clone)]
pub struct TlsContext {
  pub server_config: Arc<RustlsServerConfig>,
  pub expires_at: SystemTime,
}

/// C4 — per-host certificate policy (local-like combined cert vs. public ACME-with-fallback)
/// plus the TTL-bounded cache of parsed TLS contexts consulted on every SNI callback.
pub struct CertOrchestrator {
  cert_store: CertStore,
  acme: AcmeClient,
  router: Arc<HostRouter>,
  logger: Logger,
  context_cache: Mutex<TtlCache<String, TlsContext>>,
  /// Serializes `ensure_cert` per hostname: concurrent callers for the same host wait on the
  /// same in-flight issuance/parse instead of racing (§4.4 concurrency note).
  ensure_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertOrchestrator {
  pub fn new(cert_store: CertStore, acme: AcmeClient, router: Arc<HostRouter>, logger: Logger) -> Arc<Self> {
    Arc::new(Self {
      cert_store,
      acme,
      router,
      logger,
      context_cache: Mutex::new(TtlCache::with_max_entries(TTL_CACHE_DURATION, TTL_CACHE_MAX_ENTRIES)),
      ensure_locks: RwLock::new(HashMap::new()),
    })
  }

  /// Spawns the hourly TTL sweep (§4.4: "expiry scans run hourly").
  pub fn spawn_ttl_sweeper(self: &Arc<Self>) {
    let this = self.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(TTL_SWEEP_INTERVAL);
      loop {
        interval.tick().await;
        this.context_cache.lock().await.cleanup();
      }
    });
  }

  /// Subscribes to the event bus so that adding or starting a local-like app proactively
  /// regenerates the combined certificate before the first handshake for it (§4.10).
  pub fn spawn_reissue_on_events(self: &Arc<Self>, bus: &EventBus) {
    let this = self.clone();
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
      loop {
        match receiver.recv().await {
          Ok(GatewayEvent::AppAdded { host } | GatewayEvent::AppStart { host }) => {
            if is_local_like(&host.to_ascii_lowercase()) {
              if let Err(err) = this.ensure_cert(&host).await {
                log_host(&this.logger, &host, format!("proactive certificate regeneration failed: {err}"), true);
              }
            }
          }
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(_)) => continue,
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });
  }

  /// SNI entry point: returns a cached or newly built TLS context for `servername`. Callers must
  /// only pass a servername the host router actually matches — `tls_listener` checks this before
  /// ever reaching here, and this is checked again so no other call site can grow `ensure_locks`
  /// or trigger issuance/regeneration for an arbitrary, unconfigured hostname (§9 "SNI failure
  /// policy").
  pub async fn get_context(&self, servername: &str) -> Result<TlsContext> {
    let key = servername.to_ascii_lowercase();
    if let Some(context) = self.context_cache.lock().await.get(&key) {
      return Ok(context);
    }

    if self.router.lookup(&key).is_none() {
      return Err(anyhow!("no app configured for host \"{key}\""));
    }

    let (cert_pem, key_pem) = self.ensure_cert(&key).await?;
    let context = build_tls_context(&cert_pem, &key_pem)?;
    self.context_cache.lock().await.insert_with_expiry(key, context.clone(), instant_from_system_time(context.expires_at));
    Ok(context)
  }

  /// Builds the fallback TLS context served for SNI names the router doesn't recognize. Called
  /// once during startup, not per-connection, so it bypasses `get_context`'s router-match gate by
  /// calling `ensure_cert` directly with the fixed, non-attacker-controlled `"localhost"` name.
  pub async fn bootstrap_default_context(&self) -> Result<TlsContext> {
    let (cert_pem, key_pem) = self.ensure_cert(DEFAULT_FALLBACK_HOST).await?;
    build_tls_context(&cert_pem, &key_pem)
  }

  /// Public API: ensures a valid cert/key pair exists on disk for `hostname`, generating or
  /// reissuing as needed, and returns the PEM pair.
  pub async fn ensure_cert(&self, hostname: &str) -> Result<(String, String)> {
    let lock = self.lock_for(hostname).await;
    let _guard = lock.lock().await;

    let lower = hostname.to_ascii_lowercase();
    if is_local_like(&lower) {
      self.ensure_local_like_cert(&lower).await
    } else {
      self.ensure_public_cert(&lower).await
    }
  }

  async fn lock_for(&self, hostname: &str) -> Arc<Mutex<()>> {
    let lower = hostname.to_ascii_lowercase();
    if let Some(lock) = self.ensure_locks.read().await.get(&lower) {
      return lock.clone();
    }
    let mut locks = self.ensure_locks.write().await;
    locks.entry(lower).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
  }

  /// §4.4 step 2 — the combined `local-gateway` record.
  async fn ensure_local_like_cert(&self, hostname: &str) -> Result<(String, String)> {
    let target_sans = self.local_like_san_set(hostname);

    if let Some((cert_pem, key_pem)) = self.cert_store.read(LOCAL_GATEWAY_NAME).await {
      if let Some(parsed) = parse_cert(&cert_pem) {
        let existing: std::collections::HashSet<String> = parsed.san_dns_names.iter().cloned().collect();
        let covers_target = target_sans.iter().all(|san| existing.contains(san));
        if covers_target && parsed.subject_cn.as_deref() == Some(LOCAL_GATEWAY_NAME) {
          return Ok((cert_pem, key_pem));
        }
      }
    }

    let sans: Vec<String> = target_sans.into_iter().collect();
    let (cert_pem, key_pem) = self_signed::generate(LOCAL_GATEWAY_NAME, &sans)?;
    self.cert_store.write(LOCAL_GATEWAY_NAME, &cert_pem, &key_pem).await?;
    Ok((cert_pem, key_pem))
  }

  /// Union of the requesting hostname, every configured local-like app host/altName, and the
  /// two-label wildcard base for each such name (§4.4 step 2).
  fn local_like_san_set(&self, requesting_hostname: &str) -> std::collections::HashSet<String> {
    let mut sans = std::collections::HashSet::new();
    sans.insert(requesting_hostname.to_string());

    for (app_host, alt_names) in self.router.all_hosts_and_alt_names() {
      let mut names = vec![app_host];
      names.extend(alt_names);
      for name in names {
        let lower = name.to_ascii_lowercase();
        if !is_local_like(&lower) {
          continue;
        }
        sans.insert(lower.clone());
        if let Some(base) = wildcard_base(&lower) {
          sans.insert(base);
        }
      }
    }

    if let Some(base) = wildcard_base(requesting_hostname) {
      sans.insert(base);
    }

    sans
  }

  /// §4.4 step 3 — public per-host record: reuse if valid for ≥10 days, else ACME with
  /// self-signed fallback. This implements the *documented* near-expiry behavior rather than
  /// the "reuse whenever the files exist" behavior the design notes flag as a known bug in the
  /// system this specification was distilled from.
  async fn ensure_public_cert(&self, hostname: &str) -> Result<(String, String)> {
    if let Some((cert_pem, key_pem)) = self.cert_store.read(hostname).await {
      if self.is_valid_for_at_least(&cert_pem, NEAR_EXPIRY_REUSE_THRESHOLD) {
        return Ok((cert_pem, key_pem));
      }
    }

    match self.acme.issue(hostname, &[]).await {
      Ok((cert_pem, key_pem)) => {
        self.cert_store.write(hostname, &cert_pem, &key_pem).await?;
        Ok((cert_pem, key_pem))
      }
      Err(err) => {
        log_host(
          &self.logger,
          hostname,
          format!("ACME issuance failed, falling back to a self-signed certificate: {err}"),
          true,
        );
        let (cert_pem, key_pem) = self_signed::generate(hostname, &[hostname.to_string()])?;
        self.cert_store.write(hostname, &cert_pem, &key_pem).await?;
        Ok((cert_pem, key_pem))
      }
    }
  }

  fn is_valid_for_at_least(&self, cert_pem: &str, margin: Duration) -> bool {
    let Ok((_, pem)) = parse_x509_pem(cert_pem.as_bytes()) else {
      return false;
    };
    let Ok(cert) = pem.parse_x509() else {
      return false;
    };
    let Ok(not_after) = SystemTime::try_from(cert.validity().not_after.to_datetime()) else {
      return false;
    };
    match not_after.duration_since(SystemTime::now()) {
      Ok(remaining) => remaining > margin,
      Err(_) => false,
    }
  }
}

/// Converts a wall-clock `SystemTime` deadline into a monotonic `Instant` the TTL cache can
/// compare against, for carrying a certificate's own `notAfter` into the cache's per-entry expiry
/// (§4.4: "evict by earliest `expiresAt`"). A deadline already in the past maps to "now".
fn instant_from_system_time(target: SystemTime) -> std::time::Instant {
  match target.duration_since(SystemTime::now()) {
    Ok(remaining) => std::time::Instant::now() + remaining,
    Err(_) => std::time::Instant::now(),
  }
}

/// Builds a single-certificate rustls `ServerConfig` (wrapped for SNI dispatch by
/// `OneCertifiedKeyResolver`) from a PEM cert chain and key, and records the chain's earliest
/// `notAfter` as the TTL cache entry's `expiresAt`.
fn build_tls_context(cert_pem: &str, key_pem: &str) -> Result<TlsContext> {
  let certs = rustls_pemfile::certs(&mut Cursor::new(cert_pem.as_bytes()))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("failed to parse certificate chain")?;
  let private_key = match rustls_pemfile::private_key(&mut Cursor::new(key_pem.as_bytes())) {
    Ok(Some(key)) => key,
    Ok(None) => return Err(anyhow!("no private key found in PEM")),
    Err(err) => return Err(err.into()),
  };

  let signing_key = CryptoProvider::get_default()
    .ok_or_else(|| anyhow!("no default rustls crypto provider installed"))?
    .key_provider
    .load_private_key(private_key)
    .context("failed to load private key")?;

  let certified_key = Arc::new(CertifiedKey::new(certs, signing_key));
  let resolver = Arc::new(OneCertifiedKeyResolver::new(certified_key)) as Arc<dyn ResolvesServerCert>;

  let mut server_config = RustlsServerConfig::builder().with_no_client_auth().with_cert_resolver(resolver);
  server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

  let expires_at = parse_cert(cert_pem)
    .and_then(|_| parse_x509_pem(cert_pem.as_bytes()).ok())
    .and_then(|(_, pem)| pem.parse_x509().ok())
    .and_then(|cert| SystemTime::try_from(cert.validity().not_after.to_datetime()).ok())
    .unwrap_or_else(|| SystemTime::now() + TTL_CACHE_DURATION);

  Ok(TlsContext {
    server_config: Arc::new(server_config),
    expires_at,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn local_like_san_set_includes_requested_and_wildcard() {
    let cert_store = CertStore::new(std::env::temp_dir().join("hostgate-orch-test"));
    let acme = AcmeClient::new(
      "https://acme.example.invalid/directory".to_string(),
      "ops@example.com".to_string(),
      crate::acme::ChallengeTable::new(),
    );
    let router = HostRouter::new();
    let (logger, _rx) = async_channel::unbounded();
    let orchestrator = CertOrchestrator {
      cert_store,
      acme,
      router,
      logger,
      context_cache: Mutex::new(TtlCache::with_max_entries(TTL_CACHE_DURATION, TTL_CACHE_MAX_ENTRIES)),
      ensure_locks: RwLock::new(HashMap::new()),
    };

    let sans = orchestrator.local_like_san_set("api.local.console");
    assert!(sans.contains("api.local.console"));
    assert!(sans.contains("*.local.console"));
  }
}
