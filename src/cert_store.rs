use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

/// C1 — reads and writes PEM cert/key pairs under the configured storage directory, and parses
/// certificates for their Subject CN and SAN DNS names.
///
/// Two naming schemes coexist (§4.1): per-host `<hostname>.crt`/`.key` for public/ACME
/// certificates, and the canonical `local-gateway.crt`/`.key` for the combined self-signed
/// certificate. Both are addressed the same way here via `name`.
#[derive(Debug, Clone)]
pub struct CertStore {
  dir: PathBuf,
}

/// The parsed identity of a certificate, as needed by the orchestrator's reuse checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCert {
  pub subject_cn: Option<String>,
  pub san_dns_names: Vec<String>,
}

impl CertStore {
  pub fn new(dir: PathBuf) -> Self {
    Self { dir }
  }

  pub async fn ensure_dir(&self) -> Result<()> {
    tokio::fs::create_dir_all(&self.dir)
      .await
      .with_context(|| format!("failed to create certificate storage directory {}", self.dir.display()))?;
    Ok(())
  }

  fn cert_path(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{name}.crt"))
  }

  fn key_path(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{name}.key"))
  }

  /// Reads a cert/key pair by record name. Either file missing is reported as "missing",
  /// matching the §7 policy that cert parse/read errors are treated as "missing" and trigger
  /// regeneration rather than being fatal.
  pub async fn read(&self, name: &str) -> Option<(String, String)> {
    let cert = tokio::fs::read_to_string(self.cert_path(name)).await.ok()?;
    let key = tokio::fs::read_to_string(self.key_path(name)).await.ok()?;
    Some((cert, key))
  }

  /// Writes a cert/key pair using write-to-temp + rename, so readers never observe a
  /// half-written file. The key is published before the cert so a reader who sees `cert.pem`
  /// present is guaranteed `key.pem` is already its match (I5 / property 5).
  pub async fn write(&self, name: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
    self.ensure_dir().await?;
    write_atomic(&self.key_path(name), key_pem).await?;
    write_atomic(&self.cert_path(name), cert_pem).await?;
    Ok(())
  }

  pub fn cert_file_path(&self, name: &str) -> PathBuf {
    self.cert_path(name)
  }

  pub fn key_file_path(&self, name: &str) -> PathBuf {
    self.key_path(name)
  }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
  let tmp_path = path.with_extension(format!(
    "{}.tmp",
    path.extension().and_then(|e| e.to_str()).unwrap_or("pem")
  ));
  tokio::fs::write(&tmp_path, contents)
    .await
    .with_context(|| format!("failed to write {}", tmp_path.display()))?;
  tokio::fs::rename(&tmp_path, path)
    .await
    .with_context(|| format!("failed to rename {} into place", tmp_path.display()))?;
  Ok(())
}

/// Parses a PEM certificate for its Subject CN and SAN DNS names. Tolerates missing SAN
/// extensions (returns an empty `san_dns_names`) and returns `None` on any parse failure, which
/// callers treat as "missing" per §7.
pub fn parse_cert(pem: &str) -> Option<ParsedCert> {
  let (_, pem) = parse_x509_pem(pem.as_bytes()).ok()?;
  let cert = pem.parse_x509().ok()?;

  let subject_cn = cert
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .map(|s| s.to_string());

  let san_dns_names = cert
    .subject_alternative_name()
    .ok()
    .flatten()
    .map(|ext| {
      ext
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
          GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
          _ => None,
        })
        .collect::<Vec<_>>()
    })
    .unwrap_or_default();

  Some(ParsedCert { subject_cn, san_dns_names })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn write_then_read_round_trips() {
    let dir = std::env::temp_dir().join(format!("hostgate-certstore-test-{}", std::process::id()));
    let store = CertStore::new(dir.clone());
    store.write("example.com", "CERT", "KEY").await.unwrap();

    let (cert, key) = store.read("example.com").await.unwrap();
    assert_eq!(cert, "CERT");
    assert_eq!(key, "KEY");

    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }

  #[tokio::test]
  async fn read_missing_record_returns_none() {
    let dir = std::env::temp_dir().join(format!("hostgate-certstore-missing-{}", std::process::id()));
    let store = CertStore::new(dir);
    assert!(store.read("nope.example.com").await.is_none());
  }

  #[test]
  fn parse_cert_rejects_garbage() {
    assert!(parse_cert("not a certificate").is_none());
  }
}
