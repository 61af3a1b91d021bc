use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use time::{Duration as TimeDuration, OffsetDateTime};

const RSA_KEY_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 365;

/// C2 — generates an RSA-2048 / SHA-256 self-signed certificate for the given Subject CN and
/// SAN set. `rcgen`'s own key generation only covers ECDSA/Ed25519, so the RSA key itself is
/// generated with the `rsa` crate and handed to `rcgen` as a PKCS#8 DER key pair, which picks
/// `PKCS_RSA_SHA256` automatically from the key's algorithm identifier.
pub fn generate(common_name: &str, sans: &[String]) -> Result<(String, String)> {
  let mut rng = rand_core::OsRng;
  let rsa_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS).context("failed to generate RSA-2048 key")?;
  let pkcs8_der = rsa_key
    .to_pkcs8_der()
    .context("failed to encode RSA private key as PKCS#8")?;
  let key_pair = KeyPair::from_der(pkcs8_der.as_bytes()).context("failed to load generated RSA key into rcgen")?;

  let mut params = CertificateParams::new(Vec::<String>::new()).context("failed to build certificate parameters")?;
  params.distinguished_name.push(DnType::CommonName, common_name);

  let mut san_types = Vec::with_capacity(sans.len());
  for san in sans {
    san_types.push(SanType::DnsName(
      san.as_str().try_into().with_context(|| format!("invalid SAN DNS name \"{san}\""))?,
    ));
  }
  params.subject_alt_names = san_types;

  let now = OffsetDateTime::now_utc();
  params.not_before = now - TimeDuration::hours(1);
  params.not_after = now + TimeDuration::days(VALIDITY_DAYS);

  let certificate = params.self_signed(&key_pair).context("failed to self-sign certificate")?;

  Ok((certificate.pem(), key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cert_store::parse_cert;

  #[test]
  fn generated_cert_carries_cn_and_sans() {
    let (cert_pem, key_pem) = generate("local-gateway", &["local.console".to_string(), "*.local.console".to_string()]).unwrap();

    assert!(cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(key_pem.contains("BEGIN PRIVATE KEY") || key_pem.contains("BEGIN RSA PRIVATE KEY"));

    let parsed = parse_cert(&cert_pem).unwrap();
    assert_eq!(parsed.subject_cn.as_deref(), Some("local-gateway"));
    assert!(parsed.san_dns_names.contains(&"local.console".to_string()));
  }
}
