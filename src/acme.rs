use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use instant_acme::{Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus, RetryPolicy};
use tokio::sync::{Mutex, OnceCell, RwLock};

/// The shared challenge table (§3), mutated only by the ACME issuer for the duration of one
/// issuance. C8 performs a single lookup per request; nothing else touches it.
#[derive(Clone, Default)]
pub struct ChallengeTable {
  inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeTable {
  pub fn new() -> Self {
    Self::default()
  }

  async fn insert(&self, token: String, key_authorization: String) {
    self.inner.write().await.insert(token, key_authorization);
  }

  async fn remove(&self, token: &str) {
    self.inner.write().await.remove(token);
  }

  /// Looked up by the HTTP/ACME listener (C8) for `/.well-known/acme-challenge/<token>`.
  pub async fn get(&self, token: &str) -> Option<String> {
    self.inner.read().await.get(token).cloned()
  }
}

/// C3 — drives ACME HTTP-01 issuance for one account. One `AcmeClient` is shared by the
/// certificate orchestrator across every public host; the account key is created once, lazily,
/// on first use ("on process start" in spirit — the first issuance attempt, since account
/// creation itself talks to the network and shouldn't block a process that never ends up
/// provisioning a public host).
pub struct AcmeClient {
  directory_url: String,
  contact: String,
  challenges: ChallengeTable,
  account: OnceCell<Account>,
  // Concurrent issuance for different hosts is fine; instant-acme's `Account` is `Clone` and
  // safe to share, but we still only want one account-creation race, not one per issuance.
  account_creation_lock: Mutex<()>,
}

impl AcmeClient {
  pub fn new(directory_url: String, email: String, challenges: ChallengeTable) -> Self {
    Self {
      directory_url,
      contact: format!("mailto:{email}"),
      challenges,
      account: OnceCell::new(),
      account_creation_lock: Mutex::new(()),
    }
  }

  async fn account(&self) -> Result<&Account> {
    if let Some(account) = self.account.get() {
      return Ok(account);
    }
    let _guard = self.account_creation_lock.lock().await;
    self
      .account
      .get_or_try_init(|| async {
        let (account, _credentials) = Account::create(
          &NewAccount {
            contact: &[self.contact.as_str()],
            terms_of_service_agreed: true,
            only_return_existing: false,
          },
          &self.directory_url,
          None,
        )
        .await
        .context("failed to create ACME account")?;
        Ok::<_, anyhow::Error>(account)
      })
      .await
  }

  /// Runs one full HTTP-01 issuance for `host` with the given SAN list (defaulting to `[host]`
  /// when empty). Returns `(cert_pem, key_pem)` on success. Any failure here is non-fatal to
  /// the caller — the certificate orchestrator falls back to a self-signed cert (§4.3, §4.4).
  pub async fn issue(&self, host: &str, alt_names: &[String]) -> Result<(String, String)> {
    let names: Vec<String> = if alt_names.is_empty() {
      vec![host.to_string()]
    } else {
      alt_names.to_vec()
    };

    let account = self.account().await?;
    let identifiers: Vec<Identifier> = names.iter().map(|name| Identifier::Dns(name.clone())).collect();
    let mut order = account
      .new_order(&NewOrder::new(&identifiers))
      .await
      .context("failed to create ACME order")?;

    let mut pending_tokens = Vec::new();
    let result = self.complete_authorizations(&mut order, &mut pending_tokens).await;

    // Always clean up challenge tokens we registered, whether or not the order succeeded.
    for token in &pending_tokens {
      self.challenges.remove(token).await;
    }
    result?;

    let status = order.poll_ready(&RetryPolicy::default()).await.context("ACME order never became ready")?;
    if status != OrderStatus::Ready {
      return Err(anyhow!("ACME order for {host} did not reach the ready state"));
    }

    let key_pem = order.finalize().await.context("failed to finalize ACME order")?;
    let cert_pem = order
      .poll_certificate(&RetryPolicy::default())
      .await
      .context("failed to download issued certificate")?;

    Ok((cert_pem, key_pem))
  }

  async fn complete_authorizations(&self, order: &mut instant_acme::Order, pending_tokens: &mut Vec<String>) -> Result<()> {
    let mut authorizations = order.authorizations();
    while let Some(authorization) = authorizations.next().await {
      let mut authorization = authorization.context("failed to fetch ACME authorization")?;
      match authorization.status {
        AuthorizationStatus::Valid => continue,
        AuthorizationStatus::Pending => {}
        _ => return Err(anyhow!("ACME authorization in unexpected state")),
      }

      let mut challenge = authorization
        .challenge(ChallengeType::Http01)
        .ok_or_else(|| anyhow!("ACME server does not offer an HTTP-01 challenge"))?;

      let token = challenge.token.clone();
      let key_authorization = challenge.key_authorization();
      self.challenges.insert(token.clone(), key_authorization.as_str().to_string()).await;
      pending_tokens.push(token);

      challenge.set_ready().await.context("failed to mark ACME challenge ready")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn challenge_table_round_trips() {
    let table = ChallengeTable::new();
    table.insert("tok123".to_string(), "keyauth".to_string()).await;
    assert_eq!(table.get("tok123").await, Some("keyauth".to_string()));
    table.remove("tok123").await;
    assert_eq!(table.get("tok123").await, None);
  }
}
