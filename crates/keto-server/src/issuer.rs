use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use keto_core::credential::{self, CredentialRecord};
use keto_core::retry::RetryPolicy;
use keto_core::{BootstrapToken, Error, NodeId, Result};

use crate::store::SecretStore;

/// Creates and deletes bootstrap credentials in the control plane's store.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Issue a fresh token for `node`, valid for `ttl` (zero = no expiry).
    async fn create(
        &self,
        node: &NodeId,
        ttl: Duration,
        usages: &[String],
        namespace: &str,
    ) -> Result<BootstrapToken>;

    /// Delete the credential backing `token`. Missing credentials are not an error.
    async fn delete(&self, token: &str, namespace: &str) -> Result<()>;
}

/// Where [`BootstrapIssuer`] draws candidate tokens from.
pub type TokenSource = Arc<dyn Fn() -> Result<BootstrapToken> + Send + Sync>;

/// [`CredentialIssuer`] writing `bootstrap.kubernetes.io/token` secrets.
pub struct BootstrapIssuer {
    store: Arc<dyn SecretStore>,
    retry: RetryPolicy,
    tokens: TokenSource,
}

impl BootstrapIssuer {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::issuance(),
            tokens: Arc::new(BootstrapToken::generate),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Draw tokens from `tokens` instead of the OS randomness source.
    pub fn with_token_source<F>(mut self, tokens: F) -> Self
    where
        F: Fn() -> Result<BootstrapToken> + Send + Sync + 'static,
    {
        self.tokens = Arc::new(tokens);
        self
    }
}

#[async_trait]
impl CredentialIssuer for BootstrapIssuer {
    async fn create(
        &self,
        node: &NodeId,
        ttl: Duration,
        usages: &[String],
        namespace: &str,
    ) -> Result<BootstrapToken> {
        let store = &self.store;
        let tokens = self.tokens.as_ref();
        // token carried over from a failed attempt; empty means draw a new one
        let pending: Mutex<Option<BootstrapToken>> = Mutex::new(None);
        let pending = &pending;

        self.retry
            .run("credential create", Error::is_retryable, |attempt| async move {
                let mut slot = pending.lock().await;
                let token = match slot.take() {
                    Some(token) => token,
                    None => tokens()?,
                };
                let record = CredentialRecord::new(&token, usages, ttl)?;
                let name = record.secret_name();

                let existing = match store.get(namespace, &name).await {
                    Ok(existing) => existing,
                    Err(e) => {
                        *slot = Some(token);
                        return Err(e);
                    }
                };
                match existing {
                    Some(existing) if existing.token_secret == token.secret() => {
                        debug!(
                            node = %node,
                            secret = %name,
                            attempt,
                            "credential already exists, reusing"
                        );
                        Ok(token)
                    }
                    Some(_) => {
                        debug!(
                            node = %node,
                            secret = %name,
                            attempt,
                            "token id held by another credential"
                        );
                        Err(Error::AlreadyExists(name))
                    }
                    None => match store.create(namespace, &record).await {
                        Ok(()) => Ok(token),
                        Err(e) => {
                            *slot = Some(token);
                            Err(e)
                        }
                    },
                }
            })
            .await
            .map_err(|e| Error::IssuanceFailed {
                node: node.clone(),
                attempts: e.attempts,
                reason: e.last.to_string(),
            })
    }

    async fn delete(&self, token: &str, namespace: &str) -> Result<()> {
        let token = BootstrapToken::parse(token)?;
        let name = credential::secret_name(token.id());
        if !self.store.delete(namespace, &name).await? {
            debug!(secret = %name, "credential already gone");
        }
        Ok(())
    }
}
