use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use keto_core::credential::CredentialRecord;
use keto_core::{Error, Result};

/// Namespaced record store holding bootstrap credentials.
///
/// Records are addressed by their secret name (`bootstrap-token-<id>`).
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// The record stored under `name`, if any.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<CredentialRecord>>;

    /// Store `record` under its secret name. Fails with `AlreadyExists` on a name conflict.
    async fn create(&self, namespace: &str, record: &CredentialRecord) -> Result<()>;

    /// Remove the record under `name`. Returns `false` when there was nothing to remove.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// In-memory secret store with scriptable failures.
#[derive(Default)]
pub struct MemorySecretStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<(String, String), CredentialRecord>,
    create_failures: u32,
    create_conflicts: u32,
    lookup_failures: u32,
    fail_deletes: bool,
    create_calls: u32,
    delete_calls: u32,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` creates with a transient store error.
    pub async fn fail_next_creates(&self, n: u32) {
        self.inner.lock().await.create_failures = n;
    }

    /// Fail the next `n` creates with a name conflict.
    pub async fn conflict_next_creates(&self, n: u32) {
        self.inner.lock().await.create_conflicts = n;
    }

    /// Fail the next `n` lookups with a transient store error.
    pub async fn fail_next_lookups(&self, n: u32) {
        self.inner.lock().await.lookup_failures = n;
    }

    pub async fn fail_deletes(&self, fail: bool) {
        self.inner.lock().await.fail_deletes = fail;
    }

    /// Insert a record directly, bypassing failure injection.
    pub async fn insert(&self, namespace: &str, record: CredentialRecord) {
        let key = (namespace.to_string(), record.secret_name());
        self.inner.lock().await.records.insert(key, record);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Records in `namespace`, sorted by token id.
    pub async fn records(&self, namespace: &str) -> Vec<CredentialRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner
            .records
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by(|a, b| a.token_id.cmp(&b.token_id));
        records
    }

    pub async fn create_calls(&self) -> u32 {
        self.inner.lock().await.create_calls
    }

    pub async fn delete_calls(&self) -> u32 {
        self.inner.lock().await.delete_calls
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<CredentialRecord>> {
        let mut inner = self.inner.lock().await;
        if inner.lookup_failures > 0 {
            inner.lookup_failures -= 1;
            return Err(Error::Credential("injected lookup failure".into()));
        }
        Ok(inner
            .records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, namespace: &str, record: &CredentialRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.create_calls += 1;
        let name = record.secret_name();
        if inner.create_conflicts > 0 {
            inner.create_conflicts -= 1;
            return Err(Error::AlreadyExists(name));
        }
        if inner.create_failures > 0 {
            inner.create_failures -= 1;
            return Err(Error::Credential("injected create failure".into()));
        }
        let key = (namespace.to_string(), name);
        if inner.records.contains_key(&key) {
            return Err(Error::AlreadyExists(key.1));
        }
        inner.records.insert(key, record.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.delete_calls += 1;
        if inner.fail_deletes {
            return Err(Error::Credential("injected delete failure".into()));
        }
        Ok(inner
            .records
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }
}
