use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::token::{self, BootstrapToken};

/// Name prefix of secrets holding bootstrap tokens.
pub const SECRET_NAME_PREFIX: &str = "bootstrap-token-";
/// Secret type understood by the cluster's bootstrap authenticator.
pub const SECRET_TYPE: &str = "bootstrap.kubernetes.io/token";

pub const TOKEN_ID_KEY: &str = "token-id";
pub const TOKEN_SECRET_KEY: &str = "token-secret";
pub const EXPIRATION_KEY: &str = "expiration";
pub const USAGE_PREFIX: &str = "usage-bootstrap-";

/// Usages granted to kubelet registration tokens.
pub const DEFAULT_USAGES: &[&str] = &["authentication", "signing"];

/// Secret name for a token id: `bootstrap-token-<id>`.
pub fn secret_name(token_id: &str) -> String {
    format!("{SECRET_NAME_PREFIX}{token_id}")
}

/// Persisted form of a bootstrap token. Never mutated after creation.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub token_id: String,
    pub token_secret: String,
    pub usages: Vec<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Build the record for `token`. A zero `ttl` means no expiry.
    pub fn new(token: &BootstrapToken, usages: &[String], ttl: Duration) -> Result<Self> {
        Self::new_at(token, usages, ttl, Utc::now())
    }

    pub fn new_at(
        token: &BootstrapToken,
        usages: &[String],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let expiration = if ttl.is_zero() {
            None
        } else {
            let expiry = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .ok_or_else(|| {
                    Error::ConfigInvalid(format!(
                        "token ttl {} is out of range",
                        humantime::format_duration(ttl)
                    ))
                })?;
            Some(expiry)
        };
        Ok(Self {
            token_id: token.id().to_string(),
            token_secret: token.secret().to_string(),
            usages: usages.to_vec(),
            expiration,
        })
    }

    pub fn secret_name(&self) -> String {
        secret_name(&self.token_id)
    }

    /// Encode into secret data entries (raw bytes; transport encoding is the store's concern).
    pub fn to_secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        let mut data = BTreeMap::new();
        data.insert(TOKEN_ID_KEY.to_string(), self.token_id.as_bytes().to_vec());
        data.insert(
            TOKEN_SECRET_KEY.to_string(),
            self.token_secret.as_bytes().to_vec(),
        );
        if let Some(expiration) = self.expiration {
            data.insert(
                EXPIRATION_KEY.to_string(),
                expiration
                    .to_rfc3339_opts(SecondsFormat::Secs, true)
                    .into_bytes(),
            );
        }
        for usage in &self.usages {
            data.insert(format!("{USAGE_PREFIX}{usage}"), b"true".to_vec());
        }
        data
    }

    /// Decode secret data written by [`Self::to_secret_data`].
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let field = |key: &str| -> Result<String> {
            let raw = data
                .get(key)
                .ok_or_else(|| Error::MalformedToken(format!("secret is missing {key}")))?;
            String::from_utf8(raw.clone())
                .map_err(|_| Error::MalformedToken(format!("{key} is not valid UTF-8")))
        };

        let token_id = field(TOKEN_ID_KEY)?;
        let token_secret = field(TOKEN_SECRET_KEY)?;
        token::validate_id(&token_id)?;
        BootstrapToken::parse(&format!("{token_id}.{token_secret}"))?;

        let expiration = match data.get(EXPIRATION_KEY) {
            Some(_) => {
                let raw = field(EXPIRATION_KEY)?;
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| Error::MalformedToken(format!("bad expiration {raw:?}: {e}")))?;
                Some(parsed.with_timezone(&Utc))
            }
            None => None,
        };

        let usages = data
            .iter()
            .filter(|(_, v)| v.as_slice() == b"true")
            .filter_map(|(k, _)| k.strip_prefix(USAGE_PREFIX).map(str::to_string))
            .collect();

        Ok(Self {
            token_id,
            token_secret,
            usages,
            expiration,
        })
    }
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("token_id", &self.token_id)
            .field("token_secret", &"<redacted>")
            .field("usages", &self.usages)
            .field("expiration", &self.expiration)
            .finish()
    }
}
