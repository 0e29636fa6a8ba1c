//! Bootstrap token generation and parsing.
//!
//! A token is `<id>.<secret>`: a six character public id, used to name and
//! index the backing credential, and a sixteen character secret. Both parts
//! are lowercase hex drawn from the OS randomness source.

use std::fmt;
use std::sync::OnceLock;

use rand::RngCore;
use rand::rngs::OsRng;
use regex::Regex;

use crate::error::{Error, Result};

/// Random bytes behind the id (hex-encoded to 6 chars).
pub const TOKEN_ID_BYTES: usize = 3;
/// Random bytes behind the secret (hex-encoded to 16 chars).
pub const TOKEN_SECRET_BYTES: usize = 8;

const TOKEN_ID_PATTERN: &str = "^([a-z0-9]{6})$";
const TOKEN_PATTERN: &str = r"^([a-z0-9]{6})\.([a-z0-9]{16})$";

static TOKEN_ID_RE: OnceLock<Regex> = OnceLock::new();
static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn token_id_regex() -> &'static Regex {
    TOKEN_ID_RE.get_or_init(|| Regex::new(TOKEN_ID_PATTERN).expect("token id pattern compiles"))
}

fn token_regex() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(TOKEN_PATTERN).expect("token pattern compiles"))
}

/// A parsed, grammar-valid bootstrap token.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    /// Generate a fresh token from the OS randomness source.
    pub fn generate() -> Result<Self> {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a token from the given source. Source failures surface as
    /// `RandomSource` and are not retried here.
    pub fn generate_with<R: RngCore + ?Sized>(rng: &mut R) -> Result<Self> {
        let id = random_hex(rng, TOKEN_ID_BYTES)?;
        let secret = random_hex(rng, TOKEN_SECRET_BYTES)?;
        // must still satisfy the grammar if the byte counts change
        Self::parse(&format!("{id}.{secret}"))
    }

    /// Parse `id.secret`, rejecting anything outside the exact grammar.
    pub fn parse(s: &str) -> Result<Self> {
        let caps = token_regex().captures(s).ok_or_else(|| {
            Error::MalformedToken(format!("token was not of form {TOKEN_PATTERN:?}"))
        })?;
        Ok(Self {
            id: caps[1].to_string(),
            secret: caps[2].to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

/// Validate a bare token id.
pub fn validate_id(s: &str) -> Result<()> {
    if !token_id_regex().is_match(s) {
        return Err(Error::MalformedToken(format!(
            "token id {s:?} was not of form {TOKEN_ID_PATTERN:?}"
        )));
    }
    Ok(())
}

fn random_hex<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    rng.try_fill_bytes(&mut buf)
        .map_err(|e| Error::RandomSource(e.to_string()))?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}

impl fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.secret)
    }
}

impl fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl std::str::FromStr for BootstrapToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
