// keto-core: Pure types, token codec, retry policy, config
// No internal keto dependencies; this is the foundation crate.

pub mod config;
pub mod credential;
pub mod error;
pub mod registration;
pub mod retry;
pub mod tags;
pub mod time;
pub mod token;

pub use error::{Error, Result};
pub use registration::RegistrationState;
pub use tags::{NodeId, NodeTags, Pool};
pub use token::BootstrapToken;
