// keto-cloud: Tag store contract, provider registry, built-in stores
// Depends on keto-core (types)

pub mod file;
pub mod memory;
pub mod provider;
pub mod registration;
pub mod registry;

pub use provider::TagStore;
pub use registration::RegistrationTag;
pub use registry::{ProviderOptions, ProviderRegistry};
