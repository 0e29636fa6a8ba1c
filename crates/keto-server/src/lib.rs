// keto-server: Credential issuance and the reconciliation loop
// Depends on keto-core (types, codec, retry) and keto-cloud (tag stores)

pub mod issuer;
pub mod kube;
pub mod reconciler;
pub mod store;

pub use issuer::{BootstrapIssuer, CredentialIssuer};
pub use reconciler::{ReconcileReport, Reconciler};
pub use store::{MemorySecretStore, SecretStore};
