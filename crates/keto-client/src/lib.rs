// keto-client: Claims a node's bootstrap token and writes the kubeconfig
// Depends on keto-core (types, config) and keto-cloud (tag stores)

pub mod claimant;
pub mod kubeconfig;

pub use claimant::{ClaimOutcome, Claimant};
pub use kubeconfig::{generate_kubeconfig, write_kubeconfig};
