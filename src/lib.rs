//! # keto-tokens: kubelet bootstrap tokens over cloud resource tags
//!
//! Facade crate that re-exports the keto workspace crates so consumers
//! can depend on a single `keto-tokens` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | keto-core | Token codec, registration state, retry policy, config, errors |
//! | [`cloud`] | keto-cloud | Tag store contract, provider registry, memory/file stores |
//! | [`server`] | keto-server | Credential issuer, Kubernetes secret store, reconciler |
//! | [`client`] | keto-client | Claimant poll loop, bootstrap kubeconfig |
//! | [`cli`] | keto-cli | Command line, logging |

pub use keto_cli as cli;
pub use keto_client as client;
pub use keto_cloud as cloud;
pub use keto_core as core;
pub use keto_server as server;
