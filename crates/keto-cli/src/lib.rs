// keto-cli: Clap commands, logging, UI
// Depends on keto-core, keto-cloud, keto-server, keto-client

pub mod commands;
pub mod logging;
pub mod ui;

pub use commands::run;
