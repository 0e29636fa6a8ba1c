use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use keto_client::{ClaimOutcome, Claimant, generate_kubeconfig, write_kubeconfig};
use keto_cloud::{ProviderOptions, ProviderRegistry, TagStore};
use keto_core::{BootstrapToken, NodeId, NodeTags};
use keto_core::config::{
    ClientConfig, DEFAULT_CLIENT_KUBECONFIG, DEFAULT_MASTER_API, DEFAULT_TOKEN_NAMESPACE,
    ServerConfig,
};
use keto_core::registration::DEFAULT_TAG_NAME;
use keto_server::kube::{KubeConnection, KubeSecretStore};
use keto_server::{BootstrapIssuer, Reconciler};

use crate::logging::{self, LogFormat};
use crate::ui;

#[derive(Parser)]
#[command(
    name = "keto-tokens",
    version,
    about = "Client/server used to generate and consume kubelet registration tokens"
)]
struct Cli {
    /// Tag store provider
    #[arg(long, short = 'c', global = true, env = "CLOUD_PROVIDER", default_value = "file")]
    cloud: String,

    /// Switch on verbose logging
    #[arg(long, global = true, env = "VERBOSE")]
    verbose: bool,

    /// Tag document used by the file provider
    #[arg(long, global = true, env = "KETO_TAGS_FILE")]
    tags_file: Option<PathBuf>,

    /// Id of the local node, for providers that cannot discover it
    #[arg(long, global = true, env = "KETO_NODE_ID")]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service, generating registration tokens for kubelets
    Server(ServerArgs),
    /// Retrieve the kubelet registration token for this node
    Client(ClientArgs),
    /// Token helpers
    Token {
        #[command(subcommand)]
        action: TokenCmd,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Load the server configuration from a TOML file instead of flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// URL of the kubernetes API
    #[arg(long, env = "KUBE_SERVICE_URL")]
    master: Option<String>,

    /// Kubernetes token used to authenticate to the API
    #[arg(long, env = "KUBE_SERVICE_TOKEN", hide_env_values = true)]
    kube_token: Option<String>,

    /// Path to a kubeconfig for API access
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Resource tag used to pass the kubelet token
    #[arg(long, env = "TAG_NAME", default_value = DEFAULT_TAG_NAME)]
    tag_name: String,

    /// Filter tags identifying compute pools (key=value, repeatable)
    #[arg(long = "filter", env = "NODE_FILTER", value_delimiter = ',')]
    filters: Vec<String>,

    /// Namespace the registration tokens reside in
    #[arg(long, env = "TOKEN_NAMESPACE", default_value = DEFAULT_TOKEN_NAMESPACE)]
    token_namespace: String,

    /// Time-to-live of generated registration tokens
    #[arg(long, env = "TOKEN_TTL", default_value = "30m", value_parser = humantime::parse_duration)]
    token_ttl: Duration,

    /// Reconciliation interval
    #[arg(long, env = "INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Issuance workers per cycle
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Capacity of the discovery queue
    #[arg(long, default_value_t = 10)]
    queue_depth: usize,
}

#[derive(Args)]
struct ClientArgs {
    /// URL of the kubernetes API written into the kubeconfig
    #[arg(long, env = "KUBE_SERVICE_URL", default_value = DEFAULT_MASTER_API)]
    master: String,

    /// Path to write the kubeconfig to
    #[arg(long, env = "KUBECONFIG", default_value = DEFAULT_CLIENT_KUBECONFIG)]
    kubeconfig: PathBuf,

    /// Tag used to pass the kubelet registration token
    #[arg(long, env = "TAG_NAME", default_value = DEFAULT_TAG_NAME)]
    tag_name: String,

    /// CA certificate of the kubernetes API (otherwise TLS verification is skipped)
    #[arg(long, env = "CA_PATH")]
    ca_path: Option<PathBuf>,

    /// Interval between tag checks
    #[arg(long, env = "INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Optional timeout for the operation
    #[arg(long, env = "TIMEOUT", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
}

#[derive(Subcommand)]
enum TokenCmd {
    /// Print a freshly generated bootstrap token
    Generate,
    /// Check that a token is well formed
    Validate {
        /// Token in id.secret form
        token: String,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // JSON for the long-running server, human-readable otherwise
    let log_format = match &cli.command {
        Commands::Server(_) => LogFormat::Json,
        _ => LogFormat::Human,
    };
    logging::init(log_format, cli.verbose);

    let options = ProviderOptions {
        tags_file: cli.tags_file.clone(),
        node_id: cli.node_id.clone().map(NodeId::from),
    };

    match cli.command {
        Commands::Server(args) => cmd_server(&cli.cloud, &options, args),
        Commands::Client(args) => cmd_client(&cli.cloud, &options, args),
        Commands::Token { action } => cmd_token(action),
    }
}

fn tag_store(cloud: &str, options: &ProviderOptions) -> Result<Arc<dyn TagStore>> {
    let registry = ProviderRegistry::with_defaults();
    registry.get(cloud, options).with_context(|| {
        format!(
            "Failed to create the {} tag store (available: {})",
            cloud,
            registry.names().join(", ")
        )
    })
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")
}

fn server_config(args: ServerArgs) -> Result<ServerConfig> {
    if let Some(path) = &args.config {
        return ServerConfig::from_file(path)
            .with_context(|| format!("Failed to load server config {}", path.display()));
    }
    let config = ServerConfig {
        master_api: args.master,
        kube_token: args.kube_token,
        kubeconfig: args.kubeconfig,
        tag_name: args.tag_name,
        filters: NodeTags::parse_filters(&args.filters).with_context(|| "Invalid node filter")?,
        token_namespace: args.token_namespace,
        token_ttl: args.token_ttl,
        reconcile_interval: args.interval,
        workers: args.workers,
        queue_depth: args.queue_depth,
    };
    config.validate()?;
    Ok(config)
}

fn client_config(args: ClientArgs) -> ClientConfig {
    ClientConfig {
        master_api: args.master,
        kubeconfig: args.kubeconfig,
        ca_path: args.ca_path,
        tag_name: args.tag_name,
        interval: args.interval,
        timeout: args.timeout,
    }
}

fn cmd_server(cloud: &str, options: &ProviderOptions, args: ServerArgs) -> Result<()> {
    let config = server_config(args)?;
    let store = tag_store(cloud, options)?;

    let conn = KubeConnection::resolve(&config)
        .with_context(|| "Failed to resolve the kubernetes API connection")?;
    let secrets = KubeSecretStore::new(&conn)?;
    let issuer = BootstrapIssuer::new(Arc::new(secrets));
    let reconciler = Reconciler::new(&config, store, Arc::new(issuer))?;

    runtime()?.block_on(async move {
        reconciler
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            })
            .await;
    });
    Ok(())
}

fn cmd_client(cloud: &str, options: &ProviderOptions, args: ClientArgs) -> Result<()> {
    let config = client_config(args);
    let store = tag_store(cloud, options)?;
    let claimant = Claimant::new(config.clone(), store)?;

    let outcome = runtime()?
        .block_on(claimant.start())
        .with_context(|| "Failed to retrieve the registration token")?;

    match outcome {
        ClaimOutcome::Claimed(token) => {
            let ca_path = config.ca_path.as_ref().map(|p| p.display().to_string());
            let kubeconfig = generate_kubeconfig(&token, &config.master_api, ca_path.as_deref())?;
            write_kubeconfig(&config.kubeconfig, &kubeconfig).with_context(|| {
                format!("Failed to write kubeconfig {}", config.kubeconfig.display())
            })?;
            ui::success(&format!(
                "Bootstrap kubeconfig written to {}",
                config.kubeconfig.display()
            ));
        }
        ClaimOutcome::AlreadyConsumed => {
            warn!(tag = %config.tag_name, "Registration token already consumed");
            ui::warn("Registration token already consumed, nothing to do");
        }
    }
    Ok(())
}

fn cmd_token(action: TokenCmd) -> Result<()> {
    match action {
        TokenCmd::Generate => {
            let token = BootstrapToken::generate()?;
            println!("{}", token);
        }
        TokenCmd::Validate { token } => {
            let token = BootstrapToken::parse(&token)?;
            ui::info(&format!("Token is valid (id {})", token.id()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_server_flags_build_config() {
        let cli = parse(&[
            "keto-tokens",
            "server",
            "--master",
            "https://10.0.0.1:6443",
            "--kube-token",
            "s3cr3t",
            "--filter",
            "Role=compute,Env=dev",
            "--token-ttl",
            "1h",
            "--interval",
            "30s",
        ]);
        assert_eq!(cli.cloud, "file");
        let Commands::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let config = server_config(args).unwrap();
        assert_eq!(config.filters.get("Role"), Some("compute"));
        assert_eq!(config.filters.get("Env"), Some("dev"));
        assert_eq!(config.token_ttl, Duration::from_secs(3600));
        assert_eq!(config.reconcile_interval, Duration::from_secs(30));
        assert_eq!(config.tag_name, "KubeletToken");
        assert_eq!(config.token_namespace, "kube-system");
    }

    #[test]
    fn test_server_rejects_bad_filter() {
        let cli = parse(&["keto-tokens", "server", "--filter", "Role"]);
        let Commands::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(server_config(args).is_err());
    }

    #[test]
    fn test_server_rejects_unrepresentable_ttl() {
        let cli = parse(&["keto-tokens", "server", "--token-ttl", "1000000years"]);
        let Commands::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let err = server_config(args).unwrap_err();
        assert!(err.to_string().contains("token ttl"));
    }

    #[test]
    fn test_server_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "tag_name = \"NodeToken\"\nworkers = 2\n").unwrap();

        let cli = parse(&["keto-tokens", "server", "--config", path.to_str().unwrap()]);
        let Commands::Server(args) = cli.command else {
            panic!("expected server command");
        };
        let config = server_config(args).unwrap();
        assert_eq!(config.tag_name, "NodeToken");
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_client_flags() {
        let cli = parse(&[
            "keto-tokens",
            "-c",
            "file",
            "--node-id",
            "i-1",
            "client",
            "--kubeconfig",
            "/tmp/kubeconfig",
            "--ca-path",
            "/etc/ssl/ca.pem",
            "--interval",
            "2s",
            "--timeout",
            "1m",
        ]);
        assert_eq!(cli.cloud, "file");
        assert_eq!(cli.node_id.as_deref(), Some("i-1"));
        let Commands::Client(args) = cli.command else {
            panic!("expected client command");
        };
        let config = client_config(args);
        assert_eq!(config.kubeconfig, PathBuf::from("/tmp/kubeconfig"));
        assert_eq!(config.ca_path, Some(PathBuf::from("/etc/ssl/ca.pem")));
        assert_eq!(config.interval, Duration::from_secs(2));
        assert_eq!(config.effective_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_token_validate_parses() {
        let cli = parse(&["keto-tokens", "token", "validate", "abc123.0123456789abcdef"]);
        assert!(matches!(
            cli.command,
            Commands::Token {
                action: TokenCmd::Validate { .. }
            }
        ));
    }
}
