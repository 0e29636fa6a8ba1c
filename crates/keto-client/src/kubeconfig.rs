use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use keto_core::{Error, Result};

const CLUSTER_NAME: &str = "cluster";
const CONTEXT_NAME: &str = "bootstrap-context";

/// File mode of the written kubeconfig.
pub const KUBECONFIG_MODE: u32 = 0o640;

#[derive(Serialize)]
struct Kubeconfig<'a> {
    kind: &'a str,
    #[serde(rename = "apiVersion")]
    api_version: &'a str,
    preferences: Preferences,
    clusters: Vec<NamedCluster<'a>>,
    users: Vec<NamedUser<'a>>,
    contexts: Vec<NamedContext<'a>>,
    #[serde(rename = "current-context")]
    current_context: &'a str,
}

#[derive(Serialize)]
struct Preferences {}

#[derive(Serialize)]
struct NamedCluster<'a> {
    name: &'a str,
    cluster: Cluster<'a>,
}

#[derive(Serialize)]
struct Cluster<'a> {
    server: &'a str,
    #[serde(rename = "certificate-authority", skip_serializing_if = "Option::is_none")]
    certificate_authority: Option<&'a str>,
    #[serde(rename = "insecure-skip-tls-verify", skip_serializing_if = "is_false")]
    insecure_skip_tls_verify: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Serialize)]
struct NamedUser<'a> {
    name: &'a str,
    user: User<'a>,
}

#[derive(Serialize)]
struct User<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct NamedContext<'a> {
    name: &'a str,
    context: Context<'a>,
}

#[derive(Serialize)]
struct Context<'a> {
    cluster: &'a str,
    user: &'a str,
}

/// Render a bootstrap kubeconfig carrying `token` for `master`.
///
/// Without a CA path the cluster entry skips TLS verification.
pub fn generate_kubeconfig(token: &str, master: &str, ca_path: Option<&str>) -> Result<String> {
    let ca_path = ca_path.filter(|p| !p.is_empty());
    let config = Kubeconfig {
        kind: "Config",
        api_version: "v1",
        preferences: Preferences {},
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME,
            cluster: Cluster {
                server: master,
                certificate_authority: ca_path,
                insecure_skip_tls_verify: ca_path.is_none(),
            },
        }],
        users: vec![NamedUser {
            name: CONTEXT_NAME,
            user: User { token },
        }],
        contexts: vec![NamedContext {
            name: CONTEXT_NAME,
            context: Context {
                cluster: CLUSTER_NAME,
                user: CONTEXT_NAME,
            },
        }],
        current_context: CONTEXT_NAME,
    };
    serde_json::to_string_pretty(&config)
        .map_err(|e| Error::Io(format!("failed to encode kubeconfig: {e}")))
}

/// Write `contents` to `path` with mode 0640, creating parent directories.
pub fn write_kubeconfig(path: &Path, contents: &str) -> Result<()> {
    let io_err = |e: std::io::Error| Error::Io(format!("{}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(KUBECONFIG_MODE);
    }
    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;

    // mode only applies on create; tighten an existing file too
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(KUBECONFIG_MODE))
            .map_err(io_err)?;
    }
    Ok(())
}
