use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use keto_core::config::ServerConfig;
use keto_core::credential::{CredentialRecord, SECRET_TYPE};
use keto_core::{Error, Result};

use crate::store::SecretStore;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how to reach the Kubernetes API.
#[derive(Clone, PartialEq, Eq)]
pub struct KubeConnection {
    pub server: String,
    pub token: Option<String>,
    /// PEM bundle to trust in addition to the system roots.
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

impl std::fmt::Debug for KubeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeConnection")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl KubeConnection {
    /// Pick the connection for a server config: master URL plus token, then
    /// kubeconfig, then the in-cluster service account.
    pub fn resolve(config: &ServerConfig) -> Result<Self> {
        if let (Some(master), Some(token)) = (&config.master_api, &config.kube_token) {
            if !master.is_empty() && !token.is_empty() {
                return Ok(Self::from_token(master, token));
            }
        }
        if let Some(path) = &config.kubeconfig {
            return Self::from_kubeconfig(path);
        }
        Self::in_cluster()
    }

    /// Bearer token against `master`, skipping TLS verification.
    pub fn from_token(master: &str, token: &str) -> Self {
        Self {
            server: master.trim_end_matches('/').to_string(),
            token: Some(token.to_string()),
            ca_pem: None,
            insecure: true,
        }
    }

    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("failed to read kubeconfig {}: {e}", path.display()))
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::parse_kubeconfig(&content, base)
    }

    /// Connection for the kubeconfig's current context. Relative file
    /// references are resolved against `base`.
    pub fn parse_kubeconfig(content: &str, base: &Path) -> Result<Self> {
        let doc: KubeconfigFile = serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigInvalid(format!("invalid kubeconfig: {e}")))?;

        let context = match doc.current_context.as_deref() {
            Some(name) if !name.is_empty() => doc
                .contexts
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::ConfigInvalid(format!("kubeconfig has no context {name}")))?,
            _ => doc
                .contexts
                .first()
                .ok_or_else(|| Error::ConfigInvalid("kubeconfig has no contexts".into()))?,
        };
        let cluster = doc
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                Error::ConfigInvalid(format!(
                    "kubeconfig has no cluster {}",
                    context.context.cluster
                ))
            })?;
        let user = context
            .context
            .user
            .as_deref()
            .and_then(|name| doc.users.iter().find(|u| u.name == name))
            .map(|u| &u.user);

        let ca_pem = match (&cluster.certificate_authority_data, &cluster.certificate_authority) {
            (Some(data), _) => Some(
                STANDARD
                    .decode(data.trim())
                    .map_err(|e| Error::ConfigInvalid(format!("bad certificate-authority-data: {e}")))?,
            ),
            (None, Some(file)) => Some(read_file(&base.join(file))?),
            (None, None) => None,
        };
        let token = match user {
            Some(UserEntry { token: Some(token), .. }) => Some(token.clone()),
            Some(UserEntry {
                token_file: Some(file),
                ..
            }) => Some(read_token(&base.join(file))?),
            _ => None,
        };

        Ok(Self {
            server: cluster.server.trim_end_matches('/').to_string(),
            token,
            ca_pem,
            insecure: cluster.insecure_skip_tls_verify,
        })
    }

    /// Service-account credentials mounted into a pod.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            Error::ConfigInvalid(
                "no kube token, kubeconfig, or in-cluster environment available".into(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        Self::in_cluster_from(&host, &port, Path::new(SERVICE_ACCOUNT_DIR))
    }

    pub fn in_cluster_from(host: &str, port: &str, account_dir: &Path) -> Result<Self> {
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let ca = account_dir.join("ca.crt");
        Ok(Self {
            server: format!("https://{host}:{port}"),
            token: Some(read_token(&account_dir.join("token"))?),
            ca_pem: if ca.exists() { Some(read_file(&ca)?) } else { None },
            insecure: false,
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::ConfigInvalid(format!("failed to read {}: {e}", path.display())))
}

fn read_token(path: &Path) -> Result<String> {
    let raw = read_file(path)?;
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigFile {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    current_context: Option<String>,
}

#[derive(Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    token_file: Option<PathBuf>,
}

#[derive(Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

/// [`SecretStore`] over the Kubernetes core/v1 secrets API.
pub struct KubeSecretStore {
    server: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl KubeSecretStore {
    pub fn new(conn: &KubeConnection) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("keto-tokens/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT);
        if conn.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = &conn.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::ConfigInvalid(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("failed to build http client: {e}")))?;
        Ok(Self {
            server: conn.server.clone(),
            token: conn.token.clone(),
            http,
        })
    }

    fn secrets_url(&self, namespace: &str) -> String {
        format!("{}/api/v1/namespaces/{}/secrets", self.server, namespace)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| Error::Credential(format!("request to {} failed: {e}", self.server)))
    }
}

async fn failure(resp: reqwest::Response, action: &str) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Error::Credential(format!("{action} returned {status}: {}", body.trim()))
}

/// JSON body of a bootstrap token secret.
pub fn secret_body(name: &str, record: &CredentialRecord) -> serde_json::Value {
    let data: BTreeMap<String, String> = record
        .to_secret_data()
        .into_iter()
        .map(|(k, v)| (k, STANDARD.encode(v)))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": name },
        "type": SECRET_TYPE,
        "data": data,
    })
}

#[derive(Deserialize)]
struct SecretResponse {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

/// Decode the `data` of a secret returned by the API.
pub fn decode_secret(body: &str) -> Result<CredentialRecord> {
    let secret: SecretResponse = serde_json::from_str(body)
        .map_err(|e| Error::Credential(format!("invalid secret response: {e}")))?;
    let mut data = BTreeMap::new();
    for (key, value) in secret.data {
        let raw = STANDARD
            .decode(value)
            .map_err(|e| Error::Credential(format!("secret field {key} is not base64: {e}")))?;
        data.insert(key, raw);
    }
    CredentialRecord::from_secret_data(&data)
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<CredentialRecord>> {
        let url = format!("{}/{}", self.secrets_url(namespace), name);
        let resp = self.send(self.request(reqwest::Method::GET, &url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp
                    .text()
                    .await
                    .map_err(|e| Error::Credential(format!("failed to read secret {name}: {e}")))?;
                decode_secret(&body).map(Some)
            }
            _ => Err(failure(resp, "secret lookup").await),
        }
    }

    async fn create(&self, namespace: &str, record: &CredentialRecord) -> Result<()> {
        let name = record.secret_name();
        let url = self.secrets_url(namespace);
        let req = self
            .request(reqwest::Method::POST, &url)
            .json(&secret_body(&name, record));
        let resp = self.send(req).await?;
        match resp.status() {
            StatusCode::CONFLICT => Err(Error::AlreadyExists(name)),
            s if s.is_success() => {
                debug!(secret = %name, namespace, "created bootstrap token secret");
                Ok(())
            }
            _ => Err(failure(resp, "secret create").await),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let url = format!("{}/{}", self.secrets_url(namespace), name);
        let resp = self.send(self.request(reqwest::Method::DELETE, &url)).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(failure(resp, "secret delete").await),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use keto_core::BootstrapToken;

    use super::*;

    fn record() -> CredentialRecord {
        let token = BootstrapToken::parse("abc123.0123456789abcdef").unwrap();
        let usages = vec!["authentication".to_string(), "signing".to_string()];
        let now = Utc.with_ymd_and_hms(2017, 6, 1, 12, 0, 0).unwrap();
        CredentialRecord::new_at(&token, &usages, Duration::from_secs(1800), now).unwrap()
    }

    #[test]
    fn test_secret_body() {
        let body = secret_body("bootstrap-token-abc123", &record());
        assert_eq!(body["kind"], "Secret");
        assert_eq!(body["type"], "bootstrap.kubernetes.io/token");
        assert_eq!(body["metadata"]["name"], "bootstrap-token-abc123");
        assert_eq!(body["data"]["token-id"], STANDARD.encode("abc123"));
        assert_eq!(body["data"]["usage-bootstrap-signing"], STANDARD.encode("true"));
        assert_eq!(
            body["data"]["expiration"],
            STANDARD.encode("2017-06-01T12:30:00Z")
        );
    }

    #[test]
    fn test_decode_secret_round_trip() {
        let rec = record();
        let body = secret_body(&rec.secret_name(), &rec).to_string();
        assert_eq!(decode_secret(&body).unwrap(), rec);
        assert!(decode_secret("{\"data\":{\"token-id\":\"!!\"}}").is_err());
    }

    #[test]
    fn test_resolve_prefers_master_and_token() {
        let config = ServerConfig {
            master_api: Some("https://10.0.0.1:6443/".into()),
            kube_token: Some("s3cr3t".into()),
            kubeconfig: Some(PathBuf::from("/does/not/exist")),
            ..Default::default()
        };
        let conn = KubeConnection::resolve(&config).unwrap();
        assert_eq!(conn.server, "https://10.0.0.1:6443");
        assert_eq!(conn.token.as_deref(), Some("s3cr3t"));
        assert!(conn.insecure);
        assert!(!format!("{:?}", conn).contains("s3cr3t"));
    }

    #[test]
    fn test_parse_kubeconfig_current_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), "PEM").unwrap();
        std::fs::write(dir.path().join("token"), "file-token\n").unwrap();
        let yaml = r#"
apiVersion: v1
kind: Config
current-context: prod
clusters:
  - name: dev
    cluster:
      server: https://dev.example.com
      insecure-skip-tls-verify: true
  - name: prod
    cluster:
      server: https://prod.example.com/
      certificate-authority: ca.pem
users:
  - name: admin
    user:
      token-file: token
contexts:
  - name: dev
    context:
      cluster: dev
  - name: prod
    context:
      cluster: prod
      user: admin
"#;
        let path = dir.path().join("kubeconfig");
        std::fs::write(&path, yaml).unwrap();

        let conn = KubeConnection::from_kubeconfig(&path).unwrap();
        assert_eq!(conn.server, "https://prod.example.com");
        assert_eq!(conn.token.as_deref(), Some("file-token"));
        assert_eq!(conn.ca_pem.as_deref(), Some(&b"PEM"[..]));
        assert!(!conn.insecure);
    }

    #[test]
    fn test_parse_kubeconfig_inline_data() {
        let yaml = format!(
            r#"
clusters:
  - name: c
    cluster:
      server: https://k8s
      certificate-authority-data: {}
users:
  - name: u
    user:
      token: inline
contexts:
  - name: ctx
    context:
      cluster: c
      user: u
"#,
            STANDARD.encode("CA")
        );
        let conn = KubeConnection::parse_kubeconfig(&yaml, Path::new(".")).unwrap();
        assert_eq!(conn.ca_pem.as_deref(), Some(&b"CA"[..]));
        assert_eq!(conn.token.as_deref(), Some("inline"));
    }

    #[test]
    fn test_parse_kubeconfig_errors() {
        let missing_cluster = r#"
contexts:
  - name: ctx
    context:
      cluster: nowhere
"#;
        assert!(matches!(
            KubeConnection::parse_kubeconfig(missing_cluster, Path::new(".")),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(KubeConnection::parse_kubeconfig("clusters: []", Path::new(".")).is_err());
        assert!(KubeConnection::from_kubeconfig(Path::new("/does/not/exist")).is_err());
    }

    #[test]
    fn test_in_cluster_from() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "sa-token").unwrap();
        let conn = KubeConnection::in_cluster_from("10.96.0.1", "443", dir.path()).unwrap();
        assert_eq!(conn.server, "https://10.96.0.1:443");
        assert_eq!(conn.token.as_deref(), Some("sa-token"));
        assert_eq!(conn.ca_pem, None);

        let conn = KubeConnection::in_cluster_from("fd00::1", "6443", dir.path()).unwrap();
        assert_eq!(conn.server, "https://[fd00::1]:6443");

        let empty = tempfile::tempdir().unwrap();
        assert!(KubeConnection::in_cluster_from("10.96.0.1", "443", empty.path()).is_err());
    }

    #[test]
    fn test_store_builds_for_insecure_connection() {
        let conn = KubeConnection::from_token("https://127.0.0.1:6443", "t");
        let store = KubeSecretStore::new(&conn).unwrap();
        assert_eq!(
            store.secrets_url("kube-system"),
            "https://127.0.0.1:6443/api/v1/namespaces/kube-system/secrets"
        );
    }
}
