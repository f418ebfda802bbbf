// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Ask the targeted API server for its version
//!
//! Only the part of kubeconfig handling needed for an authenticated
//! `GET /version` is implemented: cluster server and CA, client certificates,
//! bearer tokens and exec credential plugins.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::platform;
use crate::versioner::{ApiVersionSource, ResolutionScope};
use crate::version::Version;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    pub current_context: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    pub certificate_authority: Option<PathBuf>,
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: AuthInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthInfo {
    pub token: Option<String>,
    #[serde(rename = "tokenFile")]
    pub token_file: Option<PathBuf>,
    pub exec: Option<ExecConfig>,
    pub client_certificate: Option<PathBuf>,
    pub client_certificate_data: Option<String>,
    pub client_key: Option<PathBuf>,
    pub client_key_data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<ExecEnvVar>,
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecEnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct ExecCredential {
    status: Option<ExecCredentialStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerVersion {
    git_version: String,
}

impl Kubeconfig {
    /// Read one kubeconfig file, resolving relative paths against its directory
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML.
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("cannot read kubeconfig {}", path.display()), e))?;
        let mut config: Kubeconfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::Kubeconfig(format!("{}: {e}", path.display())))?;

        if let Some(base) = path.parent() {
            for named in &mut config.clusters {
                if let Some(ca) = named.cluster.certificate_authority.as_mut()
                    && ca.is_relative()
                {
                    *ca = base.join(&*ca);
                }
            }
            for named in &mut config.users {
                let user = &mut named.user;
                for file in [
                    user.token_file.as_mut(),
                    user.client_certificate.as_mut(),
                    user.client_key.as_mut(),
                ]
                .into_iter()
                .flatten()
                {
                    if file.is_relative() {
                        *file = base.join(&*file);
                    }
                }
            }
        }
        Ok(config)
    }

    /// Merge `other` into `self`; values already present in `self` win
    pub fn merge(&mut self, other: Kubeconfig) {
        if self.current_context.is_none() {
            self.current_context = other.current_context;
        }
        for cluster in other.clusters {
            if !self.clusters.iter().any(|c| c.name == cluster.name) {
                self.clusters.push(cluster);
            }
        }
        for context in other.contexts {
            if !self.contexts.iter().any(|c| c.name == context.name) {
                self.contexts.push(context);
            }
        }
        for user in other.users {
            if !self.users.iter().any(|u| u.name == user.name) {
                self.users.push(user);
            }
        }
    }

    /// Cluster and user of `context`, or of the current context when `None`
    ///
    /// # Errors
    /// Returns [`Error::Kubeconfig`] when the context, or what it points at,
    /// is not defined.
    pub fn resolve(&self, context: Option<&str>) -> Result<(&Cluster, Option<&AuthInfo>)> {
        let name = context
            .or(self.current_context.as_deref())
            .ok_or_else(|| Error::Kubeconfig("no current context set".to_string()))?;
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.context)
            .ok_or_else(|| Error::Kubeconfig(format!("context '{name}' not found")))?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| Error::Kubeconfig(format!("cluster '{}' not found", context.cluster)))?;

        let user = match context.user.as_deref() {
            Some(user) => Some(
                self.users
                    .iter()
                    .find(|u| u.name == user)
                    .map(|u| &u.user)
                    .ok_or_else(|| Error::Kubeconfig(format!("user '{user}' not found")))?,
            ),
            None => None,
        };
        Ok((cluster, user))
    }
}

/// Value of a `--flag value` or `--flag=value` argument
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        if arg == flag {
            return iter.next().cloned();
        }
        if let Some(value) = arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            return Some(value.to_string());
        }
    }
    None
}

/// Version lookup against the cluster selected by the kubeconfig
#[derive(Debug, Clone, Default)]
pub struct KubeApi {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl KubeApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Honour the `--kubeconfig` and `--context` flags of a kubectl command line
    #[must_use]
    pub fn from_kubectl_args(args: &[String]) -> Self {
        Self {
            kubeconfig: flag_value(args, "--kubeconfig").map(PathBuf::from),
            context: flag_value(args, "--context"),
        }
    }

    #[must_use]
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Kubeconfig files to load, in precedence order
    ///
    /// # Errors
    /// Returns an error when no explicit path is given and the home directory
    /// is unknown.
    pub fn kubeconfig_paths(&self) -> Result<Vec<PathBuf>> {
        if let Some(path) = &self.kubeconfig {
            return Ok(vec![path.clone()]);
        }
        if let Some(value) = std::env::var_os("KUBECONFIG") {
            let paths: Vec<PathBuf> = std::env::split_paths(&value)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !paths.is_empty() {
                return Ok(paths);
            }
        }
        Ok(vec![platform::home_dir()?.join(".kube").join("config")])
    }

    /// Load and merge every kubeconfig file
    ///
    /// Files listed in `KUBECONFIG` that do not exist are skipped, an explicit
    /// `--kubeconfig` must exist.
    ///
    /// # Errors
    /// Returns an error when a file cannot be parsed or none can be found.
    pub fn load_kubeconfig(&self) -> Result<Kubeconfig> {
        let paths = self.kubeconfig_paths()?;
        let mut merged = Kubeconfig::default();
        let mut loaded = false;
        for path in &paths {
            if self.kubeconfig.is_none() && !path.exists() {
                debug!("skipping missing kubeconfig {}", path.display());
                continue;
            }
            merged.merge(Kubeconfig::read(path)?);
            loaded = true;
        }
        if !loaded {
            return Err(Error::Kubeconfig("no kubeconfig file found".to_string()));
        }
        Ok(merged)
    }

    fn bearer_token(user: &AuthInfo, scope: &ResolutionScope<'_>) -> Result<Option<String>> {
        if let Some(token) = &user.token {
            return Ok(Some(token.clone()));
        }
        if let Some(path) = &user.token_file {
            let token = fs::read_to_string(path)
                .map_err(|e| Error::io(format!("cannot read token file {}", path.display()), e))?;
            return Ok(Some(token.trim().to_string()));
        }
        if let Some(exec) = &user.exec {
            return run_exec_plugin(exec, scope).map(Some);
        }
        Ok(None)
    }
}

/// PEM bytes from inline base64 `data`, or else from the file at `path`
fn read_pem(data: Option<&str>, path: Option<&Path>, what: &str) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data {
        return BASE64
            .decode(data.trim())
            .map(Some)
            .map_err(|e| Error::Kubeconfig(format!("invalid {what}-data: {e}")));
    }
    match path {
        Some(path) => fs::read(path)
            .map(Some)
            .map_err(|e| Error::io(format!("cannot read {what} {}", path.display()), e)),
        None => Ok(None),
    }
}

fn root_certificate(cluster: &Cluster) -> Result<Option<reqwest::Certificate>> {
    let Some(pem) = read_pem(
        cluster.certificate_authority_data.as_deref(),
        cluster.certificate_authority.as_deref(),
        "certificate-authority",
    )?
    else {
        return Ok(None);
    };
    reqwest::Certificate::from_pem(&pem)
        .map(Some)
        .map_err(|e| Error::Kubeconfig(format!("invalid certificate authority: {e}")))
}

/// TLS client identity of `user`, when it authenticates with a certificate
fn client_identity(user: &AuthInfo) -> Result<Option<reqwest::Identity>> {
    let Some(mut pem) = read_pem(
        user.client_certificate_data.as_deref(),
        user.client_certificate.as_deref(),
        "client-certificate",
    )?
    else {
        return Ok(None);
    };
    let key = read_pem(
        user.client_key_data.as_deref(),
        user.client_key.as_deref(),
        "client-key",
    )?
    .ok_or_else(|| Error::Kubeconfig("client certificate given without client key".to_string()))?;

    pem.push(b'\n');
    pem.extend_from_slice(&key);
    reqwest::Identity::from_pem(&pem)
        .map(Some)
        .map_err(|e| Error::Kubeconfig(format!("invalid client certificate or key: {e}")))
}

/// Run an exec credential plugin and return the token it prints
fn run_exec_plugin(exec: &ExecConfig, scope: &ResolutionScope<'_>) -> Result<String> {
    let api_version = exec
        .api_version
        .as_deref()
        .unwrap_or("client.authentication.k8s.io/v1beta1");
    let exec_info = serde_json::json!({
        "apiVersion": api_version,
        "kind": "ExecCredential",
        "spec": { "interactive": false },
    });

    let mut command = Command::new(&exec.command);
    command
        .args(&exec.args)
        .envs(exec.env.iter().map(|v| (&v.name, &v.value)))
        .env("KUBERNETES_EXEC_INFO", exec_info.to_string())
        .stdin(Stdio::null())
        .stderr(Stdio::inherit());
    scope.mark(&mut command);

    debug!("running exec credential plugin {}", exec.command);
    let output = command.output().map_err(|source| Error::Exec {
        path: PathBuf::from(&exec.command),
        source,
    })?;
    if !output.status.success() {
        return Err(Error::Kubeconfig(format!(
            "exec plugin {} failed with {}",
            exec.command, output.status
        )));
    }

    let credential: ExecCredential = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::Kubeconfig(format!("invalid ExecCredential from {}: {e}", exec.command)))?;
    credential
        .status
        .and_then(|s| s.token)
        .ok_or_else(|| {
            Error::Kubeconfig(format!("exec plugin {} returned no token", exec.command))
        })
}

impl ApiVersionSource for KubeApi {
    fn server_version(&self, timeout: Duration, scope: &ResolutionScope<'_>) -> Result<Version> {
        let kubeconfig = self.load_kubeconfig()?;
        let (cluster, user) = kubeconfig.resolve(self.context.as_deref())?;

        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(format!("kuberlr/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(cluster.insecure_skip_tls_verify);
        if let Some(certificate) = root_certificate(cluster)? {
            builder = builder.add_root_certificate(certificate);
        }
        let mut token = None;
        if let Some(user) = user {
            if let Some(identity) = client_identity(user)? {
                builder = builder.identity(identity);
            }
            token = Self::bearer_token(user, scope)?;
        }
        let client = builder
            .build()
            .map_err(|e| Error::Kubeconfig(format!("cannot configure http client: {e}")))?;

        let url = format!("{}/version", cluster.server.trim_end_matches('/'));
        let mut request = client.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|e| Error::ServerUnreachable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Api(format!(
                "GET {url} returned http status {}",
                response.status().as_u16()
            )));
        }
        let body = response
            .text()
            .map_err(|e| Error::ServerUnreachable(format!("{url}: {e}")))?;
        let version: ServerVersion = serde_json::from_str(&body)
            .map_err(|e| Error::Api(format!("unexpected /version response from {url}: {e}")))?;
        Version::parse_tolerant(&version.git_version)
    }
}
