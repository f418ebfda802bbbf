// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Configuration for kuberlr
//!
//! Settings come from `kuberlr.conf` TOML files. Several files may exist; they
//! are read in a fixed order and every key found overrides the value read
//! before it, so a user's file refines the system-wide ones.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::platform::{self, DEFAULT_SYSTEM_PATH, KUBE_MIRROR_BASE, KUBERLR_HOME_DIR};

/// Name of every configuration file
pub const CONFIG_FILE_NAME: &str = "kuberlr.conf";

/// Environment variable naming one more configuration file, read last
pub const CONFIG_ENV: &str = "KUBERLR_CFG";

/// Effective settings after all configuration files are merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Download missing kubectl binaries from the mirror
    pub allow_download: bool,
    /// Directory holding system-wide `kubectl{major}.{minor}` binaries
    pub system_path: PathBuf,
    /// Seconds to wait for the API server
    pub timeout: u64,
    /// Base URL of the kubernetes release mirror
    pub kube_mirror_url: String,
    /// Use the newest installed kubectl when no compatible one can be had
    pub use_latest_if_no_compatible: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_download: true,
            system_path: PathBuf::from(DEFAULT_SYSTEM_PATH),
            timeout: 5,
            kube_mirror_url: KUBE_MIRROR_BASE.to_string(),
            use_latest_if_no_compatible: false,
        }
    }
}

impl Config {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn apply(&mut self, file: ConfigFile) {
        if let Some(v) = file.allow_download {
            self.allow_download = v;
        }
        if let Some(v) = file.system_path {
            self.system_path = v;
        }
        if let Some(v) = file.timeout {
            self.timeout = v;
        }
        if let Some(v) = file.kube_mirror_url {
            self.kube_mirror_url = v;
        }
        if let Some(v) = file.use_latest_if_no_compatible {
            self.use_latest_if_no_compatible = v;
        }
    }
}

/// Keys a single configuration file may set
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigFile {
    allow_download: Option<bool>,
    system_path: Option<PathBuf>,
    timeout: Option<u64>,
    #[serde(alias = "KubeMirrorURL", alias = "MirrorURL")]
    kube_mirror_url: Option<String>,
    use_latest_if_no_compatible: Option<bool>,
}

/// Reads and merges configuration files
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Loader for the standard configuration file locations
    ///
    /// # Errors
    /// Returns an error when the home directory cannot be determined.
    pub fn new() -> Result<Self> {
        Ok(Self {
            paths: default_paths(&platform::home_dir()?),
        })
    }

    /// Loader reading exactly `paths`, in order
    #[must_use]
    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Merge every existing file on top of the defaults
    ///
    /// # Errors
    /// Returns [`Error::Config`] when a file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Config> {
        let mut config = Config::default();
        for path in &self.paths {
            if let Some(file) = read_config_file(path)? {
                debug!("merging configuration from {}", path.display());
                config.apply(file);
            }
        }
        Ok(config)
    }
}

fn read_config_file(path: &Path) -> Result<Option<ConfigFile>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            });
        }
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

#[cfg(not(windows))]
fn default_paths(home: &Path) -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from("/usr/etc").join(CONFIG_FILE_NAME),
        PathBuf::from("/etc").join(CONFIG_FILE_NAME),
        home.join(KUBERLR_HOME_DIR).join(CONFIG_FILE_NAME),
    ];
    paths.extend(env_path());
    paths
}

#[cfg(windows)]
fn default_paths(home: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for var in ["APPDATA", "PROGRAMDATA"] {
        if let Some(base) = std::env::var_os(var) {
            dirs.push(PathBuf::from(base).join("kuberlr"));
        }
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir);
    }
    dirs.push(home.join(KUBERLR_HOME_DIR));

    let mut paths: Vec<PathBuf> = dirs.into_iter().map(|d| d.join(CONFIG_FILE_NAME)).collect();
    paths.extend(env_path());
    paths
}

fn env_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
