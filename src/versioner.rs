// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Decide which kubectl to run
//!
//! The [`Versioner`] asks the API server for its version, falls back to what
//! is installed locally (or to the latest upstream release) when the server
//! cannot tell, and finally makes sure a compatible binary is on disk.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::catalog::{BinaryFinder, local_binary_name};
use crate::downloader::KubectlDownloader;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::resolver::{find_compatible, most_recent};
use crate::version::Version;

/// Environment variable marking processes spawned while a version is being resolved
///
/// The kubernetes client may run an exec credential plugin to authenticate,
/// and that plugin may well be `kubectl`, which is kuberlr again. Seeing this
/// variable tells the nested kuberlr not to query the API server.
pub const PREVENT_RECURSION_ENV: &str = "KUBERLR_RESOLVING_VERSION";

/// Whether this process was started from within a version resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecursionGuard {
    env_name: String,
    inherited: bool,
}

impl RecursionGuard {
    /// Guard reflecting the current process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            env_name: PREVENT_RECURSION_ENV.to_string(),
            inherited: std::env::var_os(PREVENT_RECURSION_ENV).is_some(),
        }
    }

    /// Guard with an explicit state, independent of the environment
    #[must_use]
    pub fn new(env_name: impl Into<String>, inherited: bool) -> Self {
        Self {
            env_name: env_name.into(),
            inherited,
        }
    }

    /// True when a parent kuberlr is already resolving a version
    #[must_use]
    pub fn is_recursive(&self) -> bool {
        self.inherited
    }

    #[must_use]
    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    #[must_use]
    pub fn scope(&self) -> ResolutionScope<'_> {
        ResolutionScope {
            env_name: &self.env_name,
        }
    }
}

impl Default for RecursionGuard {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Marker handed to the API helper for the duration of one version lookup
///
/// Every child process started through [`ResolutionScope::mark`] inherits the
/// recursion variable; the variable never touches this process' own
/// environment, so there is nothing to unset afterwards.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScope<'a> {
    env_name: &'a str,
}

impl ResolutionScope<'_> {
    #[must_use]
    pub fn env_name(&self) -> &str {
        self.env_name
    }

    /// Flag a command about to be spawned as part of this resolution
    pub fn mark<'c>(&self, command: &'c mut Command) -> &'c mut Command {
        command.env(OsStr::new(self.env_name), "1")
    }
}

/// Something able to report the version of the targeted API server
pub trait ApiVersionSource {
    fn server_version(&self, timeout: Duration, scope: &ResolutionScope<'_>) -> Result<Version>;
}

/// Chooses, and when needed fetches, the kubectl binary to run
pub struct Versioner<F, D, A> {
    finder: F,
    downloader: D,
    api: A,
    guard: RecursionGuard,
    platform: Platform,
}

impl<F, D, A> Versioner<F, D, A>
where
    F: BinaryFinder,
    D: KubectlDownloader,
    A: ApiVersionSource,
{
    pub fn new(finder: F, downloader: D, api: A) -> Self {
        Self {
            finder,
            downloader,
            api,
            guard: RecursionGuard::from_env(),
            platform: Platform::detect(),
        }
    }

    #[must_use]
    pub fn with_guard(mut self, guard: RecursionGuard) -> Self {
        self.guard = guard;
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// The kubectl version to use against the current cluster
    ///
    /// The API server is asked first. When it cannot be reached, or when this
    /// process is itself part of a version lookup, the newest installed
    /// kubectl wins, and with nothing installed the latest stable upstream
    /// release is used.
    ///
    /// # Errors
    /// Fails only when every fallback fails, i.e. nothing is installed and the
    /// upstream stable version cannot be fetched.
    pub fn determine_target_version(&self, timeout: Duration) -> Result<Version> {
        if self.guard.is_recursive() {
            debug!(
                "{} is set: kubectl was invoked to authenticate, not querying the API server",
                self.guard.env_name()
            );
            return self.most_recent_or_upstream_stable();
        }

        let scope = self.guard.scope();
        match self.api.server_version(timeout, &scope) {
            Ok(version) => Ok(version),
            Err(e) => {
                if e.is_unreachable() {
                    debug!("Remote kubernetes server unreachable");
                } else {
                    debug!("{e}");
                }
                self.most_recent_or_upstream_stable()
            }
        }
    }

    fn most_recent_or_upstream_stable(&self) -> Result<Version> {
        let binaries = self.finder.all_binaries(true);
        if let Ok(kubectl) = most_recent(&binaries) {
            return Ok(kubectl.version);
        }

        debug!("No local kubectl binary found, fetching latest stable release version");
        self.downloader.upstream_stable_version()
    }

    /// Path of a kubectl binary compatible with `version`
    ///
    /// An installed compatible binary is always preferred. Otherwise the exact
    /// `version` is downloaded into the local cache, if downloads are allowed.
    /// With `use_latest_if_no_compatible`, the newest installed binary is used
    /// whenever no compatible one can be obtained.
    ///
    /// # Errors
    /// Returns [`Error::DownloadsDisabled`] when nothing compatible is installed
    /// and downloads are off, or the download error when the download fails,
    /// unless the newest-binary fallback applies.
    pub fn ensure_compatible_kubectl(
        &self,
        version: Version,
        allow_download: bool,
        use_latest_if_no_compatible: bool,
    ) -> Result<PathBuf> {
        let binaries = self.finder.all_binaries(true);
        if let Ok(kubectl) = find_compatible(version, &binaries) {
            return Ok(kubectl.path.clone());
        }

        let newest_fallback = || {
            if use_latest_if_no_compatible {
                most_recent(&binaries).ok()
            } else {
                None
            }
        };

        if !allow_download {
            return match newest_fallback() {
                Some(newest) => {
                    info!(
                        "No kubectl compatible with {version} installed, using newest local kubectl {} at {}",
                        newest.version,
                        newest.path.display()
                    );
                    Ok(newest.path.clone())
                }
                None => Err(Error::DownloadsDisabled),
            };
        }

        info!("Right kubectl missing, downloading version {version}");
        let destination = self
            .finder
            .local_download_dir()
            .join(local_binary_name(version, &self.platform));

        match self.downloader.download(version, &destination) {
            Ok(()) => Ok(destination),
            Err(e) => match newest_fallback() {
                Some(newest) => {
                    info!(
                        "download failed ({e}); falling back to newest local kubectl {} at {}",
                        newest.version,
                        newest.path.display()
                    );
                    Ok(newest.path.clone())
                }
                None => Err(e),
            },
        }
    }
}
