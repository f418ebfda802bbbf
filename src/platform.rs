// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Platform detection and filesystem layout for kubectl binaries
//!
//! This module knows how the upstream mirror names operating systems and
//! architectures, which extension executables carry, and where kuberlr keeps
//! the binaries it downloads.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Base URL of the upstream mirror hosting kubectl releases
pub const KUBE_MIRROR_BASE: &str = "https://dl.k8s.io";

/// Directory, relative to the user's home, holding kuberlr's state
pub const KUBERLR_HOME_DIR: &str = ".kuberlr";

/// Directory scanned for kubectl binaries installed by the OS package manager
#[cfg(not(windows))]
pub const DEFAULT_SYSTEM_PATH: &str = "/usr/bin";
#[cfg(windows)]
pub const DEFAULT_SYSTEM_PATH: &str = "C:\\ProgramData\\kuberlr\\bin";

/// Extension carried by executables on the build platform
#[cfg(windows)]
pub const BINARY_EXTENSION: &str = ".exe";
#[cfg(not(windows))]
pub const BINARY_EXTENSION: &str = "";

/// A target platform as spelled by the kubernetes release mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Mirror operating system name (e.g. "linux", "darwin")
    pub os: &'static str,
    /// Mirror architecture name (e.g. "amd64", "arm64")
    pub arch: &'static str,
    /// Extension of executables on this platform
    pub binary_extension: &'static str,
}

impl Platform {
    pub const LINUX_AMD64: Platform = Platform::new("linux", "amd64", "");
    pub const LINUX_ARM64: Platform = Platform::new("linux", "arm64", "");
    pub const DARWIN_AMD64: Platform = Platform::new("darwin", "amd64", "");
    pub const DARWIN_ARM64: Platform = Platform::new("darwin", "arm64", "");
    pub const WINDOWS_AMD64: Platform = Platform::new("windows", "amd64", ".exe");

    #[must_use]
    pub const fn new(os: &'static str, arch: &'static str, binary_extension: &'static str) -> Self {
        Self {
            os,
            arch,
            binary_extension,
        }
    }

    /// Detect the platform kuberlr is running on
    ///
    /// Unknown operating systems are passed through unchanged so the
    /// resulting mirror URL at least fails loudly with a 404.
    #[must_use]
    pub fn detect() -> Platform {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Platform::new(os, arch, BINARY_EXTENSION)
    }

    /// Human-readable `{os}-{arch}` name, also used as the cache subdirectory
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    /// Directory holding the kubectl binaries downloaded for this platform
    ///
    /// # Arguments
    /// * `home` - The user's home directory
    #[must_use]
    pub fn local_download_dir(&self, home: &Path) -> PathBuf {
        home.join(KUBERLR_HOME_DIR).join(self.name())
    }

    /// Strip the platform's executable extension from a file name, if present
    ///
    /// # Examples
    /// ```
    /// use kuberlr::platform::Platform;
    /// assert_eq!(Platform::WINDOWS_AMD64.trim_extension("kubectl1.20.0.exe"), "kubectl1.20.0");
    /// assert_eq!(Platform::LINUX_AMD64.trim_extension("kubectl1.20.0"), "kubectl1.20.0");
    /// ```
    #[must_use]
    pub fn trim_extension<'a>(&self, filename: &'a str) -> &'a str {
        if self.binary_extension.is_empty() {
            return filename;
        }
        filename
            .strip_suffix(self.binary_extension)
            .unwrap_or(filename)
    }
}

/// The current user's home directory
///
/// # Errors
/// Returns an error when the home directory cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    home::home_dir().ok_or_else(|| {
        Error::io(
            "cannot determine the user home directory",
            io::Error::from(io::ErrorKind::NotFound),
        )
    })
}

/// Local download directory for the running platform
///
/// # Errors
/// Returns an error when the home directory cannot be determined.
pub fn local_download_dir() -> Result<PathBuf> {
    Ok(Platform::detect().local_download_dir(&home_dir()?))
}
