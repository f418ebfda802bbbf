// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Discovery of the kubectl binaries installed on this machine
//!
//! Two directories are scanned: the local cache owned by kuberlr, where
//! binaries are named `kubectl{major}.{minor}.{patch}`, and a system directory
//! managed by the OS package manager, where they are named
//! `kubectl{major}.{minor}`. Anything else found there is ignored.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::version::Version;

/// File name prefix shared by both naming schemes
pub const KUBECTL_PREFIX: &str = "kubectl";

/// One kubectl binary, found on disk or about to be downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubectlBinary {
    pub path: PathBuf,
    pub version: Version,
}

/// A list of kubectl binaries, usually sorted by version
pub type KubectlBinaries = Vec<KubectlBinary>;

/// How a binary's file name encodes its version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScheme {
    /// `kubectl{major}.{minor}.{patch}`, used for downloads
    Local,
    /// `kubectl{major}.{minor}`, used by distribution packages
    System,
}

/// File name kuberlr gives to a downloaded binary of `version`
#[must_use]
pub fn local_binary_name(version: Version, platform: &Platform) -> String {
    format!(
        "{KUBECTL_PREFIX}{}.{}.{}{}",
        version.major, version.minor, version.patch, platform.binary_extension
    )
}

/// File name a system-wide binary of `version` is expected to have
#[must_use]
pub fn system_binary_name(version: Version, platform: &Platform) -> String {
    format!(
        "{KUBECTL_PREFIX}{}.{}{}",
        version.major, version.minor, platform.binary_extension
    )
}

/// Infer the version encoded in a file name
///
/// The local scheme is tried first, then the system one; the patch level of a
/// system binary is assumed to be 0.
///
/// # Examples
/// ```
/// use kuberlr::catalog::{parse_binary_name, NamingScheme};
/// use kuberlr::platform::Platform;
/// use kuberlr::version::Version;
///
/// let linux = Platform::LINUX_AMD64;
/// assert_eq!(
///     parse_binary_name("kubectl1.4.2", &linux),
///     Some((Version::new(1, 4, 2), NamingScheme::Local))
/// );
/// assert_eq!(
///     parse_binary_name("kubectl1.4", &linux),
///     Some((Version::new(1, 4, 0), NamingScheme::System))
/// );
/// assert_eq!(parse_binary_name("kubectl", &linux), None);
/// ```
#[must_use]
pub fn parse_binary_name(filename: &str, platform: &Platform) -> Option<(Version, NamingScheme)> {
    let stem = platform.trim_extension(filename);
    let encoded = stem.strip_prefix(KUBECTL_PREFIX)?;

    let mut numbers = Vec::with_capacity(3);
    for part in encoded.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        numbers.push(part.parse::<u64>().ok()?);
    }

    match numbers.as_slice() {
        [major, minor, patch] => Some((Version::new(*major, *minor, *patch), NamingScheme::Local)),
        [major, minor] => Some((Version::new(*major, *minor, 0), NamingScheme::System)),
        _ => None,
    }
}

/// Sort binaries by version, ascending or (with `reverse`) descending
///
/// The sort is stable: binaries sharing a version keep their relative order.
pub fn sort_by_version(binaries: &mut [KubectlBinary], reverse: bool) {
    if reverse {
        binaries.sort_by(|a, b| b.version.cmp(&a.version));
    } else {
        binaries.sort_by(|a, b| a.version.cmp(&b.version));
    }
}

/// List the kubectl binaries found directly inside `path`
///
/// A missing directory is not an error, it simply holds no binaries yet.
///
/// # Errors
/// Returns an error when the directory exists but cannot be read.
pub fn list_in(path: &Path, platform: &Platform) -> Result<KubectlBinaries> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::io(format!("cannot read directory {}", path.display()), e));
        }
    };

    let mut binaries = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::io(format!("cannot read directory {}", path.display()), e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        match parse_binary_name(name, platform) {
            Some((version, _)) => binaries.push(KubectlBinary {
                path: entry.path(),
                version,
            }),
            None => trace!("ignoring {name}: not a versioned kubectl binary"),
        }
    }

    Ok(binaries)
}

/// Source of installed kubectl binaries
pub trait BinaryFinder {
    /// Every binary from the local cache and the system directory, sorted by version
    fn all_binaries(&self, reverse: bool) -> KubectlBinaries;

    /// Directory downloaded binaries are written to
    fn local_download_dir(&self) -> &Path;
}

/// Finds kubectl binaries in the local cache and the system directory
#[derive(Debug, Clone)]
pub struct KubectlFinder {
    local_path: PathBuf,
    system_path: PathBuf,
    platform: Platform,
}

impl KubectlFinder {
    #[must_use]
    pub fn new(local_path: impl Into<PathBuf>, system_path: impl Into<PathBuf>) -> Self {
        Self::with_platform(local_path, system_path, Platform::detect())
    }

    #[must_use]
    pub fn with_platform(
        local_path: impl Into<PathBuf>,
        system_path: impl Into<PathBuf>,
        platform: Platform,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            system_path: system_path.into(),
            platform,
        }
    }

    #[must_use]
    pub fn system_path(&self) -> &Path {
        &self.system_path
    }

    /// Binaries downloaded by kuberlr for the current user
    ///
    /// # Errors
    /// Returns an error when the local cache exists but cannot be read.
    pub fn local_binaries(&self) -> Result<KubectlBinaries> {
        list_in(&self.local_path, &self.platform)
    }

    /// Binaries available to every user of the system
    ///
    /// # Errors
    /// Returns an error when the system directory exists but cannot be read.
    pub fn system_binaries(&self) -> Result<KubectlBinaries> {
        list_in(&self.system_path, &self.platform)
    }
}

impl BinaryFinder for KubectlFinder {
    fn all_binaries(&self, reverse: bool) -> KubectlBinaries {
        let mut binaries = KubectlBinaries::new();
        for listing in [self.local_binaries(), self.system_binaries()] {
            match listing {
                Ok(found) => binaries.extend(found),
                Err(e) => warn!("{e}"),
            }
        }
        sort_by_version(&mut binaries, reverse);
        binaries
    }

    fn local_download_dir(&self) -> &Path {
        &self.local_path
    }
}
