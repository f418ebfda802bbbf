// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Error types for kuberlr
//!
//! Every failure the library can report is one of these variants, so callers
//! can decide between "fall back" and "abort" with a plain `match`.

use std::io;
use std::path::PathBuf;

/// Result type alias using the kuberlr [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No installed kubectl satisfies the request, or there is none at all.
    #[error("no local kubectl binaries available")]
    NoVersionFound,

    /// The API server could not be reached within the timeout budget.
    #[error("remote kubernetes server unreachable: {0}")]
    ServerUnreachable(String),

    /// The API server answered, but not with something we can use.
    #[error("cannot determine kubernetes server version: {0}")]
    Api(String),

    /// The downloaded bytes do not match the published checksum.
    #[error("SHA mismatch for URL {url}: expected '{expected}', got '{actual}'")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("the right kubectl is missing, binary downloads from kubernetes' upstream mirror are disabled")]
    DownloadsDisabled,

    #[error("GET {url} returned http status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("error while issuing GET request against {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: attohttpc::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error("invalid configuration file {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("failed to execute {path}: {source}")]
    Exec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    #[must_use]
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, Error::ChecksumMismatch { .. })
    }

    #[must_use]
    pub fn is_no_version_found(&self) -> bool {
        matches!(self, Error::NoVersionFound)
    }

    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::ServerUnreachable(_))
    }
}
