// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Version parsing and comparison for kubectl releases
//!
//! Kubernetes versions are plain `major.minor.patch` triples. Pre-release and
//! build metadata reported by some distributions (`v1.27.3+k3s1`,
//! `v1.28.2-gke.1157000`) carries no meaning for client compatibility and is
//! dropped by [`Version::parse_tolerant`].

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A `major.minor.patch` version
///
/// Ordering is lexicographic on `(major, minor, patch)`, which is what the
/// derived implementations give us thanks to the field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a strict `major.minor.patch` string
    ///
    /// # Examples
    /// ```
    /// use kuberlr::version::Version;
    /// assert_eq!(Version::parse("1.19.4").unwrap(), Version::new(1, 19, 4));
    /// assert!(Version::parse("v1.19.4").is_err());
    /// assert!(Version::parse("1.19").is_err());
    /// ```
    ///
    /// # Errors
    /// Returns [`Error::InvalidVersion`] unless the input is exactly three
    /// dot-separated decimal numbers.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let parts = split_numeric(input).ok_or_else(|| Error::InvalidVersion(input.to_string()))?;
        match parts.as_slice() {
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(Error::InvalidVersion(input.to_string())),
        }
    }

    /// Parse a version the way users and servers actually write them
    ///
    /// Surrounding whitespace and a leading `v` are ignored, anything after a
    /// `-` or `+` is discarded and missing minor/patch components default to 0.
    ///
    /// # Examples
    /// ```
    /// use kuberlr::version::Version;
    /// assert_eq!(Version::parse_tolerant("v1.20").unwrap(), Version::new(1, 20, 0));
    /// assert_eq!(Version::parse_tolerant("v1.27.3+k3s1\n").unwrap(), Version::new(1, 27, 3));
    /// assert_eq!(Version::parse_tolerant("1.28.2-gke.100").unwrap(), Version::new(1, 28, 2));
    /// ```
    ///
    /// # Errors
    /// Returns [`Error::InvalidVersion`] when no numeric core can be found.
    pub fn parse_tolerant(input: &str) -> Result<Self, Error> {
        let trimmed = input.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or(trimmed);

        let parts = split_numeric(core).ok_or_else(|| Error::InvalidVersion(input.to_string()))?;
        match parts.as_slice() {
            [major] => Ok(Self::new(*major, 0, 0)),
            [major, minor] => Ok(Self::new(*major, *minor, 0)),
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(Error::InvalidVersion(input.to_string())),
        }
    }
}

/// Split on dots, requiring every component to be a non-empty decimal number
fn split_numeric(input: &str) -> Option<Vec<u64>> {
    input
        .split('.')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                part.parse::<u64>().ok()
            }
        })
        .collect()
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_tolerant(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
