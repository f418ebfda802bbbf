// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Client/server version skew rules
//!
//! A kubectl binary is considered compatible with a server when its version
//! falls in `[lower_bound, upper_bound)`: from one minor release below the
//! server up to (but excluding) two minor releases above it.

use crate::catalog::KubectlBinary;
use crate::error::{Error, Result};
use crate::version::Version;

/// Lowest compatible client version for `requested`, inclusive
///
/// # Examples
/// ```
/// use kuberlr::resolver::lower_bound;
/// use kuberlr::version::Version;
/// assert_eq!(lower_bound(Version::new(1, 5, 13)), Version::new(1, 4, 0));
/// assert_eq!(lower_bound(Version::new(2, 0, 3)), Version::new(2, 0, 0));
/// ```
#[must_use]
pub fn lower_bound(requested: Version) -> Version {
    Version::new(requested.major, requested.minor.saturating_sub(1), 0)
}

/// First incompatible client version above `requested`, exclusive
///
/// Saturates at `u64::MAX` instead of overflowing on absurd minor versions.
///
/// # Examples
/// ```
/// use kuberlr::resolver::upper_bound;
/// use kuberlr::version::Version;
/// assert_eq!(upper_bound(Version::new(1, 5, 13)), Version::new(1, 7, 0));
/// ```
#[must_use]
pub fn upper_bound(requested: Version) -> Version {
    Version::new(requested.major, requested.minor.saturating_add(2), 0)
}

/// Whether a client of version `candidate` may talk to a `requested` server
#[must_use]
pub fn is_compatible(requested: Version, candidate: Version) -> bool {
    lower_bound(requested) <= candidate && candidate < upper_bound(requested)
}

/// Highest-versioned binary compatible with `requested`
///
/// `binaries` must already be sorted in descending order; the first match wins.
///
/// # Errors
/// Returns [`Error::NoVersionFound`] when nothing in `binaries` is compatible.
pub fn find_compatible(requested: Version, binaries: &[KubectlBinary]) -> Result<&KubectlBinary> {
    binaries
        .iter()
        .find(|b| is_compatible(requested, b.version))
        .ok_or(Error::NoVersionFound)
}

/// Newest binary of a descending-sorted list
///
/// # Errors
/// Returns [`Error::NoVersionFound`] when `binaries` is empty.
pub fn most_recent(binaries: &[KubectlBinary]) -> Result<&KubectlBinary> {
    binaries.first().ok_or(Error::NoVersionFound)
}
