// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Hand the current process over to the selected kubectl

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;

use crate::error::Error;
use crate::platform::Platform;

/// Whether the program was started under a name ending in `kubectl`
///
/// # Examples
/// ```
/// use std::ffi::OsStr;
/// use kuberlr::exec::invoked_as_kubectl;
/// assert!(invoked_as_kubectl(OsStr::new("/usr/local/bin/kubectl")));
/// assert!(!invoked_as_kubectl(OsStr::new("kuberlr")));
/// ```
#[must_use]
pub fn invoked_as_kubectl(argv0: &OsStr) -> bool {
    Path::new(argv0)
        .file_name()
        .and_then(OsStr::to_str)
        .is_some_and(|name| Platform::detect().trim_extension(name).ends_with("kubectl"))
}

/// Replace the running process with `binary`, passing `args` along
///
/// Only returns on failure. The environment is inherited unchanged.
#[cfg(unix)]
pub fn replace_process(binary: &Path, args: &[OsString]) -> Error {
    use std::os::unix::process::CommandExt;

    let source = Command::new(binary).arg0(binary).args(args).exec();
    Error::Exec {
        path: binary.to_path_buf(),
        source,
    }
}

/// Windows has no `execve`: run the child to completion and exit with its status
#[cfg(not(unix))]
pub fn replace_process(binary: &Path, args: &[OsString]) -> Error {
    match Command::new(binary).args(args).status() {
        Ok(status) => std::process::exit(status.code().unwrap_or(1)),
        Err(source) => Error::Exec {
            path: binary.to_path_buf(),
            source,
        },
    }
}
