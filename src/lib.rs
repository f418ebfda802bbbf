// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! kubectl version resolution library
//!
//! This library finds the kubectl binaries installed on the machine, decides
//! which of them can talk to the targeted API server, and downloads a
//! compatible release from the kubernetes mirror when none can.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod downloader;
pub mod error;
pub mod exec;
pub mod kubeapi;
pub mod platform;
pub mod resolver;
pub mod version;
pub mod versioner;

// Re-export commonly used items at the crate root for convenience
pub use catalog::{BinaryFinder, KubectlBinaries, KubectlBinary, KubectlFinder};
pub use config::{Config, ConfigLoader};
pub use downloader::{Downloader, KubectlDownloader, RetryPolicy};
pub use error::{Error, Result};
pub use kubeapi::KubeApi;
pub use platform::Platform;
pub use resolver::{find_compatible, most_recent};
pub use version::Version;
pub use versioner::{ApiVersionSource, PREVENT_RECURSION_ENV, RecursionGuard, Versioner};
