// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
// CLI argument definitions for kuberlr
//
// Only used when kuberlr is invoked under its own name; as `kubectl` every
// argument belongs to the wrapped binary.

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "kuberlr",
    version,
    about = "kubectl wrapper picking a client version compatible with the targeted cluster",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Make the operation more talkative (repeat for more detail)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print version information
    Version,

    /// Print information about the kubectl binaries found
    Bins,

    /// Download the kubectl version specified
    #[command(after_help = "Examples:\n  kuberlr get 1.20      # patch version defaults to 0\n  kuberlr get v1.19.1")]
    Get {
        /// Version to download, with or without the 'v' prefix
        #[arg(value_name = "VERSION")]
        version: String,
    },
}

impl Cli {
    /// Default log filter for the requested verbosity
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
