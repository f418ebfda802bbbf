// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! kuberlr - Main Application
//!
//! kuberlr is installed twice: under its own name it is a small management
//! tool, and under the name `kubectl` it transparently runs a kubectl binary
//! compatible with the cluster the user is talking to.
//!
//! In wrapper mode the application:
//! - Loads the kuberlr configuration files
//! - Asks the API server for its version, falling back to local binaries
//! - Downloads a compatible kubectl when none is installed
//! - Replaces itself with that kubectl, passing every argument along

use std::error::Error;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use kuberlr::catalog::{KubectlBinaries, local_binary_name, sort_by_version};
use kuberlr::cli::{Cli, Commands};
use kuberlr::exec::{invoked_as_kubectl, replace_process};
use kuberlr::{
    ConfigLoader, Downloader, KubeApi, KubectlDownloader, KubectlFinder, Platform, Version,
    Versioner, platform,
};

/// Environment variable holding the log filter in wrapper mode
const LOG_ENV: &str = "KUBERLR_LOG";

/// Exit status used when kuberlr itself fails before running kubectl
const WRAPPER_FAILURE_EXIT_CODE: i32 = 125;

fn main() {
    let argv0 = std::env::args_os().next().unwrap_or_default();
    if invoked_as_kubectl(&argv0) {
        kubectl_wrapper_mode();
    }
    native_mode();
}

/// Install the stderr logger; `KUBERLR_LOG` takes precedence over `default_level`
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false)
                .without_time(),
        )
        .init();
}

// =============================================================================
// Wrapper Mode
// =============================================================================

/// Run a compatible kubectl in place of this process
///
/// Never returns: either the process image is replaced or kuberlr exits with
/// [`WRAPPER_FAILURE_EXIT_CODE`], which kubectl itself does not use.
fn kubectl_wrapper_mode() -> ! {
    init_logging("info");

    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let kubectl = match resolve_kubectl(&args) {
        Ok(path) => path,
        Err(e) => {
            error!("{e}");
            exit(WRAPPER_FAILURE_EXIT_CODE);
        }
    };

    let e = replace_process(&kubectl, &args);
    error!("{e}");
    exit(WRAPPER_FAILURE_EXIT_CODE);
}

/// Pick, downloading it if needed, the kubectl to run for `args`
fn resolve_kubectl(args: &[OsString]) -> Result<PathBuf, Box<dyn Error>> {
    let config = ConfigLoader::new()?.load()?;

    let finder = KubectlFinder::new(platform::local_download_dir()?, &config.system_path);
    let downloader = Downloader::new(config.kube_mirror_url.as_str());
    let string_args: Vec<String> = args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let api = KubeApi::from_kubectl_args(&string_args);

    let versioner = Versioner::new(finder, downloader, api);
    let version = versioner.determine_target_version(config.timeout())?;
    let kubectl = versioner.ensure_compatible_kubectl(
        version,
        config.allow_download,
        config.use_latest_if_no_compatible,
    )?;
    Ok(kubectl)
}

// =============================================================================
// Native Mode
// =============================================================================

/// Parse the kuberlr command line and dispatch to the command handler
fn native_mode() -> ! {
    let cli = Cli::parse();
    init_logging(cli.log_level());

    let result = match cli.command {
        Commands::Version => cmd_version(),
        Commands::Bins => cmd_bins(),
        Commands::Get { version } => cmd_get(&version),
    };

    // Handle errors by printing to stderr and exiting with non-zero status
    if let Err(e) = result {
        eprintln!("{e}");
        exit(1);
    }
    exit(0);
}

fn cmd_version() -> Result<(), Box<dyn Error>> {
    println!("kuberlr version: {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Print the system-wide and local kubectl binaries
fn cmd_bins() -> Result<(), Box<dyn Error>> {
    let config = ConfigLoader::new()?.load()?;
    let finder = KubectlFinder::new(platform::local_download_dir()?, &config.system_path);

    println!("system-wide kubectl binaries");
    print_listing(finder.system_binaries());
    println!("\n");

    println!("local kubectl binaries");
    print_listing(finder.local_binaries());

    match which::which("kubectl") {
        Ok(path) => println!("\nkubectl on PATH: {}", path.display()),
        Err(_) => println!("\nkubectl on PATH: not found"),
    }
    Ok(())
}

fn print_listing(listing: kuberlr::Result<KubectlBinaries>) {
    match listing {
        Err(e) => println!("Error retrieving binaries: {e}"),
        Ok(binaries) if binaries.is_empty() => println!("No binaries found."),
        Ok(mut binaries) => {
            sort_by_version(&mut binaries, false);
            println!("{:<4} {:<10} BINARY", "#", "VERSION");
            for (i, binary) in binaries.iter().enumerate() {
                println!(
                    "{:<4} {:<10} {}",
                    i + 1,
                    binary.version.to_string(),
                    binary.path.display()
                );
            }
        }
    }
}

/// Download a specific kubectl version into the local cache
fn cmd_get(input_version: &str) -> Result<(), Box<dyn Error>> {
    let version = Version::parse_tolerant(input_version)?;
    let config = ConfigLoader::new()?.load()?;

    let destination =
        platform::local_download_dir()?.join(local_binary_name(version, &Platform::detect()));
    Downloader::new(config.kube_mirror_url.as_str()).download(version, &destination)?;

    eprintln!("Downloaded kubectl {version} to {}", destination.display());
    Ok(())
}
