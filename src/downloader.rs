// GNU Affero General Public License v3.0 or later (see LICENSE or https://www.gnu.org/licenses/agpl.txt)
//! Download of kubectl binaries from the kubernetes release mirror
//!
//! A download streams the binary into a temporary file while hashing it,
//! compares the digest with the checksum file published next to it, and only
//! then moves the file into place. Checksum mismatches are retried because the
//! mirror is occasionally inconsistent right after a release; every other
//! failure aborts immediately.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use sha1::Sha1;
use sha2::{Digest, Sha512};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::platform::{KUBE_MIRROR_BASE, Platform};
use crate::version::Version;

/// First release for which the mirror publishes `.sha512` checksum files
pub const SHA512_SINCE: Version = Version::new(1, 12, 0);

/// Digest used to verify a given kubectl release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha512,
    /// Only used for releases older than [`SHA512_SINCE`]
    Sha1,
}

impl HashAlgorithm {
    #[must_use]
    pub fn for_version(version: Version) -> Self {
        if version >= SHA512_SINCE {
            HashAlgorithm::Sha512
        } else {
            HashAlgorithm::Sha1
        }
    }

    /// Extension of the checksum file published next to the binary
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha1 => "sha1",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
        }
    }

    /// Lowercase hex digest of `data`
    #[must_use]
    pub fn hex_digest(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }
}

enum Hasher {
    Sha512(Sha512),
    Sha1(Sha1),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha512(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
            Hasher::Sha1(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Writer feeding everything it writes to a hasher as well
struct HashingWriter<'a, W> {
    inner: W,
    hasher: &'a mut Hasher,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// How often, and how patiently, a download is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt `n` is followed by a pause of `n * backoff_step`
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// Run `attempt` until it succeeds, retrying only on checksum mismatches
///
/// `attempt` receives the 1-based attempt number. When every attempt fails the
/// error of the first one is returned.
///
/// # Errors
/// Returns the first error once the attempts are exhausted, or as soon as an
/// attempt fails for any reason other than a checksum mismatch.
pub fn retry_on_checksum_mismatch<T>(
    policy: &RetryPolicy,
    mut attempt: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);

    let first_error = match attempt(1) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    let mut retryable = first_error.is_checksum_mismatch();
    if retryable {
        warn!("Error on download attempt #1: {first_error}");
    }

    let mut number = 1;
    while retryable && number < max_attempts {
        thread::sleep(policy.delay_after(number));
        number += 1;
        match attempt(number) {
            Ok(value) => return Ok(value),
            Err(e) => {
                retryable = e.is_checksum_mismatch();
                if retryable {
                    warn!("Error on download attempt #{number}: {e}");
                } else {
                    debug!("giving up after attempt #{number}: {e}");
                }
            }
        }
    }

    Err(first_error)
}

/// Access to released kubectl binaries
pub trait KubectlDownloader {
    /// Latest release upstream considers stable
    fn upstream_stable_version(&self) -> Result<Version>;

    /// Download `version` and install it, executable, at `destination`
    fn download(&self, version: Version, destination: &Path) -> Result<()>;
}

/// Downloads kubectl from a kubernetes release mirror over HTTP
#[derive(Debug, Clone)]
pub struct Downloader {
    mirror_url: String,
    platform: Platform,
    retry: RetryPolicy,
    scratch_dir: PathBuf,
    show_progress: bool,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new(KUBE_MIRROR_BASE)
    }
}

impl Downloader {
    #[must_use]
    pub fn new(mirror_url: impl Into<String>) -> Self {
        let mirror_url: String = mirror_url.into();
        Self {
            mirror_url: mirror_url.trim_end_matches('/').to_string(),
            platform: Platform::detect(),
            retry: RetryPolicy::default(),
            scratch_dir: std::env::temp_dir(),
            show_progress: true,
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Directory temporary files are downloaded into
    #[must_use]
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    #[must_use]
    pub fn stable_version_url(&self) -> String {
        format!("{}/release/stable.txt", self.mirror_url)
    }

    /// Mirror URL of the kubectl binary for `version` on this platform
    ///
    /// # Examples
    /// ```
    /// use kuberlr::downloader::Downloader;
    /// use kuberlr::platform::Platform;
    /// use kuberlr::version::Version;
    ///
    /// let d = Downloader::new("https://dl.k8s.io/").with_platform(Platform::LINUX_AMD64);
    /// assert_eq!(
    ///     d.binary_url(Version::new(1, 18, 0)),
    ///     "https://dl.k8s.io/release/v1.18.0/bin/linux/amd64/kubectl"
    /// );
    /// ```
    #[must_use]
    pub fn binary_url(&self, version: Version) -> String {
        format!(
            "{}/release/v{}.{}.{}/bin/{}/{}/kubectl{}",
            self.mirror_url,
            version.major,
            version.minor,
            version.patch,
            self.platform.os,
            self.platform.arch,
            self.platform.binary_extension
        )
    }

    fn get(url: &str) -> Result<attohttpc::Response> {
        let response = attohttpc::get(url)
            .header(
                attohttpc::header::USER_AGENT,
                format!("kuberlr/{}", env!("CARGO_PKG_VERSION")),
            )
            .send()
            .map_err(|source| Error::Http {
                url: url.to_string(),
                source,
            })?;

        if !response.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    fn get_text(url: &str) -> Result<String> {
        Self::get(url)?.text().map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })
    }

    fn progress_bar(&self, length: Option<u64>, description: String) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::with_draw_target(length, ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(
            "{msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        bar.set_message(description);
        bar
    }

    /// A single download attempt, without any retry
    fn download_once(&self, version: Version, destination: &Path) -> Result<()> {
        let algorithm = HashAlgorithm::for_version(version);
        let url = self.binary_url(version);
        let checksum_url = format!("{url}.{}", algorithm.extension());

        let expected = Self::get_text(&checksum_url)?;
        // Some checksum files follow the `<digest>  <file name>` layout.
        let expected = expected
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        let response = Self::get(&url)?;
        let (_, headers, mut body) = response.split();
        let length = headers
            .get(attohttpc::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let mut temporary = tempfile::Builder::new()
            .prefix("kuberlr-kubectl-")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| {
                Error::io(
                    format!(
                        "error trying to create temporary file in {}",
                        self.scratch_dir.display()
                    ),
                    e,
                )
            })?;
        let temporary_path = temporary.path().to_path_buf();

        // Progress goes to stderr: stdout may be consumed by shell completion.
        info!("Downloading {url}");
        let bar = self.progress_bar(length, format!("kubectl{version}"));
        let mut hasher = algorithm.hasher();
        {
            let writer = HashingWriter {
                inner: temporary.as_file_mut(),
                hasher: &mut hasher,
            };
            let mut writer = bar.wrap_write(writer);
            io::copy(&mut body, &mut writer)
                .and_then(|_| writer.flush())
                .map_err(|e| {
                    Error::io(
                        format!(
                            "error while downloading {url} into {}",
                            temporary_path.display()
                        ),
                        e,
                    )
                })?;
        }
        bar.finish_and_clear();

        let actual = hasher.finalize_hex();
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(Error::ChecksumMismatch {
                url,
                expected,
                actual,
            });
        }

        install(temporary, destination)
    }
}

impl KubectlDownloader for Downloader {
    fn upstream_stable_version(&self) -> Result<Version> {
        let url = self.stable_version_url();
        let body = Self::get_text(&url)?;
        Version::parse_tolerant(&body)
    }

    fn download(&self, version: Version, destination: &Path) -> Result<()> {
        retry_on_checksum_mismatch(&self.retry, |_| self.download_once(version, destination))
    }
}

/// Move a verified temporary file to `destination` and make it executable
fn install(temporary: tempfile::NamedTempFile, destination: &Path) -> Result<()> {
    let directory = parent_dir(destination);
    fs::create_dir_all(directory)
        .map_err(|e| Error::io(format!("cannot create directory {}", directory.display()), e))?;

    if let Err(persist) = temporary.persist(destination) {
        if persist.error.kind() != io::ErrorKind::CrossesDevices {
            return Err(Error::io(
                format!("cannot move download to {}", destination.display()),
                persist.error,
            ));
        }
        warn!(
            "Cross-device error trying to rename a file: {} -- will do a full copy",
            persist.error
        );
        copy_into_place(persist.file.path(), destination)?;
    }

    set_executable(destination)
}

/// Copy `source` to `destination` without ever exposing a partial file
///
/// The bytes land in a temporary file inside the destination directory, which
/// is then renamed over `destination`. A failed copy removes the temporary
/// file, so no truncated binary is left behind for the catalog to pick up.
///
/// # Errors
/// Returns an error when `source` cannot be read or the destination
/// directory cannot be written.
pub fn copy_into_place(source: &Path, destination: &Path) -> Result<()> {
    let directory = parent_dir(destination);
    let mut staged = tempfile::Builder::new()
        .prefix(".kuberlr-kubectl-")
        .tempfile_in(directory)
        .map_err(|e| {
            Error::io(
                format!("cannot create temporary file in {}", directory.display()),
                e,
            )
        })?;

    let mut input = fs::File::open(source)
        .map_err(|e| Error::io(format!("cannot open {}", source.display()), e))?;
    io::copy(&mut input, staged.as_file_mut())
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| Error::io(format!("cannot copy download to {}", destination.display()), e))?;

    staged.persist(destination).map_err(|e| {
        Error::io(
            format!("cannot move download to {}", destination.display()),
            e.error,
        )
    })?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Restrict the file to its owner and make it executable
#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::io(format!("cannot set permissions of {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
