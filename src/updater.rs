//! In-place self-update of a packaged artifact.
//!
//! The running artifact carries an embedded receipt naming where its
//! published counterpart lives. Updating means fetching that published
//! receipt, comparing dates, downloading the newer release next to the
//! live artifact while hashing it, and atomically renaming it into place
//! once the digest matches.
//!
//! Only a broken artifact (unreadable archive, invalid receipt) escapes
//! as an error: transient conditions such as network failures and digest
//! mismatches are reported as a [`UpdateOutcome::Failed`] result so a
//! host process is never taken down by a failed update attempt.

use crate::archive::{ArchiveContainer, ArchiveError, OpenMode};
use crate::digest::Hasher;
use crate::output::write_stderr_line;
use crate::receipt::{RECEIPT_MEMBER, Receipt, ReceiptError};
use crate::transport::{Transport, TransportError};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs::File;
use std::io::Write;
use tempfile::NamedTempFile;

/// Environment variable overriding the published-receipt URL.
pub const RECEIPT_URL_VAR: &str = "SEAMPACK_RECEIPT_URL";

/// Environment variable overriding the release-artifact URL.
pub const RELEASE_URL_VAR: &str = "SEAMPACK_RELEASE_URL";

/// Conditions that make an update attempt pointless to retry: the local
/// artifact itself is broken.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The artifact is not a readable archive.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A receipt (embedded or published) failed to parse or validate.
    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    /// Reporting to the caller's stderr handle failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an update attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The artifact was replaced with the published version.
    Updated {
        /// Version string of the artifact now in place.
        version: String,
    },
    /// The published receipt is not newer; nothing was changed.
    AlreadyCurrent,
    /// A recoverable condition stopped the update; the live artifact is
    /// untouched.
    Failed {
        /// Human-readable cause.
        reason: String,
    },
}

impl UpdateOutcome {
    /// Process exit code for this outcome: only a failed attempt is
    /// non-zero.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Updated { .. } | Self::AlreadyCurrent => 0,
            Self::Failed { .. } => 1,
        }
    }
}

/// Settings for one update attempt.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Path of the live artifact to update in place.
    pub artifact_path: Utf8PathBuf,
    /// Published-receipt URL override; takes precedence over the
    /// embedded receipt's own URL.
    pub receipt_url: Option<String>,
    /// Release-artifact URL override; takes precedence over the
    /// published receipt's release URL.
    pub release_url: Option<String>,
    /// Suppress progress display.
    pub quiet: bool,
}

impl UpdateConfig {
    /// Build a config for `artifact_path`, taking URL overrides from the
    /// environment.
    #[must_use]
    pub fn from_env(artifact_path: Utf8PathBuf, quiet: bool) -> Self {
        Self {
            artifact_path,
            receipt_url: env_override(RECEIPT_URL_VAR),
            release_url: env_override(RELEASE_URL_VAR),
            quiet,
        }
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Attempt to update the artifact named by `config` in place.
///
/// Outcomes cover every recoverable ending, including "nothing newer is
/// available"; see [`UpdateOutcome::exit_code`] for the process-level
/// mapping.
///
/// # Errors
///
/// Returns [`UpdateError`] only when the local artifact cannot be read,
/// a receipt is invalid, or writing to `stderr` fails; a retry cannot
/// fix those.
pub fn self_update(
    config: &UpdateConfig,
    transport: &dyn Transport,
    stderr: &mut dyn Write,
) -> Result<UpdateOutcome, UpdateError> {
    let file = File::open(config.artifact_path.as_std_path()).map_err(ArchiveError::from)?;
    let mut container = ArchiveContainer::open(file, OpenMode::Read)?;
    let embedded_bytes = container.read(RECEIPT_MEMBER)?;
    let embedded_text = String::from_utf8(embedded_bytes).map_err(|_| ArchiveError::Format {
        reason: format!("{RECEIPT_MEMBER} is not UTF-8"),
    })?;
    let embedded = Receipt::from_json(&embedded_text)?;

    let receipt_url = config
        .receipt_url
        .clone()
        .unwrap_or_else(|| embedded.receipt_url().to_owned());
    let body = match transport.fetch(&receipt_url) {
        Ok(body) => body,
        Err(err) => {
            return transport_failure(stderr, &err, &receipt_url, RECEIPT_URL_VAR);
        }
    };
    let published = Receipt::from_json(&String::from_utf8_lossy(&body))?;

    if !published.is_newer(&embedded) {
        log::info!("no update available at {receipt_url}");
        write_stderr_line(stderr, "no update available")?;
        return Ok(UpdateOutcome::AlreadyCurrent);
    }

    let release_url = config
        .release_url
        .clone()
        .unwrap_or_else(|| published.release_url().to_owned());
    let outcome = stage_release(config, transport, stderr, &published, &release_url)?;
    Ok(outcome)
}

/// Download the release next to the live artifact, verify its digest,
/// and rename it into place.
fn stage_release(
    config: &UpdateConfig,
    transport: &dyn Transport,
    stderr: &mut dyn Write,
    published: &Receipt,
    release_url: &str,
) -> Result<UpdateOutcome, UpdateError> {
    let hasher = match Hasher::new(published.algo()) {
        Ok(hasher) => hasher,
        Err(err) => return failure(stderr, format!("update failed: {err}")),
    };
    // The temp file must share the target's filesystem so the final
    // rename is atomic.
    let parent = config
        .artifact_path
        .parent()
        .unwrap_or_else(|| Utf8Path::new("."));
    let mut staged = match NamedTempFile::new_in(parent.as_std_path()) {
        Ok(staged) => staged,
        Err(err) => return failure(stderr, format!("update failed: {err}")),
    };

    let report = match transport.fetch_and_hash(release_url, staged.as_file_mut(), hasher) {
        Ok(report) => report,
        Err(err) => {
            return transport_failure(stderr, &err, release_url, RELEASE_URL_VAR);
        }
    };
    if report.digest != published.hash() {
        // Dropping `staged` discards the temp file; the live artifact
        // was never touched.
        log::error!(
            "digest mismatch for {release_url}: expected {}, received {}",
            published.hash(),
            report.digest
        );
        return failure(
            stderr,
            format!(
                "update failed: digest mismatch (expected {}, received {})",
                published.hash(),
                report.digest
            ),
        );
    }

    if let Err(err) = make_executable(staged.as_file()) {
        return failure(stderr, format!("update failed: {err}"));
    }
    if let Err(err) = staged.persist(config.artifact_path.as_std_path()) {
        return failure(stderr, format!("update failed: {}", err.error));
    }

    let version = published.version().to_owned();
    log::info!(
        "updated {} to version {version} ({} bytes)",
        config.artifact_path,
        report.bytes
    );
    write_stderr_line(stderr, &format!("updated to version {version}"))?;
    Ok(UpdateOutcome::Updated { version })
}

#[cfg(unix)]
fn make_executable(file: &File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_file: &File) -> std::io::Result<()> {
    Ok(())
}

fn failure(stderr: &mut dyn Write, reason: String) -> Result<UpdateOutcome, UpdateError> {
    write_stderr_line(stderr, &reason)?;
    Ok(UpdateOutcome::Failed { reason })
}

/// Report a transport failure, adding an override hint when the server
/// rejected or could not find the resource.
fn transport_failure(
    stderr: &mut dyn Write,
    err: &TransportError,
    url: &str,
    override_var: &str,
) -> Result<UpdateOutcome, UpdateError> {
    log::error!("transport failure for {url}: {err}");
    if matches!(err.status(), Some(401 | 404)) {
        write_stderr_line(
            stderr,
            &format!("hint: set {override_var} to override {url}"),
        )?;
    }
    failure(stderr, format!("update failed: {err}"))
}

#[cfg(test)]
#[path = "updater_tests.rs"]
mod tests;
