//! HTTP fetching with digest and progress tracking.
//!
//! The [`Transport`] trait is the seam the updater and bundler depend on;
//! [`HttpTransport`] is the production implementation over a shared
//! `ureq` agent. Mocks stand in for it in tests so no test opens a
//! socket.

use crate::digest::{CHUNK_SIZE, Hasher};
use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::sync::OnceLock;
use std::time::Duration;

/// Global timeout applied to every request.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    Status {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code received.
        status: u16,
    },

    /// The request failed before an HTTP status was received.
    #[error("request to {url} failed: {reason}")]
    Http {
        /// The URL that was requested.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// Writing fetched bytes to the destination failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// The HTTP status code, when the server answered at all.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http { .. } | Self::Io(_) => None,
        }
    }
}

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

/// Outcome of a streamed, hashed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Bytes transferred.
    pub bytes: u64,
    /// Lowercase hex digest of the transferred bytes.
    pub digest: String,
}

/// Fetches remote resources.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Fetch a resource into memory.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Status`] for non-success responses and
    /// [`TransportError::Http`] for connection-level failures.
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Fetch a resource into `dest` only when the server reports it
    /// modified strictly after `local_modified`. A missing or unparseable
    /// `Last-Modified` header counts as newer. Returns whether a fetch
    /// happened.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Status`] for non-success responses,
    /// [`TransportError::Http`] for connection-level failures, and
    /// [`TransportError::Io`] when writing to `dest` fails.
    fn fetch_if_newer(
        &self,
        url: &str,
        local_modified: DateTime<Utc>,
        dest: &mut dyn Write,
    ) -> Result<bool>;

    /// Stream a resource into `dest` while feeding `hasher`, reporting
    /// the byte count and final digest.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Status`] for non-success responses,
    /// [`TransportError::Http`] for connection-level failures, and
    /// [`TransportError::Io`] when writing to `dest` fails.
    fn fetch_and_hash(
        &self,
        url: &str,
        dest: &mut dyn Write,
        hasher: Hasher,
    ) -> Result<TransferReport>;
}

/// Shared agent so connection pools and timeouts are set up once.
fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

fn map_ureq_error(url: &str, err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::StatusCode(status) => TransportError::Status {
            url: url.to_owned(),
            status,
        },
        other => TransportError::Http {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}

/// Whether a resource modified at `remote` should replace a local copy
/// modified at `local`. An unknown remote age counts as newer.
fn should_fetch(remote: Option<DateTime<Utc>>, local: DateTime<Utc>) -> bool {
    remote.is_none_or(|remote| remote > local)
}

/// Download progress against an expected total.
#[derive(Debug, Clone, Copy)]
struct Progress {
    total: u64,
    done: u64,
}

impl Progress {
    fn new(total: Option<u64>) -> Self {
        Self {
            total: total.unwrap_or(0),
            done: 0,
        }
    }

    fn advance(&mut self, bytes: u64) {
        self.done += bytes;
    }

    /// Completion percentage; zero when the total is unknown.
    #[allow(clippy::cast_precision_loss)]
    fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64 * 100.0
        }
    }

    fn render(&self) -> Option<String> {
        (self.total > 0).then(|| format!("{:5.1}%", self.percent()))
    }
}

/// Production transport over HTTP(S).
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransport {
    /// Whether to draw a percentage line on stderr during downloads.
    pub show_progress: bool,
}

impl HttpTransport {
    /// A transport that draws progress unless `quiet` is set.
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self {
            show_progress: !quiet,
        }
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        log::debug!("fetching {url}");
        let mut response = http_agent()
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, e))?;
        let mut body = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut body)?;
        Ok(body)
    }

    fn fetch_if_newer(
        &self,
        url: &str,
        local_modified: DateTime<Utc>,
        dest: &mut dyn Write,
    ) -> Result<bool> {
        let response = http_agent()
            .head(url)
            .call()
            .map_err(|e| map_ureq_error(url, e))?;
        let remote_modified = response
            .headers()
            .get("last-modified")
            .and_then(|value| value.to_str().ok())
            .and_then(|text| DateTime::parse_from_rfc2822(text).ok())
            .map(|parsed| parsed.with_timezone(&Utc));

        if !should_fetch(remote_modified, local_modified) {
            log::debug!("{url} unchanged since {local_modified}");
            return Ok(false);
        }

        let body = self.fetch(url)?;
        dest.write_all(&body)?;
        Ok(true)
    }

    fn fetch_and_hash(
        &self,
        url: &str,
        dest: &mut dyn Write,
        mut hasher: Hasher,
    ) -> Result<TransferReport> {
        log::debug!("downloading {url}");
        let mut response = http_agent()
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, e))?;
        let mut progress = Progress::new(response.body().content_length());
        let mut reader = response.body_mut().as_reader();

        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            dest.write_all(&buffer[..read])?;
            hasher.update(&buffer[..read]);
            progress.advance(read as u64);
            if self.show_progress
                && let Some(line) = progress.render()
            {
                eprint!("\r{line}");
            }
        }
        if self.show_progress && progress.render().is_some() {
            eprintln!();
        }
        Ok(TransferReport {
            bytes: progress.done,
            digest: hasher.finish(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case::remote_newer(Some(30), true)]
    #[case::remote_equal(Some(0), false)]
    #[case::remote_older(Some(-30), false)]
    #[case::remote_unknown(None, true)]
    fn conditional_fetch_requires_a_strictly_newer_remote(
        #[case] remote_offset_secs: Option<i64>,
        #[case] expected: bool,
    ) {
        let local = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let remote = remote_offset_secs.map(|secs| local + chrono::Duration::seconds(secs));
        assert_eq!(should_fetch(remote, local), expected);
    }

    #[rstest]
    #[case::start(1000, 0, 0.0)]
    #[case::midway(1000, 420, 42.0)]
    #[case::complete(1000, 1000, 100.0)]
    fn percent_tracks_completion(#[case] total: u64, #[case] done: u64, #[case] expected: f64) {
        let mut progress = Progress::new(Some(total));
        progress.advance(done);
        assert!((progress.percent() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_total_disables_the_percentage() {
        let mut progress = Progress::new(None);
        progress.advance(512);
        assert!((progress.percent() - 0.0).abs() < f64::EPSILON);
        assert_eq!(progress.render(), None);
    }

    #[test]
    fn known_total_renders_a_fixed_width_line() {
        let mut progress = Progress::new(Some(200));
        progress.advance(15);
        assert_eq!(progress.render().as_deref(), Some("  7.5%"));
    }

    #[test]
    fn status_errors_carry_the_code() {
        let err = map_ureq_error("https://example.com/app", ureq::Error::StatusCode(404));
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "HTTP 404 fetching https://example.com/app");
    }

    #[test]
    fn io_errors_have_no_status() {
        let err = TransportError::from(std::io::Error::other("disk full"));
        assert_eq!(err.status(), None);
    }
}
