//! Receipt metadata for self-updating artifacts.
//!
//! A receipt is a small JSON document describing one published artifact:
//! when it was built, how it was hashed, and where its latest version can
//! be fetched from. An *embedded* receipt travels inside the artifact (as
//! the `.receipt.json` member) and may leave the hash and version blank;
//! a *published* receipt sits next to the released artifact and must be
//! complete. The updater compares the two to decide whether to act.

use crate::clock::Clock;
use crate::digest::{self, Hasher, UnsupportedAlgorithm};
use camino::Utf8Path;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::fs::File;
use std::process::Command;
use std::sync::OnceLock;

/// URI of the receipt JSON schema; the `$schema` field must match exactly.
pub const RECEIPT_SCHEMA: &str =
    "https://raw.githubusercontent.com/seampack/seampack/0.2.0/seampack.schema.json";

/// Name of the embedded receipt member inside an artifact.
pub const RECEIPT_MEMBER: &str = ".receipt.json";

/// Default hashing algorithm for new receipts.
pub const DEFAULT_ALGO: &str = "sha256";

/// Canonical receipt date format (UTC, whole seconds).
const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Fixed length of a canonical date string.
const DATE_LEN: usize = 20;

/// Receipt keys, in canonical serialization order.
const FIELD_NAMES: [&str; 8] = [
    "$schema",
    "kind",
    "date",
    "algo",
    "hash",
    "receipt_url",
    "release_url",
    "version",
];

/// Errors from receipt parsing, validation, and construction.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    /// The payload parsed as JSON but failed validation.
    #[error("invalid receipt: {issues}")]
    Invalid {
        /// Field names grouped by the kind of problem found.
        issues: Issues,
    },

    /// The payload is not JSON at all.
    #[error("malformed receipt JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The receipt names a hash algorithm this build cannot compute.
    #[error(transparent)]
    Algorithm(#[from] UnsupportedAlgorithm),

    /// Reading the artifact or probing its version failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`ReceiptError`].
pub type Result<T> = std::result::Result<T, ReceiptError>;

/// Whether a receipt travels inside the artifact or next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    /// Partial receipt stored inside the artifact; hash and version may
    /// be blank.
    Embedded,
    /// Complete receipt published alongside the released artifact.
    Published,
}

impl ReceiptKind {
    /// The wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Published => "published",
        }
    }

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "embedded" => Some(Self::Embedded),
            "published" => Some(Self::Published),
            _ => None,
        }
    }
}

/// Validation findings, as field names grouped by problem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Issues {
    /// Required fields absent from the payload.
    pub missing: Vec<String>,
    /// Fields present in the payload that no rule knows about.
    pub unknown: Vec<String>,
    /// Fields present but failing their validation rule.
    pub malformed: Vec<String>,
}

impl Issues {
    /// Whether validation found nothing wrong.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unknown.is_empty() && self.malformed.is_empty()
    }
}

impl std::fmt::Display for Issues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        for (label, names) in [
            ("missing", &self.missing),
            ("unknown", &self.unknown),
            ("malformed", &self.malformed),
        ] {
            if !names.is_empty() {
                parts.push(format!("{label}: {}", names.join(", ")));
            }
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// Metadata describing one artifact.
///
/// Serialization preserves the canonical key order (`$schema`, `kind`,
/// `date`, `algo`, `hash`, `receipt_url`, `release_url`, `version`) so
/// published receipts are byte-stable across round trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    #[serde(rename = "$schema")]
    schema: String,
    kind: ReceiptKind,
    #[serde(serialize_with = "serialize_date")]
    date: DateTime<Utc>,
    algo: String,
    hash: String,
    receipt_url: String,
    release_url: String,
    version: String,
}

fn serialize_date<S: Serializer>(
    date: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_date(*date))
}

/// Render a timestamp in the canonical receipt date format.
#[must_use]
pub fn format_date(date: DateTime<Utc>) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != DATE_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn is_algo_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn is_lower_hex(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_non_blank(value: &str) -> bool {
    !value.trim().is_empty()
}

impl Receipt {
    /// A fresh embedded receipt dated from `clock`, with blank hash,
    /// URLs, and version.
    #[must_use]
    pub fn embedded(clock: &dyn Clock) -> Self {
        Self {
            schema: RECEIPT_SCHEMA.to_owned(),
            kind: ReceiptKind::Embedded,
            date: clock.now(),
            algo: DEFAULT_ALGO.to_owned(),
            hash: String::new(),
            receipt_url: String::new(),
            release_url: String::new(),
            version: String::new(),
        }
    }

    /// Hash an artifact on disk and build a receipt for it.
    ///
    /// When `version` is blank the artifact itself is asked, via `probe`,
    /// to print its version; the first semantic-version token in the
    /// output is used.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Algorithm`] for an unsupported `algo` and
    /// [`ReceiptError::Io`] when the artifact cannot be read or the
    /// version probe fails.
    pub fn from_artifact(
        path: &Utf8Path,
        version: &str,
        algo: &str,
        probe: &dyn VersionProbe,
        clock: &dyn Clock,
    ) -> Result<Self> {
        let mut hasher = Hasher::new(algo)?;
        let mut file = File::open(path)?;
        digest::hash_reader(&mut file, &mut hasher)?;

        let version = if version.is_empty() {
            let output = probe.version_output(path)?;
            extract_version(&output).unwrap_or_default()
        } else {
            version.to_owned()
        };

        let mut receipt = Self::embedded(clock);
        receipt.algo = algo.to_owned();
        receipt.hash = hasher.finish();
        receipt.version = version;
        Ok(receipt)
    }

    /// Validate a JSON object against the receipt rules.
    ///
    /// Each required field is reported at most once: absent fields are
    /// `missing`, present-but-bad fields are `malformed`, and keys no
    /// rule covers are `unknown`. When the payload claims to be an
    /// embedded receipt, `hash` and `version` accept any string.
    #[must_use]
    pub fn find_issues(data: &serde_json::Map<String, serde_json::Value>) -> Issues {
        let mut issues = Issues {
            unknown: data
                .keys()
                .filter(|key| !FIELD_NAMES.contains(&key.as_str()))
                .cloned()
                .collect(),
            ..Issues::default()
        };

        let relaxed = data
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("embedded")
            == "embedded";

        for name in FIELD_NAMES {
            let Some(value) = data.get(name) else {
                issues.missing.push(name.to_owned());
                continue;
            };
            let ok = match (name, value.as_str()) {
                (_, None) => false,
                ("$schema", Some(v)) => v == RECEIPT_SCHEMA,
                ("kind", Some(v)) => ReceiptKind::from_wire(v).is_some(),
                ("date", Some(v)) => parse_date(v).is_some(),
                ("algo", Some(v)) => is_algo_name(v),
                ("hash", Some(v)) => relaxed || is_lower_hex(v),
                ("version", Some(v)) => relaxed || is_non_blank(v),
                (_, Some(v)) => is_non_blank(v),
            };
            if !ok {
                issues.malformed.push(name.to_owned());
            }
        }
        issues
    }

    /// Parse and validate a receipt from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Json`] when the text is not a JSON object
    /// and [`ReceiptError::Invalid`] when validation finds issues; an
    /// invalid payload is never turned into a `Receipt`.
    pub fn from_json(text: &str) -> Result<Self> {
        let data: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let issues = Self::find_issues(&data);
        if !issues.is_empty() {
            return Err(ReceiptError::Invalid { issues });
        }

        let field = |name: &str| -> Result<&str> {
            data.get(name)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| ReceiptError::Invalid {
                    issues: Issues {
                        missing: vec![name.to_owned()],
                        ..Issues::default()
                    },
                })
        };
        let kind = ReceiptKind::from_wire(field("kind")?).ok_or_else(|| {
            ReceiptError::Invalid {
                issues: Issues {
                    malformed: vec!["kind".to_owned()],
                    ..Issues::default()
                },
            }
        })?;
        let date = parse_date(field("date")?).ok_or_else(|| ReceiptError::Invalid {
            issues: Issues {
                malformed: vec!["date".to_owned()],
                ..Issues::default()
            },
        })?;
        Ok(Self {
            schema: field("$schema")?.to_owned(),
            kind,
            date,
            algo: field("algo")?.to_owned(),
            hash: field("hash")?.to_owned(),
            receipt_url: field("receipt_url")?.to_owned(),
            release_url: field("release_url")?.to_owned(),
            version: field("version")?.to_owned(),
        })
    }

    /// Serialize to JSON in the canonical key order.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiptError::Json`] when serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this receipt would pass validation after a round trip.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.to_json()
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .is_some_and(|data| Self::find_issues(&data).is_empty())
    }

    /// Strictly newer than `other`, by date alone.
    ///
    /// # Examples
    ///
    /// ```
    /// use seampack::clock::FixedClock;
    /// use seampack::receipt::Receipt;
    ///
    /// let clock = FixedClock(chrono::Utc::now());
    /// let receipt = Receipt::embedded(&clock);
    /// assert!(!receipt.is_newer(&receipt));
    /// ```
    #[must_use]
    pub fn is_newer(&self, other: &Self) -> bool {
        self.date > other.date
    }

    /// Copy the named fields from `other`, then apply `patch`.
    pub fn update_from(&mut self, other: &Self, fields: &[ReceiptField], patch: ReceiptPatch) {
        for field in fields {
            match field {
                ReceiptField::Kind => self.kind = other.kind,
                ReceiptField::Date => self.date = other.date,
                ReceiptField::Algo => self.algo.clone_from(&other.algo),
                ReceiptField::Hash => self.hash.clone_from(&other.hash),
                ReceiptField::ReceiptUrl => self.receipt_url.clone_from(&other.receipt_url),
                ReceiptField::ReleaseUrl => self.release_url.clone_from(&other.release_url),
                ReceiptField::Version => self.version.clone_from(&other.version),
            }
        }
        self.update(patch);
    }

    /// Apply every populated field of `patch`.
    pub fn update(&mut self, patch: ReceiptPatch) {
        let ReceiptPatch {
            kind,
            date,
            algo,
            hash,
            receipt_url,
            release_url,
            version,
        } = patch;
        if let Some(kind) = kind {
            self.kind = kind;
        }
        if let Some(date) = date {
            self.date = date;
        }
        if let Some(algo) = algo {
            self.algo = algo;
        }
        if let Some(hash) = hash {
            self.hash = hash;
        }
        if let Some(receipt_url) = receipt_url {
            self.receipt_url = receipt_url;
        }
        if let Some(release_url) = release_url {
            self.release_url = release_url;
        }
        if let Some(version) = version {
            self.version = version;
        }
    }

    /// The `$schema` URI.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Embedded or published.
    #[must_use]
    pub fn kind(&self) -> ReceiptKind {
        self.kind
    }

    /// When the receipt was produced.
    #[must_use]
    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    /// The hashing algorithm name.
    #[must_use]
    pub fn algo(&self) -> &str {
        &self.algo
    }

    /// Lowercase hex digest of the artifact (may be blank when embedded).
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Where the published receipt lives.
    #[must_use]
    pub fn receipt_url(&self) -> &str {
        &self.receipt_url
    }

    /// Where the released artifact lives.
    #[must_use]
    pub fn release_url(&self) -> &str {
        &self.release_url
    }

    /// The artifact version (may be blank when embedded).
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }
}

/// One receipt field, for selective copies in [`Receipt::update_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptField {
    /// The `kind` field.
    Kind,
    /// The `date` field.
    Date,
    /// The `algo` field.
    Algo,
    /// The `hash` field.
    Hash,
    /// The `receipt_url` field.
    ReceiptUrl,
    /// The `release_url` field.
    ReleaseUrl,
    /// The `version` field.
    Version,
}

/// A set of replacement values; unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ReceiptPatch {
    /// Replacement kind.
    pub kind: Option<ReceiptKind>,
    /// Replacement date.
    pub date: Option<DateTime<Utc>>,
    /// Replacement algorithm name.
    pub algo: Option<String>,
    /// Replacement digest.
    pub hash: Option<String>,
    /// Replacement receipt URL.
    pub receipt_url: Option<String>,
    /// Replacement release URL.
    pub release_url: Option<String>,
    /// Replacement version.
    pub version: Option<String>,
}

/// Asks an artifact for its version output.
#[cfg_attr(test, mockall::automock)]
pub trait VersionProbe {
    /// Run the artifact's version command and return its standard output.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the artifact cannot be run or exits
    /// unsuccessfully.
    fn version_output(&self, artifact: &Utf8Path) -> std::io::Result<Vec<u8>>;
}

/// Probe that executes `<artifact> --version`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandProbe;

impl VersionProbe for CommandProbe {
    fn version_output(&self, artifact: &Utf8Path) -> std::io::Result<Vec<u8>> {
        let output = Command::new(artifact.as_std_path()).arg("--version").output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "{artifact} --version exited with {}",
                output.status
            )));
        }
        Ok(output.stdout)
    }
}

/// Extract the first semantic-version token from version-command output.
fn extract_version(output: &[u8]) -> Option<String> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(r"\d+\.\d+\.\d+(-[\da-zA-Z-.]+)?(\+[\da-zA-Z-.]+)?")
            .unwrap_or_else(|e| unreachable!("version pattern is well-formed: {e}"))
    });
    let text = String::from_utf8_lossy(output);
    pattern.find(&text).map(|m| m.as_str().to_owned())
}

#[cfg(test)]
#[path = "receipt_tests.rs"]
mod tests;
