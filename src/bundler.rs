//! Build-time packaging of an application into a single artifact.
//!
//! The bundler opens a staging archive (optionally seeded from a
//! downloaded or cached runtime), adds the caller's files through a
//! [`SourceCompiler`], removes unwanted members, writes the `.args` and
//! embedded-receipt members, and finally moves the finished archive into
//! place with the executable bit set. A dry run performs the archive
//! work against an in-memory buffer and leaves the filesystem alone.

use crate::archive::{ArchiveContainer, ArchiveError, OpenMode, Storage};
use crate::clock::Clock;
use crate::output::write_stderr_line;
use crate::receipt::{
    DEFAULT_ALGO, RECEIPT_MEMBER, Receipt, ReceiptError, ReceiptField, ReceiptKind,
    ReceiptPatch, VersionProbe,
};
use crate::transport::{Transport, TransportError};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{Cursor, Write};

/// Name of the member holding newline-delimited interpreter arguments.
pub const ARGS_MEMBER: &str = ".args";

/// Environment variable overriding the runtime download URL.
pub const RUNTIME_URL_VAR: &str = "SEAMPACK_RUNTIME_URL";

/// Errors from the bundling process.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// Mutating the staging archive failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Building a receipt for the output failed.
    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    /// Fetching the runtime failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`BundleError`].
pub type Result<T> = std::result::Result<T, BundleError>;

/// Output of compiling one source file for inclusion in the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSource {
    /// Member name the payload should be stored under.
    pub member_name: String,
    /// Payload bytes to store.
    pub payload: Vec<u8>,
}

/// Turns a source file into an archive member.
///
/// Implementations decide both the stored name and the stored bytes, so
/// a compiler may translate `tool.src` into `lib/tool.bin` with compiled
/// contents while plain assets pass through untouched.
#[cfg_attr(test, mockall::automock)]
pub trait SourceCompiler {
    /// Compile `source` (the contents of `path`) into a member.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the source cannot be compiled.
    fn compile(&self, path: &Utf8Path, source: &[u8]) -> std::io::Result<CompiledSource>;
}

/// Compiler that stores every file verbatim under its file name.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredSource;

impl SourceCompiler for StoredSource {
    fn compile(&self, path: &Utf8Path, source: &[u8]) -> std::io::Result<CompiledSource> {
        let member_name = path
            .file_name()
            .ok_or_else(|| std::io::Error::other(format!("{path} has no file name")))?
            .to_owned();
        Ok(CompiledSource {
            member_name,
            payload: source.to_vec(),
        })
    }
}

/// Where the staging archive's initial contents come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeSource {
    /// Start from an empty archive.
    Empty,
    /// Download the runtime afresh on every bundle.
    Fresh {
        /// Runtime download URL.
        url: String,
    },
    /// Keep a copy under `dir`, refreshed only when the server reports
    /// a newer one.
    Cached {
        /// Runtime download URL.
        url: String,
        /// Cache directory.
        dir: Utf8PathBuf,
    },
}

/// Settings for one bundling run.
#[derive(Debug, Clone)]
pub struct BundleConfig {
    /// Files to add, already expanded to concrete paths.
    pub add: Vec<Utf8PathBuf>,
    /// Member names or globs to remove after adding.
    pub remove: Vec<String>,
    /// Where the finished artifact goes.
    pub output: Utf8PathBuf,
    /// Interpreter arguments for the `.args` member, space-separated.
    pub args: Option<String>,
    /// Initial archive contents.
    pub runtime: RuntimeSource,
    /// Whether to write a published receipt next to the output.
    pub receipt: bool,
    /// Published-receipt URL recorded in the embedded receipt; defaults
    /// to `<release_url>.json`.
    pub receipt_url: Option<String>,
    /// Release-artifact URL recorded in the embedded receipt.
    pub release_url: Option<String>,
    /// Version recorded in the receipts; probed from the artifact when
    /// blank.
    pub release_version: String,
    /// Log actions without touching the filesystem.
    pub dry_run: bool,
}

/// Orchestrates one bundling run over injected collaborators.
pub struct Bundler<'a> {
    config: &'a BundleConfig,
    compiler: &'a dyn SourceCompiler,
    transport: &'a dyn Transport,
    probe: &'a dyn VersionProbe,
    clock: &'a dyn Clock,
}

/// The staging archive plus the temp path to rename into place.
struct Staging {
    container: ArchiveContainer<Box<dyn Storage>>,
    /// Absent on a dry run.
    path: Option<tempfile::TempPath>,
}

impl<'a> Bundler<'a> {
    /// Wire up a bundler over its collaborators.
    #[must_use]
    pub fn new(
        config: &'a BundleConfig,
        compiler: &'a dyn SourceCompiler,
        transport: &'a dyn Transport,
        probe: &'a dyn VersionProbe,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            compiler,
            transport,
            probe,
            clock,
        }
    }

    /// Run the whole bundling pipeline and return the output path.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] when any stage fails; nothing is left at
    /// the output path on failure.
    pub fn run(&self, stderr: &mut dyn Write) -> Result<Utf8PathBuf> {
        let mut staging = self.setup_staging()?;
        self.add_files(&mut staging.container)?;
        self.remove_members(&mut staging.container)?;
        self.write_args(&mut staging.container)?;
        self.write_embedded_receipt(&mut staging.container)?;
        staging.container.close()?;

        self.place_output(staging.path)?;
        self.write_published_receipt()?;
        write_stderr_line(
            stderr,
            &format!("{}bundled: {}", self.banner(), self.config.output),
        )?;
        Ok(self.config.output.clone())
    }

    fn banner(&self) -> &'static str {
        if self.config.dry_run { "[dry run] " } else { "" }
    }

    /// Open the staging archive, seeding it from the configured runtime.
    fn setup_staging(&self) -> Result<Staging> {
        if self.config.dry_run {
            // Archive work still happens so input errors surface, but
            // against a buffer that never reaches the filesystem.
            if let RuntimeSource::Fresh { url } | RuntimeSource::Cached { url, .. } =
                &self.config.runtime
            {
                log::info!("{}download runtime: {url}", self.banner());
            }
            let storage: Box<dyn Storage> = Box::new(Cursor::new(Vec::new()));
            return Ok(Staging {
                container: ArchiveContainer::open(storage, OpenMode::Append)?,
                path: None,
            });
        }

        let parent = self
            .config
            .output
            .parent()
            .unwrap_or_else(|| Utf8Path::new("."));
        std::fs::create_dir_all(parent.as_std_path())?;
        let (mut file, path) = tempfile::NamedTempFile::new_in(parent.as_std_path())?
            .into_parts();
        match &self.config.runtime {
            RuntimeSource::Empty => {}
            RuntimeSource::Fresh { url } => {
                log::info!("download runtime: {url}");
                let body = self.transport.fetch(url)?;
                file.write_all(&body)?;
            }
            RuntimeSource::Cached { url, dir } => {
                let cached = self.refresh_cache(url, dir)?;
                std::io::copy(&mut File::open(cached.as_std_path())?, &mut file)?;
            }
        }

        let storage: Box<dyn Storage> = Box::new(file);
        Ok(Staging {
            container: ArchiveContainer::open(storage, OpenMode::Append)?,
            path: Some(path),
        })
    }

    /// Bring the cached runtime up to date and return its path.
    fn refresh_cache(&self, url: &str, dir: &Utf8Path) -> Result<Utf8PathBuf> {
        std::fs::create_dir_all(dir.as_std_path())?;
        let cached = dir.join("runtime");
        let local_modified = std::fs::metadata(cached.as_std_path())
            .and_then(|meta| meta.modified())
            .map_or(DateTime::<Utc>::UNIX_EPOCH, DateTime::<Utc>::from);

        // Stage the download beside the cache entry so a "not newer"
        // answer leaves the existing copy intact.
        let (mut dest, staged) = tempfile::NamedTempFile::new_in(dir.as_std_path())?.into_parts();
        let fetched = self
            .transport
            .fetch_if_newer(url, local_modified, &mut dest)?;
        if fetched {
            dest.flush()?;
            staged
                .persist(cached.as_std_path())
                .map_err(|err| BundleError::Io(err.error))?;
            log::info!("refreshed cached runtime from {url}");
        } else {
            log::debug!("cached runtime is current");
        }
        Ok(cached)
    }

    fn add_files(&self, container: &mut ArchiveContainer<Box<dyn Storage>>) -> Result<()> {
        for path in &self.config.add {
            let source = std::fs::read(path.as_std_path())?;
            let compiled = self.compiler.compile(path, &source)?;
            log::info!("{}add: {}", self.banner(), compiled.member_name);
            container.add(
                &compiled.member_name,
                &compiled.payload,
                0o644,
                self.clock.now(),
            )?;
        }
        Ok(())
    }

    /// Apply removal patterns. A dry run only logs them: exact names
    /// refer to runtime members the in-memory staging archive does not
    /// contain.
    fn remove_members(&self, container: &mut ArchiveContainer<Box<dyn Storage>>) -> Result<()> {
        for pattern in &self.config.remove {
            log::info!("{}remove: {pattern}", self.banner());
            if !self.config.dry_run {
                container.remove(pattern)?;
            }
        }
        Ok(())
    }

    fn write_args(&self, container: &mut ArchiveContainer<Box<dyn Storage>>) -> Result<()> {
        let Some(args) = &self.config.args else {
            return Ok(());
        };
        let payload = args.split_whitespace().collect::<Vec<_>>().join("\n");
        log::debug!("{}{ARGS_MEMBER} = {payload:?}", self.banner());
        container.add(ARGS_MEMBER, payload.as_bytes(), 0o644, self.clock.now())?;
        Ok(())
    }

    /// The embedded receipt tells the artifact where to look for
    /// updates; without a release URL there is nothing to embed.
    fn write_embedded_receipt(
        &self,
        container: &mut ArchiveContainer<Box<dyn Storage>>,
    ) -> Result<()> {
        let Some(receipt) = self.embedded_receipt() else {
            log::debug!("no release URL; skipping embedded receipt");
            return Ok(());
        };
        log::info!("{}add: {RECEIPT_MEMBER}", self.banner());
        container.add(
            RECEIPT_MEMBER,
            receipt.to_json()?.as_bytes(),
            0o644,
            self.clock.now(),
        )?;
        Ok(())
    }

    /// The receipt embedded in the artifact, telling it where to look
    /// for updates. Without a release URL there is nothing to embed.
    fn embedded_receipt(&self) -> Option<Receipt> {
        let release_url = self.config.release_url.clone()?;
        let receipt_url = self
            .config
            .receipt_url
            .clone()
            .unwrap_or_else(|| format!("{release_url}.json"));
        let mut receipt = Receipt::embedded(self.clock);
        receipt.update(ReceiptPatch {
            receipt_url: Some(receipt_url),
            release_url: Some(release_url),
            version: Some(self.config.release_version.clone()),
            ..ReceiptPatch::default()
        });
        Some(receipt)
    }

    /// Move the finished archive to the output path with the executable
    /// bit set.
    fn place_output(&self, staged: Option<tempfile::TempPath>) -> Result<()> {
        let Some(staged) = staged else {
            log::info!("[dry run] move and chmod +x: {}", self.config.output);
            return Ok(());
        };
        log::debug!("move and chmod +x: {}", self.config.output);
        staged
            .persist(self.config.output.as_std_path())
            .map_err(|err| BundleError::Io(err.error))?;
        set_executable(&self.config.output)?;
        Ok(())
    }

    /// Hash the finished artifact and publish its receipt next to it.
    fn write_published_receipt(&self) -> Result<()> {
        if !self.config.receipt {
            return Ok(());
        }
        let receipt_path = Utf8PathBuf::from(format!("{}.json", self.config.output));
        if self.config.dry_run {
            log::info!("[dry run] write published receipt: {receipt_path}");
            return Ok(());
        }

        let mut receipt = Receipt::from_artifact(
            &self.config.output,
            &self.config.release_version,
            DEFAULT_ALGO,
            self.probe,
            self.clock,
        )?;
        if let Some(embedded) = self.embedded_receipt() {
            receipt.update_from(
                &embedded,
                &[ReceiptField::ReceiptUrl, ReceiptField::ReleaseUrl],
                ReceiptPatch::default(),
            );
        }
        receipt.update(ReceiptPatch {
            kind: Some(ReceiptKind::Published),
            ..ReceiptPatch::default()
        });
        std::fs::write(receipt_path.as_std_path(), receipt.to_json()?)?;
        log::info!("wrote published receipt: {receipt_path}");
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Utf8Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path.as_std_path())?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path.as_std_path(), permissions)
}

#[cfg(not(unix))]
fn set_executable(_path: &Utf8Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "bundler_tests.rs"]
mod tests;
