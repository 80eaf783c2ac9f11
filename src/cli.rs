//! Command-line interface definition.

use camino::Utf8PathBuf;
use clap::Parser;

/// Package applications into single self-updating executables.
#[derive(Debug, Parser)]
#[command(name = "seampack", version, about)]
pub struct Cli {
    /// Files to add to the artifact.
    #[arg(value_name = "FILE")]
    pub add: Vec<Utf8PathBuf>,

    /// Member names or globs to remove from the artifact.
    #[arg(long, value_name = "PATTERN")]
    pub remove: Vec<String>,

    /// Path of the output artifact.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<Utf8PathBuf>,

    /// Interpreter arguments to store in the artifact, space-separated.
    #[arg(long, value_name = "STRING")]
    pub args: Option<String>,

    /// URL to seed the artifact with a base runtime.
    #[arg(long, value_name = "URL")]
    pub runtime_url: Option<String>,

    /// Directory in which to cache runtime downloads.
    #[arg(long, value_name = "PATH")]
    pub cache: Option<Utf8PathBuf>,

    /// Write a published receipt next to the output.
    #[arg(long)]
    pub receipt: bool,

    /// URL of the published receipt (default: `<release-url>.json`).
    #[arg(long, value_name = "URL")]
    pub receipt_url: Option<String>,

    /// URL the released artifact will be downloadable from.
    #[arg(long, value_name = "URL")]
    pub release_url: Option<String>,

    /// Version to record in receipts; probed from the artifact when
    /// omitted.
    #[arg(long, value_name = "STRING")]
    pub release_version: Option<String>,

    /// Update this executable to its latest published version and exit.
    #[arg(long, conflicts_with_all = ["add", "output", "receipt"])]
    pub self_update: bool,

    /// Log actions without making filesystem changes.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Suppress progress output.
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn bundle_flags_parse() {
        let cli = Cli::try_parse_from([
            "seampack",
            "src/app.py",
            "src/util.py",
            "--remove",
            "*.dist-info/*",
            "-o",
            "dist/app",
            "--args",
            "-m app",
            "--release-url",
            "https://example.com/app",
            "--receipt",
            "-n",
        ])
        .unwrap();
        assert_eq!(cli.add.len(), 2);
        assert_eq!(cli.remove, ["*.dist-info/*"]);
        assert_eq!(cli.output.as_deref(), Some(camino::Utf8Path::new("dist/app")));
        assert_eq!(cli.args.as_deref(), Some("-m app"));
        assert!(cli.receipt);
        assert!(cli.dry_run);
        assert!(!cli.self_update);
    }

    #[test]
    fn self_update_conflicts_with_bundling() {
        let err = Cli::try_parse_from(["seampack", "--self-update", "-o", "dist/app"]);
        assert!(err.is_err());
    }
}
