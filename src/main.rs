//! seampack CLI entrypoint.
//!
//! Two modes share one binary: bundling (package files into a new
//! artifact) and self-update (replace this executable with its latest
//! published version).

use camino::Utf8PathBuf;
use clap::Parser;
use seampack::bundler::{
    BundleConfig, BundleError, Bundler, RUNTIME_URL_VAR, RuntimeSource, StoredSource,
};
use seampack::cli::Cli;
use seampack::clock::SystemClock;
use seampack::output::write_stderr_line;
use seampack::receipt::CommandProbe;
use seampack::transport::HttpTransport;
use seampack::updater::{self, UpdateConfig, UpdateError};
use std::io::Write;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("{0}")]
    Usage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() {
    let cli = Cli::parse();
    let mut stderr = std::io::stderr();
    let exit_code = match run(&cli, &mut stderr) {
        Ok(code) => code,
        Err(err) => {
            let _ = write_stderr_line(&mut stderr, &format!("error: {err}"));
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run(cli: &Cli, stderr: &mut dyn Write) -> Result<i32, AppError> {
    if cli.self_update {
        run_self_update(cli, stderr)
    } else {
        run_bundle(cli, stderr)
    }
}

fn run_self_update(cli: &Cli, stderr: &mut dyn Write) -> Result<i32, AppError> {
    let exe = std::env::current_exe()?;
    let artifact = Utf8PathBuf::from_path_buf(exe).map_err(|path| {
        AppError::Usage(format!(
            "executable path {} is not valid UTF-8",
            path.display()
        ))
    })?;

    let mut config = UpdateConfig::from_env(artifact, cli.quiet);
    if let Some(url) = &cli.receipt_url {
        config.receipt_url = Some(url.clone());
    }
    if let Some(url) = &cli.release_url {
        config.release_url = Some(url.clone());
    }

    let transport = HttpTransport::new(config.quiet);
    let outcome = updater::self_update(&config, &transport, stderr)?;
    Ok(outcome.exit_code())
}

fn run_bundle(cli: &Cli, stderr: &mut dyn Write) -> Result<i32, AppError> {
    let Some(output) = cli.output.clone() else {
        return Err(AppError::Usage(
            "--output is required when bundling".to_owned(),
        ));
    };

    let config = BundleConfig {
        add: cli.add.clone(),
        remove: cli.remove.clone(),
        output,
        args: cli.args.clone(),
        runtime: runtime_source(cli),
        receipt: cli.receipt,
        receipt_url: cli.receipt_url.clone(),
        release_url: cli.release_url.clone(),
        release_version: cli.release_version.clone().unwrap_or_default(),
        dry_run: cli.dry_run,
    };

    let transport = HttpTransport::new(cli.quiet);
    let compiler = StoredSource;
    let probe = CommandProbe;
    let clock = SystemClock;
    let bundler = Bundler::new(&config, &compiler, &transport, &probe, &clock);
    bundler.run(stderr)?;
    Ok(0)
}

/// Resolve where the staging archive's initial contents come from: an
/// explicit flag beats the environment, and a cache directory turns a
/// fresh download into a conditional one.
fn runtime_source(cli: &Cli) -> RuntimeSource {
    let url = cli
        .runtime_url
        .clone()
        .or_else(|| std::env::var(RUNTIME_URL_VAR).ok())
        .filter(|value| !value.is_empty());
    match (url, cli.cache.clone()) {
        (Some(url), Some(dir)) => RuntimeSource::Cached { url, dir },
        (Some(url), None) => RuntimeSource::Fresh { url },
        (None, _) => RuntimeSource::Empty,
    }
}
