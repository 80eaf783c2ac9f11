use super::*;
use crate::clock::FixedClock;
use crate::receipt::{ReceiptKind, ReceiptPatch};
use crate::transport::{MockTransport, TransferReport, TransportError};
use chrono::{TimeZone, Utc};
use std::fs::OpenOptions;
use std::io::Write as _;

const RECEIPT_URL: &str = "https://example.com/app.json";
const RELEASE_URL: &str = "https://example.com/app";

fn receipt_dated(year: i32, month: u32, day: u32) -> Receipt {
    let clock = FixedClock(Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap());
    let mut receipt = Receipt::embedded(&clock);
    receipt.update(ReceiptPatch {
        receipt_url: Some(RECEIPT_URL.to_owned()),
        release_url: Some(RELEASE_URL.to_owned()),
        ..ReceiptPatch::default()
    });
    receipt
}

fn published_receipt(hash: &str, version: &str) -> Receipt {
    let mut receipt = receipt_dated(2000, 1, 2);
    receipt.update(ReceiptPatch {
        kind: Some(ReceiptKind::Published),
        hash: Some(hash.to_owned()),
        version: Some(version.to_owned()),
        ..ReceiptPatch::default()
    });
    receipt
}

/// Write an artifact archive carrying the given embedded receipt.
fn write_artifact(path: &Utf8Path, receipt: &Receipt) {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path.as_std_path())
        .expect("create artifact");
    let mut container =
        ArchiveContainer::open(file, OpenMode::Append).expect("open empty archive");
    container
        .add("app.bin", b"original payload", 0o755, receipt.date())
        .expect("add payload member");
    container
        .add(
            RECEIPT_MEMBER,
            receipt.to_json().expect("serialize receipt").as_bytes(),
            0o644,
            receipt.date(),
        )
        .expect("add receipt member");
    container.close().expect("close artifact");
}

fn workspace() -> (tempfile::TempDir, UpdateConfig) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("app"))
        .expect("temp paths are UTF-8");
    let config = UpdateConfig {
        artifact_path: path,
        receipt_url: None,
        release_url: None,
        quiet: true,
    };
    (dir, config)
}

fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Hasher::new("sha256").expect("sha256 is supported");
    hasher.update(bytes);
    hasher.finish()
}

fn expect_published(transport: &mut MockTransport, published: &Receipt) {
    let json = published.to_json().expect("serialize published receipt");
    transport
        .expect_fetch()
        .withf(|url| url == RECEIPT_URL)
        .times(1)
        .returning(move |_| Ok(json.clone().into_bytes()));
}

#[test]
fn newer_published_receipt_replaces_the_artifact() {
    let (_dir, config) = workspace();
    write_artifact(&config.artifact_path, &receipt_dated(2000, 1, 1));

    let release: &[u8] = b"brand new artifact bytes";
    let published = published_receipt(&digest_of(release), "9.9.9");
    let mut transport = MockTransport::new();
    expect_published(&mut transport, &published);
    transport
        .expect_fetch_and_hash()
        .times(1)
        .returning(move |url, dest, mut hasher| {
            assert_eq!(url, RELEASE_URL);
            dest.write_all(release).map_err(TransportError::from)?;
            hasher.update(release);
            Ok(TransferReport {
                bytes: release.len() as u64,
                digest: hasher.finish(),
            })
        });

    let mut stderr = Vec::new();
    let outcome = self_update(&config, &transport, &mut stderr).expect("update is not fatal");

    assert_eq!(
        outcome,
        UpdateOutcome::Updated {
            version: "9.9.9".to_owned()
        }
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        std::fs::read(config.artifact_path.as_std_path()).unwrap(),
        release
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(config.artifact_path.as_std_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111, "replacement must be executable");
    }
}

#[test]
fn equal_dates_mean_already_current_and_untouched_bytes() {
    let (_dir, config) = workspace();
    write_artifact(&config.artifact_path, &receipt_dated(2000, 1, 2));
    let before = std::fs::read(config.artifact_path.as_std_path()).unwrap();

    let published = published_receipt(&digest_of(b"irrelevant"), "9.9.9");
    let mut transport = MockTransport::new();
    expect_published(&mut transport, &published);

    let mut stderr = Vec::new();
    let outcome = self_update(&config, &transport, &mut stderr).expect("update is not fatal");

    assert_eq!(outcome, UpdateOutcome::AlreadyCurrent);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        std::fs::read(config.artifact_path.as_std_path()).unwrap(),
        before
    );
}

#[test]
fn digest_mismatch_fails_and_discards_the_download() {
    let (dir, config) = workspace();
    write_artifact(&config.artifact_path, &receipt_dated(2000, 1, 1));
    let before = std::fs::read(config.artifact_path.as_std_path()).unwrap();

    let published = published_receipt("123456", "9.9.9");
    let mut transport = MockTransport::new();
    expect_published(&mut transport, &published);
    transport
        .expect_fetch_and_hash()
        .times(1)
        .returning(move |_, dest, _| {
            dest.write_all(b"tampered bytes")
                .map_err(TransportError::from)?;
            Ok(TransferReport {
                bytes: 14,
                digest: "abcdef".to_owned(),
            })
        });

    let mut stderr = Vec::new();
    let outcome = self_update(&config, &transport, &mut stderr).expect("update is not fatal");

    let UpdateOutcome::Failed { reason } = outcome else {
        panic!("expected a failed outcome");
    };
    assert!(reason.contains("digest mismatch"));
    assert!(reason.contains("123456"));
    assert!(reason.contains("abcdef"));
    assert_eq!(
        std::fs::read(config.artifact_path.as_std_path()).unwrap(),
        before,
        "live artifact must be untouched"
    );
    let survivors = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(survivors, 1, "temporary download must be discarded");
}

#[test]
fn receipt_fetch_404_hints_at_the_override_variable() {
    let (_dir, config) = workspace();
    write_artifact(&config.artifact_path, &receipt_dated(2000, 1, 1));

    let mut transport = MockTransport::new();
    transport.expect_fetch().times(1).returning(|url| {
        Err(TransportError::Status {
            url: url.to_owned(),
            status: 404,
        })
    });

    let mut stderr = Vec::new();
    let outcome = self_update(&config, &transport, &mut stderr).expect("update is not fatal");

    assert!(matches!(outcome, UpdateOutcome::Failed { .. }));
    assert_eq!(outcome.exit_code(), 1);
    let shown = String::from_utf8(stderr).unwrap();
    assert!(shown.contains(RECEIPT_URL_VAR));
}

#[test]
fn release_fetch_401_hints_at_the_release_override() {
    let (_dir, config) = workspace();
    write_artifact(&config.artifact_path, &receipt_dated(2000, 1, 1));

    let published = published_receipt(&digest_of(b"bytes"), "9.9.9");
    let mut transport = MockTransport::new();
    expect_published(&mut transport, &published);
    transport
        .expect_fetch_and_hash()
        .times(1)
        .returning(|url, _, _| {
            Err(TransportError::Status {
                url: url.to_owned(),
                status: 401,
            })
        });

    let mut stderr = Vec::new();
    let outcome = self_update(&config, &transport, &mut stderr).expect("update is not fatal");

    assert!(matches!(outcome, UpdateOutcome::Failed { .. }));
    let shown = String::from_utf8(stderr).unwrap();
    assert!(shown.contains(RELEASE_URL_VAR));
}

#[test]
fn transient_server_errors_fail_without_a_hint() {
    let (_dir, config) = workspace();
    write_artifact(&config.artifact_path, &receipt_dated(2000, 1, 1));

    let mut transport = MockTransport::new();
    transport.expect_fetch().times(1).returning(|url| {
        Err(TransportError::Status {
            url: url.to_owned(),
            status: 500,
        })
    });

    let mut stderr = Vec::new();
    let outcome = self_update(&config, &transport, &mut stderr).expect("update is not fatal");

    assert!(matches!(outcome, UpdateOutcome::Failed { .. }));
    let shown = String::from_utf8(stderr).unwrap();
    assert!(!shown.contains("hint:"));
}

#[test]
fn configured_receipt_url_overrides_the_embedded_one() {
    let (_dir, mut config) = workspace();
    write_artifact(&config.artifact_path, &receipt_dated(2000, 1, 2));
    config.receipt_url = Some("https://mirror.example/app.json".to_owned());

    let published = published_receipt(&digest_of(b"bytes"), "9.9.9");
    let json = published.to_json().unwrap();
    let mut transport = MockTransport::new();
    transport
        .expect_fetch()
        .withf(|url| url == "https://mirror.example/app.json")
        .times(1)
        .returning(move |_| Ok(json.clone().into_bytes()));

    let mut stderr = Vec::new();
    let outcome = self_update(&config, &transport, &mut stderr).expect("update is not fatal");
    assert_eq!(outcome, UpdateOutcome::AlreadyCurrent);
}

#[test]
fn missing_embedded_receipt_is_fatal() {
    let (_dir, config) = workspace();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(config.artifact_path.as_std_path())
        .unwrap();
    let mut container = ArchiveContainer::open(file, OpenMode::Append).unwrap();
    container
        .add("app.bin", b"payload", 0o755, Utc::now())
        .unwrap();
    container.close().unwrap();

    let mut stderr = Vec::new();
    let err = self_update(&config, &MockTransport::new(), &mut stderr).unwrap_err();
    assert!(matches!(err, UpdateError::Archive(ArchiveError::NotFound { .. })));
}

#[test]
fn invalid_embedded_receipt_is_fatal() {
    let (_dir, config) = workspace();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(config.artifact_path.as_std_path())
        .unwrap();
    let mut container = ArchiveContainer::open(file, OpenMode::Append).unwrap();
    container
        .add(RECEIPT_MEMBER, b"{\"kind\":\"embedded\"}", 0o644, Utc::now())
        .unwrap();
    container.close().unwrap();

    let mut stderr = Vec::new();
    let err = self_update(&config, &MockTransport::new(), &mut stderr).unwrap_err();
    assert!(matches!(err, UpdateError::Receipt(ReceiptError::Invalid { .. })));
}

#[test]
fn from_env_picks_up_both_overrides() {
    temp_env::with_vars(
        [
            (RECEIPT_URL_VAR, Some("https://env.example/r.json")),
            (RELEASE_URL_VAR, Some("https://env.example/app")),
        ],
        || {
            let config = UpdateConfig::from_env(Utf8PathBuf::from("/opt/app"), false);
            assert_eq!(
                config.receipt_url.as_deref(),
                Some("https://env.example/r.json")
            );
            assert_eq!(
                config.release_url.as_deref(),
                Some("https://env.example/app")
            );
            assert!(!config.quiet);
        },
    );
}

#[test]
fn blank_environment_values_are_ignored() {
    temp_env::with_vars(
        [(RECEIPT_URL_VAR, Some("")), (RELEASE_URL_VAR, None::<&str>)],
        || {
            let config = UpdateConfig::from_env(Utf8PathBuf::from("/opt/app"), true);
            assert_eq!(config.receipt_url, None);
            assert_eq!(config.release_url, None);
            assert!(config.quiet);
        },
    );
}
