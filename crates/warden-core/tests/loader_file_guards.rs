//! File-source guards (§4.1 step 1): path traversal, symlink rejection,
//! non-regular files, and oversize files. These only apply to the
//! `PolicySource::Path` variant, so they're exercised here rather than in
//! `loader.rs`'s unit tests, which focus on parse/shape/semantic/signature
//! behavior shared by every source.

use std::fs;
use std::path::PathBuf;

use warden_core::errors::LoaderError;
use warden_core::loader::{load_bundle, LoaderConfig, PolicySource};
use warden_core::schema::{Defaults, Outcome, PolicyBundle};

fn sample_bundle_json() -> String {
    let bundle = PolicyBundle {
        version: "1".to_string(),
        generated_at: chrono::Utc::now() - chrono::Duration::hours(1),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        rules: vec![],
        defaults: Defaults { outcome: Outcome::Allow },
        signature: None,
    };
    serde_json::to_string(&bundle).unwrap()
}

#[test]
fn rejects_path_outside_base_dir() {
    let base = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let outside_file = outside.path().join("bundle.json");
    fs::write(&outside_file, sample_bundle_json()).unwrap();

    let config = LoaderConfig {
        base_dir: base.path().to_path_buf(),
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(outside_file);
    let err = load_bundle(&source, &config).unwrap_err();
    assert!(matches!(err, LoaderError::PathTraversal(_)));
}

#[test]
fn rejects_ascent_via_dot_dot() {
    let base = tempfile::tempdir().unwrap();
    let nested = base.path().join("nested");
    fs::create_dir(&nested).unwrap();
    let escape_target = base.path().parent().unwrap().join("escape-bundle.json");
    fs::write(&escape_target, sample_bundle_json()).unwrap();

    let config = LoaderConfig {
        base_dir: nested.clone(),
        ..LoaderConfig::default()
    };
    let relative = PathBuf::from("../../escape-bundle.json");
    let source = PolicySource::Path(relative);
    let err = load_bundle(&source, &config);
    assert!(err.is_err());
    let _ = fs::remove_file(&escape_target);
}

#[cfg(unix)]
#[test]
fn rejects_symlinked_bundle_file() {
    use std::os::unix::fs::symlink;

    let base = tempfile::tempdir().unwrap();
    let real_file = base.path().join("real-bundle.json");
    fs::write(&real_file, sample_bundle_json()).unwrap();
    let link_path = base.path().join("bundle-link.json");
    symlink(&real_file, &link_path).unwrap();

    let config = LoaderConfig {
        base_dir: base.path().to_path_buf(),
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(link_path);
    let err = load_bundle(&source, &config).unwrap_err();
    assert!(matches!(err, LoaderError::SymlinkRejected(_)));
}

#[test]
fn rejects_non_regular_file() {
    let base = tempfile::tempdir().unwrap();
    let dir_as_bundle = base.path().join("a-directory");
    fs::create_dir(&dir_as_bundle).unwrap();

    let config = LoaderConfig {
        base_dir: base.path().to_path_buf(),
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(dir_as_bundle);
    let err = load_bundle(&source, &config).unwrap_err();
    assert!(matches!(err, LoaderError::NotRegularFile(_)));
}

#[test]
fn rejects_file_larger_than_configured_limit() {
    let base = tempfile::tempdir().unwrap();
    let big_file = base.path().join("big.json");
    fs::write(&big_file, vec![b'a'; 2048]).unwrap();

    let config = LoaderConfig {
        base_dir: base.path().to_path_buf(),
        max_size_bytes: 1024,
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(big_file);
    let err = load_bundle(&source, &config).unwrap_err();
    assert!(matches!(err, LoaderError::TooLarge { .. }));
}

#[test]
fn rejects_missing_file() {
    let base = tempfile::tempdir().unwrap();
    let config = LoaderConfig {
        base_dir: base.path().to_path_buf(),
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(base.path().join("does-not-exist.json"));
    let err = load_bundle(&source, &config).unwrap_err();
    assert!(matches!(err, LoaderError::FileNotFound(_)));
}

#[test]
fn loads_a_valid_bundle_within_the_base_dir() {
    let base = tempfile::tempdir().unwrap();
    let file = base.path().join("bundle.json");
    fs::write(&file, sample_bundle_json()).unwrap();

    let config = LoaderConfig {
        base_dir: base.path().to_path_buf(),
        ..LoaderConfig::default()
    };
    let source = PolicySource::Path(file);
    let bundle = load_bundle(&source, &config).unwrap();
    assert_eq!(bundle.version, "1");
}

fn bundle_json_of_exact_length(target_len: usize) -> String {
    let mut bundle = PolicyBundle {
        version: String::new(),
        generated_at: chrono::Utc::now() - chrono::Duration::hours(1),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        rules: vec![],
        defaults: Defaults { outcome: Outcome::Allow },
        signature: None,
    };
    let base_len = serde_json::to_string(&bundle).unwrap().len();
    assert!(target_len >= base_len, "target shorter than the unpadded bundle");
    bundle.version = "x".repeat(target_len - base_len);
    let json = serde_json::to_string(&bundle).unwrap();
    assert_eq!(json.len(), target_len);
    json
}

#[test]
fn bundle_at_exactly_one_mebibyte_is_accepted_and_one_byte_over_is_rejected() {
    const LIMIT: usize = 1024 * 1024;
    let config = LoaderConfig::default();

    let exact = bundle_json_of_exact_length(LIMIT);
    let source = PolicySource::Json(exact);
    assert!(load_bundle(&source, &config).is_ok());

    let oversized = bundle_json_of_exact_length(LIMIT + 1);
    let source = PolicySource::Json(oversized);
    let err = load_bundle(&source, &config).unwrap_err();
    assert!(matches!(err, LoaderError::TooLarge { .. }));
}
