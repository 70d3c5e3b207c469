use std::fs;

use comb_core::AuditError;
use comb_data::{hash_file, load_manifest, validate, Manifest};

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[test]
fn hash_of_empty_file_is_known_digest() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("empty.txt");
    fs::write(&path, b"").expect("write");
    let (hash, size) = hash_file(&path).expect("hash");
    assert_eq!(hash, EMPTY_SHA256);
    assert_eq!(size, 0);
}

#[test]
fn matching_hash_passes_and_mismatch_is_fatal() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("tt.txt");
    fs::write(&path, b"2 1.0 0.1\n").expect("write");
    let (hash, _) = hash_file(&path).expect("hash");

    let check = validate(&path, &hash.to_uppercase()).expect("upper-case hex accepted");
    assert!(check.ok);
    assert_eq!(check.actual_hash, hash);

    let err = validate(&path, EMPTY_SHA256).expect_err("mismatch");
    assert!(matches!(err, AuditError::Provenance(_)));
    assert_eq!(err.info().code, "provenance_hash_mismatch");
    assert_eq!(err.info().context.get("actual"), Some(&hash));
}

#[test]
fn manifest_round_trip_detects_tampering() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let data = dir.path().join("data");
    fs::create_dir_all(&data).expect("mkdir");
    let observed = data.join("observed.txt");
    let model = data.join("model.txt");
    fs::write(&observed, b"2 1.0 0.1\n3 1.5 0.1\n").expect("write observed");
    fs::write(&model, b"2 1.0\n3 1.4\n").expect("write model");

    let manifest = Manifest::build(&[observed.clone(), model.clone()], dir.path()).expect("build");
    let manifest_path = dir.path().join("manifest.json");
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest).expect("json"))
        .expect("write manifest");

    let loaded = load_manifest(&manifest_path).expect("load");
    assert_eq!(loaded.files.len(), 2);
    assert_eq!(loaded.validate_all().expect("all valid").len(), 2);
    assert!(loaded.verify_input(&observed).expect("observed listed").ok);

    fs::write(&model, b"2 1.0\n3 1.6\n").expect("tamper");
    let err = loaded.verify_input(&model).expect_err("tampered");
    assert!(matches!(err, AuditError::Provenance(_)));

    let stray = dir.path().join("stray.txt");
    fs::write(&stray, b"x").expect("write stray");
    let err = loaded.verify_input(&stray).expect_err("unlisted");
    assert_eq!(err.info().code, "provenance_unlisted");
}

#[test]
fn unsupported_algorithm_is_rejected() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("manifest.json");
    fs::write(&path, br#"{"algorithm": "md5", "files": []}"#).expect("write");
    let err = load_manifest(&path).expect_err("md5");
    assert_eq!(err.info().code, "manifest_algorithm");
}
