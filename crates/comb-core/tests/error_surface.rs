use comb_core::errors::{AuditError, ErrorInfo};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("path", "planck_tt.txt")
        .with_context("reason", "example")
}

#[test]
fn provenance_error_surface() {
    let err = AuditError::Provenance(sample_info("P001", "hash mismatch"));
    assert_eq!(err.info().code, "P001");
    assert_eq!(err.family(), "provenance");
    assert!(err.info().context.contains_key("path"));
}

#[test]
fn numerical_error_surface() {
    let err = AuditError::Numerical(sample_info("N001", "cholesky failed"));
    assert_eq!(err.family(), "numerical");
    assert!(err.to_string().starts_with("numerical error: cholesky failed"));
}

#[test]
fn stage_context_preserves_family() {
    let err = AuditError::format("spectrum_ell_order", "ell not increasing")
        .stage("load")
        .with_context("dataset", "planck-pr3");
    assert_eq!(err.family(), "format");
    assert_eq!(err.info().context.get("stage").map(String::as_str), Some("load"));
    assert_eq!(
        err.info().context.get("dataset").map(String::as_str),
        Some("planck-pr3")
    );
    let rendered = err.to_string();
    assert!(rendered.contains("stage=load"));
}

#[test]
fn error_round_trips_through_json() {
    let err = AuditError::config("prereg_lock", "lock hash mismatch").stage("config");
    let json = serde_json::to_string(&err).expect("serialize");
    assert!(json.contains("\"family\":\"Config\""));
    let decoded: AuditError = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(decoded, err);
}
