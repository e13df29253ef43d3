use super::*;

#[test]
fn code_and_message_accessors() {
    let e = AppError::auth("invalid_credentials", "bad password");
    assert_eq!(e.code_str(), "invalid_credentials");
    assert_eq!(e.message(), "bad password");
    assert_eq!(e.to_string(), "invalid_credentials: bad password");
    assert!(e.is_unauthenticated());
    assert!(!e.is_network());
}

#[test]
fn network_classification() {
    assert!(AppError::io("offline", "connection refused").is_network());
    assert!(!AppError::internal("boom", "x").is_network());
    assert!(!AppError::not_found("nf", "missing").is_network());
}

#[test]
fn serde_tagging_is_snake_case() {
    let v = serde_json::to_value(AppError::not_found("nf", "no row")).unwrap();
    assert_eq!(v["type"], "not_found");
    assert_eq!(v["code"], "nf");
}

#[test]
fn anyhow_roundtrip_keeps_app_error() {
    let original = AppError::conflict("duplicate_email", "exists");
    let wrapped: anyhow::Error = original.clone().into();
    assert_eq!(AppError::from(wrapped), original);

    let plain = AppError::from(anyhow::anyhow!("disk on fire"));
    assert_eq!(plain.code_str(), "internal_error");
}

#[test]
fn scan_error_codes_and_messages_are_distinct() {
    let all = [
        ScanError::InvalidCode,
        ScanError::UnknownCode("X1".into()),
        ScanError::NoActiveSession,
        ScanError::NetworkUnavailable("down".into()),
    ];
    let codes: std::collections::HashSet<_> = all.iter().map(|e| e.code_str()).collect();
    let msgs: std::collections::HashSet<_> = all.iter().map(|e| e.user_message()).collect();
    assert_eq!(codes.len(), 4);
    assert_eq!(msgs.len(), 4);
    assert!(ScanError::UnknownCode("X1".into()).user_message().contains("X1"));
}

#[test]
fn portal_mismatch_has_its_own_message() {
    let m = AppError::auth("portal_mismatch", "student on lecturer portal").user_message();
    assert!(m.contains("login page"));
    assert_ne!(m, AppError::auth("invalid_credentials", "x").user_message());
}
