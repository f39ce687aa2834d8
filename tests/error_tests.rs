//! Tests for error types.
//!
//! Validates display formatting and the kind taxonomy callers branch on.

use magikube::{Error, ErrorKind};
use std::time::Duration;

// =============================================================================
// Display Tests
// =============================================================================

#[test]
fn test_session_not_found_display() {
    let err = Error::SessionNotFound("abc123".to_string());
    let msg = err.to_string();

    assert!(msg.contains("abc123"), "should include session id");
    assert!(msg.contains("not found"), "should indicate not found");
}

#[test]
fn test_not_ready_display() {
    let err = Error::NotReady {
        id: "abc".to_string(),
        waited: Duration::from_secs(60),
    };
    let msg = err.to_string();

    assert!(msg.contains("abc"));
    assert!(msg.contains("60s"), "should include waited duration: {msg}");
}

#[test]
fn test_payload_too_large_display() {
    let err = Error::PayloadTooLarge {
        size: 1_048_577,
        limit: 1_048_576,
    };
    let msg = err.to_string();

    assert!(msg.contains("1048577"));
    assert!(msg.contains("1048576"));
}

#[test]
fn test_build_failed_includes_logs() {
    let err = Error::BuildFailed {
        reference: "ttl.sh/mk-abc:1h".to_string(),
        reason: "step exited with code 1".to_string(),
        logs: Some("error: package not found\n".to_string()),
    };
    let msg = err.to_string();

    assert!(msg.contains("ttl.sh/mk-abc:1h"));
    assert!(msg.contains("step exited with code 1"));
    assert!(msg.contains("package not found"), "should carry build log");
}

#[test]
fn test_build_failed_without_logs() {
    let err = Error::BuildFailed {
        reference: "r".to_string(),
        reason: "boom".to_string(),
        logs: Some("   ".to_string()),
    };
    assert!(!err.to_string().contains("build log"));
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err: Error = io.into();

    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("pipe closed"));
}

#[test]
fn test_json_error_conversion() {
    let json_err = serde_json::from_str::<serde_json::Value>("{ not json").unwrap_err();
    let err: Error = json_err.into();

    assert!(matches!(err, Error::Serialization(_)));
}

// =============================================================================
// Kind Tests
// =============================================================================

#[test]
fn test_kinds() {
    let cases = [
        (Error::SessionNotFound("x".into()), ErrorKind::NotFound),
        (
            Error::NotFound {
                resource: "workload".into(),
                name: "mk-x".into(),
            },
            ErrorKind::NotFound,
        ),
        (
            Error::NotReady {
                id: "x".into(),
                waited: Duration::from_secs(1),
            },
            ErrorKind::Timeout,
        ),
        (
            Error::TerminalState {
                id: "x".into(),
                reason: "ErrImagePull".into(),
            },
            ErrorKind::TerminalState,
        ),
        (
            Error::Tunnel {
                port: 80,
                reason: "refused".into(),
            },
            ErrorKind::Transport,
        ),
        (Error::InvalidInput("bad".into()), ErrorKind::Validation),
        (Error::Internal("oops".into()), ErrorKind::Internal),
    ];

    for (err, kind) in cases {
        assert_eq!(err.kind(), kind, "{err}");
    }
}

#[test]
fn test_retryable() {
    assert!(Error::Timeout {
        operation: "tunnel".into(),
        duration: Duration::from_secs(10),
    }
    .is_retryable());
    assert!(Error::Api {
        operation: "create".into(),
        resource: "pod".into(),
        reason: "connection reset".into(),
    }
    .is_retryable());
    assert!(!Error::InvalidInput("bad".into()).is_retryable());
    assert!(!Error::SessionNotFound("x".into()).is_retryable());
}

#[test]
fn test_predicates() {
    assert!(Error::SessionNotFound("x".into()).is_not_found());
    assert!(Error::NotReady {
        id: "x".into(),
        waited: Duration::ZERO,
    }
    .is_timeout());
    assert!(!Error::InvalidInput("x".into()).is_timeout());
}

#[test]
fn test_kind_display() {
    assert_eq!(ErrorKind::NotFound.to_string(), "not-found");
    assert_eq!(ErrorKind::TerminalState.to_string(), "terminal-state");
}
