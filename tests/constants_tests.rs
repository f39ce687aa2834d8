//! Tests for constants module.
//!
//! Validates that limits and timeouts have sane values and that the
//! validation helpers accept what the cluster accepts.

use magikube::constants::*;
use std::time::Duration;

// =============================================================================
// Size Limit Tests
// =============================================================================

#[test]
fn test_injected_file_limit_is_one_mib() {
    assert_eq!(MAX_INJECTED_FILE_BYTES, 1_048_576);
}

#[test]
fn test_image_ref_length_reasonable() {
    assert!(MAX_IMAGE_REF_LEN >= 256, "image ref limit too restrictive");
    assert!(MAX_IMAGE_REF_LEN <= 1024, "image ref limit too permissive");
}

#[test]
fn test_workload_name_fits_object_name_limit() {
    // "mk-" + simple uuid (32 hex chars)
    assert!(WORKLOAD_NAME_PREFIX.len() + 1 + 32 <= MAX_OBJECT_NAME_LEN);
    // "<workload>-files"
    assert!(
        WORKLOAD_NAME_PREFIX.len() + 1 + 32 + 1 + FILES_ARTIFACT_SUFFIX.len()
            <= MAX_OBJECT_NAME_LEN
    );
}

#[test]
fn test_image_tag_fits_tag_limit() {
    // OCI tags are capped at 128 characters.
    assert!(IMAGE_TAG_PREFIX.len() + IMAGE_TAG_DIGEST_LEN <= 128);
    assert!(IMAGE_TAG_DIGEST_LEN <= 64, "cannot exceed a sha256 hex digest");
}

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_timeouts_are_ordered() {
    assert_eq!(READY_TIMEOUT, Duration::from_secs(60));
    assert_eq!(TUNNEL_TIMEOUT, Duration::from_secs(10));
    assert!(READY_POLL_INTERVAL < READY_TIMEOUT);
    assert!(BUILD_POLL_INTERVAL < BUILD_TIMEOUT);
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_killed_exit_code_is_sigkill() {
    assert_eq!(KILLED_EXIT_CODE, 128 + 9);
    assert!(UNKNOWN_EXIT_CODE < 0);
}

#[test]
fn test_reserved_prefixes_cover_internal_labels() {
    for key in [MANAGED_BY_LABEL, SESSION_ID_LABEL, BUILD_ID_LABEL, SPEC_ANNOTATION] {
        assert!(
            RESERVED_LABEL_PREFIXES.iter().any(|p| key.starts_with(p)),
            "{key} is not reserved"
        );
    }
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_validate_image_ref() {
    assert!(validate_image_ref("alpine").is_ok());
    assert!(validate_image_ref("ghcr.io/org/app:1.2.3").is_ok());
    assert!(validate_image_ref("registry:5000/app@sha256:abcdef").is_ok());

    assert!(validate_image_ref("").is_err());
    assert!(validate_image_ref("alpine latest").is_err());
    assert!(validate_image_ref(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
}

#[test]
fn test_validate_dns_label() {
    assert!(validate_dns_label("data").is_ok());
    assert!(validate_dns_label("cache-1").is_ok());

    assert!(validate_dns_label("").is_err());
    assert!(validate_dns_label("Data").is_err());
    assert!(validate_dns_label("-data").is_err());
    assert!(validate_dns_label("data-").is_err());
    assert!(validate_dns_label("data_1").is_err());
    assert!(validate_dns_label(&"a".repeat(MAX_OBJECT_NAME_LEN + 1)).is_err());
}
