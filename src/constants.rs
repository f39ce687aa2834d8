//! # Session Backend Constants
//!
//! Defines all timeouts, size limits, label keys and naming conventions for
//! the session backend and the image builder. These constants are the
//! **single source of truth** for the cluster-side contract: every resource
//! created by this crate is labelled, named and bounded from here.
//!
//! ## Cross-References
//!
//! - [`crate::backend`]: readiness timeout, label selectors, rollback
//! - [`crate::session`]: tunnel timeout, exit codes, workload naming
//! - [`crate::build`]: build timeout, image tag scheme, artifact layout
//! - [`crate::config`]: defaults for every tunable value

use std::time::Duration;

// =============================================================================
// Labels and Annotations
// =============================================================================
//
// Every cluster resource created for a session carries the managed-by marker
// and the session id. Resources are located exclusively through these labels;
// destruction always targets the full tagged set.
// =============================================================================

/// Label key marking resources owned by this backend.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] for resources owned by this backend.
pub const MANAGED_BY_VALUE: &str = "magikube";

/// Label key carrying the session id on every per-session resource.
pub const SESSION_ID_LABEL: &str = "magikube.io/session-id";

/// Label key carrying the build id on build jobs and build artifacts.
pub const BUILD_ID_LABEL: &str = "magikube.io/build-id";

/// Annotation key holding the serialized session spec for later recovery.
pub const SPEC_ANNOTATION: &str = "magikube.io/spec";

/// Label and annotation key prefixes reserved for this backend.
///
/// User labels must not use them.
pub const RESERVED_LABEL_PREFIXES: &[&str] = &["magikube.io/", "app.kubernetes.io/managed-by"];

// =============================================================================
// Naming
// =============================================================================

/// Prefix for workload names (`mk-<session id>`).
pub const WORKLOAD_NAME_PREFIX: &str = "mk";

/// Name of the primary container inside every session workload.
pub const PRIMARY_CONTAINER: &str = "main";

/// Name of the shared scratch volume mounted by setup steps and the primary container.
pub const SCRATCH_VOLUME: &str = "scratch";

/// Mount path of the shared scratch volume.
pub const SCRATCH_MOUNT_PATH: &str = "/workspace";

/// Name of the volume backed by the file-injection artifact.
pub const FILES_VOLUME: &str = "files";

/// Suffix of the file-injection artifact name (`<workload>-files`).
pub const FILES_ARTIFACT_SUFFIX: &str = "files";

/// Maximum length of a Kubernetes object name (RFC 1123 DNS label).
pub const MAX_OBJECT_NAME_LEN: usize = 63;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum aggregate content of injected files (1 MiB).
///
/// Counts file content only. Exceeding it is a creation-time error.
pub const MAX_INJECTED_FILE_BYTES: usize = 1024 * 1024;

/// Maximum stored size of a ConfigMap (1 MiB), keys and values together.
///
/// The API server enforces this on top of [`MAX_INJECTED_FILE_BYTES`], so on a
/// real cluster a payload right at the content limit is still rejected once
/// its keys are counted.
pub const MAX_CONFIG_MAP_BYTES: usize = 1024 * 1024;

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum number of declared ports per session.
pub const MAX_PORTS_PER_SESSION: usize = 64;

/// Maximum number of setup commands per session or build.
pub const MAX_SETUP_COMMANDS: usize = 128;

/// Chunk size used when copying raw output into buffered streams.
pub const STREAM_COPY_CHUNK: usize = 8 * 1024;

// =============================================================================
// Timeouts
// =============================================================================
//
// Every blocking operation is bounded. None of these bounds is retried
// automatically; a timeout is surfaced to the caller with context.
// =============================================================================

/// Timeout for a workload to reach an executing state after submission (60 seconds).
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for a workload to become ready.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for establishing a port tunnel (10 seconds).
pub const TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on draining attached output before streams are finished.
pub const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard timeout for an image build job (10 minutes).
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Poll interval for build job status.
pub const BUILD_POLL_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// Exit Codes
// =============================================================================

/// Conventional exit code for a force-removed workload (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// Exit code reported when no real exit code can be recovered.
///
/// Used for exec results without a status frame, failed workloads without a
/// terminated container status, and watch subscription failures.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// In-workload command used to request graceful termination of the primary process.
pub const GRACEFUL_STOP_COMMAND: &[&str] = &["/bin/sh", "-c", "kill -TERM 1"];

/// Waiting reasons after which a workload will never start on its own.
pub const FATAL_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

// =============================================================================
// Image Builds
// =============================================================================

/// Prefix marking content-addressed image tags produced by the builder.
pub const IMAGE_TAG_PREFIX: &str = "mk-";

/// Number of hex characters of the content digest kept in an image tag.
pub const IMAGE_TAG_DIGEST_LEN: usize = 32;

/// Default registry for built images.
///
/// `ttl.sh` treats the image tag as a lifetime, which matches the
/// `registry/tag:ttl` reference scheme.
pub const DEFAULT_REGISTRY: &str = "ttl.sh";

/// Default lifetime tag for built images.
pub const DEFAULT_IMAGE_TTL: &str = "1h";

/// Default image that executes the build step.
pub const DEFAULT_BUILDER_IMAGE: &str = "gcr.io/kaniko-project/executor:v1.23.2";

/// Default image that materializes build inputs into the scratch context.
pub const DEFAULT_MATERIALIZE_IMAGE: &str = "busybox:1.36";

/// Artifact key of the rendered build script.
pub const BUILD_SCRIPT_KEY: &str = "Dockerfile";

/// Mount path of the build artifact inside the materialize step.
pub const BUILD_INPUT_PATH: &str = "/plan";

/// Mount path of the build context shared by the materialize and build steps.
pub const BUILD_CONTEXT_PATH: &str = "/context";

/// Container name of the build step (log source on failure).
pub const BUILD_CONTAINER: &str = "build";

/// Container name of the materialize step.
pub const MATERIALIZE_CONTAINER: &str = "materialize";

/// Number of build log lines attached to a failed build error.
pub const BUILD_LOG_TAIL_LINES: i64 = 50;

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

/// Valid characters for artifact keys (after path sanitization).
pub const ARTIFACT_KEY_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Validates an image reference.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked"]
pub fn validate_image_ref(reference: &str) -> std::result::Result<(), &'static str> {
    if reference.is_empty() {
        return Err("image reference cannot be empty");
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err("image reference exceeds maximum length");
    }
    if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err("image reference contains invalid characters");
    }
    Ok(())
}

/// Validates an RFC 1123 DNS label (volume names, object names).
#[must_use = "validation result must be checked"]
pub fn validate_dns_label(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_OBJECT_NAME_LEN {
        return Err("name exceeds maximum length");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("name must contain only lowercase alphanumeric characters or '-'");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("name cannot start or end with '-'");
    }
    Ok(())
}
