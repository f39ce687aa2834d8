//! Backend and builder configuration.
//!
//! Both configurations start from the defaults in [`crate::constants`] and can
//! be overridden from `MAGIKUBE_*` environment variables. Durations accept
//! human-readable values (`90s`, `2m`, `500ms`).
//!
//! | Variable | Field |
//! |----------|-------|
//! | `MAGIKUBE_NAMESPACE` | `namespace` (both) |
//! | `MAGIKUBE_READY_TIMEOUT` | [`BackendConfig::ready_timeout`] |
//! | `MAGIKUBE_READY_POLL_INTERVAL` | [`BackendConfig::ready_poll_interval`] |
//! | `MAGIKUBE_TUNNEL_TIMEOUT` | [`BackendConfig::tunnel_timeout`] |
//! | `MAGIKUBE_STREAM_DRAIN_TIMEOUT` | [`BackendConfig::stream_drain_timeout`] |
//! | `MAGIKUBE_REGISTRY` | [`BuilderConfig::registry`] |
//! | `MAGIKUBE_IMAGE_TTL` | [`BuilderConfig::ttl`] |
//! | `MAGIKUBE_BUILDER_IMAGE` | [`BuilderConfig::builder_image`] |
//! | `MAGIKUBE_BUILD_TIMEOUT` | [`BuilderConfig::build_timeout`] |

use crate::constants::{
    BUILD_LOG_TAIL_LINES, BUILD_POLL_INTERVAL, BUILD_TIMEOUT, DEFAULT_BUILDER_IMAGE,
    DEFAULT_IMAGE_TTL, DEFAULT_MATERIALIZE_IMAGE, DEFAULT_REGISTRY, MAX_INJECTED_FILE_BYTES,
    READY_POLL_INTERVAL, READY_TIMEOUT, STREAM_DRAIN_TIMEOUT, TUNNEL_TIMEOUT, validate_dns_label,
};
use crate::error::{Error, Result};
use std::time::Duration;

/// Default namespace for sessions and builds.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Environment variable prefix.
const ENV_PREFIX: &str = "MAGIKUBE_";

/// Configuration for [`crate::ClusterBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Namespace holding every session resource.
    pub namespace: String,
    /// Bound on waiting for a new workload to start executing.
    pub ready_timeout: Duration,
    /// Interval between readiness polls.
    pub ready_poll_interval: Duration,
    /// Bound on establishing a port tunnel.
    pub tunnel_timeout: Duration,
    /// Bound on draining attached output once the session exits.
    pub stream_drain_timeout: Duration,
    /// Aggregate cap on injected file content.
    pub max_file_bytes: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ready_timeout: READY_TIMEOUT,
            ready_poll_interval: READY_POLL_INTERVAL,
            tunnel_timeout: TUNNEL_TIMEOUT,
            stream_drain_timeout: STREAM_DRAIN_TIMEOUT,
            max_file_bytes: MAX_INJECTED_FILE_BYTES,
        }
    }
}

impl BackendConfig {
    /// Loads defaults overridden by `MAGIKUBE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an unparsable duration or namespace.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads defaults overridden by values from `lookup` (keyed by full variable name).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(namespace) = lookup(&env_key("NAMESPACE")) {
            config.namespace = parse_namespace(&namespace)?;
        }
        override_duration(&lookup, "READY_TIMEOUT", &mut config.ready_timeout)?;
        override_duration(&lookup, "READY_POLL_INTERVAL", &mut config.ready_poll_interval)?;
        override_duration(&lookup, "TUNNEL_TIMEOUT", &mut config.tunnel_timeout)?;
        override_duration(&lookup, "STREAM_DRAIN_TIMEOUT", &mut config.stream_drain_timeout)?;
        Ok(config)
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the readiness timeout.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Configuration for [`crate::ImageBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Namespace holding build jobs and artifacts.
    pub namespace: String,
    /// Registry host (and optional path) images are published to.
    pub registry: String,
    /// Lifetime tag appended to every image reference.
    pub ttl: String,
    /// Image executing the build step.
    pub builder_image: String,
    /// Image materializing build inputs.
    pub materialize_image: String,
    /// Hard bound on a build.
    pub build_timeout: Duration,
    /// Interval between job status polls.
    pub poll_interval: Duration,
    /// Build log lines attached to failures.
    pub log_tail_lines: i64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            registry: DEFAULT_REGISTRY.to_string(),
            ttl: DEFAULT_IMAGE_TTL.to_string(),
            builder_image: DEFAULT_BUILDER_IMAGE.to_string(),
            materialize_image: DEFAULT_MATERIALIZE_IMAGE.to_string(),
            build_timeout: BUILD_TIMEOUT,
            poll_interval: BUILD_POLL_INTERVAL,
            log_tail_lines: BUILD_LOG_TAIL_LINES,
        }
    }
}

impl BuilderConfig {
    /// Loads defaults overridden by `MAGIKUBE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads defaults overridden by values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(namespace) = lookup(&env_key("NAMESPACE")) {
            config.namespace = parse_namespace(&namespace)?;
        }
        if let Some(registry) = lookup(&env_key("REGISTRY")) {
            config.registry = registry.trim_end_matches('/').to_string();
        }
        if let Some(ttl) = lookup(&env_key("IMAGE_TTL")) {
            config.ttl = ttl;
        }
        if let Some(image) = lookup(&env_key("BUILDER_IMAGE")) {
            config.builder_image = image;
        }
        override_duration(&lookup, "BUILD_TIMEOUT", &mut config.build_timeout)?;
        Ok(config)
    }

    /// Sets the registry.
    #[must_use]
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = registry.into();
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

fn env_key(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

fn parse_namespace(value: &str) -> Result<String> {
    validate_dns_label(value)
        .map_err(|reason| Error::InvalidInput(format!("namespace '{value}': {reason}")))?;
    Ok(value.to_string())
}

fn override_duration(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut Duration,
) -> Result<()> {
    let key = env_key(name);
    if let Some(raw) = lookup(&key) {
        *target = humantime::parse_duration(raw.trim())
            .map_err(|e| Error::InvalidInput(format!("{key}='{raw}': {e}")))?;
    }
    Ok(())
}
