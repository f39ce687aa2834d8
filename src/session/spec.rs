//! Session specification.
//!
//! A `SessionSpec` describes one isolated execution: image, command,
//! environment, resources, ordered setup commands, injected files and
//! persistent volumes. It is validated in full before any cluster resource
//! is created.
//!
//! ## Example
//!
//! ```yaml
//! image: alpine:3.20
//! command: ["sh", "-c", "cat /workspace/log"]
//! setup:
//!   - echo first >> /workspace/log
//!   - echo second >> /workspace/log
//! files:
//!   - path: /etc/app/config.toml
//!     content: "debug = true"
//! ports: [8080]
//! labels:
//!   team: infra
//! ```

use crate::constants::{
    FILES_VOLUME, MAX_OBJECT_NAME_LEN, MAX_PORTS_PER_SESSION, MAX_SETUP_COMMANDS,
    RESERVED_LABEL_PREFIXES, SCRATCH_VOLUME, WORKLOAD_NAME_PREFIX, validate_dns_label,
    validate_image_ref,
};
use crate::error::{Error, Result};
use crate::files::{self, FileEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Longest volume name that still yields a valid claim name
/// (`<prefix>-<32 hex id>-<volume>`).
const MAX_VOLUME_NAME_LEN: usize = MAX_OBJECT_NAME_LEN - WORKLOAD_NAME_PREFIX.len() - 34;

/// Default claim size for persistent volumes.
const DEFAULT_VOLUME_SIZE: &str = "1Gi";

/// Specification of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSpec {
    /// Image reference of the primary container.
    pub image: String,
    /// Command of the primary process (image entrypoint when empty).
    pub command: Vec<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Allocate a TTY.
    pub tty: bool,
    /// Keep stdin open and attach it.
    pub stdin: bool,
    /// CPU and memory (requests equal limits).
    pub resources: Resources,
    /// Ports the primary process listens on.
    pub ports: Vec<u16>,
    /// Shell commands run in order before the primary process, sharing a
    /// scratch directory.
    pub setup: Vec<String>,
    /// Files injected at absolute paths.
    pub files: Vec<FileEntry>,
    /// Persistent volumes.
    pub volumes: Vec<VolumeSpec>,
    /// User labels, applied to every session resource and usable in list filters.
    pub labels: BTreeMap<String, String>,
}

/// Compute resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU quantity (e.g. `500m`).
    pub cpu: Option<String>,
    /// Memory quantity (e.g. `256Mi`).
    pub memory: Option<String>,
}

/// A persistent volume mounted into the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name (DNS label).
    pub name: String,
    /// Absolute mount path.
    pub mount_path: String,
    /// Requested size.
    #[serde(default = "default_volume_size")]
    pub size: String,
    /// Storage class (cluster default when absent).
    #[serde(default)]
    pub storage_class: Option<String>,
}

fn default_volume_size() -> String {
    DEFAULT_VOLUME_SIZE.to_string()
}

impl SessionSpec {
    /// Creates a spec running the image's default entrypoint.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Parses a spec from YAML (or JSON) bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the document is malformed.
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(yaml).map_err(|e| Error::InvalidInput(e.to_string()))
    }

    /// Sets the command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Appends a setup command.
    #[must_use]
    pub fn with_setup(mut self, command: impl Into<String>) -> Self {
        self.setup.push(command.into());
        self
    }

    /// Appends an injected file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push(FileEntry::new(path, content));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Declares a port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Adds a user label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validates the spec.
    ///
    /// # Errors
    ///
    /// - [`Error::PayloadTooLarge`] when file content exceeds `max_file_bytes`
    /// - [`Error::InvalidInput`] for every other violation
    pub fn validate(&self, max_file_bytes: usize) -> Result<()> {
        validate_image_ref(&self.image)
            .map_err(|reason| Error::InvalidInput(format!("image '{}': {reason}", self.image)))?;

        if self.setup.len() > MAX_SETUP_COMMANDS {
            return Err(Error::InvalidInput(format!(
                "{} setup commands exceed the limit of {MAX_SETUP_COMMANDS}",
                self.setup.len()
            )));
        }
        if self.setup.iter().any(|cmd| cmd.trim().is_empty()) {
            return Err(Error::InvalidInput("setup command cannot be empty".to_string()));
        }

        files::validate(&self.files, max_file_bytes)?;
        if let Some(file) = self.files.iter().find(|f| !f.path.starts_with('/')) {
            return Err(Error::InvalidInput(format!(
                "file path '{}' must be absolute",
                file.path
            )));
        }

        self.validate_ports()?;
        self.validate_volumes()?;

        if self.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(Error::InvalidInput(
                "environment variable names cannot be empty or contain '='".to_string(),
            ));
        }

        if let Some(key) = self.labels.keys().find(|k| is_reserved_label(k)) {
            return Err(Error::InvalidInput(format!("label '{key}' is reserved")));
        }
        Ok(())
    }

    fn validate_ports(&self) -> Result<()> {
        if self.ports.len() > MAX_PORTS_PER_SESSION {
            return Err(Error::InvalidInput(format!(
                "{} ports exceed the limit of {MAX_PORTS_PER_SESSION}",
                self.ports.len()
            )));
        }
        let mut seen = HashSet::new();
        for &port in &self.ports {
            if port == 0 {
                return Err(Error::InvalidInput("port 0 is not allowed".to_string()));
            }
            if !seen.insert(port) {
                return Err(Error::InvalidInput(format!("port {port} declared twice")));
            }
        }
        Ok(())
    }

    fn validate_volumes(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for volume in &self.volumes {
            validate_dns_label(&volume.name).map_err(|reason| {
                Error::InvalidInput(format!("volume '{}': {reason}", volume.name))
            })?;
            if volume.name.len() > MAX_VOLUME_NAME_LEN {
                return Err(Error::InvalidInput(format!(
                    "volume '{}' exceeds {MAX_VOLUME_NAME_LEN} characters",
                    volume.name
                )));
            }
            if volume.name == SCRATCH_VOLUME || volume.name == FILES_VOLUME {
                return Err(Error::InvalidInput(format!(
                    "volume name '{}' is reserved",
                    volume.name
                )));
            }
            if !volume.mount_path.starts_with('/') {
                return Err(Error::InvalidInput(format!(
                    "volume '{}' mount path must be absolute",
                    volume.name
                )));
            }
            if !seen.insert(volume.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "volume '{}' declared twice",
                    volume.name
                )));
            }
        }
        Ok(())
    }

    /// Serializes the spec for the workload annotation.
    ///
    /// File contents are dropped (paths kept); they live in the file artifact.
    pub fn to_annotation(&self) -> Result<String> {
        let mut stripped = self.clone();
        for file in &mut stripped.files {
            file.content.clear();
        }
        Ok(serde_json::to_string(&stripped)?)
    }

    /// Restores a spec from its workload annotation.
    pub fn from_annotation(annotation: &str) -> Result<Self> {
        Ok(serde_json::from_str(annotation)?)
    }
}

/// Returns true for label keys owned by the system.
pub(crate) fn is_reserved_label(key: &str) -> bool {
    RESERVED_LABEL_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}
