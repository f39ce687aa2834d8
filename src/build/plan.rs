//! Build plan rendering and content addressing.
//!
//! ```text
//! FROM <base>
//! COPY ["<key>", "<path>"]     one per file, sorted by path
//! RUN <command>                one per setup command, in order
//! ```
//!
//! The tag is `mk-` followed by the first 32 hex digits of
//! `SHA-256(script ‖ for each file sorted by path: len(path) ‖ path ‖ len(content) ‖ content)`.
//! Identical specs therefore always produce identical tags.

use crate::constants::{
    BUILD_SCRIPT_KEY, IMAGE_TAG_DIGEST_LEN, IMAGE_TAG_PREFIX, MAX_SETUP_COMMANDS,
    validate_image_ref,
};
use crate::error::{Error, Result};
use crate::files::{self, FileEntry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Declarative image build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSpec {
    /// Base image reference.
    pub base_image: String,
    /// Shell commands run in order on top of the base.
    pub setup: Vec<String>,
    /// Files copied into the image.
    pub files: Vec<FileEntry>,
}

impl BuildSpec {
    /// Creates a spec with only a base image.
    pub fn new(base_image: impl Into<String>) -> Self {
        Self {
            base_image: base_image.into(),
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

    /// Appends a setup command.
    #[must_use]
    pub fn with_setup(mut self, command: impl Into<String>) -> Self {
        self.setup.push(command.into());
        self
    }

    /// Appends a file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.push(FileEntry::new(path, content));
        self
    }
}

/// Rendered build inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    /// Build script.
    pub script: String,
    /// Files sorted by path.
    pub files: Vec<FileEntry>,
    /// Content-addressed image tag.
    pub tag: String,
}

/// Renders and hashes a build spec.
///
/// # Errors
///
/// [`Error::InvalidInput`] for an invalid base image, a setup command that
/// redeclares the base or spans several lines, or invalid file entries;
/// [`Error::PayloadTooLarge`] when file content exceeds `max_file_bytes`.
pub fn render_plan(spec: &BuildSpec, max_file_bytes: usize) -> Result<BuildPlan> {
    validate_image_ref(&spec.base_image).map_err(|reason| {
        Error::InvalidInput(format!("base image '{}': {reason}", spec.base_image))
    })?;
    if spec.setup.len() > MAX_SETUP_COMMANDS {
        return Err(Error::InvalidInput(format!(
            "{} setup commands exceed the limit of {MAX_SETUP_COMMANDS}",
            spec.setup.len()
        )));
    }
    for command in &spec.setup {
        validate_setup_command(command)?;
    }
    files::validate(&spec.files, max_file_bytes)?;
    if spec.files.iter().any(|f| f.key() == BUILD_SCRIPT_KEY) {
        return Err(Error::InvalidInput(format!(
            "file path '{BUILD_SCRIPT_KEY}' is reserved for the build script"
        )));
    }

    let mut files = spec.files.clone();
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut script = format!("FROM {}\n", spec.base_image);
    for file in &files {
        // JSON form keeps paths with spaces or quotes intact.
        let _ = writeln!(
            script,
            "COPY [{}, {}]",
            serde_json::to_string(&file.key())?,
            serde_json::to_string(&file.path)?
        );
    }
    for command in &spec.setup {
        let _ = writeln!(script, "RUN {}", command.trim());
    }

    let tag = content_tag(&script, &files);
    Ok(BuildPlan { script, files, tag })
}

fn validate_setup_command(command: &str) -> Result<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("setup command cannot be empty".to_string()));
    }
    if trimmed.contains('\n') || trimmed.contains('\r') {
        return Err(Error::InvalidInput(format!(
            "setup command '{trimmed}' must be a single line"
        )));
    }
    let first_word = trimmed.split_whitespace().next().unwrap_or_default();
    if first_word.eq_ignore_ascii_case("FROM") {
        return Err(Error::InvalidInput(format!(
            "setup command '{trimmed}' redeclares the base image"
        )));
    }
    Ok(())
}

/// Computes the content-addressed tag for a rendered script and sorted files.
fn content_tag(script: &str, sorted_files: &[FileEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    for file in sorted_files {
        hasher.update((file.path.len() as u64).to_be_bytes());
        hasher.update(file.path.as_bytes());
        hasher.update((file.content.len() as u64).to_be_bytes());
        hasher.update(&file.content);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{IMAGE_TAG_PREFIX}{}", &digest[..IMAGE_TAG_DIGEST_LEN])
}
