//! Injected file entries.
//!
//! Sessions and builds both ship `(path, content)` pairs to the cluster inside
//! a single artifact. Each entry is stored under a slash-free key derived from
//! its path, and binary content (any NUL byte) is kept apart from text.

use crate::constants::ARTIFACT_KEY_VALID_CHARS;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A file to place inside a workload or build context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// Destination path (absolute for sessions, any for builds).
    pub path: String,
    /// Raw content. Serialized as a string when valid UTF-8, else as bytes.
    #[serde(default, with = "content_serde")]
    pub content: Vec<u8>,
}

impl FileEntry {
    /// Creates a file entry.
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Returns the artifact key for this entry.
    #[must_use]
    pub fn key(&self) -> String {
        artifact_key(&self.path)
    }

    /// Returns true if the content must be stored as binary data.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.content.contains(&0) || std::str::from_utf8(&self.content).is_err()
    }
}

/// Accepts file content written either as text or as a byte sequence.
mod content_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(content: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(content) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(content),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}

/// Derives the artifact key for a path: every `/` becomes `-`.
#[must_use]
pub fn artifact_key(path: &str) -> String {
    path.replace('/', "-")
}

/// Sums the content size of all entries.
#[must_use]
pub fn total_size(files: &[FileEntry]) -> usize {
    files.iter().map(|f| f.content.len()).sum()
}

/// Checks the aggregate size cap, key charset and key uniqueness.
///
/// # Errors
///
/// - [`Error::PayloadTooLarge`] when content exceeds `limit`
/// - [`Error::InvalidInput`] for empty paths, unsupported characters, or two
///   paths mapping to the same key
pub fn validate(files: &[FileEntry], limit: usize) -> Result<()> {
    let size = total_size(files);
    if size > limit {
        return Err(Error::PayloadTooLarge { size, limit });
    }

    let mut seen = HashSet::new();
    for file in files {
        if file.path.trim().is_empty() {
            return Err(Error::InvalidInput("file path cannot be empty".to_string()));
        }
        let key = file.key();
        if !key.chars().all(|c| ARTIFACT_KEY_VALID_CHARS.contains(c)) {
            return Err(Error::InvalidInput(format!(
                "file path '{}' contains unsupported characters",
                file.path
            )));
        }
        if key.chars().all(|c| c == '.' || c == '-') {
            return Err(Error::InvalidInput(format!(
                "file path '{}' does not name a file",
                file.path
            )));
        }
        if !seen.insert(key) {
            return Err(Error::InvalidInput(format!(
                "file path '{}' collides with another file",
                file.path
            )));
        }
    }
    Ok(())
}

/// Text and binary entries keyed for storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactData {
    /// UTF-8 entries.
    pub text: BTreeMap<String, String>,
    /// Entries containing NUL bytes or invalid UTF-8.
    pub binary: BTreeMap<String, Vec<u8>>,
}

impl ArtifactData {
    /// Splits file entries into text and binary maps keyed by [`artifact_key`].
    #[must_use]
    pub fn from_files(files: &[FileEntry]) -> Self {
        let mut data = Self::default();
        for file in files {
            match (file.is_binary(), String::from_utf8(file.content.clone())) {
                (false, Ok(text)) => {
                    data.text.insert(file.key(), text);
                }
                _ => {
                    data.binary.insert(file.key(), file.content.clone());
                }
            }
        }
        data
    }

    /// Size as counted by the API server: every key plus every value.
    #[must_use]
    pub fn stored_size(&self) -> usize {
        let text: usize = self.text.iter().map(|(k, v)| k.len() + v.len()).sum();
        let binary: usize = self.binary.iter().map(|(k, v)| k.len() + v.len()).sum();
        text + binary
    }

    /// Returns true if no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.binary.is_empty()
    }
}
