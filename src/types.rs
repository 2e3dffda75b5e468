//! Core identifier types shared by every storage structure.
//!
//! A [`ChunkId`] is the join key between the vector index position array,
//! the metadata store, the symbol hash cache and the binary vector cache.
//! Identifiers arrive from different front-ends with different path
//! separator conventions, so lookups go through [`ChunkId::lookup_variants`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute map stored alongside every chunk.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Zero-based dense position inside the vector index.
pub type Position = usize;

/// Attribute key holding the chunk's relative file path.
pub const ATTR_FILE_PATH: &str = "file_path";

/// Attribute key holding the chunk's qualified name.
pub const ATTR_NAME: &str = "name";

/// Attribute key holding extra symbol names of a merged chunk.
pub const ATTR_SYMBOLS: &str = "symbols";

/// Attribute key holding the owning project id.
pub const ATTR_PROJECT: &str = "project_id";

/// String key naming one indexed code unit.
///
/// Textual form: `<path>:<start>-<end>:<kind>[:<qualified name>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Wraps an identifier string as-is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds an identifier from its parts, normalizing the path.
    pub fn from_parts(
        path: &str,
        start_line: u32,
        end_line: u32,
        kind: &str,
        name: Option<&str>,
    ) -> Self {
        let path = normalize_path(path);
        match name {
            Some(name) => Self(format!("{path}:{start_line}-{end_line}:{kind}:{name}")),
            None => Self(format!("{path}:{start_line}-{end_line}:{kind}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The identifier with every separator variant folded to one form.
    pub fn normalized(&self) -> String {
        normalize_path(&self.0)
    }

    /// Path portion of the identifier, if it follows the textual form.
    ///
    /// Scans for the first `:<digits>-<digits>` segment so Windows drive
    /// letters inside the path do not confuse the split.
    pub fn path(&self) -> Option<&str> {
        let mut search_from = 0;
        while let Some(offset) = self.0[search_from..].find(':') {
            let colon = search_from + offset;
            let range = self.0[colon + 1..].split(':').next().unwrap_or("");
            if is_line_range(range) {
                return Some(&self.0[..colon]);
            }
            search_from = colon + 1;
        }
        None
    }

    /// Candidate spellings of this identifier, in lookup order.
    ///
    /// Order: as given, un-double-escaped, forward-slash, back-slash,
    /// fully normalized. Duplicates are dropped, first occurrence wins.
    pub fn lookup_variants(&self) -> Vec<String> {
        let original = self.0.as_str();
        let unescaped = original.replace("\\\\", "\\");
        let forward = unescaped.replace('\\', "/");
        let backward = forward.replace('/', "\\");
        let normalized = normalize_path(original);

        let mut variants: Vec<String> = Vec::with_capacity(5);
        for candidate in [
            original.to_string(),
            unescaped,
            forward,
            backward,
            normalized,
        ] {
            if !variants.contains(&candidate) {
                variants.push(candidate);
            }
        }
        variants
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ChunkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Folds separator variants: un-escapes doubled back-slashes, converts to
/// forward slashes, collapses repeated slashes and strips a leading `./`.
pub fn normalize_path(raw: &str) -> String {
    let unescaped = raw.replace("\\\\", "\\").replace('\\', "/");
    let mut normalized = String::with_capacity(unescaped.len());
    let mut previous_slash = false;
    for ch in unescaped.chars() {
        if ch == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        normalized.push(ch);
    }
    match normalized.strip_prefix("./") {
        Some(stripped) => stripped.to_string(),
        None => normalized,
    }
}

fn is_line_range(segment: &str) -> bool {
    let Some((start, end)) = segment.split_once('-') else {
        return false;
    };
    !start.is_empty()
        && !end.is_empty()
        && start.bytes().all(|b| b.is_ascii_digit())
        && end.bytes().all(|b| b.is_ascii_digit())
}
