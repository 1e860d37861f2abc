use super::error::StoreError;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Number assigned to a generation at creation time. Strictly increasing per store.
pub type GenerationId = u64;

/// A validated, dotted artifact name such as `demo.range_sum.worker`.
///
/// Each segment is restricted to ASCII alphanumerics, `_`, `-` and `$`, which keeps
/// the derived file path inside the store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn parse(name: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name is empty"));
        }

        for segment in name.split('.') {
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$'))
            {
                return Err(invalid("segments may only contain [A-Za-z0-9_$-]"));
            }
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative path of the artifact without extension: `a.b.C` -> `a/b/C`.
    pub fn relative_path(&self) -> PathBuf {
        self.0.split('.').collect()
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactName {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactName> for String {
    fn from(name: ArtifactName) -> Self {
        name.0
    }
}

/// Lower-case hex SHA-256 of an artifact's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactDigest(pub String);

impl ArtifactDigest {
    pub fn compute(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        Self(hash.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What `CodeStore::set_definition` did with the bytes it was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Digest matched the current binding; nothing was written.
    Unchanged,
    /// New bytes installed without archiving (no live generation could need the old ones,
    /// or they were already archived for this boundary).
    Installed,
    /// Previous bytes archived under `boundary`, new bytes installed.
    Archived { boundary: GenerationId },
}
