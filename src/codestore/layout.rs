//! On-Disk Layout
//!
//! ```text
//! <root>/current/a/b/C.bin          latest bytes of `a.b.C`
//! <root>/current/a/b/C.digest       hex digest of those bytes
//! <root>/deprecated/<boundary>/...  bytes archived when a name was rebound
//! <root>/children/<generation>/...  private overrides of one generation
//! ```
//!
//! Every area uses the same per-artifact file pair, so moving an artifact between
//! areas is two renames.

use super::error::StoreError;
use super::types::{ArtifactDigest, ArtifactName, GenerationId};

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const DEFINITION_EXTENSION: &str = "bin";
const DIGEST_EXTENSION: &str = "digest";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub root: PathBuf,
    pub current: PathBuf,
    pub deprecated: PathBuf,
    pub children: PathBuf,
}

impl StoreLayout {
    /// Prepares the three areas under `root`. `current` survives restarts, the other
    /// two are cleared because no generation outlives the process that created it.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        if root.exists() && !root.is_dir() {
            return Err(StoreError::NotADirectory(root.to_path_buf()));
        }

        let layout = Self {
            root: root.to_path_buf(),
            current: root.join("current"),
            deprecated: root.join("deprecated"),
            children: root.join("children"),
        };

        fs::create_dir_all(&layout.current).map_err(|e| StoreError::io(&layout.current, e))?;
        clear_directory(&layout.deprecated)?;
        clear_directory(&layout.children)?;

        Ok(layout)
    }

    pub fn boundary_dir(&self, boundary: GenerationId) -> PathBuf {
        self.deprecated.join(boundary.to_string())
    }

    pub fn child_dir(&self, generation: GenerationId) -> PathBuf {
        self.children.join(generation.to_string())
    }
}

fn artifact_paths(dir: &Path, name: &ArtifactName) -> (PathBuf, PathBuf) {
    let base = dir.join(name.relative_path());
    (
        base.with_extension(DEFINITION_EXTENSION),
        base.with_extension(DIGEST_EXTENSION),
    )
}

pub fn artifact_exists(dir: &Path, name: &ArtifactName) -> bool {
    let (definition, digest) = artifact_paths(dir, name);
    definition.is_file() && digest.is_file()
}

/// Writes bytes and digest atomically (temp file + rename per file).
pub fn write_artifact(
    dir: &Path,
    name: &ArtifactName,
    bytes: &[u8],
    digest: &ArtifactDigest,
) -> Result<(), StoreError> {
    let (definition_path, digest_path) = artifact_paths(dir, name);

    if let Some(parent) = definition_path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let result = write_atomic(&definition_path, bytes)
        .and_then(|_| write_atomic(&digest_path, digest.as_str().as_bytes()));

    if result.is_err() {
        let _ = fs::remove_file(&definition_path);
        let _ = fs::remove_file(&digest_path);
    }

    result
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);

    fs::write(&temp, contents).map_err(|e| StoreError::io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| StoreError::io(path, e))
}

pub fn move_artifact(from: &Path, name: &ArtifactName, to: &Path) -> Result<(), StoreError> {
    let (from_definition, from_digest) = artifact_paths(from, name);
    let (to_definition, to_digest) = artifact_paths(to, name);

    if let Some(parent) = to_definition.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    fs::rename(&from_definition, &to_definition).map_err(|e| StoreError::io(&from_definition, e))?;
    fs::rename(&from_digest, &to_digest).map_err(|e| StoreError::io(&from_digest, e))
}

/// Reads the stored digest, `None` if the artifact is absent.
pub fn read_digest(dir: &Path, name: &ArtifactName) -> Result<Option<ArtifactDigest>, StoreError> {
    let (_, digest_path) = artifact_paths(dir, name);
    match fs::read_to_string(&digest_path) {
        Ok(hex) => Ok(Some(ArtifactDigest(hex.trim().to_string()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(digest_path, e)),
    }
}

/// Reads the bytes and checks them against the stored digest.
pub fn read_definition(dir: &Path, name: &ArtifactName) -> Result<Option<Vec<u8>>, StoreError> {
    let (definition_path, _) = artifact_paths(dir, name);

    let bytes = match fs::read(&definition_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(definition_path, e)),
    };

    match read_digest(dir, name)? {
        Some(expected) if expected == ArtifactDigest::compute(&bytes) => Ok(Some(bytes)),
        _ => Err(StoreError::Corrupt {
            name: name.to_string(),
            path: definition_path,
        }),
    }
}

pub fn remove_directory(dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

fn clear_directory(dir: &Path) -> Result<(), StoreError> {
    remove_directory(dir)?;
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}
