//! Artifact Synchronisation
//!
//! Mirrors a directory of artifacts into a code store, local or behind a coordinator.
//! A file's path below the root is its name: `a/b/C.json` becomes `a.b.C`. Only
//! artifacts whose digest differs from the current binding are uploaded.

use crate::codestore::{ArtifactDigest, ArtifactName, CodeStore, WriteOutcome};
use crate::worker::HttpCoordinatorClient;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Somewhere artifacts can be published to.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn current_digest(&self, name: &ArtifactName) -> Result<Option<ArtifactDigest>>;

    async fn publish(&self, name: &ArtifactName, bytes: &[u8]) -> Result<WriteOutcome>;
}

#[async_trait]
impl ArtifactPublisher for HttpCoordinatorClient {
    async fn current_digest(&self, name: &ArtifactName) -> Result<Option<ArtifactDigest>> {
        Ok(HttpCoordinatorClient::current_digest(self, name).await?)
    }

    async fn publish(&self, name: &ArtifactName, bytes: &[u8]) -> Result<WriteOutcome> {
        Ok(self.set_artifact_definition(name, None, bytes).await?)
    }
}

#[async_trait]
impl ArtifactPublisher for CodeStore {
    async fn current_digest(&self, name: &ArtifactName) -> Result<Option<ArtifactDigest>> {
        Ok(self.get_digest(name.as_str())?)
    }

    async fn publish(&self, name: &ArtifactName, bytes: &[u8]) -> Result<WriteOutcome> {
        Ok(self.set_definition(name.as_str(), bytes)?)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub uploaded: Vec<ArtifactName>,
    pub unchanged: usize,
    /// Files whose path does not form a valid artifact name.
    pub skipped: Vec<PathBuf>,
}

/// Artifact name for `path` below `root`, extension of the file name dropped.
pub fn artifact_name_for(root: &Path, path: &Path) -> Option<ArtifactName> {
    let relative = path.strip_prefix(root).ok()?;
    let stem = relative.with_extension("");

    let segments: Option<Vec<&str>> = stem.components().map(|c| c.as_os_str().to_str()).collect();
    ArtifactName::parse(&segments?.join(".")).ok()
}

fn collect_artifacts(root: &Path, report: &mut SyncReport) -> Vec<(ArtifactName, PathBuf)> {
    let mut found = Vec::new();

    for entry in WalkBuilder::new(root).standard_filters(false).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.into_path();
        match artifact_name_for(root, &path) {
            Some(name) => found.push((name, path)),
            None => {
                tracing::warn!("{} does not map to an artifact name", path.display());
                report.skipped.push(path);
            }
        }
    }

    found.sort();
    found
}

/// Uploads every artifact under `root` whose bytes differ from the current binding.
pub async fn sync_directory(root: &Path, publisher: &dyn ArtifactPublisher) -> Result<SyncReport> {
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }

    let mut report = SyncReport::default();
    let artifacts = collect_artifacts(root, &mut report);

    for (name, path) in artifacts {
        let bytes =
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let local = ArtifactDigest::compute(&bytes);

        let remote = publisher
            .current_digest(&name)
            .await
            .with_context(|| format!("looking up digest of {}", name))?;
        if remote.as_ref() == Some(&local) {
            report.unchanged += 1;
            continue;
        }

        publisher
            .publish(&name, &bytes)
            .await
            .with_context(|| format!("publishing {}", name))?;
        tracing::info!("Uploaded {} ({})", name, local);
        report.uploaded.push(name);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, bytes: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_path_maps_to_dotted_name() {
        let root = Path::new("/artifacts");

        let name = artifact_name_for(root, Path::new("/artifacts/a/b/C.json")).unwrap();
        assert_eq!(name.as_str(), "a.b.C");

        assert!(artifact_name_for(root, Path::new("/artifacts/a b/C.json")).is_none());
        assert!(artifact_name_for(root, Path::new("/elsewhere/C.json")).is_none());
    }

    #[tokio::test]
    async fn test_only_changed_artifacts_are_uploaded() {
        let source = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let store = CodeStore::open(store_dir.path()).unwrap();

        write(source.path(), "a/b/C.json", b"{\"kind\":\"x\"}");
        write(source.path(), "a/D.json", b"{\"kind\":\"y\"}");
        write(source.path(), "bad name.json", b"{}");

        let first = sync_directory(source.path(), &store).await.unwrap();
        assert_eq!(first.uploaded.len(), 2);
        assert_eq!(first.unchanged, 0);
        assert_eq!(first.skipped.len(), 1);
        assert_eq!(store.get_definition("a.b.C").unwrap().unwrap(), b"{\"kind\":\"x\"}");

        let second = sync_directory(source.path(), &store).await.unwrap();
        assert!(second.uploaded.is_empty());
        assert_eq!(second.unchanged, 2);

        write(source.path(), "a/D.json", b"{\"kind\":\"z\"}");
        let third = sync_directory(source.path(), &store).await.unwrap();
        assert_eq!(third.uploaded, vec![ArtifactName::parse("a.D").unwrap()]);
        assert_eq!(third.unchanged, 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = CodeStore::open(store_dir.path()).unwrap();

        assert!(sync_directory(Path::new("/definitely/not/here"), &store).await.is_err());
    }
}
