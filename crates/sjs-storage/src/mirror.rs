//! Mirror finished export files to a remote object store.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::info;

/// Logical folder exports are mirrored under.
pub const MIRROR_FOLDER: &str = "job-listings";

pub struct ExportMirror {
    store: Arc<dyn ObjectStore>,
    location: String,
}

impl ExportMirror {
    pub fn new(store: Arc<dyn ObjectStore>, location: impl Into<String>) -> Self {
        Self {
            store,
            location: location.into(),
        }
    }

    /// S3 bucket mirror; credentials and region come from the standard AWS_* variables.
    pub fn s3(bucket: &str) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .with_context(|| format!("configuring S3 mirror for bucket {bucket}"))?;
        Ok(Self::new(Arc::new(store), format!("s3://{bucket}")))
    }

    pub fn local(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating mirror directory {}", dir.display()))?;
        let store = LocalFileSystem::new_with_prefix(dir)
            .with_context(|| format!("opening mirror directory {}", dir.display()))?;
        Ok(Self::new(Arc::new(store), dir.display().to_string()))
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn object_path(file_name: &str) -> ObjectPath {
        ObjectPath::from(format!("{MIRROR_FOLDER}/{file_name}"))
    }

    /// Upload a completed local file; returns the remote location it was written to.
    pub async fn mirror_file(&self, local_path: &Path) -> Result<String> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("export path {} has no file name", local_path.display()))?;
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("reading {}", local_path.display()))?;
        let object_path = Self::object_path(&file_name);
        self.store
            .put(&object_path, bytes::Bytes::from(data).into())
            .await
            .with_context(|| format!("uploading {object_path} to {}", self.location))?;

        let remote = format!("{}/{}", self.location.trim_end_matches('/'), object_path);
        info!(remote = %remote, "export mirrored");
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tempfile::tempdir;

    #[tokio::test]
    async fn mirrors_file_under_fixed_folder() {
        let dir = tempdir().expect("tempdir");
        let local = dir.path().join("job-listings--2024-03-15.csv");
        std::fs::write(&local, "dol_id\nH-1\n").unwrap();

        let store = Arc::new(InMemory::new());
        let mirror = ExportMirror::new(store.clone(), "memory://exports");
        let remote = mirror.mirror_file(&local).await.unwrap();
        assert_eq!(remote, "memory://exports/job-listings/job-listings--2024-03-15.csv");

        let stored = store
            .get(&ExportMirror::object_path("job-listings--2024-03-15.csv"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&stored[..], b"dol_id\nH-1\n");
    }

    #[tokio::test]
    async fn local_mirror_writes_into_directory() {
        let dir = tempdir().expect("tempdir");
        let local = dir.path().join("job-listings-latest.json");
        std::fs::write(&local, "[]").unwrap();

        let target = dir.path().join("mirror");
        let mirror = ExportMirror::local(&target).unwrap();
        mirror.mirror_file(&local).await.unwrap();
        let copied =
            std::fs::read_to_string(target.join(MIRROR_FOLDER).join("job-listings-latest.json"))
                .unwrap();
        assert_eq!(copied, "[]");
    }
}
