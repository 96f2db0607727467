use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{AppError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
    pub url: String,
}

#[derive(Clone)]
pub struct ObjectStorage {
    root: PathBuf,
    public_url: String,
}

impl ObjectStorage {
    pub async fn open(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let invalid = path.is_empty()
            || path
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..");
        if invalid {
            return Err(AppError::InvalidOperation(format!("invalid storage path {path:?}")));
        }
        Ok(self.root.join(Path::new(path)))
    }

    pub fn download_url(&self, path: &str) -> Result<String> {
        self.resolve(path)?;
        Ok(format!("{}/files/{path}", self.public_url))
    }

    pub async fn upload(&self, path: &str, bytes: &[u8]) -> Result<StoredObject> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, bytes).await?;
        debug!(path, size = bytes.len(), "stored object");
        Ok(StoredObject {
            path: path.to_string(),
            url: self.download_url(path)?,
        })
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("file {path}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a single object, or everything under a directory prefix.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        let result = match fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
