//! A2 collaborator interface: blob storage behind `(bucket, key)`
//! (SPEC_FULL.md §4.10). Only the local filesystem backend is a real
//! implementation; S3 is selected by config but deliberately unimplemented
//! — storage backends are a fixed interface, not core engineering (spec.md §1).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;

pub trait BlobStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), AppError>;
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, AppError>;
    fn delete(&self, bucket: &str, key: &str) -> Result<(), AppError>;
}

pub struct LocalFsBlobStore {
    root: PathBuf,
}

impl LocalFsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, AppError> {
        if key.contains("..") || bucket.contains("..") {
            return Err(AppError::permission_denied("path traversal rejected in storage key"));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

impl BlobStore for LocalFsBlobStore {
    fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), AppError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = Path::new(&path).parent() {
            fs::create_dir_all(parent).map_err(|e| AppError::internal(format!("storage mkdir failed: {e}")))?;
        }
        fs::write(&path, bytes).map_err(|e| AppError::internal(format!("storage write failed: {e}")))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, AppError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|_| AppError::not_found(format!("object not found: {bucket}/{key}")))
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), AppError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::internal(format!("storage delete failed: {e}"))),
        }
    }
}

/// Declared per SPEC_FULL.md §4.10 but not implemented — selecting it via
/// `SBLITE_STORAGE_BACKEND=s3` is accepted, every operation errors.
pub struct S3BlobStore;

impl BlobStore for S3BlobStore {
    fn put(&self, _bucket: &str, _key: &str, _bytes: Vec<u8>) -> Result<(), AppError> {
        Err(AppError::internal("s3 backend not configured in this build"))
    }

    fn get(&self, _bucket: &str, _key: &str) -> Result<Vec<u8>, AppError> {
        Err(AppError::internal("s3 backend not configured in this build"))
    }

    fn delete(&self, _bucket: &str, _key: &str) -> Result<(), AppError> {
        Err(AppError::internal("s3 backend not configured in this build"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_local_fs() {
        let dir = std::env::temp_dir().join(format!("sblite-test-{}", uuid::Uuid::new_v4()));
        let store = LocalFsBlobStore::new(&dir);
        store.put("avatars", "a.png", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get("avatars", "a.png").unwrap(), vec![1, 2, 3]);
        store.delete("avatars", "a.png").unwrap();
        assert!(store.get("avatars", "a.png").is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_path_traversal() {
        let store = LocalFsBlobStore::new(std::env::temp_dir());
        assert!(store.put("bucket", "../../etc/passwd", vec![]).is_err());
    }

    #[test]
    fn s3_backend_is_an_explicit_stub() {
        let store = S3BlobStore;
        assert!(store.put("b", "k", vec![]).is_err());
    }
}
