//! Object metadata access.
//!
//! The object's attributes are an opaque string map owned by the storage
//! service; the tagger only reads the write timestamp and adds the tag
//! attribute. [`SidecarStore`] persists the map as JSON next to the object
//! file, `<dir>/.<name>.meta.json`, replacing it atomically on write. The
//! storage write path is responsible for creating and updating the sidecar,
//! at minimum the write timestamp, whenever it writes the object. Deployments
//! that keep attributes elsewhere, such as extended attributes on the object
//! file, plug in their own [`ObjectStore`].

use async_trait::async_trait;
use insight_pipeline::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors raised by metadata access
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("No object or metadata at {0}")]
    NotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt metadata at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
}

impl MetadataError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Attribute map of one object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectMetadata(BTreeMap<String, String>);

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// The write timestamp held in `attribute`, if present and parsable
    pub fn timestamp(&self, attribute: &str) -> Option<Timestamp> {
        self.get(attribute).and_then(|v| v.parse().ok())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ObjectMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Read/write access to objects and their attribute maps, keyed by the
/// object's file path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read_metadata(&self, path: &Path) -> Result<ObjectMetadata, MetadataError>;

    /// Replace the whole attribute map
    async fn write_metadata(&self, path: &Path, metadata: &ObjectMetadata) -> Result<(), MetadataError>;

    async fn read_content(&self, path: &Path) -> Result<Vec<u8>, MetadataError>;
}

/// Attribute maps stored as JSON sidecar files
#[derive(Debug, Clone, Default)]
pub struct SidecarStore;

impl SidecarStore {
    pub fn new() -> Self {
        Self
    }

    /// `<dir>/.<name>.meta.json` for `<dir>/<name>`
    pub fn sidecar_path(path: &Path) -> Result<PathBuf, MetadataError> {
        let name = path.file_name().ok_or_else(|| MetadataError::Corrupt {
            path: path.to_path_buf(),
            message: "path has no file name".to_string(),
        })?;
        let mut sidecar = std::ffi::OsString::from(".");
        sidecar.push(name);
        sidecar.push(".meta.json");
        Ok(path.with_file_name(sidecar))
    }
}

#[async_trait]
impl ObjectStore for SidecarStore {
    #[instrument(skip(self))]
    async fn read_metadata(&self, path: &Path) -> Result<ObjectMetadata, MetadataError> {
        // The object must still exist; a sidecar left behind by a delete does not count
        tokio::fs::metadata(path)
            .await
            .map_err(|e| MetadataError::io(path, e))?;

        let sidecar = Self::sidecar_path(path)?;
        let raw = tokio::fs::read(&sidecar)
            .await
            .map_err(|e| MetadataError::io(path, e))?;

        serde_json::from_slice(&raw).map_err(|e| MetadataError::Corrupt {
            path: sidecar,
            message: e.to_string(),
        })
    }

    #[instrument(skip(self, metadata), fields(attributes = metadata.len()))]
    async fn write_metadata(&self, path: &Path, metadata: &ObjectMetadata) -> Result<(), MetadataError> {
        let sidecar = Self::sidecar_path(path)?;
        let mut tmp = sidecar.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let raw = serde_json::to_vec_pretty(metadata).map_err(|e| MetadataError::Corrupt {
            path: sidecar.clone(),
            message: e.to_string(),
        })?;

        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(|e| MetadataError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &sidecar)
            .await
            .map_err(|e| MetadataError::io(&sidecar, e))?;

        debug!(sidecar = %sidecar.display(), "Metadata written");
        Ok(())
    }

    async fn read_content(&self, path: &Path) -> Result<Vec<u8>, MetadataError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| MetadataError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            SidecarStore::sidecar_path(Path::new("/srv/node/gpfs0/a/c/cat.jpg")).unwrap(),
            PathBuf::from("/srv/node/gpfs0/a/c/.cat.jpg.meta.json")
        );
        assert!(SidecarStore::sidecar_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let object = dir.path().join("cat.jpg");
        std::fs::write(&object, b"jpeg").unwrap();

        let store = SidecarStore::new();
        let metadata: ObjectMetadata = [
            ("X-Timestamp", "1463745600.00000"),
            ("Content-Type", "image/jpeg"),
        ]
        .into_iter()
        .collect();
        store.write_metadata(&object, &metadata).await.unwrap();

        assert_eq!(store.read_metadata(&object).await.unwrap(), metadata);
        assert_eq!(store.read_content(&object).await.unwrap(), b"jpeg");
        assert!(!dir.path().join(".cat.jpg.meta.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_object_or_sidecar_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SidecarStore::new();
        let object = dir.path().join("gone.jpg");

        assert!(matches!(
            store.read_metadata(&object).await,
            Err(MetadataError::NotFound(_))
        ));

        std::fs::write(&object, b"jpeg").unwrap();
        assert!(matches!(
            store.read_metadata(&object).await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let object = dir.path().join("cat.jpg");
        std::fs::write(&object, b"jpeg").unwrap();
        std::fs::write(dir.path().join(".cat.jpg.meta.json"), b"{not json").unwrap();

        assert!(matches!(
            SidecarStore::new().read_metadata(&object).await,
            Err(MetadataError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_timestamp_attribute() {
        let metadata: ObjectMetadata = [("X-Timestamp", "1.5"), ("Bad", "never")].into_iter().collect();
        assert_eq!(
            metadata.timestamp("X-Timestamp").map(|t| t.normal()),
            Some("0000000001.50000".to_string())
        );
        assert_eq!(metadata.timestamp("Bad"), None);
        assert_eq!(metadata.timestamp("Missing"), None);
    }
}
