//! Local directory backend
//!
//! Objects are plain files under a root directory; metadata lives in a
//! `.meta.json` sidecar next to each object. Useful for offline copies,
//! NFS targets, and testing without S3.

use crate::chunk::sha1_base64;
use crate::error::{Error, Result};
use crate::store::{ObjectMetadata, ObjectStore, PutObject, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

const METADATA_SUFFIX: &str = ".meta.json";

/// Object store rooted at a local directory
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LocalStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Path of `key` under the root; keys may not escape it
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let confined = Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !confined {
            return Err(Error::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn metadata_path_for(&self, key: &str) -> Result<PathBuf> {
        self.path_for(&format!("{}{}", key, METADATA_SUFFIX))
    }

    async fn read_metadata(&self, key: &str) -> Result<ObjectMetadata> {
        match fs::read(self.metadata_path_for(key)?).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ObjectMetadata::new()),
            Err(e) => Err(Error::store("head", key, e)),
        }
    }
}

/// Write `data` to a sibling temp file and rename it over `path`
async fn replace_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        match fs::metadata(self.path_for(key)?).await {
            Ok(_) => Ok(Some(self.read_metadata(key).await?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::store("head", key, e)),
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let body = match fs::read(self.path_for(key)?).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::store("get", key, e)),
        };
        let metadata = self.read_metadata(key).await?;

        Ok(Some(StoredObject {
            body: Bytes::from(body),
            metadata,
        }))
    }

    async fn put_object(&self, key: &str, object: PutObject) -> Result<()> {
        if let Some(expected) = &object.payload_sha1 {
            let actual = sha1_base64(&object.body);
            if &actual != expected {
                return Err(Error::ChecksumMismatch {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let path = self.path_for(key)?;
        let metadata_path = self.metadata_path_for(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::store("put", key, e))?;
        }

        // Body before sidecar: a torn put leaves the old fingerprint, which
        // no longer matches and gets the block planned again
        replace_file(&path, &object.body)
            .await
            .map_err(|e| Error::store("put", key, e))?;
        let metadata = serde_json::to_vec(&object.metadata)?;
        replace_file(&metadata_path, &metadata)
            .await
            .map_err(|e| Error::store("put", key, e))?;

        Ok(())
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix.trim_matches('/'))?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::store("list", prefix, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::store("list", prefix, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| Error::store("list", prefix, e))?
                .is_dir();
            if is_dir {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        Ok(names)
    }
}
