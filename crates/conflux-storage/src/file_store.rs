use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use conflux_core::blob::{BlobError, BlobStore};
use tempfile::NamedTempFile;
use tracing::instrument;

const MAX_FILE_NAME: usize = 255;

/// File-backed blob store. One file per key, named by the URL-safe base64 of the
/// key; writes go through a temp file and an atomic rename.
///
/// Secret values arrive already sealed by the envelope manager, so blobs are
/// written as-is.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    #[instrument(skip_all, fields(key))]
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), BlobError> {
        if sanitize_key(key).len() > MAX_FILE_NAME {
            return Err(BlobError::Storage {
                reason: format!("key `{key}` is too long for the file store"),
            });
        }
        fs::create_dir_all(&self.root).map_err(storage_err)?;
        write_blob(&self.path_for(key), value)
    }

    #[instrument(skip_all, fields(key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        read_blob(&self.path_for(key), key)
    }

    #[instrument(skip_all, fields(key))]
    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }

    #[instrument(skip_all, fields(prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(err)),
        };

        let mut keys = Vec::new();
        for entry in dir {
            let entry = entry.map_err(storage_err)?;
            let name = entry.file_name();
            // temp files and foreign files do not decode; skip them
            let Some(key) = name.to_str().and_then(decode_key) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn write_blob(path: &Path, value: &[u8]) -> Result<(), BlobError> {
    let parent = path.parent().ok_or_else(|| BlobError::Storage {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(storage_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(storage_err)?;
    tmp.write_all(value).map_err(storage_err)?;
    tmp.flush().map_err(storage_err)?;
    tmp.as_file().sync_all().map_err(storage_err)?;
    tmp.persist(path).map_err(|e| storage_err(e.error))?;
    Ok(())
}

fn read_blob(path: &Path, key: &str) -> Result<Vec<u8>, BlobError> {
    let mut file = File::open(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            BlobError::NotFound {
                key: key.to_string(),
            }
        } else {
            storage_err(err)
        }
    })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(storage_err)?;
    Ok(buf)
}

fn sanitize_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(name).ok()?;
    String::from_utf8(bytes).ok()
}

fn storage_err<E: ToString>(err: E) -> BlobError {
    BlobError::Storage {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_writes_and_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileBlobStore::new(dir.path());

        let key = "entries/prod/db/password";
        store.put(key, b"{\"v\":1}").await.expect("put");
        assert_eq!(store.get(key).await.expect("get"), b"{\"v\":1}");

        store.put(key, b"{\"v\":2}").await.expect("overwrite");
        assert_eq!(store.get(key).await.expect("get"), b"{\"v\":2}");

        // keys with slashes never become nested directories
        assert!(store.path_for(key).parent() == Some(dir.path()));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileBlobStore::new(dir.path());
        let key = "k";
        store.put(key, b"v").await.expect("put");
        store.delete(key).await.expect("delete");
        store.delete(key).await.expect("delete again");

        let err = store.get(key).await.expect_err("should be missing");
        assert!(matches!(err, BlobError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_decodes_names_and_filters_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileBlobStore::new(dir.path());
        store.put("policies/b", b"1").await.unwrap();
        store.put("policies/a", b"2").await.unwrap();
        store.put("entries/prod/x", b"3").await.unwrap();
        fs::write(dir.path().join("not base64!"), b"junk").unwrap();

        assert_eq!(
            store.list("policies/").await.unwrap(),
            vec!["policies/a".to_string(), "policies/b".to_string()]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileBlobStore::new(dir.path().join("never-created"));
        assert!(store.list("").await.unwrap().is_empty());
    }
}
