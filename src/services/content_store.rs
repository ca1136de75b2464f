//! src/services/content_store.rs
//!
//! Content store capability plus the local-disk implementation. Blobs live
//! sharded beneath `base_path/{shard}/{shard}/{name}`; per-object attributes
//! (content type, read grants) live beneath `base_path/.attrs/` with the same
//! sharding so they never collide with asset names.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::naming::MAX_NAME_LEN;

#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object name `{0}`")]
    InvalidName(String),
    #[error("object `{name}` is not valid UTF-8 text")]
    NotText { name: String },
    #[error("attributes of `{name}` are corrupt: {source}")]
    CorruptAttributes {
        name: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ContentStoreResult<T> = Result<T, ContentStoreError>;

/// Durable blob storage keyed by name.
///
/// Every call is independent; there is no multi-call atomicity.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Write (or overwrite) a binary blob.
    async fn put(&self, name: &str, data: Bytes) -> ContentStoreResult<()>;

    /// Read a blob. Missing blobs are `NotFound`.
    async fn get(&self, name: &str) -> ContentStoreResult<Bytes>;

    async fn exists(&self, name: &str) -> ContentStoreResult<bool>;

    /// Remove a blob. Removing an absent blob succeeds.
    async fn delete(&self, name: &str) -> ContentStoreResult<()>;

    /// Write a text object and record its content type.
    async fn put_text(&self, name: &str, text: &str, content_type: &str)
    -> ContentStoreResult<()>;

    /// Read a text object. Missing objects are `NotFound`.
    async fn get_text(&self, name: &str) -> ContentStoreResult<String>;

    /// Drop every read grant on an object.
    async fn revoke_readers(&self, name: &str) -> ContentStoreResult<()>;

    /// Add read grants to an object.
    async fn grant_readers(&self, name: &str, users: &[String]) -> ContentStoreResult<()>;

    /// Current read grants; `None` when the object was never restricted.
    async fn readers(&self, name: &str) -> ContentStoreResult<Option<Vec<String>>>;

    /// Cheap write/read/delete round trip used by readiness checks.
    async fn probe(&self) -> ContentStoreResult<()>;
}

/// Attributes kept alongside a blob.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectAttrs {
    pub content_type: Option<String>,
    pub readers: Option<Vec<String>>,
}

const ATTRS_DIR: &str = ".attrs";

/// Content store backed by a local directory.
#[derive(Clone, Debug)]
pub struct DiskContentStore {
    /// Base directory on disk where blobs are stored.
    base_path: PathBuf,
}

impl DiskContentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject names that could escape the base directory.
    ///
    /// The pipeline only hands out sanitized names, so this is a backstop for
    /// direct callers such as the HTTP layer's path parameters.
    fn ensure_name_safe(&self, name: &str) -> ContentStoreResult<()> {
        let invalid = name.is_empty()
            || name.len() > MAX_NAME_LEN + 5
            || name.starts_with('.')
            || name
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\');
        if invalid {
            return Err(ContentStoreError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Two-level shard identifiers from the first two bytes of MD5(name).
    fn shards(name: &str) -> (String, String) {
        let digest = md5::compute(name);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(name);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    fn attrs_path(&self, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(name);
        let mut path = self.base_path.join(ATTRS_DIR);
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{}.json", name));
        path
    }

    /// Write bytes through a temp file, fsync, then rename into place so
    /// readers never observe a partial object.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> ContentStoreResult<()> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ContentStoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        if let Err(err) = file.write_all(data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ContentStoreError::Io(err));
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ContentStoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ContentStoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(path).await?;
                fs::rename(&tmp_path, path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ContentStoreError::Io(err));
            }
        }
        Ok(())
    }

    async fn load_attrs(&self, name: &str) -> ContentStoreResult<Option<ObjectAttrs>> {
        let path = self.attrs_path(name);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|source| {
                ContentStoreError::CorruptAttributes {
                    name: name.to_string(),
                    source,
                }
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ContentStoreError::Io(err)),
        }
    }

    async fn store_attrs(&self, name: &str, attrs: &ObjectAttrs) -> ContentStoreResult<()> {
        let payload = serde_json::to_vec(attrs).map_err(|source| {
            ContentStoreError::CorruptAttributes {
                name: name.to_string(),
                source,
            }
        })?;
        self.write_atomic(&self.attrs_path(name), &payload).await
    }

    /// Read-modify-write of an object's attributes. The object must exist.
    async fn update_attrs<F>(&self, name: &str, update: F) -> ContentStoreResult<()>
    where
        F: FnOnce(&mut ObjectAttrs) + Send,
    {
        self.ensure_name_safe(name)?;
        if !self.exists(name).await? {
            return Err(ContentStoreError::NotFound(name.to_string()));
        }
        let mut attrs = self.load_attrs(name).await?.unwrap_or_default();
        update(&mut attrs);
        self.store_attrs(name, &attrs).await
    }

    async fn remove_file_if_present(&self, path: &Path) -> ContentStoreResult<()> {
        match fs::remove_file(path).await {
            Ok(_) => {
                debug!("removed {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} already missing", path.display());
                Ok(())
            }
            Err(err) => Err(ContentStoreError::Io(err)),
        }
    }

    /// Remove empty shard directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ContentStore for DiskContentStore {
    async fn put(&self, name: &str, data: Bytes) -> ContentStoreResult<()> {
        self.ensure_name_safe(name)?;
        let path = self.object_path(name);
        self.write_atomic(&path, &data).await?;
        // An overwrite is a new generation of the object; grants do not carry over.
        self.remove_file_if_present(&self.attrs_path(name)).await?;
        debug!("stored {} ({} bytes) at {}", name, data.len(), path.display());
        Ok(())
    }

    async fn get(&self, name: &str) -> ContentStoreResult<Bytes> {
        self.ensure_name_safe(name)?;
        match fs::read(self.object_path(name)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ContentStoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(ContentStoreError::Io(err)),
        }
    }

    async fn exists(&self, name: &str) -> ContentStoreResult<bool> {
        self.ensure_name_safe(name)?;
        match fs::metadata(self.object_path(name)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ContentStoreError::Io(err)),
        }
    }

    async fn delete(&self, name: &str) -> ContentStoreResult<()> {
        self.ensure_name_safe(name)?;
        let object_path = self.object_path(name);
        self.remove_file_if_present(&object_path).await?;

        let attrs_path = self.attrs_path(name);
        self.remove_file_if_present(&attrs_path).await?;

        if let Some(parent) = object_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        if let Some(parent) = attrs_path.parent() {
            let attrs_root = self.base_path.join(ATTRS_DIR);
            self.prune_empty_dirs(parent, &attrs_root).await;
        }
        Ok(())
    }

    async fn put_text(
        &self,
        name: &str,
        text: &str,
        content_type: &str,
    ) -> ContentStoreResult<()> {
        self.put(name, Bytes::copy_from_slice(text.as_bytes())).await?;
        let content_type = content_type.to_string();
        self.update_attrs(name, move |attrs| attrs.content_type = Some(content_type))
            .await
    }

    async fn get_text(&self, name: &str) -> ContentStoreResult<String> {
        let bytes = self.get(name).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ContentStoreError::NotText {
            name: name.to_string(),
        })
    }

    async fn revoke_readers(&self, name: &str) -> ContentStoreResult<()> {
        self.update_attrs(name, |attrs| attrs.readers = Some(Vec::new()))
            .await
    }

    async fn grant_readers(&self, name: &str, users: &[String]) -> ContentStoreResult<()> {
        let users = users.to_vec();
        self.update_attrs(name, move |attrs| {
            let readers = attrs.readers.get_or_insert_with(Vec::new);
            for user in users {
                if !readers.contains(&user) {
                    readers.push(user);
                }
            }
        })
        .await
    }

    async fn readers(&self, name: &str) -> ContentStoreResult<Option<Vec<String>>> {
        self.ensure_name_safe(name)?;
        if !self.exists(name).await? {
            return Err(ContentStoreError::NotFound(name.to_string()));
        }
        Ok(self.load_attrs(name).await?.and_then(|attrs| attrs.readers))
    }

    async fn probe(&self) -> ContentStoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(ContentStoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DiskContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskContentStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_round_trip_and_overwrite() {
        let (_dir, store) = store();
        store.put("cat.png", Bytes::from_static(b"first")).await.unwrap();
        store.put("cat.png", Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(store.get("cat.png").await.unwrap(), Bytes::from_static(b"second"));
        assert!(store.exists("cat.png").await.unwrap());
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("nope.png").await,
            Err(ContentStoreError::NotFound(name)) if name == "nope.png"
        ));
        assert!(matches!(
            store.get_text("nope.json").await,
            Err(ContentStoreError::NotFound(_))
        ));
        assert!(!store.exists("nope.png").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_shards() {
        let (dir, store) = store();
        store.put("cat.png", Bytes::from_static(b"x")).await.unwrap();
        store.delete("cat.png").await.unwrap();
        store.delete("cat.png").await.unwrap();
        assert!(!store.exists("cat.png").await.unwrap());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "shard directories should be pruned");
    }

    #[tokio::test]
    async fn text_objects_record_content_type() {
        let (_dir, store) = store();
        store
            .put_text("cat.json", r#"{"title":"t","description":"d"}"#, "application/json")
            .await
            .unwrap();
        assert_eq!(
            store.get_text("cat.json").await.unwrap(),
            r#"{"title":"t","description":"d"}"#
        );
        let attrs = store.load_attrs("cat.json").await.unwrap().unwrap();
        assert_eq!(attrs.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn grants_replace_after_revoke() {
        let (_dir, store) = store();
        store.put("cat.png", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(store.readers("cat.png").await.unwrap(), None);

        store
            .grant_readers("cat.png", &["alice".into(), "bob".into(), "alice".into()])
            .await
            .unwrap();
        assert_eq!(
            store.readers("cat.png").await.unwrap(),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );

        store.revoke_readers("cat.png").await.unwrap();
        store.grant_readers("cat.png", &["carol".into()]).await.unwrap();
        assert_eq!(
            store.readers("cat.png").await.unwrap(),
            Some(vec!["carol".to_string()])
        );
    }

    #[tokio::test]
    async fn grants_on_missing_object_are_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.grant_readers("ghost.png", &["alice".into()]).await,
            Err(ContentStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn overwrite_resets_grants() {
        let (_dir, store) = store();
        store.put("cat.png", Bytes::from_static(b"x")).await.unwrap();
        store.grant_readers("cat.png", &["alice".into()]).await.unwrap();
        store.put("cat.png", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(store.readers("cat.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_drops_grants() {
        let (_dir, store) = store();
        store.put("cat.png", Bytes::from_static(b"x")).await.unwrap();
        store.grant_readers("cat.png", &["alice".into()]).await.unwrap();
        store.delete("cat.png").await.unwrap();
        store.put("cat.png", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(store.readers("cat.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unsafe_names_are_rejected() {
        let (_dir, store) = store();
        for name in ["", "../escape", "a/b", ".attrs", "a\\b"] {
            assert!(
                matches!(
                    store.put(name, Bytes::from_static(b"x")).await,
                    Err(ContentStoreError::InvalidName(_))
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn probe_leaves_no_files_behind() {
        let (dir, store) = store();
        store.probe().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
