//! JSON-document collection
//!
//! Each kind lives in `<dir>/<kind>.json`. Every mutation rewrites the
//! document through a temporary file and an atomic rename. The collection
//! keeps the document in memory, so only the process holding the directory
//! lock may write through it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::store::memory::MemoryCollection;
use crate::store::{Collection, Record};

/// Write-through collection backed by a JSON file
pub struct FileCollection<R> {
    path: PathBuf,
    inner: MemoryCollection<R>,
    flush: Mutex<()>,
}

impl<R: Record> FileCollection<R> {
    /// Load `<dir>/<kind>.json`, starting empty if it does not exist
    ///
    /// # Errors
    /// Returns [`StoreError`] if an existing document cannot be read or parsed
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = document_path::<R>(dir);
        let entries = read_document(&path).await?;

        debug!(path = %path.display(), records = entries.len(), "opened collection");

        Ok(Self {
            path,
            inner: MemoryCollection::from_entries(entries),
            flush: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.flush.lock().await;

        let data = serde_json::to_vec_pretty(&self.inner.entries().await)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

pub(crate) fn document_path<R: Record>(dir: &Path) -> PathBuf {
    dir.join(format!("{}.json", R::KIND))
}

/// Parse a kind's document; a missing file is an empty collection
pub(crate) async fn read_document(path: &Path) -> Result<BTreeMap<String, Value>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl<R: Record> Collection<R> for FileCollection<R> {
    async fn find(&self, id: &str) -> Result<Option<R>, StoreError> {
        self.inner.find(id).await
    }

    async fn find_all(&self) -> Result<Vec<R>, StoreError> {
        self.inner.find_all().await
    }

    async fn save(&self, record: &R) -> Result<(), StoreError> {
        self.inner.save(record).await?;
        self.persist().await
    }

    async fn save_fields(&self, fields: &[&str], record: &R) -> Result<(), StoreError> {
        self.inner.save_fields(fields, record).await?;
        self.persist().await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let existed = self.inner.delete(id).await?;
        if existed {
            self.persist().await?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use shepherd_api::{Group, Host};

    use super::*;
    use crate::store::Db;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let groups = FileCollection::<Group>::open(dir.path()).await.unwrap();
            let mut web = Group::new("web");
            web.playbook = Some("base".to_string());
            web.add_host("web1");
            groups.save(&web).await.unwrap();
        }

        let groups = FileCollection::<Group>::open(dir.path()).await.unwrap();
        let web = groups.find("web").await.unwrap().unwrap();
        assert_eq!(web.playbook.as_deref(), Some("base"));
        assert_eq!(web.hosts, vec!["web1"]);
        assert!(dir.path().join("group.json").exists());
    }

    #[tokio::test]
    async fn test_delete_is_persisted() {
        let dir = tempfile::tempdir().unwrap();

        let hosts = FileCollection::<Host>::open(dir.path()).await.unwrap();
        hosts.save(&Host::new("web1")).await.unwrap();
        assert!(hosts.delete("web1").await.unwrap());

        let reopened = FileCollection::<Host>::open(dir.path()).await.unwrap();
        assert!(reopened.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("host.json"), b"{not json")
            .await
            .unwrap();

        let result = FileCollection::<Host>::open(dir.path()).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_directory_has_one_owner() {
        let dir = tempfile::tempdir().unwrap();

        let owner = Db::open_dir(dir.path()).await.unwrap();
        let second = Db::open_dir(dir.path()).await;
        assert!(matches!(second, Err(StoreError::Locked(_))));

        // Readers do not need the lock
        owner.hosts.save(&Host::new("web1")).await.unwrap();
        let view = Db::snapshot_dir(dir.path()).await.unwrap();
        assert!(view.hosts.exists("web1").await.unwrap());

        let clone = owner.clone();
        drop(owner);
        let still_held = Db::open_dir(dir.path()).await;
        assert!(matches!(still_held, Err(StoreError::Locked(_))));

        drop(clone);
        let next = Db::open_dir(dir.path()).await.unwrap();
        assert!(next.hosts.exists("web1").await.unwrap());
    }
}
