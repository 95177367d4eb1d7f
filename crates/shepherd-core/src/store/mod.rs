//! Persistence interface
//!
//! The durable store is an external collaborator. The core only relies on
//! the [`Collection`] contract, implemented once per record kind.

pub mod file;
mod lock;
pub mod memory;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use shepherd_api::{Deploy, Group, Host, Key, Playbook};

use crate::error::StoreError;
use crate::store::lock::DirLock;

pub use file::FileCollection;
pub use memory::MemoryCollection;

/// The closed set of persisted record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Host,
    Playbook,
    Group,
    Deploy,
    Key,
}

impl RecordKind {
    /// Stable lowercase name, used for file names
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Playbook => "playbook",
            Self::Group => "group",
            Self::Deploy => "deploy",
            Self::Key => "key",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted record with a natural string identity
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn record_id(&self) -> &str;
}

impl Record for Host {
    const KIND: RecordKind = RecordKind::Host;

    fn record_id(&self) -> &str {
        &self.name
    }
}

impl Record for Playbook {
    const KIND: RecordKind = RecordKind::Playbook;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Group {
    const KIND: RecordKind = RecordKind::Group;

    fn record_id(&self) -> &str {
        &self.name
    }
}

impl Record for Deploy {
    const KIND: RecordKind = RecordKind::Deploy;

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Key {
    const KIND: RecordKind = RecordKind::Key;

    fn record_id(&self) -> &str {
        &self.token
    }
}

/// Capability set every record kind is stored through
#[async_trait]
pub trait Collection<R: Record>: Send + Sync {
    /// Look up by natural id
    async fn find(&self, id: &str) -> Result<Option<R>, StoreError>;

    /// Every stored record
    async fn find_all(&self) -> Result<Vec<R>, StoreError>;

    /// Insert or fully replace
    async fn save(&self, record: &R) -> Result<(), StoreError>;

    /// Replace only the named top-level fields of an existing record
    ///
    /// Fields not listed keep their stored values, so writers owning
    /// disjoint field groups never overwrite each other.
    async fn save_fields(&self, fields: &[&str], record: &R) -> Result<(), StoreError>;

    /// Remove by id; returns whether the record existed
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Whether a record with `id` exists
    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.find(id).await?.is_some())
    }
}

/// One collection per record kind
#[derive(Clone)]
pub struct Db {
    pub hosts: Arc<dyn Collection<Host>>,
    pub playbooks: Arc<dyn Collection<Playbook>>,
    pub groups: Arc<dyn Collection<Group>>,
    pub deploys: Arc<dyn Collection<Deploy>>,
    pub keys: Arc<dyn Collection<Key>>,
    /// Held while any clone of a directory-backed `Db` is alive
    lock: Option<Arc<DirLock>>,
}

impl Db {
    /// Volatile store, lost on exit
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            hosts: Arc::new(MemoryCollection::<Host>::new()),
            playbooks: Arc::new(MemoryCollection::<Playbook>::new()),
            groups: Arc::new(MemoryCollection::<Group>::new()),
            deploys: Arc::new(MemoryCollection::<Deploy>::new()),
            keys: Arc::new(MemoryCollection::<Key>::new()),
            lock: None,
        }
    }

    /// JSON documents under `dir`, one per kind, owned by this process
    ///
    /// The directory stays locked until every clone of the returned `Db`
    /// is dropped.
    ///
    /// # Errors
    /// Returns [`StoreError::Locked`] if another `Db` holds the directory,
    /// or another [`StoreError`] if a document cannot be read
    pub async fn open_dir(dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(dir).await?;
        let lock = DirLock::acquire(dir)?;

        Ok(Self {
            hosts: Arc::new(FileCollection::<Host>::open(dir).await?),
            playbooks: Arc::new(FileCollection::<Playbook>::open(dir).await?),
            groups: Arc::new(FileCollection::<Group>::open(dir).await?),
            deploys: Arc::new(FileCollection::<Deploy>::open(dir).await?),
            keys: Arc::new(FileCollection::<Key>::open(dir).await?),
            lock: Some(Arc::new(lock)),
        })
    }

    /// In-memory copy of the documents under `dir`, without taking the lock
    ///
    /// Writes to the copy are never persisted.
    ///
    /// # Errors
    /// Returns [`StoreError`] if an existing document cannot be read
    pub async fn snapshot_dir(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            hosts: Arc::new(snapshot::<Host>(dir).await?),
            playbooks: Arc::new(snapshot::<Playbook>(dir).await?),
            groups: Arc::new(snapshot::<Group>(dir).await?),
            deploys: Arc::new(snapshot::<Deploy>(dir).await?),
            keys: Arc::new(snapshot::<Key>(dir).await?),
            lock: None,
        })
    }
}

async fn snapshot<R: Record>(dir: &Path) -> Result<MemoryCollection<R>, StoreError> {
    let entries = file::read_document(&file::document_path::<R>(dir)).await?;
    Ok(MemoryCollection::from_entries(entries))
}
