use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::kv::{KvBackend, KvCodec, KvKey, KvNamespace, KvStore, SledBackend};
use crate::model::{Album, AlbumId, Photo, Record, RecordId, UserId};

/// A catalog document addressed by owner and filesystem path.
pub trait Document: KvCodec + Clone + fmt::Debug {
    const NAMESPACE: KvNamespace;
    /// Holds the by-parent and by-path lookups for `NAMESPACE`.
    const INDEX: KvNamespace;

    fn user_id(&self) -> &UserId;
    fn parent(&self) -> Option<AlbumId>;
    fn path(&self) -> &Path;
    /// True when the filesystem-derived fields match and no rewrite is needed.
    fn same_physical(&self, other: &Self) -> bool;
}

impl Document for Album {
    const NAMESPACE: KvNamespace = KvNamespace::Album;
    const INDEX: KvNamespace = KvNamespace::AlbumIndex;

    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn parent(&self) -> Option<AlbumId> {
        self.parent
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn same_physical(&self, other: &Self) -> bool {
        self.name == other.name && self.stat == other.stat
    }
}

impl Document for Photo {
    const NAMESPACE: KvNamespace = KvNamespace::Photo;
    const INDEX: KvNamespace = KvNamespace::PhotoIndex;

    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn parent(&self) -> Option<AlbumId> {
        Some(self.parent)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn same_physical(&self, other: &Self) -> bool {
        self.name == other.name && self.extension == other.extension && self.stat == other.stat
    }
}

#[async_trait]
pub trait Collection<T: Document>: Send + Sync {
    async fn insert(&self, docs: Vec<T>) -> Result<Vec<RecordId>>;
    /// Inserts `doc` unless its owner already has a row at the same path.
    async fn insert_if_absent(&self, doc: T) -> Result<Option<RecordId>>;
    /// Overwrites the document of an existing row. Returns false if the row is gone.
    async fn update(&self, id: RecordId, doc: T) -> Result<bool>;
    async fn children(&self, user: &UserId, parent: Option<AlbumId>) -> Result<Vec<Record<T>>>;
    async fn find_by_path(&self, user: &UserId, path: &Path) -> Result<Option<Record<T>>>;
    /// Adds `flag` to every row of `user` at or below `prefix`.
    async fn push_flag(&self, user: &UserId, prefix: &Path, flag: &str) -> Result<usize>;
    async fn pop_flag(&self, ids: &[RecordId], flag: &str) -> Result<usize>;
    async fn delete_flagged(&self, flag: &str) -> Result<Vec<Record<T>>>;
    async fn delete_by_path(&self, user: &UserId, path: &Path) -> Result<Vec<Record<T>>>;
    async fn all(&self) -> Result<Vec<Record<T>>>;
}

const SEP: char = '\u{1f}';

fn path_text(path: &Path) -> String {
    path.components()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

fn parent_prefix(user: &UserId, parent: Option<AlbumId>) -> String {
    let parent = parent.map_or_else(|| "-".to_owned(), |id| format!("{:020}", id.0));
    format!("parent{SEP}{user}{SEP}{parent}{SEP}")
}

fn parent_entry<T: Document>(doc: &T, id: RecordId) -> String {
    format!("{}{:020}", parent_prefix(doc.user_id(), doc.parent()), id.0)
}

fn path_entry(user: &UserId, path: &Path) -> String {
    format!("path{SEP}{user}{SEP}{}", path_text(path))
}

/// Rows keyed by id, plus an index namespace mapping
/// `parent/<user>/<parent>/<id>` and `path/<user>/<path>` to row ids.
pub struct KvCollection<T, B: KvBackend> {
    store: KvStore<B>,
    // serialises read-modify-write cycles on this collection
    writes: Mutex<()>,
    _doc: PhantomData<fn() -> T>,
}

impl<T: Document, B: KvBackend> KvCollection<T, B> {
    pub fn new(store: KvStore<B>) -> Self {
        Self {
            store,
            writes: Mutex::new(()),
            _doc: PhantomData,
        }
    }

    fn key(id: RecordId) -> KvKey {
        KvKey::new(T::NAMESPACE, format!("{:020}", id.0))
    }

    fn index_key(entry: String) -> KvKey {
        KvKey::new(T::INDEX, entry)
    }

    async fn save(&self, record: &Record<T>) -> Result<()> {
        self.store.store(&Self::key(record.id), record).await
    }

    async fn load(&self, id: RecordId) -> Result<Option<Record<T>>> {
        self.store.load(&Self::key(id)).await
    }

    async fn load_many(&self, ids: Vec<RecordId>) -> Result<Vec<Record<T>>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn index(&self, record: &Record<T>) -> Result<()> {
        let by_parent = Self::index_key(parent_entry(&record.doc, record.id));
        let by_path = Self::index_key(path_entry(record.doc.user_id(), record.doc.path()));
        self.store.store(&by_parent, &record.id).await?;
        self.store.store(&by_path, &record.id).await
    }

    async fn unindex(&self, record: &Record<T>) -> Result<()> {
        self.store
            .remove(&Self::index_key(parent_entry(&record.doc, record.id)))
            .await?;
        let by_path = Self::index_key(path_entry(record.doc.user_id(), record.doc.path()));
        if self.store.load::<RecordId>(&by_path).await? == Some(record.id) {
            self.store.remove(&by_path).await?;
        }
        Ok(())
    }

    async fn insert_one(&self, doc: T) -> Result<RecordId> {
        let id = RecordId(self.store.backend().next_id().await?);
        let record = Record::new(id, doc);
        self.save(&record).await?;
        self.index(&record).await?;
        Ok(id)
    }

    async fn lookup_path(&self, user: &UserId, path: &Path) -> Result<Option<Record<T>>> {
        let by_path = Self::index_key(path_entry(user, path));
        match self.store.load::<RecordId>(&by_path).await? {
            Some(id) => self.load(id).await,
            None => Ok(None),
        }
    }

    async fn remove_record(&self, record: &Record<T>) -> Result<()> {
        self.unindex(record).await?;
        self.store.remove(&Self::key(record.id)).await
    }

    /// Rows of `user` whose path string starts with `prefix`; callers still
    /// check component-wise.
    async fn under_prefix(&self, user: &UserId, prefix: &Path) -> Result<Vec<Record<T>>> {
        let ids = self
            .store
            .load_prefix(T::INDEX, &path_entry(user, prefix))
            .await?;
        self.load_many(ids).await
    }
}

#[async_trait]
impl<T: Document, B: KvBackend> Collection<T> for KvCollection<T, B> {
    async fn insert(&self, docs: Vec<T>) -> Result<Vec<RecordId>> {
        let _guard = self.writes.lock().await;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert_one(doc).await?);
        }
        Ok(ids)
    }

    async fn insert_if_absent(&self, doc: T) -> Result<Option<RecordId>> {
        let _guard = self.writes.lock().await;
        if self.lookup_path(doc.user_id(), doc.path()).await?.is_some() {
            return Ok(None);
        }
        self.insert_one(doc).await.map(Some)
    }

    async fn update(&self, id: RecordId, doc: T) -> Result<bool> {
        let _guard = self.writes.lock().await;
        let Some(mut record) = self.load(id).await? else {
            return Ok(false);
        };
        self.unindex(&record).await?;
        record.doc = doc;
        self.save(&record).await?;
        self.index(&record).await?;
        Ok(true)
    }

    async fn children(&self, user: &UserId, parent: Option<AlbumId>) -> Result<Vec<Record<T>>> {
        let ids = self
            .store
            .load_prefix(T::INDEX, &parent_prefix(user, parent))
            .await?;
        self.load_many(ids).await
    }

    async fn find_by_path(&self, user: &UserId, path: &Path) -> Result<Option<Record<T>>> {
        self.lookup_path(user, path).await
    }

    async fn push_flag(&self, user: &UserId, prefix: &Path, flag: &str) -> Result<usize> {
        let _guard = self.writes.lock().await;
        let mut touched = 0;
        for mut record in self.under_prefix(user, prefix).await? {
            if record.doc.path().starts_with(prefix) && record.flags.insert(flag.to_owned()) {
                self.save(&record).await?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn pop_flag(&self, ids: &[RecordId], flag: &str) -> Result<usize> {
        let _guard = self.writes.lock().await;
        let mut touched = 0;
        for id in ids {
            if let Some(mut record) = self.load(*id).await? {
                if record.flags.remove(flag) {
                    self.save(&record).await?;
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    async fn delete_flagged(&self, flag: &str) -> Result<Vec<Record<T>>> {
        let _guard = self.writes.lock().await;
        let mut removed = Vec::new();
        for record in self.all().await? {
            if record.has_flag(flag) {
                self.remove_record(&record).await?;
                removed.push(record);
            }
        }
        Ok(removed)
    }

    async fn delete_by_path(&self, user: &UserId, path: &Path) -> Result<Vec<Record<T>>> {
        let _guard = self.writes.lock().await;
        let Some(record) = self.lookup_path(user, path).await? else {
            return Ok(Vec::new());
        };
        self.remove_record(&record).await?;
        Ok(vec![record])
    }

    async fn all(&self) -> Result<Vec<Record<T>>> {
        self.store.load_all(T::NAMESPACE).await
    }
}

/// Album and photo collections sharing one backend.
#[derive(Clone)]
pub struct Catalog {
    pub albums: Arc<dyn Collection<Album>>,
    pub photos: Arc<dyn Collection<Photo>>,
    backend: Arc<dyn KvBackend>,
}

impl Catalog {
    pub fn from_backend<B: KvBackend>(backend: Arc<B>) -> Self {
        let store = KvStore::new(backend.clone());
        Self {
            albums: Arc::new(KvCollection::<Album, B>::new(store.clone())),
            photos: Arc::new(KvCollection::<Photo, B>::new(store)),
            backend,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_backend(Arc::new(SledBackend::open(path)?)))
    }

    pub async fn flush(&self) -> Result<()> {
        self.backend.flush().await
    }
}
