use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::spawn_blocking;

use crate::error::{Result, TrackerError};

use super::{KvBackend, KvKey, KvNamespace, NamespaceCache};

pub struct SledBackend {
    db: Arc<sled::Db>,
    cache: Arc<NamespaceCache>,
}

impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|err| TrackerError::Catalog(format!("unable to open sled db: {err}")))?;
        Ok(Self::from_db(db))
    }

    pub fn from_db(db: sled::Db) -> Self {
        Self {
            db: Arc::new(db),
            cache: Arc::new(NamespaceCache::new()),
        }
    }

    async fn tree(&self, namespace: KvNamespace) -> Result<sled::Tree> {
        let db = self.db.clone();
        let cache = self.cache.clone();
        spawn_blocking(move || cache.get_or_insert(&db, namespace))
            .await
            .map_err(join_error)?
    }
}

fn join_error(err: tokio::task::JoinError) -> TrackerError {
    TrackerError::Catalog(format!("task join error: {err}"))
}

#[async_trait]
impl KvBackend for SledBackend {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(key.namespace).await?;
        let key_bytes = key.key.clone();
        spawn_blocking(move || {
            tree.get(key_bytes.as_bytes())
                .map(|opt| opt.map(|ivec| ivec.as_ref().to_vec()))
                .map_err(|err| TrackerError::Catalog(err.to_string()))
        })
        .await
        .map_err(join_error)?
    }

    async fn put(&self, key: &KvKey, value: Vec<u8>) -> Result<()> {
        let tree = self.tree(key.namespace).await?;
        let key_bytes = key.key.clone();
        spawn_blocking(move || {
            tree.insert(key_bytes.as_bytes(), value)
                .map(|_| ())
                .map_err(|err| TrackerError::Catalog(err.to_string()))
        })
        .await
        .map_err(join_error)?
    }

    async fn delete(&self, key: &KvKey) -> Result<()> {
        let tree = self.tree(key.namespace).await?;
        let key_bytes = key.key.clone();
        spawn_blocking(move || {
            tree.remove(key_bytes.as_bytes())
                .map(|_| ())
                .map_err(|err| TrackerError::Catalog(err.to_string()))
        })
        .await
        .map_err(join_error)?
    }

    async fn scan_prefix(
        &self,
        namespace: KvNamespace,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let tree = self.tree(namespace).await?;
        let prefix = prefix.to_owned();
        spawn_blocking(move || {
            let mut results = Vec::new();
            for item in tree.scan_prefix(prefix.as_bytes()) {
                let (key, value) = item.map_err(|err| TrackerError::Catalog(err.to_string()))?;
                results.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
            }
            Ok(results)
        })
        .await
        .map_err(join_error)?
    }

    async fn next_id(&self) -> Result<u64> {
        let db = self.db.clone();
        spawn_blocking(move || {
            db.generate_id()
                .map_err(|err| TrackerError::Catalog(err.to_string()))
        })
        .await
        .map_err(join_error)?
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|err| TrackerError::Catalog(err.to_string()))
    }
}
