use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;
use tracing::debug;

use crate::config::ContentConfig;
use crate::error::{Result, TrackerError};
use crate::model::{Photo, PhotoId, Record};

/// Removes generated artifacts of photos that left the catalog.
#[async_trait]
pub trait AssetCleaner: Send + Sync {
    async fn remove(&self, photos: &[Record<Photo>]) -> Result<()>;
}

pub struct NoopCleaner;

#[async_trait]
impl AssetCleaner for NoopCleaner {
    async fn remove(&self, _photos: &[Record<Photo>]) -> Result<()> {
        Ok(())
    }
}

/// Thumbnails live at `<thumb_dir>/<thumb_type>/<photo_id>.jpg`.
pub struct ThumbnailCleaner {
    thumb_dir: PathBuf,
    thumb_types: Vec<String>,
}

impl ThumbnailCleaner {
    pub fn new(thumb_dir: impl Into<PathBuf>, thumb_types: Vec<String>) -> Self {
        Self {
            thumb_dir: thumb_dir.into(),
            thumb_types,
        }
    }

    pub fn thumbnail_paths(&self, id: PhotoId) -> Vec<PathBuf> {
        self.thumb_types
            .iter()
            .map(|kind| self.thumb_dir.join(kind).join(format!("{id}.jpg")))
            .collect()
    }

    fn remove_files(paths: Vec<PathBuf>) -> Result<usize> {
        let mut removed = 0;
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(TrackerError::Io(err)),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl AssetCleaner for ThumbnailCleaner {
    async fn remove(&self, photos: &[Record<Photo>]) -> Result<()> {
        let paths: Vec<PathBuf> = photos
            .iter()
            .flat_map(|photo| self.thumbnail_paths(photo.id))
            .collect();
        let removed = task::spawn_blocking(move || Self::remove_files(paths))
            .await
            .map_err(|err| TrackerError::Io(std::io::Error::other(err)))??;
        debug!(photos = photos.len(), removed, "thumbnails removed");
        Ok(())
    }
}

pub fn cleaner_for(content: &ContentConfig) -> Arc<dyn AssetCleaner> {
    match &content.thumb_dir {
        Some(dir) => Arc::new(ThumbnailCleaner::new(dir.clone(), content.thumb_types.clone())),
        None => Arc::new(NoopCleaner),
    }
}
