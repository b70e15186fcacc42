use std::io;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::model::{Album, AlbumId, FileStat, Listing, Photo, UserId};
use crate::policy::PhotoFilter;
use crate::queue::{Job, JobHandler};

/// Lists one directory into album and photo candidates.
///
/// I/O failures never escape: the directory is reported as empty. During a scan
/// that makes everything previously catalogued under it stale, so it will be
/// swept once the queue drains.
pub struct DirectoryScanner {
    filter: PhotoFilter,
}

impl DirectoryScanner {
    pub fn new(filter: PhotoFilter) -> Self {
        Self { filter }
    }

    pub async fn list(&self, path: &Path, user: &UserId, parent: Option<AlbumId>) -> Listing {
        let result = match parent {
            None => Self::list_root(path, user).await,
            Some(parent) => self.list_path(path, user, parent).await,
        };

        match result {
            Ok(listing) => {
                debug!(
                    path = %path.display(),
                    albums = listing.albums.len(),
                    photos = listing.photos.len(),
                    "directory listed"
                );
                listing
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    user = %user,
                    error = %err,
                    "directory listing failed, treating it as empty"
                );
                Listing::default()
            }
        }
    }

    async fn list_root(path: &Path, user: &UserId) -> io::Result<Listing> {
        let stat = FileStat::read(path).await?;
        Ok(Listing {
            albums: vec![Album::root(user.clone(), path.to_path_buf(), stat)],
            photos: Vec::new(),
        })
    }

    async fn list_path(&self, path: &Path, user: &UserId, parent: AlbumId) -> io::Result<Listing> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut listing = Listing::default();

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name();
            let item_path = path.join(&name);

            if file_type.is_dir() && !PhotoFilter::is_hidden(&name.to_string_lossy()) {
                let stat = FileStat::read(&item_path).await?;
                listing
                    .albums
                    .push(Album::new(user.clone(), Some(parent), item_path, stat));
            } else if file_type.is_file() && self.filter.accepts(&item_path) {
                let stat = FileStat::read(&item_path).await?;
                listing
                    .photos
                    .push(Photo::new(user.clone(), parent, item_path, stat));
            }
        }

        listing.albums.sort_by(|a, b| a.path.cmp(&b.path));
        listing.photos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }
}

#[async_trait]
impl JobHandler for DirectoryScanner {
    async fn handle(&self, job: &Job) -> Listing {
        self.list(&job.path, &job.user_id, job.parent).await
    }
}
