use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assets::AssetCleaner;
use crate::catalog::Catalog;
use crate::config::WatcherSettings;
use crate::error::{Result, TrackerError};
use crate::model::{Album, AlbumId, FileStat, Photo, UserId};
use crate::policy::PhotoFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// A path-level change as reported by the OS. The entry kind is unknown for
/// renames and for backends that do not report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Added(PathBuf, Option<EntryKind>),
    Removed(PathBuf, Option<EntryKind>),
}

/// A change the catalog knows how to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    DirAdded(PathBuf),
    DirRemoved(PathBuf),
    FileAdded(PathBuf),
    FileRemoved(PathBuf),
}

/// Maps a raw notify event to the changes it implies below `root`.
///
/// Renames become a removal of the old path and an addition of the new one.
/// Data modifications, paths outside the root, the root itself, hidden entries
/// and entries deeper than `depth` are dropped.
pub fn classify(root: &Path, depth: usize, event: &Event) -> Vec<Observed> {
    let added = |kind: Option<EntryKind>| -> Vec<Observed> {
        event
            .paths
            .iter()
            .filter(|path| within(root, depth, path))
            .map(|path| Observed::Added(path.clone(), kind))
            .collect()
    };
    let removed = |kind: Option<EntryKind>| -> Vec<Observed> {
        event
            .paths
            .iter()
            .filter(|path| within(root, depth, path))
            .map(|path| Observed::Removed(path.clone(), kind))
            .collect()
    };

    match event.kind {
        EventKind::Create(CreateKind::Folder) => added(Some(EntryKind::Dir)),
        EventKind::Create(CreateKind::File) => added(Some(EntryKind::File)),
        EventKind::Create(_) => added(None),
        EventKind::Remove(RemoveKind::Folder) => removed(Some(EntryKind::Dir)),
        EventKind::Remove(RemoveKind::File) => removed(Some(EntryKind::File)),
        EventKind::Remove(_) => removed(None),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => removed(None),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => added(None),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::new();
            if let [from, to, ..] = event.paths.as_slice() {
                if within(root, depth, from) {
                    changes.push(Observed::Removed(from.clone(), None));
                }
                if within(root, depth, to) {
                    changes.push(Observed::Added(to.clone(), None));
                }
            }
            changes
        }
        EventKind::Modify(ModifyKind::Name(_)) => added(None),
        _ => Vec::new(),
    }
}

fn within(root: &Path, depth: usize, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let mut levels = 0;
    for component in relative.components() {
        let Component::Normal(name) = component else {
            return false;
        };
        if PhotoFilter::is_hidden(&name.to_string_lossy()) {
            return false;
        }
        levels += 1;
    }
    levels > 0 && levels <= depth
}

/// Settles the entry kind of an observed change without following symlinks.
/// An added path that is already gone is treated as removed.
async fn resolve(observed: Observed) -> Vec<FsChange> {
    match observed {
        Observed::Added(path, Some(EntryKind::Dir)) => vec![FsChange::DirAdded(path)],
        Observed::Added(path, Some(EntryKind::File)) => vec![FsChange::FileAdded(path)],
        Observed::Added(path, None) => match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => vec![FsChange::DirAdded(path)],
            Ok(meta) if meta.is_file() => vec![FsChange::FileAdded(path)],
            Ok(_) => Vec::new(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                vec![FsChange::DirRemoved(path.clone()), FsChange::FileRemoved(path)]
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "cannot stat changed path");
                Vec::new()
            }
        },
        Observed::Removed(path, Some(EntryKind::Dir)) => vec![FsChange::DirRemoved(path)],
        Observed::Removed(path, Some(EntryKind::File)) => vec![FsChange::FileRemoved(path)],
        Observed::Removed(path, None) => {
            vec![FsChange::DirRemoved(path.clone()), FsChange::FileRemoved(path)]
        }
    }
}

/// Applies live filesystem changes straight to the catalog.
///
/// Rows written here never carry the scan flag, so a concurrent sweep leaves
/// them alone. Changes whose parent album is not catalogued yet are dropped and
/// left for the next scan.
pub struct WatchSynchronizer {
    catalog: Catalog,
    assets: Arc<dyn AssetCleaner>,
    filter: PhotoFilter,
    settings: WatcherSettings,
}

impl WatchSynchronizer {
    pub fn new(
        catalog: Catalog,
        assets: Arc<dyn AssetCleaner>,
        filter: PhotoFilter,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            catalog,
            assets,
            filter,
            settings,
        }
    }

    /// Subscribes to `root` recursively. Watching stops when the handle is dropped.
    pub fn watch(self: &Arc<Self>, user: UserId, root: PathBuf) -> Result<WatchHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => warn!(error = %err, "filesystem watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|err| TrackerError::Watch(format!("failed to create watcher: {err}")))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|err| {
                TrackerError::Watch(format!("failed to watch {}: {err}", root.display()))
            })?;

        let sync = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for observed in classify(&root, sync.settings.depth, &event) {
                    for change in resolve(observed).await {
                        sync.dispatch(&user, change).await;
                    }
                }
            }
            debug!(root = %root.display(), "watch stream closed");
        });

        Ok(WatchHandle {
            _watcher: watcher,
            task,
        })
    }

    async fn dispatch(self: &Arc<Self>, user: &UserId, change: FsChange) {
        if let FsChange::FileAdded(_) = change {
            // settling can take seconds, keep the stream moving
            let sync = self.clone();
            let user = user.clone();
            tokio::spawn(async move { sync.apply_logged(&user, change).await });
        } else {
            self.apply_logged(user, change).await;
        }
    }

    async fn apply_logged(&self, user: &UserId, change: FsChange) {
        if let Err(err) = self.apply(user, change.clone()).await {
            warn!(change = ?change, error = %err, "failed to apply filesystem change");
        }
    }

    pub async fn apply(&self, user: &UserId, change: FsChange) -> Result<()> {
        match change {
            FsChange::DirAdded(path) => self.dir_added(user, &path).await,
            FsChange::DirRemoved(path) => self.dir_removed(user, &path).await,
            FsChange::FileAdded(path) => self.file_added(user, &path).await,
            FsChange::FileRemoved(path) => self.file_removed(user, &path).await,
        }
    }

    async fn dir_added(&self, user: &UserId, path: &Path) -> Result<()> {
        let Some(parent) = self.parent_album(user, path).await? else {
            return Ok(());
        };
        let stat = FileStat::read(path).await?;
        let album = Album::new(user.clone(), Some(parent), path.to_path_buf(), stat);
        match self.catalog.albums.insert_if_absent(album).await? {
            Some(_) => info!(path = %path.display(), user = %user, "album added"),
            None => debug!(path = %path.display(), "album already catalogued"),
        }
        Ok(())
    }

    async fn dir_removed(&self, user: &UserId, path: &Path) -> Result<()> {
        let removed = self.catalog.albums.delete_by_path(user, path).await?;
        if !removed.is_empty() {
            info!(path = %path.display(), user = %user, "album removed");
        }
        Ok(())
    }

    async fn file_added(&self, user: &UserId, path: &Path) -> Result<()> {
        if !self.filter.accepts(path) {
            return Ok(());
        }
        let Some(parent) = self.parent_album(user, path).await? else {
            return Ok(());
        };
        let stat = self.await_write_finish(path).await?;
        if self.catalog.photos.find_by_path(user, path).await?.is_some() {
            debug!(path = %path.display(), "photo already catalogued");
            return Ok(());
        }
        // a rename can report the same target more than once
        let photo = Photo::new(user.clone(), parent, path.to_path_buf(), stat);
        match self.catalog.photos.insert_if_absent(photo).await? {
            Some(_) => info!(path = %path.display(), user = %user, "photo added"),
            None => debug!(path = %path.display(), "photo already catalogued"),
        }
        Ok(())
    }

    async fn file_removed(&self, user: &UserId, path: &Path) -> Result<()> {
        let removed = self.catalog.photos.delete_by_path(user, path).await?;
        if removed.is_empty() {
            return Ok(());
        }
        info!(path = %path.display(), user = %user, photos = removed.len(), "photo removed");
        if let Err(err) = self.assets.remove(&removed).await {
            warn!(path = %path.display(), error = %err, "derived asset cleanup failed");
        }
        Ok(())
    }

    async fn parent_album(&self, user: &UserId, path: &Path) -> Result<Option<AlbumId>> {
        let Some(dir) = path.parent() else {
            return Ok(None);
        };
        let parent = self.catalog.albums.find_by_path(user, dir).await?;
        if parent.is_none() {
            debug!(path = %path.display(), "parent album not catalogued, change dropped");
        }
        Ok(parent.map(|album| album.id))
    }

    /// Waits until the file's size and mtime stop changing for the settle window.
    async fn await_write_finish(&self, path: &Path) -> Result<FileStat> {
        let settle = self.settings.write_settle();
        let poll = self.settings.poll_interval();
        let mut last = FileStat::read(path).await?;
        let mut stable_since = Instant::now();
        loop {
            if stable_since.elapsed() >= settle {
                return Ok(last);
            }
            tokio::time::sleep(poll).await;
            let current = FileStat::read(path).await?;
            if current != last {
                last = current;
                stable_since = Instant::now();
            }
        }
    }
}

pub struct WatchHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
