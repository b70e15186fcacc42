use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::assets::AssetCleaner;
use crate::catalog::{Catalog, Collection, Document};
use crate::config::{RecursePolicy, ScanSettings, TrackerConfig, WatcherSettings};
use crate::error::{Result, TrackerError};
use crate::merge::{Merge, MergeReport, merge};
use crate::model::{AlbumId, Listing, Record, RecordId, UserId};
use crate::policy::PhotoFilter;
use crate::queue::{Job, JobQueue, QueueEvent, QueuedJob};
use crate::scanner::DirectoryScanner;
use crate::staleness::{PendingWork, StalenessTracker, SweepReport};
use crate::watcher::{WatchHandle, WatchSynchronizer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    pub host: String,
    pub processes: usize,
    pub scan: ScanSettings,
    pub watcher: WatcherSettings,
    pub filter: PhotoFilter,
}

impl TrackerSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            host: config.proc.host.clone(),
            processes: config.proc.processes,
            scan: config.scan.clone(),
            watcher: config.watcher.clone(),
            filter: PhotoFilter::new(&config.allowed_extensions),
        }
    }
}

/// Everything a tracker instance owns; nothing is process-global.
pub struct TrackerContext {
    pub catalog: Catalog,
    pub queue: Arc<dyn JobQueue>,
    pub assets: Arc<dyn AssetCleaner>,
    pub settings: TrackerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Reconciled {
        path: PathBuf,
        albums: MergeReport,
        photos: MergeReport,
    },
    Swept(SweepReport),
    SweepSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Inserted,
    Remained,
    Updated,
}

/// A listed album together with the catalog row it was reconciled to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAlbum {
    pub id: AlbumId,
    pub path: PathBuf,
    pub resolution: Resolution,
}

/// Frontier step: the jobs a completed listing contributes to the crawl.
pub fn next_jobs(job: &Job, albums: &[ResolvedAlbum], policy: RecursePolicy) -> Vec<Job> {
    albums
        .iter()
        .filter(|album| match policy {
            RecursePolicy::All => true,
            RecursePolicy::Inserted => album.resolution == Resolution::Inserted,
        })
        .map(|album| Job::child(job.user_id.clone(), album.id, album.path.clone()))
        .collect()
}

struct Applied<T> {
    merge: Merge<T>,
    inserted: Vec<RecordId>,
}

impl<T: Document> Applied<T> {
    fn resolved(&self) -> Vec<ResolvedAlbum> {
        let resolved = |id: RecordId, doc: &T, resolution| ResolvedAlbum {
            id,
            path: doc.path().to_path_buf(),
            resolution,
        };
        let inserted = self
            .merge
            .insert
            .iter()
            .zip(&self.inserted)
            .map(|(doc, id)| resolved(*id, doc, Resolution::Inserted));
        let remained = self
            .merge
            .remain
            .iter()
            .map(|record| resolved(record.id, &record.doc, Resolution::Remained));
        let updated = self
            .merge
            .update
            .iter()
            .map(|record| resolved(record.id, &record.doc, Resolution::Updated));
        inserted.chain(remained).chain(updated).collect()
    }
}

struct Inner {
    catalog: Catalog,
    queue: Arc<dyn JobQueue>,
    assets: Arc<dyn AssetCleaner>,
    settings: TrackerSettings,
    staleness: StalenessTracker,
    in_flight: AtomicUsize,
    signal: broadcast::Sender<TrackerEvent>,
}

#[async_trait]
impl PendingWork for Inner {
    async fn outstanding(&self) -> Result<usize> {
        Ok(self.queue.count().await? + self.in_flight.load(Ordering::SeqCst))
    }
}

impl Inner {
    fn emit(&self, event: TrackerEvent) {
        let _ = self.signal.send(event);
    }

    fn dispatch(self: &Arc<Self>, event: QueueEvent) {
        match event {
            QueueEvent::Waiting(_) | QueueEvent::Active(_) => self.staleness.note_activity(),
            QueueEvent::Completed { entry, listing } => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let inner = self.clone();
                tokio::spawn(async move {
                    let path = entry.job.path.clone();
                    if let Err(err) = inner.complete(entry, listing).await {
                        error!(path = %path.display(), error = %err, "job reconciliation failed");
                    }
                    // the queue may have reported drained while this was still running
                    let last = inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1;
                    if last && matches!(inner.queue.count().await, Ok(0)) {
                        inner.drain();
                    }
                });
            }
            QueueEvent::Drained => self.drain(),
        }
    }

    fn drain(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.staleness.on_drained(inner.as_ref()).await {
                Ok(Some(report)) => inner.emit(TrackerEvent::Swept(report)),
                Ok(None) => inner.emit(TrackerEvent::SweepSkipped),
                Err(err) => error!(error = %err, "sweep failed"),
            }
        });
    }

    async fn complete(&self, entry: QueuedJob, listing: Listing) -> Result<()> {
        let job = &entry.job;

        let albums = reconcile(self.catalog.albums.as_ref(), job, listing.albums).await?;
        self.staleness
            .confirm_albums(&albums.merge.confirmed_ids())
            .await?;

        let photos = reconcile(self.catalog.photos.as_ref(), job, listing.photos).await?;
        self.staleness
            .confirm_photos(&photos.merge.confirmed_ids())
            .await?;

        for next in next_jobs(job, &albums.resolved(), self.settings.scan.recurse) {
            self.queue.add(entry.host.as_deref(), next).await?;
        }

        let (albums, photos) = (albums.merge.report(), photos.merge.report());
        info!(
            path = %job.path.display(),
            user = %job.user_id,
            albums_inserted = albums.inserted,
            albums_updated = albums.updated,
            photos_inserted = photos.inserted,
            photos_updated = photos.updated,
            "job reconciled"
        );
        self.emit(TrackerEvent::Reconciled {
            path: job.path.clone(),
            albums,
            photos,
        });
        Ok(())
    }
}

async fn reconcile<T: Document>(
    collection: &dyn Collection<T>,
    job: &Job,
    candidates: Vec<T>,
) -> Result<Applied<T>> {
    let existing: Vec<Record<T>> = collection.children(&job.user_id, job.parent).await?;
    let merge = merge(&existing, candidates);
    let inserted = collection.insert(merge.insert.clone()).await?;
    for record in &merge.update {
        collection.update(record.id, record.doc.clone()).await?;
    }
    Ok(Applied { merge, inserted })
}

/// Crawl scheduler: drives scans through the job queue and owns live watchers.
pub struct Tracker {
    inner: Arc<Inner>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    watches: Mutex<HashMap<(UserId, PathBuf), WatchHandle>>,
}

impl Tracker {
    pub async fn start(
        context: TrackerContext,
        mut events: mpsc::UnboundedReceiver<QueueEvent>,
    ) -> Result<Self> {
        let TrackerContext {
            catalog,
            queue,
            assets,
            settings,
        } = context;
        let (signal, _) = broadcast::channel(256);
        let staleness = StalenessTracker::new(
            catalog.clone(),
            assets.clone(),
            settings.scan.drain_debounce(),
        );
        let inner = Arc::new(Inner {
            catalog,
            queue,
            assets,
            settings,
            staleness,
            in_flight: AtomicUsize::new(0),
            signal,
        });

        let scanner = Arc::new(DirectoryScanner::new(inner.settings.filter.clone()));
        inner
            .queue
            .process(&inner.settings.host, inner.settings.processes, scanner)
            .await?;

        let event_loop = tokio::spawn({
            let inner = inner.clone();
            async move {
                while let Some(event) = events.recv().await {
                    inner.dispatch(event);
                }
                debug!("queue event stream closed");
            }
        });
        inner.queue.resume().await?;

        Ok(Self {
            inner,
            event_loop: Mutex::new(Some(event_loop)),
            watches: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.signal.subscribe()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Marks everything under `root` stale and queues the root listing.
    pub async fn scan(&self, user_id: &str, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        let user = require_user(user_id, root)?;
        info!(root = %root.display(), user = %user, "scan requested");

        let marked = self.inner.staleness.mark(&user, root).await?;
        debug!(albums = marked.albums, photos = marked.photos, "rows flagged for scan");
        self.inner
            .queue
            .add(
                Some(&self.inner.settings.host),
                Job::root(user, root.to_path_buf()),
            )
            .await
    }

    /// Starts applying live filesystem changes under `root`. Repeated calls for the
    /// same user and root keep the existing watcher.
    pub async fn watch(&self, user_id: &str, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        let user = require_user(user_id, root)?;
        let key = (user.clone(), root.to_path_buf());
        if self.watches.lock().contains_key(&key) {
            debug!(root = %root.display(), "already watching");
            return Ok(());
        }

        let synchronizer = Arc::new(WatchSynchronizer::new(
            self.inner.catalog.clone(),
            self.inner.assets.clone(),
            self.inner.settings.filter.clone(),
            self.inner.settings.watcher.clone(),
        ));
        let handle = synchronizer.watch(user, root.to_path_buf())?;
        info!(root = %root.display(), "watching");
        self.watches.lock().entry(key).or_insert(handle);
        Ok(())
    }

    /// Pauses the queue and drops every watcher. Running jobs finish.
    pub async fn stop(&self) -> Result<()> {
        self.inner.queue.pause().await?;
        self.watches.lock().clear();
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.stop().await?;
        self.inner.queue.close().await?;
        if let Some(event_loop) = self.event_loop.lock().take() {
            event_loop.abort();
        }
        self.inner.catalog.flush().await
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.lock().take() {
            event_loop.abort();
        }
    }
}

fn require_user(user_id: &str, root: &Path) -> Result<UserId> {
    if user_id.trim().is_empty() {
        return Err(TrackerError::MissingUser {
            root: root.to_path_buf(),
        });
    }
    Ok(UserId::from(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::NoopCleaner;
    use crate::model::SCAN_FLAG;
    use crate::queue::LocalQueue;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    struct Harness {
        tracker: Tracker,
        events: broadcast::Receiver<TrackerEvent>,
        queue: Arc<LocalQueue>,
        _catalog_dir: TempDir,
    }

    async fn harness(recurse: RecursePolicy) -> Harness {
        let catalog_dir = tempfile::tempdir().expect("catalog dir");
        let catalog = Catalog::open(catalog_dir.path()).expect("catalog");
        let (queue, queue_events) = LocalQueue::new();
        let queue = Arc::new(queue);
        let settings = TrackerSettings {
            host: "*".into(),
            processes: 2,
            scan: ScanSettings {
                drain_debounce_ms: 300,
                recurse,
            },
            watcher: WatcherSettings::default(),
            filter: PhotoFilter::default(),
        };
        let tracker = Tracker::start(
            TrackerContext {
                catalog,
                queue: queue.clone(),
                assets: Arc::new(NoopCleaner),
                settings,
            },
            queue_events,
        )
        .await
        .expect("start");
        let events = tracker.subscribe();
        Harness {
            tracker,
            events,
            queue,
            _catalog_dir: catalog_dir,
        }
    }

    /// Collects reconcile totals until the next sweep.
    async fn until_swept(
        events: &mut broadcast::Receiver<TrackerEvent>,
    ) -> (MergeReport, MergeReport, SweepReport) {
        let mut albums = MergeReport::default();
        let mut photos = MergeReport::default();
        loop {
            let event = timeout(Duration::from_secs(20), events.recv())
                .await
                .expect("sweep in time")
                .expect("event");
            match event {
                TrackerEvent::Reconciled {
                    albums: a,
                    photos: p,
                    ..
                } => {
                    albums += a;
                    photos += p;
                }
                TrackerEvent::Swept(report) => return (albums, photos, report),
                TrackerEvent::SweepSkipped => {}
            }
        }
    }

    fn photo_tree() -> TempDir {
        let dir = tempfile::tempdir().expect("photo dir");
        let year = dir.path().join("2020");
        fs::create_dir(&year).expect("mkdir 2020");
        fs::write(year.join("a.jpg"), b"jpeg").expect("write a.jpg");
        fs::write(year.join("notes.txt"), b"text").expect("write notes");
        fs::create_dir(dir.path().join(".trash")).expect("mkdir hidden");
        dir
    }

    #[tokio::test]
    async fn scan_builds_the_album_chain() {
        let photos_dir = photo_tree();
        let mut h = harness(RecursePolicy::All).await;

        h.tracker.scan("alice", photos_dir.path()).await.expect("scan");
        let (albums, photos, sweep) = until_swept(&mut h.events).await;
        assert_eq!(albums.inserted, 2);
        assert_eq!(photos.inserted, 1);
        assert!(sweep.is_empty());

        let catalog = h.tracker.catalog();
        let all_albums = catalog.albums.all().await.expect("albums");
        let all_photos = catalog.photos.all().await.expect("photos");
        assert_eq!(all_albums.len(), 2);
        assert_eq!(all_photos.len(), 1);

        let root = all_albums
            .iter()
            .find(|album| album.doc.parent.is_none())
            .expect("root album");
        assert_eq!(root.doc.name, "@");
        assert_eq!(root.doc.path, photos_dir.path());
        let year = all_albums
            .iter()
            .find(|album| album.doc.name == "2020")
            .expect("2020 album");
        assert_eq!(year.doc.parent, Some(root.id));
        assert_eq!(all_photos[0].doc.parent, year.id);
        assert_eq!(all_photos[0].doc.name, "a.jpg");
        assert!(all_albums.iter().all(|album| !album.has_flag(SCAN_FLAG)));
        assert!(all_photos.iter().all(|photo| !photo.has_flag(SCAN_FLAG)));
        assert_eq!(h.queue.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn rescan_without_changes_is_a_no_op() {
        let photos_dir = photo_tree();
        let mut h = harness(RecursePolicy::All).await;

        h.tracker.scan("alice", photos_dir.path()).await.expect("scan");
        until_swept(&mut h.events).await;

        h.tracker.scan("alice", photos_dir.path()).await.expect("rescan");
        let (albums, photos, sweep) = until_swept(&mut h.events).await;
        assert_eq!((albums.inserted, albums.updated), (0, 0));
        assert_eq!((photos.inserted, photos.updated), (0, 0));
        assert_eq!(albums.remained, 2);
        assert_eq!(photos.remained, 1);
        assert!(sweep.is_empty());
    }

    #[tokio::test]
    async fn rescan_sweeps_what_disappeared() {
        let photos_dir = photo_tree();
        let mut h = harness(RecursePolicy::All).await;

        h.tracker.scan("alice", photos_dir.path()).await.expect("scan");
        until_swept(&mut h.events).await;

        fs::remove_dir_all(photos_dir.path().join("2020")).expect("remove 2020");
        fs::create_dir(photos_dir.path().join("2021")).expect("mkdir 2021");
        h.tracker.scan("alice", photos_dir.path()).await.expect("rescan");
        let (albums, _, sweep) = until_swept(&mut h.events).await;

        assert_eq!(albums.inserted, 1);
        assert_eq!(sweep, SweepReport { albums: 1, photos: 1 });
        let names: Vec<String> = h
            .tracker
            .catalog()
            .albums
            .all()
            .await
            .expect("albums")
            .into_iter()
            .map(|album| album.doc.name)
            .collect();
        assert!(names.contains(&"2021".to_owned()));
        assert!(!names.contains(&"2020".to_owned()));
        assert!(h.tracker.catalog().photos.all().await.expect("photos").is_empty());
    }

    #[tokio::test]
    async fn unreadable_root_sweeps_its_whole_subtree() {
        let photos_dir = photo_tree();
        let mut h = harness(RecursePolicy::All).await;
        h.tracker.scan("alice", photos_dir.path()).await.expect("scan");
        until_swept(&mut h.events).await;

        let root = photos_dir.path().to_path_buf();
        drop(photos_dir);
        h.tracker.scan("alice", &root).await.expect("rescan");
        let (_, _, sweep) = until_swept(&mut h.events).await;

        assert_eq!(sweep, SweepReport { albums: 2, photos: 1 });
        assert!(h.tracker.catalog().albums.all().await.expect("albums").is_empty());
    }

    #[tokio::test]
    async fn inserted_only_recursion_leaves_known_albums_unlisted() {
        let photos_dir = photo_tree();
        let mut h = harness(RecursePolicy::Inserted).await;

        h.tracker.scan("alice", photos_dir.path()).await.expect("scan");
        until_swept(&mut h.events).await;
        assert_eq!(h.tracker.catalog().albums.all().await.expect("albums").len(), 2);

        h.tracker.scan("alice", photos_dir.path()).await.expect("rescan");
        let (albums, _, sweep) = until_swept(&mut h.events).await;

        assert_eq!(albums.remained, 1);
        assert_eq!(sweep, SweepReport { albums: 1, photos: 1 });
    }

    #[tokio::test]
    async fn scan_without_user_fails_before_queueing() {
        let photos_dir = photo_tree();
        let h = harness(RecursePolicy::All).await;

        let err = h
            .tracker
            .scan("  ", photos_dir.path())
            .await
            .expect_err("missing user");
        assert!(matches!(err, TrackerError::MissingUser { .. }));
        assert_eq!(h.queue.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn users_sharing_a_tree_keep_separate_catalogs() {
        let photos_dir = photo_tree();
        let mut h = harness(RecursePolicy::All).await;

        h.tracker.scan("alice", photos_dir.path()).await.expect("scan alice");
        until_swept(&mut h.events).await;
        h.tracker.scan("bob", photos_dir.path()).await.expect("scan bob");
        let (albums, photos, sweep) = until_swept(&mut h.events).await;

        assert_eq!(albums.inserted, 2);
        assert_eq!(photos.inserted, 1);
        assert!(sweep.is_empty());
        assert_eq!(h.tracker.catalog().albums.all().await.expect("albums").len(), 4);
    }

    #[test]
    fn frontier_follows_the_recurse_policy() {
        let job = Job::child(UserId::from("alice"), RecordId(1), PathBuf::from("/p"));
        let albums = vec![
            ResolvedAlbum {
                id: RecordId(2),
                path: PathBuf::from("/p/new"),
                resolution: Resolution::Inserted,
            },
            ResolvedAlbum {
                id: RecordId(3),
                path: PathBuf::from("/p/known"),
                resolution: Resolution::Remained,
            },
            ResolvedAlbum {
                id: RecordId(4),
                path: PathBuf::from("/p/touched"),
                resolution: Resolution::Updated,
            },
        ];

        let all = next_jobs(&job, &albums, RecursePolicy::All);
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|next| next.user_id == job.user_id));
        assert_eq!(all[1].parent, Some(RecordId(3)));
        assert_eq!(all[1].path, PathBuf::from("/p/known"));

        let inserted = next_jobs(&job, &albums, RecursePolicy::Inserted);
        assert_eq!(
            inserted,
            vec![Job::child(
                UserId::from("alice"),
                RecordId(2),
                PathBuf::from("/p/new")
            )]
        );
    }
}
