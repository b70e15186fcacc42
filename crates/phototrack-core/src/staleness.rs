use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::assets::AssetCleaner;
use crate::catalog::Catalog;
use crate::error::Result;
use crate::model::{RecordId, SCAN_FLAG, UserId};

/// Reports how much crawl work is still outstanding.
#[async_trait]
pub trait PendingWork: Send + Sync {
    async fn outstanding(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkReport {
    pub albums: usize,
    pub photos: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub albums: usize,
    pub photos: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.albums == 0 && self.photos == 0
    }
}

/// Mark-and-sweep bookkeeping for scans.
///
/// Rows under a scan root are flagged before the root job is queued, unflagged
/// as jobs confirm them, and whatever is still flagged is deleted once the queue
/// has stayed drained for a full debounce window.
pub struct StalenessTracker {
    catalog: Catalog,
    assets: Arc<dyn AssetCleaner>,
    debounce: Duration,
    // bumped by every queue activity and every drain signal
    epoch: AtomicU64,
    // held while marking and while sweeping
    sweep: Mutex<()>,
}

impl StalenessTracker {
    pub fn new(catalog: Catalog, assets: Arc<dyn AssetCleaner>, debounce: Duration) -> Self {
        Self {
            catalog,
            assets,
            debounce,
            epoch: AtomicU64::new(0),
            sweep: Mutex::new(()),
        }
    }

    pub async fn mark(&self, user: &UserId, root: &Path) -> Result<MarkReport> {
        let _guard = self.sweep.lock().await;
        self.note_activity();
        let albums = self.catalog.albums.push_flag(user, root, SCAN_FLAG).await?;
        let photos = self.catalog.photos.push_flag(user, root, SCAN_FLAG).await?;
        debug!(user = %user, root = %root.display(), albums, photos, "subtree marked");
        Ok(MarkReport { albums, photos })
    }

    pub async fn confirm_albums(&self, ids: &[RecordId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.catalog.albums.pop_flag(ids, SCAN_FLAG).await
    }

    pub async fn confirm_photos(&self, ids: &[RecordId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.catalog.photos.pop_flag(ids, SCAN_FLAG).await
    }

    pub fn note_activity(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Handles a drain signal. Sweeps only if nothing happened during the debounce
    /// window and the queue reports no outstanding work; returns `None` otherwise.
    pub async fn on_drained(&self, pending: &dyn PendingWork) -> Result<Option<SweepReport>> {
        let seen = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.debounce).await;

        let _guard = self.sweep.lock().await;
        if self.epoch.load(Ordering::SeqCst) != seen {
            debug!("queue activity during drain window, sweep skipped");
            return Ok(None);
        }
        let outstanding = pending.outstanding().await?;
        if outstanding > 0 {
            debug!(outstanding, "queue not empty after drain window, sweep skipped");
            return Ok(None);
        }
        self.sweep_flagged().await.map(Some)
    }

    async fn sweep_flagged(&self) -> Result<SweepReport> {
        let albums = self.catalog.albums.delete_flagged(SCAN_FLAG).await?;
        let photos = self.catalog.photos.delete_flagged(SCAN_FLAG).await?;
        if !photos.is_empty() {
            if let Err(err) = self.assets.remove(&photos).await {
                warn!(error = %err, photos = photos.len(), "derived asset cleanup failed");
            }
        }

        let report = SweepReport {
            albums: albums.len(),
            photos: photos.len(),
        };
        info!(albums = report.albums, photos = report.photos, "stale rows swept");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::NoopCleaner;
    use crate::kv::memory::MemoryBackend;
    use crate::model::{Album, FileStat, Photo, Record};
    use mockall::mock;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    mock! {
        pub Cleaner {}

        #[async_trait]
        impl AssetCleaner for Cleaner {
            async fn remove(&self, photos: &[Record<crate::model::Photo>]) -> Result<()>;
        }
    }

    struct FixedPending(AtomicUsize);

    #[async_trait]
    impl PendingWork for FixedPending {
        async fn outstanding(&self) -> Result<usize> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    const WINDOW: Duration = Duration::from_secs(8);

    fn alice() -> UserId {
        UserId::from("alice")
    }

    /// root/2020/a.jpg plus an unrelated root owned by bob.
    async fn seeded_catalog() -> (Catalog, Vec<RecordId>) {
        let catalog = Catalog::from_backend(Arc::new(MemoryBackend::default()));
        let root = catalog
            .albums
            .insert(vec![Album::root(
                alice(),
                PathBuf::from("/photos/alice"),
                FileStat::default(),
            )])
            .await
            .expect("root")[0];
        let year = catalog
            .albums
            .insert(vec![Album::new(
                alice(),
                Some(root),
                PathBuf::from("/photos/alice/2020"),
                FileStat::default(),
            )])
            .await
            .expect("year")[0];
        let photo = catalog
            .photos
            .insert(vec![Photo::new(
                alice(),
                year,
                PathBuf::from("/photos/alice/2020/a.jpg"),
                FileStat::default(),
            )])
            .await
            .expect("photo")[0];
        catalog
            .albums
            .insert(vec![Album::root(
                UserId::from("bob"),
                PathBuf::from("/photos/bob"),
                FileStat::default(),
            )])
            .await
            .expect("bob");
        (catalog, vec![root, year, photo])
    }

    fn tracker(catalog: &Catalog) -> Arc<StalenessTracker> {
        Arc::new(StalenessTracker::new(
            catalog.clone(),
            Arc::new(NoopCleaner),
            WINDOW,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_subtree_is_swept_only_after_the_full_window() {
        let (catalog, _) = seeded_catalog().await;
        let staleness = tracker(&catalog);
        let marked = staleness
            .mark(&alice(), Path::new("/photos/alice"))
            .await
            .expect("mark");
        assert_eq!(marked, MarkReport { albums: 2, photos: 1 });

        let drain = tokio::spawn({
            let staleness = staleness.clone();
            async move {
                let pending = FixedPending(AtomicUsize::new(0));
                staleness.on_drained(&pending).await
            }
        });

        tokio::time::sleep(WINDOW - Duration::from_secs(1)).await;
        assert!(!drain.is_finished());
        assert_eq!(catalog.albums.all().await.expect("albums").len(), 3);
        assert_eq!(catalog.photos.all().await.expect("photos").len(), 1);

        let report = drain.await.expect("join").expect("drain").expect("swept");
        assert_eq!(report, SweepReport { albums: 2, photos: 1 });
        let left = catalog.albums.all().await.expect("albums");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].doc.user_id, UserId::from("bob"));
        assert!(catalog.photos.all().await.expect("photos").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_rows_survive_the_sweep() {
        let (catalog, ids) = seeded_catalog().await;
        let staleness = tracker(&catalog);
        staleness
            .mark(&alice(), Path::new("/photos/alice"))
            .await
            .expect("mark");
        staleness.confirm_albums(&ids[..1]).await.expect("confirm");

        let pending = FixedPending(AtomicUsize::new(0));
        let report = staleness
            .on_drained(&pending)
            .await
            .expect("drain")
            .expect("swept");
        assert_eq!(report, SweepReport { albums: 1, photos: 1 });

        let left: Vec<PathBuf> = catalog
            .albums
            .all()
            .await
            .expect("albums")
            .into_iter()
            .map(|record| record.doc.path)
            .collect();
        assert!(left.contains(&PathBuf::from("/photos/alice")));
        assert!(!left.contains(&PathBuf::from("/photos/alice/2020")));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_inside_the_window_cancels_the_sweep() {
        let (catalog, _) = seeded_catalog().await;
        let staleness = tracker(&catalog);
        staleness
            .mark(&alice(), Path::new("/photos/alice"))
            .await
            .expect("mark");

        let drain = tokio::spawn({
            let staleness = staleness.clone();
            async move {
                let pending = FixedPending(AtomicUsize::new(0));
                staleness.on_drained(&pending).await
            }
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        staleness.note_activity();

        assert_eq!(drain.await.expect("join").expect("drain"), None);
        assert_eq!(catalog.albums.all().await.expect("albums").len(), 3);

        let pending = FixedPending(AtomicUsize::new(0));
        let report = staleness.on_drained(&pending).await.expect("drain");
        assert_eq!(report, Some(SweepReport { albums: 2, photos: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_drain_signal_supersedes_an_older_one() {
        let (catalog, _) = seeded_catalog().await;
        let staleness = tracker(&catalog);
        staleness
            .mark(&alice(), Path::new("/photos/alice"))
            .await
            .expect("mark");

        let first = tokio::spawn({
            let staleness = staleness.clone();
            async move {
                let pending = FixedPending(AtomicUsize::new(0));
                staleness.on_drained(&pending).await
            }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = tokio::spawn({
            let staleness = staleness.clone();
            async move {
                let pending = FixedPending(AtomicUsize::new(0));
                staleness.on_drained(&pending).await
            }
        });

        assert_eq!(first.await.expect("join").expect("drain"), None);
        assert_eq!(catalog.albums.all().await.expect("albums").len(), 3);
        let report = second.await.expect("join").expect("drain");
        assert_eq!(report, Some(SweepReport { albums: 2, photos: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_jobs_block_the_sweep() {
        let (catalog, _) = seeded_catalog().await;
        let staleness = tracker(&catalog);
        staleness
            .mark(&alice(), Path::new("/photos/alice"))
            .await
            .expect("mark");

        let pending = FixedPending(AtomicUsize::new(1));
        assert_eq!(staleness.on_drained(&pending).await.expect("drain"), None);
        assert_eq!(catalog.photos.all().await.expect("photos").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn swept_photos_reach_the_asset_cleaner_once() {
        let (catalog, ids) = seeded_catalog().await;
        let mut cleaner = MockCleaner::new();
        let photo_id = ids[2];
        cleaner
            .expect_remove()
            .withf(move |photos| photos.len() == 1 && photos[0].id == photo_id)
            .times(1)
            .returning(|_| Ok(()));
        let staleness = StalenessTracker::new(catalog.clone(), Arc::new(cleaner), WINDOW);
        staleness
            .mark(&alice(), Path::new("/photos/alice"))
            .await
            .expect("mark");

        let pending = FixedPending(AtomicUsize::new(0));
        let report = staleness.on_drained(&pending).await.expect("drain");
        assert_eq!(report, Some(SweepReport { albums: 2, photos: 1 }));
    }
}
