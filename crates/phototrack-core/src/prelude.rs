pub use crate::assets::{AssetCleaner, NoopCleaner, ThumbnailCleaner, cleaner_for};
pub use crate::catalog::{Catalog, Collection, Document};
pub use crate::config::{RecursePolicy, RootConfig, TrackerConfig};
pub use crate::error::{Result, TrackerError};
pub use crate::model::{Album, AlbumId, Listing, Photo, PhotoId, Record, RecordId, UserId};
pub use crate::queue::{Job, JobQueue, LocalQueue, QueueEvent};
pub use crate::tracker::{Tracker, TrackerContext, TrackerEvent, TrackerSettings};
pub use crate::watcher::{FsChange, WatchHandle, WatchSynchronizer};
