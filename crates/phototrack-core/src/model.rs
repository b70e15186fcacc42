use std::collections::BTreeSet;
use std::fmt;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::policy::{PhotoFilter, ROOT_ALBUM_NAME};

/// Processing flag carried by rows that a running scan has not reconfirmed yet.
pub const SCAN_FLAG: &str = "@scan";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type AlbumId = RecordId;
pub type PhotoId = RecordId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub modified_ms: u64,
    pub created_ms: Option<u64>,
    pub size: u64,
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            modified_ms: meta.modified().map(epoch_ms).unwrap_or_default(),
            created_ms: meta.created().ok().map(epoch_ms),
            size: meta.len(),
        }
    }

    pub async fn read(path: &Path) -> io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self::from_metadata(&meta))
    }
}

fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub user_id: UserId,
    pub parent: Option<AlbumId>,
    pub path: PathBuf,
    pub name: String,
    pub stat: FileStat,
}

impl Album {
    pub fn new(user_id: UserId, parent: Option<AlbumId>, path: PathBuf, stat: FileStat) -> Self {
        let name = file_name(&path);
        Self {
            user_id,
            parent,
            path,
            name,
            stat,
        }
    }

    pub fn root(user_id: UserId, path: PathBuf, stat: FileStat) -> Self {
        Self {
            user_id,
            parent: None,
            path,
            name: ROOT_ALBUM_NAME.to_owned(),
            stat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub user_id: UserId,
    pub parent: AlbumId,
    pub path: PathBuf,
    pub name: String,
    pub extension: String,
    pub stat: FileStat,
}

impl Photo {
    pub fn new(user_id: UserId, parent: AlbumId, path: PathBuf, stat: FileStat) -> Self {
        let name = file_name(&path);
        let extension = PhotoFilter::extension_of(&path).unwrap_or_default();
        Self {
            user_id,
            parent,
            path,
            name,
            extension,
            stat,
        }
    }
}

/// A catalog row: a document plus its catalog-assigned identity and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: RecordId,
    #[serde(default)]
    pub flags: BTreeSet<String>,
    pub doc: T,
}

impl<T> Record<T> {
    pub fn new(id: RecordId, doc: T) -> Self {
        Self {
            id,
            flags: BTreeSet::new(),
            doc,
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}

/// Candidate set produced by listing one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub albums: Vec<Album>,
    pub photos: Vec<Photo>,
}

impl Listing {
    pub fn is_empty(&self) -> bool {
        self.albums.is_empty() && self.photos.is_empty()
    }
}
