use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "tif", "tiff", "bmp",
];

/// Name given to the album that anchors a scan root.
pub const ROOT_ALBUM_NAME: &str = "@";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoFilter {
    extensions: BTreeSet<String>,
}

impl PhotoFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { extensions }
    }

    pub fn extension_of(path: &Path) -> Option<String> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }

    pub fn allows_extension(&self, ext: &str) -> bool {
        self.extensions.contains(&ext.to_ascii_lowercase())
    }

    pub fn accepts(&self, path: &Path) -> bool {
        Self::extension_of(path).is_some_and(|ext| self.extensions.contains(&ext))
    }

    pub fn is_hidden(name: &str) -> bool {
        name.starts_with('.')
    }
}

impl Default for PhotoFilter {
    fn default() -> Self {
        Self::new(DEFAULT_PHOTO_EXTENSIONS)
    }
}
