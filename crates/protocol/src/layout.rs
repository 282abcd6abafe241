//! On-disk locations of cached files.
//!
//! The shared cache tree holds published files at
//! `<cache_root>/<dir>/<file>`. Transfers stage data in the private
//! in-progress area, which mirrors the same two-level layout. Multipart
//! chunks are carved into `<inprogress_root>/<dir>/<chunk>` where `<chunk>`
//! is a freshly generated token.

use std::path::{Path, PathBuf};

use crate::names::{CacheName, CachePath, CacheTarget};

/// Name of the in-progress area inside the cache root.
pub const INPROGRESS_DIR: &str = ".inprogress";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    cache_root: PathBuf,
    inprogress_root: PathBuf,
}

impl CacheLayout {
    /// Layout with the in-progress area nested under `cache_root`.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        let cache_root = cache_root.into();
        let inprogress_root = cache_root.join(INPROGRESS_DIR);
        Self {
            cache_root,
            inprogress_root,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn inprogress_root(&self) -> &Path {
        &self.inprogress_root
    }

    pub fn shared_dir(&self, dir: &CacheName) -> PathBuf {
        self.cache_root.join(dir.as_str())
    }

    pub fn shared_file(&self, path: &CachePath) -> PathBuf {
        self.cache_root.join(path.relative())
    }

    pub fn shared_target(&self, target: &CacheTarget) -> PathBuf {
        self.cache_root.join(target.relative())
    }

    pub fn inprogress_dir(&self, dir: &CacheName) -> PathBuf {
        self.inprogress_root.join(dir.as_str())
    }

    pub fn inprogress_file(&self, path: &CachePath) -> PathBuf {
        self.inprogress_root.join(path.relative())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inprogress_area_is_nested() {
        let layout = CacheLayout::new("/var/cache/cachefs");
        assert_eq!(
            layout.inprogress_root(),
            Path::new("/var/cache/cachefs/.inprogress")
        );

        let path = CachePath::new(CacheName::generate(), CacheName::generate());
        let shared = layout.shared_file(&path);
        let staged = layout.inprogress_file(&path);
        assert!(shared.starts_with(layout.cache_root()));
        assert!(staged.starts_with(layout.inprogress_root()));
        assert_eq!(shared.file_name(), staged.file_name());
        assert_eq!(
            layout.shared_target(&CacheTarget::Directory(path.dir.clone())),
            layout.shared_dir(&path.dir)
        );
    }
}
