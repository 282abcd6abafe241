//! Cache filename tokens.
//!
//! Local cache directories and files are never named after user-supplied
//! remote paths. The cache layer generates fixed-length alphanumeric
//! tokens instead, and the privileged side only ever joins tokens that
//! pass [`CacheName::parse`], so no traversal or special character can
//! reach its path arithmetic.

use std::fmt;
use std::path::PathBuf;

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::ProtocolError;

/// Length of every generated cache name.
pub const NAME_LEN: usize = 32;

/// A validated cache directory or file token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheName(String);

impl CacheName {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        let name = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NAME_LEN)
            .map(char::from)
            .collect();
        Self(name)
    }

    /// Validates `raw` against the token shape.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if is_valid_name(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(ProtocolError::InvalidName(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns `true` if `raw` is exactly [`NAME_LEN`] ASCII alphanumerics.
pub fn is_valid_name(raw: &str) -> bool {
    raw.len() == NAME_LEN && raw.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// A cached file: parent directory token plus file token.
///
/// Rendered on the wire as `<dir>/<file>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachePath {
    pub dir: CacheName,
    pub file: CacheName,
}

impl CachePath {
    pub fn new(dir: CacheName, file: CacheName) -> Self {
        Self { dir, file }
    }

    /// Parses `<dir>/<file>`, validating both tokens.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let (dir, file) = raw
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidName(raw.to_string()))?;
        Ok(Self {
            dir: CacheName::parse(dir)?,
            file: CacheName::parse(file)?,
        })
    }

    /// Path relative to a cache root.
    pub fn relative(&self) -> PathBuf {
        PathBuf::from(self.dir.as_str()).join(self.file.as_str())
    }
}

impl fmt::Display for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir, self.file)
    }
}

/// Target of an ownership change: a cache directory or a cached file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheTarget {
    Directory(CacheName),
    File(CachePath),
}

impl CacheTarget {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if raw.contains('/') {
            CachePath::parse(raw).map(Self::File)
        } else {
            CacheName::parse(raw).map(Self::Directory)
        }
    }

    pub fn relative(&self) -> PathBuf {
        match self {
            Self::Directory(dir) => PathBuf::from(dir.as_str()),
            Self::File(path) => path.relative(),
        }
    }
}

impl fmt::Display for CacheTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(dir) => dir.fmt(f),
            Self::File(path) => path.fmt(f),
        }
    }
}
