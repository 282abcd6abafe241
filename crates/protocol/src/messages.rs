//! Typed requests and replies for the three channel conversations.
//!
//! ```text
//! scheduler -> broker:   CHOWN <uid>:<gid>:<path>
//!                        PUBLISH <dir>:<file>
//!                        CHUNK <part>:<src>:<dst>
//! broker -> scheduler:   ACK | <rejection reason>
//!
//! scheduler -> adapter:  CONNECT <bucket>:<access_key>:<secret_key>
//! adapter -> scheduler:  CONNECTED | ERROR: <reason>
//!
//! adapter -> scheduler:  CACHE <remote-path> | UPLOAD <remote-path>
//! scheduler -> adapter:  OK | ERROR <errno>
//! ```
//!
//! Each message is one line; framing is handled by the channel crate.

use crate::constants::{ACK, CONNECTED, OK, verbs};
use crate::names::{CacheName, CachePath, CacheTarget};
use crate::ProtocolError;

/// Splits `line` into its verb and argument string.
fn split_verb(line: &str) -> Result<(&str, &str), ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((verb, args)) if !args.is_empty() => Ok((verb, args)),
        _ => Err(ProtocolError::Malformed(line.to_string())),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str) -> Result<T, ProtocolError> {
    field
        .parse()
        .map_err(|_| ProtocolError::InvalidNumber(field.to_string()))
}

/// Replaces line breaks so free-form text cannot break framing.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A privileged operation requested from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerRequest {
    /// Change ownership of a directory or file in the shared cache.
    Chown {
        uid: u32,
        gid: u32,
        target: CacheTarget,
    },
    /// Move a finished download from the in-progress area into the shared cache.
    Publish { dir: CacheName, file: CacheName },
    /// Copy one multipart byte range of a shared-cache file into the in-progress area.
    Chunk {
        part: u32,
        source: CachePath,
        dest: CachePath,
    },
}

impl BrokerRequest {
    pub fn encode(&self) -> String {
        match self {
            Self::Chown { uid, gid, target } => {
                format!("{} {uid}:{gid}:{target}", verbs::CHOWN)
            }
            Self::Publish { dir, file } => format!("{} {dir}:{file}", verbs::PUBLISH),
            Self::Chunk { part, source, dest } => {
                format!("{} {part}:{source}:{dest}", verbs::CHUNK)
            }
        }
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (verb, args) = split_verb(line)?;
        let fields: Vec<&str> = args.split(':').collect();
        match (verb, fields.as_slice()) {
            (verbs::CHOWN, [uid, gid, target]) => Ok(Self::Chown {
                uid: parse_number(uid)?,
                gid: parse_number(gid)?,
                target: CacheTarget::parse(target)?,
            }),
            (verbs::PUBLISH, [dir, file]) => Ok(Self::Publish {
                dir: CacheName::parse(dir)?,
                file: CacheName::parse(file)?,
            }),
            (verbs::CHUNK, [part, source, dest]) => Ok(Self::Chunk {
                part: parse_number(part)?,
                source: CachePath::parse(source)?,
                dest: CachePath::parse(dest)?,
            }),
            (verbs::CHOWN | verbs::PUBLISH | verbs::CHUNK, _) => {
                Err(ProtocolError::Malformed(line.to_string()))
            }
            _ => Err(ProtocolError::UnknownVerb(verb.to_string())),
        }
    }

    /// Verb used in logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Chown { .. } => verbs::CHOWN,
            Self::Publish { .. } => verbs::PUBLISH,
            Self::Chunk { .. } => verbs::CHUNK,
        }
    }
}

/// The broker's answer to a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerReply {
    Ack,
    Rejected(String),
}

impl BrokerReply {
    pub fn rejected(reason: impl AsRef<str>) -> Self {
        Self::Rejected(single_line(reason.as_ref()))
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Ack => ACK.to_string(),
            Self::Rejected(reason) => single_line(reason),
        }
    }

    pub fn decode(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == ACK {
            Self::Ack
        } else {
            Self::Rejected(line.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Opens an adapter link, naming the bucket and the credentials used for it.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl ConnectRequest {
    pub fn encode(&self) -> String {
        format!(
            "{} {}:{}:{}",
            verbs::CONNECT,
            self.bucket,
            self.access_key,
            self.secret_key
        )
    }

    /// Parses a `CONNECT` line. The secret key is the remainder after the
    /// second colon and may itself contain colons.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (verb, args) = split_verb(line)?;
        if verb != verbs::CONNECT {
            return Err(ProtocolError::UnknownVerb(verb.to_string()));
        }
        let mut fields = args.splitn(3, ':');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(bucket), Some(access_key), Some(secret_key)) if !bucket.is_empty() => {
                Ok(Self {
                    bucket: bucket.to_string(),
                    access_key: access_key.to_string(),
                    secret_key: secret_key.to_string(),
                })
            }
            _ => Err(ProtocolError::Malformed(verbs::CONNECT.to_string())),
        }
    }
}

/// Answer to a `CONNECT` handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReply {
    Connected,
    Error(String),
}

impl ConnectReply {
    pub fn encode(&self) -> String {
        match self {
            Self::Connected => CONNECTED.to_string(),
            Self::Error(reason) => format!("ERROR: {}", single_line(reason)),
        }
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == CONNECTED {
            return Ok(Self::Connected);
        }
        line.strip_prefix("ERROR:")
            .map(|reason| Self::Error(reason.trim().to_string()))
            .ok_or_else(|| ProtocolError::Malformed(line.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// A request from the filesystem adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterRequest {
    /// Make sure the object at `remote_path` is present in the shared cache.
    Cache { remote_path: String },
    /// Queue the locally modified object at `remote_path` for upload.
    Upload { remote_path: String },
}

impl AdapterRequest {
    pub fn encode(&self) -> String {
        match self {
            Self::Cache { remote_path } => format!("{} {remote_path}", verbs::CACHE),
            Self::Upload { remote_path } => format!("{} {remote_path}", verbs::UPLOAD),
        }
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let (verb, remote_path) = split_verb(line)?;
        let remote_path = validate_remote_path(remote_path)?;
        match verb {
            verbs::CACHE => Ok(Self::Cache { remote_path }),
            verbs::UPLOAD => Ok(Self::Upload { remote_path }),
            _ => Err(ProtocolError::UnknownVerb(verb.to_string())),
        }
    }

    pub fn remote_path(&self) -> &str {
        match self {
            Self::Cache { remote_path } | Self::Upload { remote_path } => remote_path,
        }
    }
}

/// Checks that a remote path is absolute within the bucket and not a directory.
pub fn validate_remote_path(path: &str) -> Result<String, ProtocolError> {
    if !path.starts_with('/') || path.ends_with('/') || path.contains('\0') {
        return Err(ProtocolError::InvalidPath(path.to_string()));
    }
    Ok(path.to_string())
}

/// Remote path of the directory holding `remote_path` (`/` at the top level).
pub fn remote_parent(remote_path: &str) -> &str {
    match remote_path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &remote_path[..idx],
    }
}

/// Answer to an adapter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterReply {
    Ok,
    Error(i32),
}

impl AdapterReply {
    pub fn encode(&self) -> String {
        match self {
            Self::Ok => OK.to_string(),
            Self::Error(errno) => format!("ERROR {errno}"),
        }
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == OK {
            return Ok(Self::Ok);
        }
        match line.strip_prefix("ERROR ") {
            Some(errno) => Ok(Self::Error(parse_number(errno)?)),
            None => Err(ProtocolError::Malformed(line.to_string())),
        }
    }
}
