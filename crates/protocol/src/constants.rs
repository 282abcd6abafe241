use std::time::Duration;

/// Maximum length of a single framed message, newline excluded.
///
/// Every message is a short command line; anything longer is treated as a
/// framing error rather than buffered.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Reply to a broker request that was carried out.
pub const ACK: &str = "ACK";

/// Reply to a broker request sent by a process other than the authorized one.
pub const NOT_AUTHORIZED: &str = "Not authorized";

/// Reply to a successful `CONNECT` handshake.
pub const CONNECTED: &str = "CONNECTED";

/// Reply to a successful adapter request.
pub const OK: &str = "OK";

/// Time allowed for the peer to answer a handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errno values carried in `ERROR <errno>` adapter replies.
pub mod errno {
    /// No such file or directory.
    pub const ENOENT: i32 = 2;
    /// I/O error: the transfer did not produce a cached file.
    pub const EIO: i32 = 5;
    /// Device or resource busy: a transfer in the other direction is pending.
    pub const EBUSY: i32 = 16;
    /// Invalid argument: the request could not be parsed.
    pub const EINVAL: i32 = 22;
}

/// Request verbs.
pub mod verbs {
    pub const CHOWN: &str = "CHOWN";
    pub const PUBLISH: &str = "PUBLISH";
    pub const CHUNK: &str = "CHUNK";
    pub const CONNECT: &str = "CONNECT";
    pub const CACHE: &str = "CACHE";
    pub const UPLOAD: &str = "UPLOAD";
}
