//! Content digests and key derivation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

/// Base64 MD5 of `body`, as sent in the `Content-MD5` header.
pub fn content_md5(body: &[u8]) -> String {
    STANDARD.encode(Md5::digest(body))
}

/// Hex MD5 of `body`, the ETag a store assigns to a single-part object.
pub fn md5_hex(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

/// Object key for a remote path: the path without its leading slash.
pub fn object_key(remote_path: &str) -> &str {
    remote_path.trim_start_matches('/')
}
