//! Hash utilities for cache entry naming.
//!
//! Entry directories are keyed by xxHash64 of the normalized source path,
//! encoded as URL-safe base64 so the result is always a valid file name.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

/// Compute xxHash64 of a string and return it as an 11 character file-name-safe key.
pub fn path_key(normalized_path: &str) -> String {
    let hash = xxhash_rust::xxh64::xxh64(normalized_path.as_bytes(), 0);

    URL_SAFE_NO_PAD.encode(hash.to_le_bytes())
}
