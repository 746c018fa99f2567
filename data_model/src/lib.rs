use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Algorithm tag prefixed to every content hash so the scheme is
/// self-describing and can change without ambiguity.
pub const HASH_ALGORITHM: &str = "sha256";

/// Renders a finished digest in the `sha256:<hex>` form used both as the
/// metadata record's fingerprint and as the object store key.
pub fn content_hash(hasher: Sha256) -> String {
    format!("{}:{:x}", HASH_ALGORITHM, hasher.finalize())
}

/// Per-file metadata record, created once per scan pass per file.
///
/// The `hash` field is a pure function of file content: two files with
/// identical bytes anywhere in the tree carry the same hash, which is what
/// makes blob deduplication work. The blob store key for a record is always
/// equal to its `hash`, so no separate foreign key is kept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub path: String,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub hash: String,
}
