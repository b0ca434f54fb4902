//! Content/password hashing (`hash(bytes) -> digest`). Backed by `sha2`,
//! exposed as base64 text since that is the wire representation checksync
//! and the database both use.

use base64::Engine;
use sha2::{Digest, Sha512};
use std::io::Read;
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// base64(SHA-512(bytes)).
pub fn hash_bytes(data: &[u8]) -> String {
    let digest = Sha512::digest(data);
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// base64(SHA-512(file contents)), streamed so large files don't need to be
/// buffered whole.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_is_stable() {
        let a = hash_bytes(b"hello");
        let b = hash_bytes(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, hash_bytes(b"world"));
    }

    #[test]
    fn hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"hello"));
    }
}
