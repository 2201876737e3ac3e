//! Cache keys, content digests and on-disk layout.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::http::{Request, RequestExt};

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Metadata key for the request's canonical URL.
pub fn cache_key(request: &Request) -> String {
    format!("md{}", sha256_hex(request.canonical_uri().as_bytes()))
}

/// Content-addressed key for a response body.
pub fn content_digest(body: &[u8]) -> String {
    format!("en{}", sha256_hex(body))
}

/// `root/md/xx/yy/zz/<rest>` for a key.
pub fn shard_path(root: &Path, key: &str) -> PathBuf {
    if key.len() < 9 || !key.is_ascii() {
        return root.join(key);
    }
    root.join(&key[..2])
        .join(&key[2..4])
        .join(&key[4..6])
        .join(&key[6..8])
        .join(&key[8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;

    fn get(uri: &str) -> Request {
        axum::http::Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    #[test]
    fn test_key_ignores_query_order() {
        assert_eq!(
            cache_key(&get("http://localhost/a?x=1&y=2")),
            cache_key(&get("http://localhost/a?y=2&x=1"))
        );
        assert_ne!(
            cache_key(&get("http://localhost/a")),
            cache_key(&get("https://localhost/a"))
        );
        assert!(cache_key(&get("http://localhost/")).starts_with("md"));
    }

    #[test]
    fn test_digest_is_content_addressed() {
        let digest = content_digest(b"hello");
        assert_eq!(
            digest,
            "en2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest, content_digest(b"hello"));
    }

    #[test]
    fn test_shard_path_layout() {
        let path = shard_path(Path::new("/cache"), "md0123456789");
        assert_eq!(path, PathBuf::from("/cache/md/01/23/45/6789"));
    }
}
