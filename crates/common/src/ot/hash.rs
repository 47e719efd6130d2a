use sha1::{Digest, Sha1};

/// 20-byte content hash of a snapshot's UTF-8 bytes.
pub fn content_hash(snapshot: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(snapshot.as_bytes());
    hasher.finalize().into()
}

/// Lowercase hex form carried on updates for the optional post-apply check.
pub fn content_hash_hex(snapshot: &str) -> String {
    hex::encode(content_hash(snapshot))
}

#[cfg(test)]
mod tests {
    use super::{content_hash, content_hash_hex};

    #[test]
    fn hashes_are_stable_and_twenty_bytes() {
        assert_eq!(content_hash("").len(), 20);
        // Well-known SHA-1 vector.
        assert_eq!(content_hash_hex(""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        assert_eq!(
            content_hash_hex("The quick brown fox jumps over the lazy dog"),
            "2fd4e1c67a2d28fced849ee1bb76e7391b93eb12"
        );
    }

    #[test]
    fn hash_distinguishes_snapshots() {
        assert_ne!(content_hash("a"), content_hash("b"));
        assert_eq!(content_hash("same"), content_hash("same"));
    }
}
