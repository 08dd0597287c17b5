use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Content identity of a blob: SHA-256 hash plus size in bytes.
///
/// Equality is structural. The digest of empty content is a valid identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub hash: String,
    pub size_bytes: u64,
}

impl Digest {
    pub fn of(content: &[u8]) -> Self {
        Self {
            hash: hex::encode(Sha256::digest(content)),
            size_bytes: content.len() as u64,
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// Incremental SHA-256 for content that arrives in chunks.
#[derive(Default)]
pub struct DigestBuilder {
    hasher: Sha256,
    size_bytes: u64,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size_bytes += chunk.len() as u64;
    }

    pub fn finish(self) -> Digest {
        Digest {
            hash: hex::encode(self.hasher.finalize()),
            size_bytes: self.size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_empty_content() {
        let digest = Digest::of(b"");
        assert_eq!(digest.size_bytes, 0);
        assert_eq!(
            digest.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn builder_matches_one_shot() {
        let mut builder = DigestBuilder::new();
        builder.update(b"hello ");
        builder.update(b"world");
        assert_eq!(builder.finish(), Digest::of(b"hello world"));
    }
}
