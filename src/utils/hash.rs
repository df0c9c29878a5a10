use sha2::{Digest, Sha256};

/// Incremental SHA-256 for uploads written chunk by chunk.
#[derive(Default)]
pub struct StreamingHasher {
    hasher: Sha256,
    size: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finalize(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.size)
    }
}
