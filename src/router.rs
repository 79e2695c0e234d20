//! Deterministic string-to-shard routing.
//!
//! The hash is an FxHash-style word fold over the UTF-8 bytes. Its output
//! must stay fixed across restarts and toolchain upgrades, so `std::hash`
//! hashers are not used.

/// Maps strings onto `[0, shard_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: usize,
}

impl ShardRouter {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[inline]
    pub fn shard_for(&self, value: &str) -> usize {
        (hash_bytes(value.as_bytes()) % self.shard_count as u64) as usize
    }
}

/// FxHash multiplier (good mixing properties)
const K: u64 = 0x517cc1b727220a95;

#[inline(always)]
fn hash_word(state: u64, word: u64) -> u64 {
    (state.rotate_left(5) ^ word).wrapping_mul(K)
}

/// Hash a byte slice, eight bytes at a time.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut state = 0u64;

    let mut chunks = bytes.chunks_exact(8);
    for chunk in chunks.by_ref() {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        state = hash_word(state, u64::from_le_bytes(word));
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut word = 0u64;
        for (i, &byte) in remainder.iter().enumerate() {
            word |= (byte as u64) << (i * 8);
        }
        state = hash_word(state, word);
    }

    // Length is folded in so that trailing zero bytes change the hash.
    hash_word(state, bytes.len() as u64)
}
