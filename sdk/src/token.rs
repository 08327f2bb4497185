//! Correlation token generation
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues tokens unique for the lifetime of the sequencer
///
/// Each sequencer picks a random 32-bit session nonce so tokens from two
/// device sessions are unlikely to collide on the platform side; uniqueness
/// within a session comes from the counter alone.
pub struct TokenSequencer {
    session: String,
    next: AtomicU64,
}

impl TokenSequencer {
    pub fn new() -> Self {
        let nonce: [u8; 4] = rand::random();
        Self {
            session: hex::encode(nonce),
            next: AtomicU64::new(0),
        }
    }

    /// Next token, safe to call from any thread
    pub fn next(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.session)
    }
}

impl Default for TokenSequencer {
    fn default() -> Self {
        Self::new()
    }
}
