//! In-process share-blob deduper (§3 "Deduper (MinedShares)").
//!
//! Two generations of sets rotated on a 15-minute ticker: membership is
//! checked against both, insertion against only the current one. This is
//! the process-local guard against the *same* miner blob being submitted
//! twice within the replay window, ahead of the accountable Redis-side
//! bookkeeping in [`crate::validator`] (the Redis `submit/<jobHash>` set
//! records winning shares only, not every submission).

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

const ROTATE_INTERVAL: Duration = Duration::from_secs(15 * 60);

struct Generations {
    current: HashSet<String>,
    last: HashSet<String>,
}

/// Two-generation share-blob membership cache.
pub struct MinedShares {
    inner: Mutex<Generations>,
}

impl Default for MinedShares {
    fn default() -> Self {
        Self::new()
    }
}

impl MinedShares {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generations {
                current: HashSet::new(),
                last: HashSet::new(),
            }),
        }
    }

    /// Returns `true` if `key` was already present (in either generation);
    /// otherwise records it in the current generation and returns `false`.
    pub fn check_and_insert(&self, key: &str) -> bool {
        let mut g = self.inner.lock().unwrap();
        if g.current.contains(key) || g.last.contains(key) {
            return true;
        }
        g.current.insert(key.to_string());
        false
    }

    /// Rotate: current becomes last, a fresh empty set becomes current.
    /// Called every [`ROTATE_INTERVAL`] by [`Self::spawn_rotator`].
    pub fn rotate(&self) {
        let mut g = self.inner.lock().unwrap();
        g.last = std::mem::take(&mut g.current);
    }

    /// Spawn the periodic rotation ticker. Cancelled by dropping the
    /// returned `JoinHandle` or the process-wide cancellation signal.
    pub fn spawn_rotator(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ROTATE_INTERVAL);
            loop {
                ticker.tick().await;
                self.rotate();
                tracing::debug!("dedup: rotated share-blob generations");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_is_not_duplicate() {
        let d = MinedShares::new();
        assert!(!d.check_and_insert("abc"));
    }

    #[test]
    fn dedup_law_second_submit_is_duplicate() {
        let d = MinedShares::new();
        assert!(!d.check_and_insert("abc"));
        assert!(d.check_and_insert("abc"));
    }

    #[test]
    fn survives_one_rotation() {
        let d = MinedShares::new();
        assert!(!d.check_and_insert("abc"));
        d.rotate();
        assert!(d.check_and_insert("abc"), "must still be a duplicate from the 'last' generation");
    }

    #[test]
    fn forgotten_after_two_rotations() {
        let d = MinedShares::new();
        assert!(!d.check_and_insert("abc"));
        d.rotate();
        d.rotate();
        assert!(!d.check_and_insert("abc"), "dropped from both generations after two rotations");
    }
}
