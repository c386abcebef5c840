//! RandomX CPU-optimized hashing oracle.
//!
//! Thread-safe implementation using randomx-rs crate with auto-detected
//! optimal flags (JIT, HARD_AES, etc.).
//!
//! ## Key-install modes
//!
//! The Job Fabric rekeys this oracle whenever the upstream template's
//! `seedHash` changes, choosing one of two modes:
//!
//! - [`KeyMode::Slow`] (cache-only): ~50-400 H/s per thread, fast init, 256 MB RAM
//! - [`KeyMode::Fast`] (full dataset, `XDAGPOOL_RANDOMX_FULL=1`): ~500-2000 H/s
//!   per thread, 2 GB RAM, 30-60s init
//!
//! JIT compilation is always enabled when the CPU supports it.

use anyhow::{anyhow, Result};
use randomx_rs::{RandomXCache, RandomXDataset, RandomXFlag, RandomXVM};
use std::sync::Once;

static LOG_FLAGS_ONCE: Once = Once::new();

/// Key-install mode requested when rekeying the oracle for a new seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Cache-only VM: low memory, slower hashing.
    Slow,
    /// Full 2 GB dataset built up front: higher memory, faster hashing.
    Fast,
}

impl KeyMode {
    /// Resolve a mode from config/env, defaulting to `Slow`.
    pub fn from_env() -> Self {
        let use_full = std::env::var("XDAGPOOL_RANDOMX_FULL")
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                v == "1" || v == "true" || v == "yes"
            })
            .unwrap_or(false);
        if use_full { Self::Fast } else { Self::Slow }
    }
}

/// Detect optimal RandomX flags for this CPU.
///
/// `get_recommended_flags()` enables JIT + HARD_AES where available.
fn detect_flags(mode: KeyMode) -> RandomXFlag {
    let mut flags = RandomXFlag::get_recommended_flags();

    if mode == KeyMode::Fast {
        flags |= RandomXFlag::FLAG_FULL_MEM;
    }

    // HugePages (2 MB pages) — reduces TLB misses, 10-30% hashrate boost.
    // Requires: sysctl vm.nr_hugepages >= 1280 (for 2.5 GB)
    // and either root, CAP_IPC_LOCK, or memlock ulimit.
    // Auto-detect: if /proc/meminfo shows available huge pages, enable.
    // Override: XDAGPOOL_RANDOMX_HUGEPAGES=0 to force-disable.
    let hugepages_disabled = std::env::var("XDAGPOOL_RANDOMX_HUGEPAGES")
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "0" || v == "false" || v == "no"
        })
        .unwrap_or(false);

    if !hugepages_disabled {
        // On Linux, check if huge pages are actually available
        let hp_available = if cfg!(target_os = "linux") {
            std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|m| {
                    m.lines()
                        .find(|l| l.starts_with("HugePages_Free:"))
                        .and_then(|l| l.split_whitespace().nth(1))
                        .and_then(|v| v.parse::<u64>().ok())
                })
                .unwrap_or(0)
                > 0
        } else {
            // On macOS/other: try anyway, RandomX will fall back gracefully
            false
        };

        if hp_available {
            flags |= RandomXFlag::FLAG_LARGE_PAGES;
        }
    }

    LOG_FLAGS_ONCE.call_once(|| {
        let mode = if flags.contains(RandomXFlag::FLAG_FULL_MEM) { "FULL" } else { "LIGHT" };
        let jit = if flags.contains(RandomXFlag::FLAG_JIT) { "+JIT" } else { "" };
        let aes = if flags.contains(RandomXFlag::FLAG_HARD_AES) { "+HARD_AES" } else { "" };
        let hp = if flags.contains(RandomXFlag::FLAG_LARGE_PAGES) { "+HUGEPAGES" } else { "" };
        log::info!(
            "⚡ RandomX flags: 0x{:x} mode={}{}{}{} (get_recommended_flags + env)",
            flags.bits(), mode, jit, aes, hp
        );
    });

    flags
}

/// RandomX hasher (per-thread instance)
pub struct RandomXHasher {
    vm: RandomXVM,
    // Keep dataset alive for the lifetime of the VM (full mode).
    _dataset: Option<RandomXDataset>,
}

impl RandomXHasher {
    /// Create a new RandomX hasher keyed to `key` (the template's seed hash).
    ///
    /// Auto-detects optimal CPU flags (JIT, HARD_AES) and builds the full
    /// dataset instead of a cache-only VM when `mode` is [`KeyMode::Fast`].
    pub fn new(key: &[u8], mode: KeyMode) -> Result<Self> {
        let flags = detect_flags(mode);

        // Create cache from key (always needed)
        let cache = RandomXCache::new(flags, key)
            .map_err(|e| anyhow!("RandomX cache creation failed: {}", e))?;

        // Full mode: allocate 2 GB dataset from cache
        let (vm, dataset) = if flags.contains(RandomXFlag::FLAG_FULL_MEM) {
            let dataset = RandomXDataset::new(flags, cache.clone(), 0)
                .map_err(|e| anyhow!("RandomX dataset creation failed: {}", e))?;
            let vm = RandomXVM::new(flags, Some(cache), Some(dataset.clone()))
                .map_err(|e| anyhow!("RandomX VM (full) creation failed: {}", e))?;
            (vm, Some(dataset))
        } else {
            // Light mode: no dataset, uses cache directly (slower but less RAM)
            let vm = RandomXVM::new(flags, Some(cache), None)
                .map_err(|e| anyhow!("RandomX VM (light) creation failed: {}", e))?;
            (vm, None)
        };

        Ok(Self { vm, _dataset: dataset })
    }

    /// Compute RandomX hash
    pub fn hash(&mut self, input: &[u8]) -> Result<[u8; 32]> {
        let hash = self
            .vm
            .calculate_hash(input)
            .map_err(|e| anyhow!("RandomX hash calculation failed: {}", e))?;

        // Convert Vec<u8> to [u8; 32]
        let mut result = [0u8; 32];
        result.copy_from_slice(&hash[..32]);
        Ok(result)
    }

    /// Batch compute RandomX hashes using pipeline mode.
    ///
    /// `calculate_hash_set` uses RandomX's internal first/next pipeline,
    /// which overlaps execution of consecutive hashes for ~1.5-2× throughput
    /// compared to sequential `calculate_hash` calls.
    pub fn hash_batch(&self, inputs: &[Vec<u8>]) -> Result<Vec<[u8; 32]>> {
        if inputs.is_empty() {
            return Ok(vec![]);
        }

        // Build slice-of-slices for the FFI call
        let refs: Vec<&[u8]> = inputs.iter().map(|v| v.as_slice()).collect();
        let hashes = self
            .vm
            .calculate_hash_set(&refs)
            .map_err(|e| anyhow!("RandomX batch hash failed: {}", e))?;

        let mut results = Vec::with_capacity(hashes.len());
        for h in &hashes {
            if h.len() < 32 {
                return Err(anyhow!("RandomX batch: short hash ({}B)", h.len()));
            }
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&h[..32]);
            results.push(arr);
        }
        Ok(results)
    }
}

/// Validate that a key can be installed, at startup or on rekey.
pub fn init_randomx(key: &[u8], mode: KeyMode) -> Result<()> {
    log::info!("[RandomX] Validating key...");
    let _hasher = RandomXHasher::new(key, mode)?;
    let flags = detect_flags(mode);
    log::info!("[RandomX] Ready (mode={:?}, flags=0x{:x})", mode, flags.bits());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_randomx_init() {
        let key = b"xdagpool-test-key";
        assert!(init_randomx(key, KeyMode::Slow).is_ok());
    }

    #[test]
    fn test_randomx_hash() {
        let mut hasher = RandomXHasher::new(b"seed-a", KeyMode::Slow).unwrap();
        let input = b"template-preimage";
        let hash = hasher.hash(input).unwrap();
        assert_eq!(hash.len(), 32);

        // Hash should be deterministic for a fixed key+input.
        let hash2 = hasher.hash(input).unwrap();
        assert_eq!(hash, hash2);
    }

    #[test]
    fn test_randomx_different_inputs() {
        let mut hasher = RandomXHasher::new(b"seed-a", KeyMode::Slow).unwrap();
        let hash1 = hasher.hash(b"input1").unwrap();
        let hash2 = hasher.hash(b"input2").unwrap();
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_randomx_hasher_reuse() {
        let key = b"xdagpool-test-key";
        let mut hasher = RandomXHasher::new(key, KeyMode::Slow).unwrap();

        // Hash multiple inputs with same hasher
        let hash1 = hasher.hash(b"input1").unwrap();
        let hash2 = hasher.hash(b"input2").unwrap();
        let hash3 = hasher.hash(b"input1").unwrap();

        // Different inputs produce different hashes
        assert_ne!(hash1, hash2);

        // Same input is deterministic
        assert_eq!(hash1, hash3);
    }
}
