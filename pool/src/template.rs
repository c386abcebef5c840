//! Template, Endpoint and Job types, and the Job Fabric (C2): §3 data model,
//! §4.2 component design.
//!
//! An atomic `Arc<RwLock<Option<Template>>>` slot with change-detection
//! broadcasts fresh Jobs directly to every live session; each session
//! keeps its own capped `VecDeque` ring of the last four Jobs issued to it
//! (§3 Job invariant).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use xdagpool_core::algorithms::randomx::{KeyMode, RandomXHasher};

use crate::config::Config;

/// Maximum recent jobs retained per session (§3: "a bounded ring (size 4)").
pub const JOB_RING_SIZE: usize = 4;

/// The single currently-active job preimage (§3 Template).
#[derive(Debug, Clone)]
pub struct Template {
    pub job_hash: [u8; 32],
    pub seed_hash: [u8; 32],
    pub timestamp: u64,
    pub task_index: u64,
    /// The 32-byte preimage bytes copied verbatim into blob bytes 0..31.
    pub buffer: [u8; 32],
}

/// One listening port's static configuration and per-port sequence counters
/// (§3 Endpoint).
pub struct Endpoint {
    pub difficulty: u64,
    pub target_hex: String,
    pub instance_id: [u8; 4],
    job_sequence: AtomicU32,
    extra_nonce: AtomicU32,
}

impl Endpoint {
    pub fn new(difficulty: u64) -> Self {
        let instance_id: [u8; 4] = rand::random();
        Self {
            difficulty,
            target_hex: target_hex_from_difficulty(difficulty),
            instance_id,
            job_sequence: AtomicU32::new(0),
            extra_nonce: AtomicU32::new(0),
        }
    }

    pub fn next_job_id(&self) -> String {
        self.job_sequence.fetch_add(1, Ordering::Relaxed).to_string()
    }

    pub fn next_extra_nonce(&self) -> u32 {
        self.extra_nonce.fetch_add(1, Ordering::Relaxed)
    }
}

/// Standard 64-bit-style compact target: `u64::MAX / difficulty`, rendered
/// little-endian hex, mirroring the `shareU64`/`hashDiff` convention used
/// throughout §4.4.
pub fn target_hex_from_difficulty(difficulty: u64) -> String {
    let target = if difficulty == 0 { u64::MAX } else { u64::MAX / difficulty };
    hex::encode(target.to_le_bytes())
}

/// A per-session work unit (§3 Job).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub extra_nonce: u32,
    pub job_hash: [u8; 32],
    pub blob: [u8; 64],
    submitted_nonces: std::collections::HashSet<String>,
}

impl Job {
    /// Construct a freshly dispensed Job (§4.2 step 5 / §4.3 login and
    /// getjob): no nonce has been submitted against it yet.
    pub fn new(id: String, extra_nonce: u32, job_hash: [u8; 32], blob: [u8; 64]) -> Self {
        Self { id, extra_nonce, job_hash, blob, submitted_nonces: Default::default() }
    }

    /// `true` if `nonce` (lowercased hex) was already submitted on this Job;
    /// otherwise records it and returns `false`.
    pub fn check_and_submit(&mut self, nonce: &str) -> bool {
        if self.submitted_nonces.contains(nonce) {
            return true;
        }
        self.submitted_nonces.insert(nonce.to_string());
        false
    }
}

/// Outbound `{algo, job_id, blob, target, seed_hash}` payload (§4.3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobReply {
    pub algo: &'static str,
    pub job_id: String,
    pub blob: String,
    pub target: String,
    pub seed_hash: String,
}

impl Job {
    pub fn to_reply(&self, target_hex: &str, seed_hash: &[u8; 32]) -> JobReply {
        JobReply {
            algo: "rx/0",
            job_id: self.id.clone(),
            blob: hex::encode(self.blob),
            target: target_hex.to_string(),
            seed_hash: hex::encode(seed_hash),
        }
    }
}

/// Bounded ring of recently issued jobs (§3 Job invariant): at most one of
/// the four most recent jobs is current; older ones remain so in-flight
/// submits classify as stale rather than "job not found".
#[derive(Default)]
pub struct JobRing {
    jobs: VecDeque<Job>,
}

impl JobRing {
    pub fn push(&mut self, job: Job) {
        if self.jobs.len() >= JOB_RING_SIZE {
            self.jobs.pop_front();
        }
        self.jobs.push_back(job);
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn current(&self) -> Option<&Job> {
        self.jobs.back()
    }
}

/// Builds the 64-byte share blob for a session (§4.4 blob assembly).
///
/// Bytes 44..63 (the pool's address payload) are supplied by the caller so
/// this function has no dependency on [`crate::config::Config`]; kept as a
/// free function so it is directly unit-testable without constructing a
/// full pool context.
pub fn assemble_blob(
    template_buffer: &[u8; 32],
    extra_nonce: u32,
    instance_id: &[u8; 4],
    pool_address_hash160: &[u8; 20],
) -> [u8; 64] {
    let mut blob = [0u8; 64];
    blob[0..32].copy_from_slice(template_buffer);
    blob[32..36].copy_from_slice(&extra_nonce.to_be_bytes());
    blob[36..39].copy_from_slice(&instance_id[0..3]);
    // bytes 39..43 (miner nonce) are filled in by the validator on submit.
    blob[43] = instance_id[3];
    blob[44..64].copy_from_slice(pool_address_hash160);
    blob
}

/// The Job Fabric (C2): owns the single live [`Template`] and the exclusive
/// RandomX rekey/hash lock.
pub struct JobFabric {
    template: RwLock<Option<Template>>,
    hasher: Mutex<Option<RandomXHasher>>,
    key_mode: KeyMode,
}

impl JobFabric {
    pub fn new(cfg: &Config) -> Self {
        let key_mode = if cfg.randomx_key_mode.eq_ignore_ascii_case("fast") {
            KeyMode::Fast
        } else {
            KeyMode::Slow
        };
        Self {
            template: RwLock::new(None),
            hasher: Mutex::new(None),
            key_mode,
        }
    }

    pub async fn current(&self) -> Option<Template> {
        self.template.read().await.clone()
    }

    /// Apply an incoming Task (§4.2 steps 1-4). Returns the new [`Template`]
    /// if it replaced the current one, `None` if the `jobHash` was
    /// unchanged (dropped silently per step 2).
    pub async fn apply_task(
        &self,
        job_hash: [u8; 32],
        seed_hash: [u8; 32],
        timestamp: u64,
        task_index: u64,
        buffer: [u8; 32],
    ) -> anyhow::Result<Option<Template>> {
        {
            let current = self.template.read().await;
            if let Some(t) = current.as_ref() {
                if t.job_hash == job_hash {
                    return Ok(None);
                }
            }
        }

        let seed_changed = {
            let current = self.template.read().await;
            current.as_ref().map(|t| t.seed_hash != seed_hash).unwrap_or(true)
        };

        if seed_changed {
            // Rekey is blocking with respect to validation: hold the hasher
            // lock for the duration of the rebuild so no hash() call can
            // observe a half-installed VM.
            let mut guard = self.hasher.lock().await;
            let hasher = RandomXHasher::new(&seed_hash, self.key_mode)?;
            *guard = Some(hasher);
            tracing::info!("randomx oracle rekeyed for new seed");
        }

        let new_template = Template {
            job_hash,
            seed_hash,
            timestamp,
            task_index,
            buffer,
        };

        let mut slot = self.template.write().await;
        *slot = Some(new_template.clone());
        Ok(Some(new_template))
    }

    /// Hash `blob` through the (exclusively-locked) RandomX oracle.
    pub async fn hash(&self, blob: &[u8]) -> anyhow::Result<[u8; 32]> {
        let mut guard = self.hasher.lock().await;
        let hasher = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("randomx oracle not yet keyed"))?;
        hasher.hash(blob)
    }
}

pub type SharedJobFabric = Arc<JobFabric>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip_fixed_fields() {
        let buffer = [9u8; 32];
        let instance_id = [0xAA, 0xBB, 0xCC, 0xDD];
        let addr = [0x42u8; 20];
        let blob = assemble_blob(&buffer, 0x01020304, &instance_id, &addr);

        assert_eq!(&blob[0..32], &buffer[..]);
        assert_eq!(&blob[32..36], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&blob[36..39], &instance_id[0..3]);
        assert_eq!(blob[43], instance_id[3]);
        assert_eq!(&blob[44..64], &addr[..]);
    }

    #[test]
    fn job_ring_caps_at_four() {
        let mut ring = JobRing::default();
        for i in 0..6 {
            ring.push(Job {
                id: i.to_string(),
                extra_nonce: i,
                job_hash: [0; 32],
                blob: [0; 64],
                submitted_nonces: Default::default(),
            });
        }
        assert_eq!(ring.jobs.len(), JOB_RING_SIZE);
        assert!(ring.find_mut("0").is_none());
        assert!(ring.find_mut("5").is_some());
    }

    #[test]
    fn job_duplicate_nonce_detection() {
        let mut job = Job {
            id: "1".into(),
            extra_nonce: 0,
            job_hash: [0; 32],
            blob: [0; 64],
            submitted_nonces: Default::default(),
        };
        assert!(!job.check_and_submit("00000001"));
        assert!(job.check_and_submit("00000001"));
    }
}
