//! Session/Endpoint registry (C3): §3 Session, Miner, Workers index; §4.3
//! component design.
//!
//! A three-map split — sessions, per-uid miner aggregates, per-login
//! worker-id index — that §4.6's payout fan-out and §7's
//! `xdag_getPoolWorkers` admin surface both read from.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, RwLock};

use crate::stratum::protocol::JobNotification;
use crate::template::{assemble_blob, Endpoint, Job, JobRing, Template};

pub type SessionId = u64;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A single TCP/TLS connection's live state (§3 Session).
pub struct Session {
    pub id: SessionId,
    pub login: String,
    pub worker_id: String,
    /// `login + "." + worker_id`, the key the Miner/workers-index maps use.
    pub uid: String,
    pub ip: IpAddr,
    pub endpoint: Arc<Endpoint>,
    pub jobs: RwLock<JobRing>,
    /// Latches the jobHash of the last job dispensed to this session, so a
    /// repeat `getjob` with nothing new can reply with an empty payload
    /// (§4.3: "or empty payload if hashlatch matches").
    pub last_job_hash: RwLock<Option<[u8; 32]>>,
    pub connected_at: Instant,
    pub last_activity: RwLock<Instant>,
    /// Outbound frames (job broadcasts, error replies) queued to the
    /// writer half running in the connection's own task.
    pub outbox: mpsc::UnboundedSender<String>,
}

impl Session {
    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    /// Build a fresh Job against `template` for this session, push it onto
    /// the job ring, latch `last_job_hash`, and return the reply payload
    /// (§4.2 step 5 / §4.3 login, getjob).
    pub async fn dispense_job(&self, template: &Template, pool_address_hash160: &[u8; 20]) -> crate::template::JobReply {
        let extra_nonce = self.endpoint.next_extra_nonce();
        let blob = assemble_blob(&template.buffer, extra_nonce, &self.endpoint.instance_id, pool_address_hash160);
        let job = Job::new(self.endpoint.next_job_id(), extra_nonce, template.job_hash, blob);
        let reply = job.to_reply(&self.endpoint.target_hex, &template.seed_hash);
        self.jobs.write().await.push(job);
        *self.last_job_hash.write().await = Some(template.job_hash);
        reply
    }
}

/// Per-uid runtime counters and hashrate-estimation bucket (§3 Miner).
pub struct Miner {
    pub login: String,
    pub worker_id: String,
    pub valid_shares: AtomicU64,
    pub invalid_shares: AtomicU64,
    pub stale_shares: AtomicU64,
    pub accepts: AtomicU64,
    pub rejects: AtomicU64,
    pub last_beat: AtomicU64,
    pub started_at: u64,
    /// unix-second → diff-sum, used for hashrate estimation. Entries older
    /// than 24h are evicted lazily on access (§3: "evicted lazily").
    hashrate_buckets: RwLock<HashMap<u64, u64>>,
}

const HASHRATE_WINDOW_SECS: u64 = 24 * 3600;

impl Miner {
    fn new(login: &str, worker_id: &str) -> Self {
        let now = unix_now();
        Self {
            login: login.to_string(),
            worker_id: worker_id.to_string(),
            valid_shares: AtomicU64::new(0),
            invalid_shares: AtomicU64::new(0),
            stale_shares: AtomicU64::new(0),
            accepts: AtomicU64::new(0),
            rejects: AtomicU64::new(0),
            last_beat: AtomicU64::new(now),
            started_at: now,
            hashrate_buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn heartbeat(&self) {
        self.last_beat.store(unix_now(), Ordering::Relaxed);
    }

    pub fn record_valid(&self, diff: u64) {
        self.valid_shares.fetch_add(1, Ordering::Relaxed);
        self.accepts.fetch_add(1, Ordering::Relaxed);
        self.record_diff_sample(diff);
    }

    pub fn record_invalid(&self) {
        self.invalid_shares.fetch_add(1, Ordering::Relaxed);
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_shares.fetch_add(1, Ordering::Relaxed);
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_diff_sample(&self, diff: u64) {
        let now = unix_now();
        if let Ok(mut buckets) = self.hashrate_buckets.try_write() {
            *buckets.entry(now).or_insert(0) += diff;
            buckets.retain(|ts, _| now.saturating_sub(*ts) <= HASHRATE_WINDOW_SECS);
        }
    }

    /// Sum of diff samples within `window_secs` of now, for a simple
    /// hashrate estimate (`sum(diff) / window_secs`), evicting anything
    /// older than [`HASHRATE_WINDOW_SECS`] on the way.
    pub async fn windowed_diff_sum(&self, window_secs: u64) -> u64 {
        let now = unix_now();
        let mut buckets = self.hashrate_buckets.write().await;
        buckets.retain(|ts, _| now.saturating_sub(*ts) <= HASHRATE_WINDOW_SECS);
        buckets
            .iter()
            .filter(|(ts, _)| now.saturating_sub(**ts) <= window_secs)
            .map(|(_, diff)| *diff)
            .sum()
    }
}

/// Registry of live sessions, per-uid miner aggregates, and the
/// login→worker-ids index (§3 Workers index). A thin `Arc<RwLock<_>>>`
/// triple rather than a sharded map: FNV-sharding is a hedge against lock
/// contention at a scale this pool does not need to assume up front; see
/// `DESIGN.md`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    miners: RwLock<HashMap<String, Arc<Miner>>>,
    workers: RwLock<HashMap<String, HashSet<String>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get-or-create the Miner for `uid` (§4.3 login: "create or reuse the
    /// Miner for uid").
    pub async fn miner_for(&self, login: &str, worker_id: &str) -> Arc<Miner> {
        let uid = format!("{}.{}", login, worker_id);
        {
            let miners = self.miners.read().await;
            if let Some(m) = miners.get(&uid) {
                return m.clone();
            }
        }
        let mut miners = self.miners.write().await;
        miners
            .entry(uid)
            .or_insert_with(|| Arc::new(Miner::new(login, worker_id)))
            .clone()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        {
            let mut workers = self.workers.write().await;
            workers.entry(session.login.clone()).or_default().insert(session.worker_id.clone());
        }
        self.sessions.write().await.insert(session.id, session);
    }

    pub async fn remove(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Broadcast an outbound JSON-RPC notification line to every live
    /// session (§4.2 step 5, the Job Fabric's fan-out on template change).
    pub async fn broadcast(&self, line: &str) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let _ = session.outbox.send(line.to_string());
        }
    }

    /// Dispense a fresh Job against `template` to every live session and
    /// push its `job` notification onto the session's outbox (§4.2 step 5:
    /// "each session's extraNonce is bumped and a fresh Job pushed onto its
    /// ring"). A session whose outbox has closed (its writer task already
    /// exited on a socket error) is dropped from the registry here rather
    /// than waiting for the idle reaper.
    pub async fn broadcast_job(&self, template: &Template, pool_address_hash160: &[u8; 20]) {
        let live: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut dead = Vec::new();
        for session in live {
            let reply = session.dispense_job(template, pool_address_hash160).await;
            let notif = JobNotification::new(serde_json::to_value(&reply).unwrap_or(serde_json::Value::Null));
            if session.outbox.send(notif.to_line()).is_err() {
                dead.push(session.id);
            }
        }
        if !dead.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in dead {
                sessions.remove(&id);
            }
        }
    }

    /// Worker ids registered for `login` (§3 Workers index; read by the
    /// admin `xdag_getPoolWorkers` surface and, per §9's open question, by
    /// equal-mode reward distribution instead of the source's single-key
    /// `SCAN`).
    pub async fn workers_for(&self, login: &str) -> Vec<String> {
        self.workers.read().await.get(login).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Snapshot for the admin `xdag_getPoolWorkers` surface (§6): one row
    /// per uid with its live counters.
    pub async fn worker_snapshot(&self) -> Vec<WorkerSnapshot> {
        let miners = self.miners.read().await;
        let mut out = Vec::with_capacity(miners.len());
        for miner in miners.values() {
            out.push(WorkerSnapshot {
                login: miner.login.clone(),
                worker_id: miner.worker_id.clone(),
                valid_shares: miner.valid_shares.load(Ordering::Relaxed),
                invalid_shares: miner.invalid_shares.load(Ordering::Relaxed),
                stale_shares: miner.stale_shares.load(Ordering::Relaxed),
                last_beat: miner.last_beat.load(Ordering::Relaxed),
            });
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub login: String,
    pub worker_id: String,
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub stale_shares: u64,
    pub last_beat: u64,
}

pub type SharedSessionRegistry = Arc<SessionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(id: SessionId, login: &str, worker_id: &str) -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Session {
            id,
            login: login.to_string(),
            worker_id: worker_id.to_string(),
            uid: format!("{}.{}", login, worker_id),
            ip: "127.0.0.1".parse().unwrap(),
            endpoint: Arc::new(Endpoint::new(1000)),
            jobs: RwLock::new(JobRing::default()),
            last_job_hash: RwLock::new(None),
            connected_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            outbox: tx,
        })
    }

    #[tokio::test]
    async fn insert_tracks_worker_index() {
        let reg = SessionRegistry::new();
        let s1 = new_session(reg.alloc_id(), "miner1", "rig1");
        let s2 = new_session(reg.alloc_id(), "miner1", "rig2");
        reg.insert(s1.clone()).await;
        reg.insert(s2.clone()).await;

        let workers = reg.workers_for("miner1").await;
        assert_eq!(workers.len(), 2);
        assert!(workers.contains(&"rig1".to_string()));
        assert!(workers.contains(&"rig2".to_string()));
    }

    #[tokio::test]
    async fn miner_for_reuses_existing_entry() {
        let reg = SessionRegistry::new();
        let m1 = reg.miner_for("miner1", "0").await;
        m1.record_valid(1000);
        let m2 = reg.miner_for("miner1", "0").await;
        assert_eq!(m2.valid_shares.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn miner_counters_record_outcomes() {
        let miner = Miner::new("miner1", "0");
        miner.record_valid(500);
        miner.record_invalid();
        miner.record_stale();
        assert_eq!(miner.valid_shares.load(Ordering::Relaxed), 1);
        assert_eq!(miner.invalid_shares.load(Ordering::Relaxed), 1);
        assert_eq!(miner.stale_shares.load(Ordering::Relaxed), 1);
        assert_eq!(miner.accepts.load(Ordering::Relaxed), 1);
        assert_eq!(miner.rejects.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn windowed_diff_sum_reflects_recent_samples() {
        let miner = Miner::new("miner1", "0");
        miner.record_valid(1000);
        miner.record_valid(2000);
        let sum = miner.windowed_diff_sum(3600).await;
        assert_eq!(sum, 3000);
    }
}
