//! Process-wide shared state (§4: "component design" root object), wired up
//! once in `main` and handed to every task as an `Arc<PoolContext>`.
//!
//! The RPC client, job fabric, and session registry are sibling `Arc`s
//! rather than fields behind one shared lock, so a task touching one
//! doesn't block a task touching another.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::address;
use crate::config::Config;
use crate::dedup::MinedShares;
use crate::session::SharedSessionRegistry;
use crate::template::{Endpoint, SharedJobFabric};
use crate::upstream::UpstreamRpcClient;

pub struct PoolContext {
    /// Guards the mutable ration and threshold fields the admin API may
    /// update at runtime (§5 Concurrency: "a reader/writer lock guards the
    /// mutable ration and threshold fields"). Every consumer takes a single
    /// consistent snapshot via [`Self::config_snapshot`] rather than reading
    /// fields one at a time, so a dividend computation never mixes ration
    /// percentages from two different admin updates.
    pub config: RwLock<Config>,
    pub job_fabric: SharedJobFabric,
    pub endpoint: Arc<Endpoint>,
    pub sessions: SharedSessionRegistry,
    pub dedup: Arc<MinedShares>,
    pub redis: Mutex<ConnectionManager>,
    pub pool_address_hash160: [u8; 20],
    pub pool_keypair: Option<crate::payout::txblock::PoolKeypair>,
    pub rpc: UpstreamRpcClient,
    /// Outbound Submit frames for the upstream WebSocket bridge task (§4.1).
    /// The receiving half is handed to [`crate::upstream::run_bridge`] once,
    /// at startup.
    pub upstream_submit_tx: mpsc::UnboundedSender<String>,
    /// SHA-256 of the security password entered at startup (§6 Environment:
    /// "two prompts read from the controlling terminal"), checked by the
    /// admin `xdag_updatePoolConfig` surface rather than stored in plain
    /// text anywhere, including `pool_config.json`.
    pub admin_password_hash: [u8; 32],
}

impl PoolContext {
    pub async fn new(
        config: Config,
        upstream_submit_tx: mpsc::UnboundedSender<String>,
        admin_password: &str,
    ) -> anyhow::Result<Arc<Self>> {
        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(redis_client).await?;

        let pool_address_hash160 = if config.pool_address.is_empty() {
            [0u8; 20]
        } else {
            address::decode(&config.pool_address)?
        };

        let pool_keypair = if config.pool_private_key_hex.is_empty() {
            None
        } else {
            Some(crate::payout::txblock::PoolKeypair::from_hex(&config.pool_private_key_hex)?)
        };

        let job_fabric = Arc::new(crate::template::JobFabric::new(&config));
        let endpoint = Arc::new(Endpoint::new(config.difficulty));
        let rpc = UpstreamRpcClient::new(config.upstream_rpc_url.clone());

        let admin_password_hash: [u8; 32] = {
            use sha2::{Digest, Sha256};
            Sha256::digest(admin_password.as_bytes()).into()
        };

        Ok(Arc::new(Self {
            job_fabric,
            endpoint,
            sessions: Arc::new(crate::session::SessionRegistry::new()),
            dedup: Arc::new(MinedShares::new()),
            redis: Mutex::new(redis),
            pool_address_hash160,
            pool_keypair,
            rpc,
            upstream_submit_tx,
            admin_password_hash,
            config: RwLock::new(config),
        }))
    }

    /// Constant-time-ish comparison against the stored admin password hash
    /// (§6: `xdag_updatePoolConfig` is "authenticated with the
    /// encrypted-address password").
    pub fn check_admin_password(&self, candidate: &str) -> bool {
        use sha2::{Digest, Sha256};
        let candidate_hash: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        candidate_hash == self.admin_password_hash
    }

    pub async fn redis_conn(&self) -> ConnectionManager {
        self.redis.lock().await.clone()
    }

    /// A consistent clone of the current configuration, for any call site
    /// that needs several fields to agree with each other (reward math,
    /// payout chunking).
    pub async fn config_snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Applied by the admin `xdag_updatePoolConfig` surface (§6): updates
    /// only the ration percentages and payout threshold, re-validating the
    /// ration sum before committing.
    pub async fn update_rations(
        &self,
        pool_ration_percent: Option<f64>,
        fund_ration_percent: Option<f64>,
        reward_ration_percent: Option<f64>,
        direct_ration_percent: Option<f64>,
        payout_threshold: Option<f64>,
    ) -> anyhow::Result<Config> {
        let mut guard = self.config.write().await;
        let mut next = guard.clone();
        if let Some(v) = pool_ration_percent { next.pool_ration_percent = v; }
        if let Some(v) = fund_ration_percent { next.fund_ration_percent = v; }
        if let Some(v) = reward_ration_percent { next.reward_ration_percent = v; }
        if let Some(v) = direct_ration_percent { next.direct_ration_percent = v; }
        if let Some(v) = payout_threshold { next.payout_threshold = v; }
        next.validate_rations()?;
        *guard = next.clone();
        Ok(next)
    }
}
