//! Layered configuration, loaded the way the source pool's `config.rs` does:
//! hardcoded defaults, then environment overrides, then an optional JSON
//! file, then post-load validation.

use serde::Deserialize;

/// Reward-distribution mode (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardMode {
    Solo,
    Equal,
}

impl Default for RewardMode {
    fn default() -> Self {
        RewardMode::Equal
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Stratum listen address, e.g. `0.0.0.0:3333`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Admin HTTP listen address.
    #[serde(default = "default_api_listen")]
    pub api_listen: String,
    /// Redis connection string.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Upstream node WebSocket URL (the message bus of §6).
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Upstream JSON-RPC endpoint used for payout transaction submission.
    #[serde(default = "default_upstream_rpc_url")]
    pub upstream_rpc_url: String,

    /// Pool's own base58Check address, derived from `pool_private_key_hex`
    /// at load time if left empty.
    #[serde(default)]
    pub pool_address: String,
    /// Pool's secp256k1 private key, hex-encoded (32 bytes). Required to
    /// sign payout transaction blocks.
    #[serde(default)]
    pub pool_private_key_hex: String,
    /// Community-fund base58Check address (§4.6 step 4: the fund-ration
    /// slice is transferred here, out of the pool, on every confirmed
    /// block).
    #[serde(default)]
    pub fund_address: String,

    /// Per-endpoint static difficulty.
    #[serde(default = "default_difficulty")]
    pub difficulty: u64,
    /// Stratum read deadline, reset on every successful read.
    #[serde(default = "default_stratum_timeout_secs")]
    pub stratum_timeout_secs: u64,
    /// Max line length accepted from a miner socket (§4.3: 10 KiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// `fast` rekeys with the full RandomX dataset; `slow` stays cache-only.
    #[serde(default = "default_randomx_key_mode")]
    pub randomx_key_mode: String,

    /// Reward distribution mode.
    #[serde(default)]
    pub reward_mode: RewardMode,
    /// Pool fee, percent of block amount.
    #[serde(default = "default_pool_ration")]
    pub pool_ration_percent: f64,
    /// Community-fund slice, percent of block amount, transferred upstream.
    #[serde(default = "default_fund_ration")]
    pub fund_ration_percent: f64,
    /// Finder (lowest-hash submitter) slice, percent of block amount.
    #[serde(default = "default_reward_ration")]
    pub reward_ration_percent: f64,
    /// Slice split equally among all contributing miners (solo mode) or
    /// folded into the per-miner share (equal mode).
    #[serde(default = "default_direct_ration")]
    pub direct_ration_percent: f64,

    /// Minimum unpaid balance (display units) before a miner is paid out.
    #[serde(default = "default_payout_threshold")]
    pub payout_threshold: f64,
    /// Payout ticker interval.
    #[serde(default = "default_payout_interval_secs")]
    pub payout_interval_secs: u64,
    /// Upstream RPC confirmation-poll timeout for a sent payout.
    #[serde(default = "default_payout_confirm_timeout_secs")]
    pub payout_confirm_timeout_secs: u64,
    /// Optional remark embedded in each payout transaction block. A
    /// non-empty remark reserves one of the ten recipient slots.
    #[serde(default)]
    pub payout_remark: String,

    /// Purge ticker interval.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
    /// Age beyond which purged records are dropped.
    #[serde(default = "default_purge_window_secs")]
    pub purge_window_secs: i64,
}

fn default_listen() -> String { "0.0.0.0:3333".to_string() }
fn default_api_listen() -> String { "0.0.0.0:8080".to_string() }
fn default_redis_url() -> String { "redis://127.0.0.1/".to_string() }
fn default_upstream_url() -> String { "ws://127.0.0.1:7001/".to_string() }
fn default_upstream_rpc_url() -> String { "http://127.0.0.1:7000/rpc".to_string() }
fn default_difficulty() -> u64 { 100_000 }
fn default_stratum_timeout_secs() -> u64 { 600 }
fn default_max_frame_bytes() -> usize { 10 * 1024 }
fn default_randomx_key_mode() -> String { "slow".to_string() }
fn default_pool_ration() -> f64 { 3.0 }
fn default_fund_ration() -> f64 { 5.0 }
fn default_reward_ration() -> f64 { 2.0 }
fn default_direct_ration() -> f64 { 10.0 }
fn default_payout_threshold() -> f64 { 10.0 }
fn default_payout_interval_secs() -> u64 { 600 }
fn default_payout_confirm_timeout_secs() -> u64 { 3600 }
fn default_purge_interval_secs() -> u64 { 900 }
fn default_purge_window_secs() -> i64 { 86_400 }

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_listen: default_api_listen(),
            redis_url: default_redis_url(),
            upstream_url: default_upstream_url(),
            upstream_rpc_url: default_upstream_rpc_url(),
            pool_address: String::new(),
            pool_private_key_hex: String::new(),
            fund_address: String::new(),
            difficulty: default_difficulty(),
            stratum_timeout_secs: default_stratum_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            randomx_key_mode: default_randomx_key_mode(),
            reward_mode: RewardMode::default(),
            pool_ration_percent: default_pool_ration(),
            fund_ration_percent: default_fund_ration(),
            reward_ration_percent: default_reward_ration(),
            direct_ration_percent: default_direct_ration(),
            payout_threshold: default_payout_threshold(),
            payout_interval_secs: default_payout_interval_secs(),
            payout_confirm_timeout_secs: default_payout_confirm_timeout_secs(),
            payout_remark: String::new(),
            purge_interval_secs: default_purge_interval_secs(),
            purge_window_secs: default_purge_window_secs(),
        }
    }
}

impl Config {
    /// Loads config the way the source pool's own loader does: hardcoded
    /// defaults, then environment overrides, then the JSON file named by
    /// the process's single command-line argument (§6 Environment: "a
    /// single command-line config-file path"), falling back to
    /// `pool_config.json` in the working directory when no argument is
    /// given so the pool still runs unattended under a supervisor.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = std::env::args().nth(1).unwrap_or_else(|| "pool_config.json".to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &str) -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("XDAGPOOL_LISTEN") { cfg.listen = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_API_LISTEN") { cfg.api_listen = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_REDIS_URL") { cfg.redis_url = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_UPSTREAM_URL") { cfg.upstream_url = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_UPSTREAM_RPC_URL") { cfg.upstream_rpc_url = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_POOL_PRIVATE_KEY") { cfg.pool_private_key_hex = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_POOL_ADDRESS") { cfg.pool_address = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_FUND_ADDRESS") { cfg.fund_address = v; }
        if let Ok(v) = std::env::var("XDAGPOOL_DIFFICULTY") {
            cfg.difficulty = v.parse().unwrap_or(cfg.difficulty);
        }
        if let Ok(v) = std::env::var("XDAGPOOL_PAYOUT_REMARK") { cfg.payout_remark = v; }

        if let Ok(txt) = std::fs::read_to_string(config_path) {
            match serde_json::from_str::<Config>(&txt) {
                Ok(mut file_cfg) => {
                    if file_cfg.pool_private_key_hex.is_empty() {
                        file_cfg.pool_private_key_hex = cfg.pool_private_key_hex.clone();
                    }
                    cfg = file_cfg;
                }
                Err(e) => {
                    tracing::warn!(path = %config_path, "failed to parse config file: {}", e);
                }
            }
        } else {
            tracing::debug!(path = %config_path, "no config file found, using defaults + environment overrides");
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Just the ration-sum and threshold invariants, re-checked on every
    /// admin-triggered runtime update (§6 `xdag_updatePoolConfig`) without
    /// re-running the mainnet startup safety check below.
    pub fn validate_rations(&self) -> anyhow::Result<()> {
        let total_rations = self.pool_ration_percent
            + self.fund_ration_percent
            + self.reward_ration_percent
            + self.direct_ration_percent;
        if total_rations > 100.0 {
            anyhow::bail!(
                "ration percentages sum to {:.2}, must be <= 100",
                total_rations
            );
        }
        if self.payout_threshold <= 0.0 {
            anyhow::bail!("payout_threshold must be positive");
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.validate_rations()?;
        let is_mainnet = std::env::var("XDAG_NETWORK")
            .unwrap_or_default()
            .eq_ignore_ascii_case("mainnet");
        if is_mainnet && (self.pool_private_key_hex.is_empty() || self.pool_address.is_empty()) {
            anyhow::bail!(
                "refusing to start on mainnet without a real pool address and private key"
            );
        }
        Ok(())
    }
}
