//! Prometheus counters and gauges (§10 ambient stack: "Metrics").
//!
//! One `OnceLock`-per-metric accessor function per statistic, a thin
//! public `inc_*`/`set_*` wrapper around each, and a `render()` that walks
//! every family through `TextEncoder`.

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static SHARES_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static SHARES_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static SHARES_STALE: OnceLock<IntCounter> = OnceLock::new();
static SHARES_LOW_DIFF: OnceLock<IntCounter> = OnceLock::new();
static SHARES_DUPLICATE: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static UPSTREAM_RECONNECTS: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static PAYOUTS_SENT: OnceLock<IntCounter> = OnceLock::new();
static PAYOUTS_FAILED: OnceLock<IntCounter> = OnceLock::new();
static PAYOUT_RECIPIENTS_PAID: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static REDIS_UP: OnceLock<IntGauge> = OnceLock::new();

fn shares_accepted() -> &'static IntCounter {
    SHARES_ACCEPTED.get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted (block-candidate) shares").unwrap())
}

fn shares_rejected() -> &'static IntCounter {
    SHARES_REJECTED.get_or_init(|| IntCounter::new("shares_rejected_total", "Total rejected shares of any reason").unwrap())
}

fn shares_stale() -> &'static IntCounter {
    SHARES_STALE.get_or_init(|| IntCounter::new("shares_stale_total", "Total shares rejected as stale").unwrap())
}

fn shares_low_diff() -> &'static IntCounter {
    SHARES_LOW_DIFF.get_or_init(|| IntCounter::new("shares_low_difficulty_total", "Total shares below endpoint difficulty").unwrap())
}

fn shares_duplicate() -> &'static IntCounter {
    SHARES_DUPLICATE.get_or_init(|| IntCounter::new("shares_duplicate_total", "Total shares rejected as duplicate").unwrap())
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| IntCounter::new("blocks_found_total", "Total block candidates submitted upstream as winners").unwrap())
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| IntCounter::new("job_broadcasts_total", "Total job push-notifications sent to sessions").unwrap())
}

fn upstream_reconnects() -> &'static IntCounter {
    UPSTREAM_RECONNECTS.get_or_init(|| IntCounter::new("upstream_reconnects_total", "Total upstream message-bus reconnect attempts").unwrap())
}

fn upstream_rpc_errors() -> &'static IntCounter {
    UPSTREAM_RPC_ERRORS.get_or_init(|| IntCounter::new("upstream_rpc_errors_total", "Total upstream RPC call failures").unwrap())
}

fn payouts_sent() -> &'static IntCounter {
    PAYOUTS_SENT.get_or_init(|| IntCounter::new("payouts_sent_total", "Total payout transaction blocks submitted").unwrap())
}

fn payouts_failed() -> &'static IntCounter {
    PAYOUTS_FAILED.get_or_init(|| IntCounter::new("payouts_failed_total", "Total payout transaction blocks that failed or timed out confirming").unwrap())
}

fn payout_recipients_paid() -> &'static IntCounter {
    PAYOUT_RECIPIENTS_PAID.get_or_init(|| IntCounter::new("payout_recipients_paid_total", "Total recipient credits applied by the payout engine").unwrap())
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| IntGauge::new("stratum_active_sessions", "Live Stratum sessions").unwrap())
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| IntGauge::new("template_task_index", "Current Template taskIndex").unwrap())
}

fn redis_up() -> &'static IntGauge {
    REDIS_UP.get_or_init(|| IntGauge::new("redis_up", "Redis reachable (1/0)").unwrap())
}

pub fn inc_shares_accepted() {
    shares_accepted().inc();
}

pub fn inc_shares_rejected() {
    shares_rejected().inc();
}

pub fn inc_shares_stale() {
    shares_stale().inc();
    shares_rejected().inc();
}

pub fn inc_shares_low_diff() {
    shares_low_diff().inc();
    shares_rejected().inc();
}

pub fn inc_shares_duplicate() {
    shares_duplicate().inc();
    shares_rejected().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_upstream_reconnects() {
    upstream_reconnects().inc();
}

pub fn inc_upstream_rpc_errors() {
    upstream_rpc_errors().inc();
}

pub fn inc_payouts_sent() {
    payouts_sent().inc();
}

pub fn inc_payouts_failed() {
    payouts_failed().inc();
}

pub fn inc_payout_recipients_paid_by(n: u64) {
    payout_recipients_paid().inc_by(n);
}

pub fn set_active_sessions(n: usize) {
    active_sessions().set(n as i64);
}

pub fn set_template_height(task_index: u64) {
    template_height().set(task_index as i64);
}

pub fn set_redis_up(up: bool) {
    redis_up().set(if up { 1 } else { 0 });
}

/// Render every registered family as Prometheus text exposition (§6 `/metrics`).
pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(shares_accepted().collect());
    mfs.extend(shares_rejected().collect());
    mfs.extend(shares_stale().collect());
    mfs.extend(shares_low_diff().collect());
    mfs.extend(shares_duplicate().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(upstream_reconnects().collect());
    mfs.extend(upstream_rpc_errors().collect());
    mfs.extend(payouts_sent().collect());
    mfs.extend(payouts_failed().collect());
    mfs.extend(payout_recipients_paid().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(template_height().collect());
    mfs.extend(redis_up().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
