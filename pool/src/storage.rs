//! Persistent ledger (§3 "Persistent ledger entities", §4.4 step 6, §4.6,
//! §4.7): counter hashes plus time-scored event logs over a single Redis
//! connection, every mutation pipelined into one atomic transaction.
//!
//! A lazily-connected `ConnectionManager` backs every call; share and
//! payout records are JSON event objects appended to ZSETs, one pipelined
//! transaction per event.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::config::RewardMode;

/// 30-minute expiry on per-job diff contribution keys (§3, §4.4 step 6).
const DIFF_WINDOW_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ledger {
    pub rewards: i64,
    pub payment: i64,
    pub unpaid: i64,
    pub donate: i64,
}

/// A single immutable event appended to a time-scored log (`rewards/*`,
/// `payment/*`, `balance/*`, `pool/rewards`, `pool/donate`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub timestamp: i64,
    pub amount: i64,
    pub job_hash_hex: Option<String>,
}

fn event_json(timestamp: i64, amount: i64, job_hash_hex: Option<&str>) -> String {
    serde_json::to_string(&LedgerEvent {
        timestamp,
        amount,
        job_hash_hex: job_hash_hex.map(str::to_string),
    })
    .expect("LedgerEvent never fails to serialize")
}

async fn read_hash_i64(
    conn: &mut redis::aio::ConnectionManager,
    key: &str,
    field: &str,
) -> anyhow::Result<i64> {
    let v: Option<i64> = conn.hget(key, field).await?;
    Ok(v.unwrap_or(0))
}

/// `pool/account`'s four counters (§3).
pub async fn pool_account(conn: &mut redis::aio::ConnectionManager) -> anyhow::Result<Ledger> {
    Ok(Ledger {
        rewards: read_hash_i64(conn, "pool/account", "rewards").await?,
        payment: read_hash_i64(conn, "pool/account", "payment").await?,
        unpaid: read_hash_i64(conn, "pool/account", "unpaid").await?,
        donate: read_hash_i64(conn, "pool/account", "donate").await?,
    })
}

/// `account/<login>`'s counters. The per-miner hash uses `reward` rather
/// than `rewards` (§4.6 step 6: "increment account/<login>.reward").
pub async fn miner_account(
    conn: &mut redis::aio::ConnectionManager,
    login: &str,
) -> anyhow::Result<Ledger> {
    let key = format!("account/{}", login);
    Ok(Ledger {
        rewards: read_hash_i64(conn, &key, "reward").await?,
        payment: read_hash_i64(conn, &key, "payment").await?,
        unpaid: read_hash_i64(conn, &key, "unpaid").await?,
        donate: 0,
    })
}

/// §4.4 step 6: record a block-candidate share's diff contribution.
/// `job/<jobHash>` is kept as a hash (field = login) rather than a
/// per-login flat key, so participants can be enumerated with `HKEYS`
/// instead of the source's single-key `SCAN` bug — see `DESIGN.md`.
pub async fn record_diff_contribution(
    conn: &mut redis::aio::ConnectionManager,
    job_hash_hex: &str,
    login: &str,
    diff: u64,
) -> anyhow::Result<()> {
    let pool_diff_key = format!("pool/{}/diff", job_hash_hex);
    let job_key = format!("job/{}", job_hash_hex);

    let mut pipe = redis::pipe();
    pipe.atomic()
        .incr(&pool_diff_key, diff)
        .expire(&pool_diff_key, DIFF_WINDOW_SECS)
        .hincr(&job_key, login, diff)
        .expire(&job_key, DIFF_WINDOW_SECS);
    pipe.query_async(conn).await?;
    Ok(())
}

/// Logins that contributed diff to `job_hash_hex`, for equal-mode
/// distribution (§9 open question).
pub async fn participants(
    conn: &mut redis::aio::ConnectionManager,
    job_hash_hex: &str,
) -> anyhow::Result<Vec<String>> {
    let key = format!("job/{}", job_hash_hex);
    let logins: Vec<String> = conn.hkeys(&key).await?;
    Ok(logins)
}

/// One participant's diff contribution to `job_hash_hex`.
pub async fn diff_for(
    conn: &mut redis::aio::ConnectionManager,
    job_hash_hex: &str,
    login: &str,
) -> anyhow::Result<u64> {
    let key = format!("job/{}", job_hash_hex);
    let v: Option<u64> = conn.hget(&key, login).await?;
    Ok(v.unwrap_or(0))
}

/// §4.6 step 3: credit the pool's own counters on a confirmed block win.
pub async fn credit_pool_win(
    conn: &mut redis::aio::ConnectionManager,
    amount: i64,
    donate: i64,
    now: i64,
) -> anyhow::Result<()> {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .hincr("pool/account", "rewards", amount)
        .hincr("pool/account", "unpaid", amount)
        .hincr("pool/account", "donate", donate)
        .zadd("pool/rewards", event_json(now, amount, None), now)
        .zadd("pool/donate", event_json(now, donate, None), now);
    pipe.query_async(conn).await?;
    Ok(())
}

/// §4.6 final paragraph: one miner's share of a block's dividend.
pub async fn credit_miner_share(
    conn: &mut redis::aio::ConnectionManager,
    login: &str,
    job_hash_hex: &str,
    amount: i64,
    now: i64,
) -> anyhow::Result<()> {
    let account_key = format!("account/{}", login);
    let rewards_by_login = format!("rewards/{}", login);
    let rewards_by_job = format!("rewards/{}", job_hash_hex);
    let balance_key = format!("balance/{}", login);
    let record = event_json(now, amount, Some(job_hash_hex));

    let mut pipe = redis::pipe();
    pipe.atomic()
        .hincr(&account_key, "reward", amount)
        .hincr(&account_key, "unpaid", amount)
        .zadd(&rewards_by_job, record.clone(), now)
        .zadd(&rewards_by_login, record.clone(), now)
        .zadd(&balance_key, record, now);
    pipe.query_async(conn).await?;
    Ok(())
}

/// §4.4 step 5: a low-difficulty reject, time-scored for `rejecthashrate`.
pub async fn record_reject_share(
    conn: &mut redis::aio::ConnectionManager,
    login: &str,
    diff: u64,
    now: i64,
) -> anyhow::Result<()> {
    let _: () = conn.zadd("rejecthashrate", format!("{}:{}", login, diff), now).await?;
    Ok(())
}

/// Invalid (bad-hash or malformed) shares, time-scored for `invalidhashrate`.
pub async fn record_invalid_share(
    conn: &mut redis::aio::ConnectionManager,
    login: &str,
    now: i64,
) -> anyhow::Result<()> {
    let _: () = conn.zadd("invalidhashrate", login, now).await?;
    Ok(())
}

/// §4.4 step 6 bookkeeping: stamp the `lastShare` timestamp on the worker,
/// miner and pool-wide stats keys a block-candidate share touches.
pub async fn record_last_share(
    conn: &mut redis::aio::ConnectionManager,
    login: &str,
    worker_id: &str,
    now: i64,
) -> anyhow::Result<()> {
    let worker_key = format!("workers/{}.{}", login, worker_id);
    let miner_key = format!("miners/{}", login);
    let mut pipe = redis::pipe();
    pipe.atomic()
        .hset(&worker_key, "lastShare", now)
        .hset(&miner_key, "lastShare", now)
        .hset("stats", "lastShare", now);
    pipe.query_async(conn).await?;
    Ok(())
}

/// One candidate for payout: a login with more than `threshold` unpaid.
#[derive(Debug, Clone)]
pub struct PayoutCandidate {
    pub login: String,
    pub unpaid: i64,
}

/// §4.7 step 1: scan `account/*` for balances above `threshold_base_units`.
/// Uses a non-blocking `SCAN` cursor rather than `KEYS`, so the listener
/// loop never stalls behind an O(n) full-keyspace walk.
pub async fn list_payout_candidates(
    conn: &mut redis::aio::ConnectionManager,
    threshold_base_units: i64,
) -> anyhow::Result<Vec<PayoutCandidate>> {
    let mut candidates = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg("account/*")
            .arg("COUNT")
            .arg(200)
            .query_async(conn)
            .await?;

        for key in keys {
            let login = match key.strip_prefix("account/") {
                Some(l) => l.to_string(),
                None => continue,
            };
            let unpaid = read_hash_i64(conn, &key, "unpaid").await?;
            if unpaid > threshold_base_units {
                candidates.push(PayoutCandidate { login, unpaid });
            }
        }

        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }
    Ok(candidates)
}

/// §4.7 step 4: apply a confirmed payout chunk's ledger mutation.
pub async fn apply_payout(
    conn: &mut redis::aio::ConnectionManager,
    recipients: &[(String, i64)],
    now: i64,
) -> anyhow::Result<()> {
    let chunk_total: i64 = recipients.iter().map(|(_, amount)| *amount).sum();

    let mut pipe = redis::pipe();
    pipe.atomic()
        .hincr("pool/account", "payment", chunk_total)
        .hincr("pool/account", "unpaid", -chunk_total);

    for (login, amount) in recipients {
        let account_key = format!("account/{}", login);
        let payment_key = format!("payment/{}", login);
        let balance_key = format!("balance/{}", login);
        let record = event_json(now, *amount, None);
        pipe.hincr(&account_key, "payment", *amount)
            .hincr(&account_key, "unpaid", -*amount)
            .zadd(&payment_key, record.clone(), now)
            .zadd(&balance_key, record, now);
    }

    pipe.query_async(conn).await?;
    Ok(())
}

/// §4.7 paragraph 2: the purge job. Trims every time-scored log named
/// above to the configured retention window.
pub async fn purge_expired_records(
    conn: &mut redis::aio::ConnectionManager,
    window_secs: i64,
    now: i64,
) -> anyhow::Result<u64> {
    let cutoff = now - window_secs;
    let mut removed = 0u64;

    for fixed_key in ["pool/donate", "pool/rewards", "rejecthashrate", "invalidhashrate"] {
        removed += purge_one(conn, fixed_key, cutoff).await?;
    }

    for prefix in ["balance/", "rewards/", "payment/"] {
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", prefix))
                .arg("COUNT")
                .arg(200)
                .query_async(&mut *conn)
                .await?;
            for key in &keys {
                removed += purge_one(conn, key, cutoff).await?;
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
    }

    Ok(removed)
}

async fn purge_one(
    conn: &mut redis::aio::ConnectionManager,
    key: &str,
    cutoff: i64,
) -> anyhow::Result<u64> {
    let removed: u64 = conn.zrembyscore(key, "-inf", cutoff).await?;
    Ok(removed)
}

/// Reward-dividend math (§4.6 step 7), kept dependency-free so the literal
/// scenario 6 values in §8 are directly unit-testable.
pub fn compute_dividend_distribution(
    mode: RewardMode,
    divide_amount: i64,
    reward_fee: i64,
    direct_fee: i64,
    participant_ratios: &[(String, f64)],
) -> Vec<(String, i64)> {
    let n = participant_ratios.len();
    if n == 0 {
        return Vec::new();
    }

    let direct_share_each = direct_fee / n as i64;

    match mode {
        RewardMode::Solo => participant_ratios
            .iter()
            .map(|(login, _)| (login.clone(), direct_share_each))
            .collect(),
        RewardMode::Equal => {
            let proportional_pot = (divide_amount - reward_fee).max(0);
            participant_ratios
                .iter()
                .map(|(login, ratio)| {
                    let proportional = (ratio * proportional_pot as f64).floor() as i64;
                    (login.clone(), proportional + direct_share_each)
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_mode_matches_scenario_six() {
        // §8 scenario 6: amount=100e9, poolRation=3, fundRation=5,
        // rewardRation=2, directRation=10, ratios 0.4/0.3/0.2/0.05/0.05.
        let amount = 100_000_000_000i64;
        let pool_fee = (amount as f64 * 0.03) as i64;
        let reward_fee = (amount as f64 * 0.02) as i64;
        let direct_fee = (amount as f64 * 0.10) as i64;
        // divideAmount excludes poolFee and directFee only; the fund slice
        // (fundRation=5) is wired out of the pool's own balance separately
        // and does not shrink the miners' shared pot — see reward.rs.
        let divide_amount = amount - pool_fee - direct_fee;
        assert_eq!(divide_amount - reward_fee, 85_000_000_000);

        let ratios = vec![
            ("m1".to_string(), 0.4),
            ("m2".to_string(), 0.3),
            ("m3".to_string(), 0.2),
            ("m4".to_string(), 0.05),
            ("m5".to_string(), 0.05),
        ];
        let credits = compute_dividend_distribution(
            RewardMode::Equal,
            divide_amount,
            reward_fee,
            direct_fee,
            &ratios,
        );

        let direct_each = direct_fee / 5;
        let expected_m1 = (0.4 * (divide_amount - reward_fee) as f64).floor() as i64 + direct_each;
        assert_eq!(credits[0].1, expected_m1);
    }

    #[test]
    fn solo_mode_splits_direct_fee_equally() {
        let ratios = vec![
            ("m1".to_string(), 0.0),
            ("m2".to_string(), 0.0),
            ("m3".to_string(), 0.0),
        ];
        let credits = compute_dividend_distribution(RewardMode::Solo, 0, 0, 300, &ratios);
        assert_eq!(credits.len(), 3);
        assert!(credits.iter().all(|(_, amount)| *amount == 100));
    }

    #[test]
    fn empty_participant_set_short_circuits() {
        let credits = compute_dividend_distribution(RewardMode::Equal, 1000, 0, 0, &[]);
        assert!(credits.is_empty());
    }
}
