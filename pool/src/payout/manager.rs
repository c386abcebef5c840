//! Payout Engine (C7): §4.7. Periodic scan of over-threshold balances,
//! chunked transaction-block construction and submission, confirmation
//! polling, and the purge job.
//!
//! Tick loop is confirm-before-process: `payout:record:<id>` HSET-with-
//! status bookkeeping, a `payout:sent` ZSET batched confirmation poll with
//! a timeout-to-failed fallback, and chunked signed transaction blocks
//! built via `crate::payout::txblock`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;

use crate::context::PoolContext;
use crate::metrics;
use crate::payout::txblock::{self, Recipient};

/// How many payout:sent entries the confirmation poller checks per tick,
/// a `payout_batch_limit`-bounded `ZRANGEBYSCORE` matching the pattern this
/// confirmation poller was adapted from.
const CONFIRM_BATCH_LIMIT: isize = 50;
const PAYOUT_RECORDS_CAP: isize = 1000;

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// XDAG addresses are 20-byte hash160 payloads; the transaction block's
/// address field is 24 bytes, zero-padded after the payload.
fn hash160_to_address_field(hash160: &[u8; 20]) -> [u8; 24] {
    let mut field = [0u8; 24];
    field[..20].copy_from_slice(hash160);
    field
}

/// Spawns the payout ticker (confirm-then-process, §4.7) and the purge
/// ticker as independent background tasks.
pub fn spawn(ctx: Arc<PoolContext>) {
    tokio::spawn(payout_loop(ctx.clone()));
    tokio::spawn(purge_loop(ctx));
}

async fn payout_loop(ctx: Arc<PoolContext>) {
    loop {
        let cfg = ctx.config_snapshot().await;
        tokio::time::sleep(Duration::from_secs(cfg.payout_interval_secs.max(1))).await;

        if let Err(e) = confirm_sent_payouts(&ctx).await {
            tracing::error!(error = %e, "confirm_sent_payouts failed");
        }
        if let Err(e) = process_payouts(&ctx).await {
            tracing::error!(error = %e, "process_payouts failed");
        }
    }
}

async fn purge_loop(ctx: Arc<PoolContext>) {
    loop {
        let cfg = ctx.config_snapshot().await;
        tokio::time::sleep(Duration::from_secs(cfg.purge_interval_secs.max(1))).await;

        let mut conn = ctx.redis_conn().await;
        match crate::storage::purge_expired_records(&mut conn, cfg.purge_window_secs, unix_now()).await {
            Ok(n) if n > 0 => tracing::info!(purged = n, "purge job removed expired ledger records"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "purge_expired_records failed"),
        }
    }
}

/// §4.7 steps 1-5: scan over-threshold balances, chunk them, build+sign a
/// transaction block per chunk, submit it, and apply the ledger mutation
/// only once the upstream node's accepted hash matches ours.
async fn process_payouts(ctx: &Arc<PoolContext>) -> anyhow::Result<()> {
    let cfg = ctx.config_snapshot().await;

    let Some(keypair) = ctx.pool_keypair.as_ref() else {
        tracing::debug!("no pool keypair configured, payout engine idle");
        return Ok(());
    };
    if cfg.pool_address.is_empty() {
        return Ok(());
    }

    let threshold_fixed = txblock::xdag_to_fixed(cfg.payout_threshold) as i64;
    let mut conn = ctx.redis_conn().await;
    let candidates = crate::storage::list_payout_candidates(&mut conn, threshold_fixed).await?;
    if candidates.is_empty() {
        return Ok(());
    }

    let from_field = hash160_to_address_field(&ctx.pool_address_hash160);

    for chunk in txblock::chunk_recipients(&candidates, &cfg.payout_remark) {
        let mut recipients = Vec::with_capacity(chunk.len());
        let mut logins = Vec::with_capacity(chunk.len());
        let mut total_fixed: u64 = 0;

        for candidate in chunk {
            let hash160 = match crate::address::decode(&candidate.login) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(login = %candidate.login, error = %e, "skipping payout candidate with unparsable address");
                    continue;
                }
            };
            let fixed_value = candidate.unpaid as u64;
            total_fixed += fixed_value;
            recipients.push(Recipient { address_field: hash160_to_address_field(&hash160), fixed_value });
            logins.push((candidate.login.clone(), candidate.unpaid));
        }
        if recipients.is_empty() {
            continue;
        }

        let (block, tx_hash) = match txblock::build_transaction_block(
            &from_field,
            total_fixed,
            &recipients,
            &cfg.payout_remark,
            keypair,
            unix_now().max(0) as u64,
        ) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to build payout transaction block");
                metrics::inc_payouts_failed();
                continue;
            }
        };

        let tx_hash_hex = hex::encode(tx_hash);
        let block_hex = hex::encode(block);

        match ctx.rpc.send_raw_transaction(&block_hex).await {
            Ok(returned_hash) => {
                // §4.7 step 5: a node-accepted hash disagreeing with ours is
                // an error; abandon the chunk with no ledger mutation.
                if !returned_hash.eq_ignore_ascii_case(&tx_hash_hex) {
                    tracing::error!(
                        expected = %tx_hash_hex,
                        got = %returned_hash,
                        "upstream accepted a different transaction hash than signed, abandoning chunk"
                    );
                    metrics::inc_payouts_failed();
                    continue;
                }

                crate::storage::apply_payout(&mut conn, &logins, unix_now()).await?;
                record_payout_sent(&mut conn, &tx_hash_hex, &logins).await?;
                metrics::inc_payouts_sent();
                metrics::inc_payout_recipients_paid_by(logins.len() as u64);
                tracing::info!(tx_hash = %tx_hash_hex, recipients = logins.len(), "payout transaction submitted");
            }
            Err(e) => {
                tracing::error!(error = %e, "payout transaction submission failed");
                metrics::inc_payouts_failed();
            }
        }
    }

    Ok(())
}

async fn record_payout_sent(
    conn: &mut redis::aio::ConnectionManager,
    tx_hash_hex: &str,
    recipients: &[(String, i64)],
) -> anyhow::Result<()> {
    let id = NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed);
    let now = unix_now();
    let record_key = format!("payout:record:{}", id);
    let recipients_json = serde_json::to_string(recipients)?;

    let mut pipe = redis::pipe();
    pipe.atomic()
        .hset(&record_key, "id", id)
        .hset(&record_key, "tx_hash", tx_hash_hex)
        .hset(&record_key, "recipients", recipients_json)
        .hset(&record_key, "status", "sent")
        .hset(&record_key, "created_ts", now)
        .hset(&record_key, "updated_ts", now)
        .zadd("payout:sent", id, now)
        .lpush("payout:records", id)
        .ltrim("payout:records", 0, PAYOUT_RECORDS_CAP - 1);
    pipe.query_async(conn).await?;
    Ok(())
}

/// §10 supplemented feature, "Payout confirmation tracking": poll every
/// still-outstanding sent record, mark it confirmed or, past
/// `payout_confirm_timeout_secs`, failed.
async fn confirm_sent_payouts(ctx: &Arc<PoolContext>) -> anyhow::Result<()> {
    let cfg = ctx.config_snapshot().await;
    let mut conn = ctx.redis_conn().await;
    let now = unix_now();

    let ids: Vec<u64> = conn
        .zrangebyscore_limit("payout:sent", 0, "+inf", 0, CONFIRM_BATCH_LIMIT)
        .await?;

    for id in ids {
        let record_key = format!("payout:record:{}", id);
        let fields: std::collections::HashMap<String, String> = conn.hgetall(&record_key).await?;
        let Some(tx_hash) = fields.get("tx_hash") else { continue };
        let updated_ts: i64 = fields.get("updated_ts").and_then(|v| v.parse().ok()).unwrap_or(now);

        match ctx.rpc.get_transaction_status(tx_hash).await {
            Ok(Some(status)) if status.eq_ignore_ascii_case("confirmed") => {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .hset(&record_key, "status", "confirmed")
                    .hset(&record_key, "updated_ts", now)
                    .zrem("payout:sent", id);
                pipe.query_async(&mut conn).await?;
                tracing::info!(tx_hash = %tx_hash, "payout transaction confirmed");
            }
            Ok(_) => {
                if now - updated_ts >= cfg.payout_confirm_timeout_secs as i64 {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .hset(&record_key, "status", "failed")
                        .hset(&record_key, "updated_ts", now)
                        .zrem("payout:sent", id);
                    pipe.query_async(&mut conn).await?;
                    metrics::inc_payouts_failed();
                    tracing::warn!(tx_hash = %tx_hash, "payout confirmation timed out, marking failed");
                }
            }
            Err(e) => {
                metrics::inc_upstream_rpc_errors();
                if now - updated_ts >= cfg.payout_confirm_timeout_secs as i64 {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .hset(&record_key, "status", "failed")
                        .hset(&record_key, "updated_ts", now)
                        .zrem("payout:sent", id);
                    pipe.query_async(&mut conn).await?;
                    metrics::inc_payouts_failed();
                    tracing::warn!(tx_hash = %tx_hash, error = %e, "payout confirmation poll failing past timeout, marking failed");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_field_zero_pads_hash160() {
        let hash160 = [7u8; 20];
        let field = hash160_to_address_field(&hash160);
        assert_eq!(&field[..20], &hash160[..]);
        assert_eq!(&field[20..], &[0u8; 4]);
    }
}
