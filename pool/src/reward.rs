//! Reward Distributor (C6): §4.6. Turns one upstream Reward event into a
//! set of ledger credits.
//!
//! The dividend math is pure and lives in
//! [`crate::storage::compute_dividend_distribution`]; this module is the
//! thin async wrapper that does the Redis I/O and payout-block submission
//! around it.

use crate::address;
use crate::config::{Config, RewardMode};
use crate::payout::txblock::{self, PoolKeypair, Recipient};
use crate::selector;
use crate::storage;
use crate::upstream::UpstreamRpcClient;

/// One upstream Reward notification (§4.6, §6 message type 3).
#[derive(Debug, Clone)]
pub struct RewardEvent {
    pub pre_hash_hex: String,
    /// First 20 bytes of the winning share blob — the finder's address
    /// payload before base58Check re-encoding (§4.6 step 1).
    pub share_hash160: [u8; 20],
    pub amount: i64,
    pub donate: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardOutcome {
    /// Block belonged to another pool; nothing credited.
    NotOurs,
    /// Credited the pool, the finder, and every contributing miner.
    Credited,
}

/// Apply one Reward event end to end (§4.6 steps 1-7).
pub async fn apply_reward(
    conn: &mut redis::aio::ConnectionManager,
    cfg: &Config,
    event: &RewardEvent,
    now: i64,
    rpc: &UpstreamRpcClient,
    pool_keypair: Option<&PoolKeypair>,
    pool_address_hash160: &[u8; 20],
) -> anyhow::Result<RewardOutcome> {
    let login = address::encode(&event.share_hash160);
    let blob_hex = hex::encode(event.share_hash160);

    // §4.6 step 2: a block we did not actually submit belongs to another
    // pool — this is a normal outcome, not an error.
    if !selector::was_submitted(conn, &event.pre_hash_hex, &blob_hex).await? {
        tracing::info!(job_hash = %event.pre_hash_hex, "reward event for a block this pool did not submit");
        return Ok(RewardOutcome::NotOurs);
    }

    storage::credit_pool_win(conn, event.amount, event.donate, now).await?;
    selector::clear_submitted(conn, &event.pre_hash_hex).await?;

    let pool_fee = ration(event.amount, cfg.pool_ration_percent);
    let fund_fee = ration(event.amount, cfg.fund_ration_percent);
    let reward_fee = ration(event.amount, cfg.reward_ration_percent);
    let direct_fee = ration(event.amount, cfg.direct_ration_percent);
    // §8 scenario 6 pins divideAmount at `amount - poolFee - directFee`: the
    // fund slice is wired out of the pool's own custodial balance (§4.6 step
    // 4) rather than off the top of the miners' shared pot, so it does not
    // reduce the pot despite §4.6 step 5's prose reading "- fundFee" too.
    // See DESIGN.md open-question resolutions.
    let divide_amount = event.amount - pool_fee - direct_fee;

    tracing::info!(
        target: "block",
        job_hash = %event.pre_hash_hex,
        amount = event.amount,
        pool_fee,
        fund_fee,
        reward_fee,
        direct_fee,
        divide_amount,
        "block reward confirmed, distributing"
    );

    // §4.6 step 4: the community-fund slice leaves the pool entirely,
    // signed and sent the same way a payout chunk is (§4.7 step 3), rather
    // than credited to any ledger here.
    if fund_fee > 0 && !cfg.fund_address.is_empty() {
        if let Err(e) = transfer_fund_fee(rpc, pool_keypair, pool_address_hash160, &cfg.fund_address, fund_fee, now).await {
            tracing::error!(error = %e, fund_fee, "failed to transfer community-fund slice upstream");
        }
    }

    // §4.6 step 6: the finder named by the running per-job minimum.
    let finder_login = selector::current_finder(conn, &event.pre_hash_hex).await?;
    let finder_amount = match cfg.reward_mode {
        RewardMode::Solo => divide_amount,
        RewardMode::Equal => reward_fee,
    };
    if let Some(finder) = finder_login.clone() {
        storage::credit_miner_share(conn, &finder, &event.pre_hash_hex, finder_amount, now).await?;
    } else {
        tracing::warn!(job_hash = %event.pre_hash_hex, "no recorded finder for a confirmed block");
    }

    let participants = storage::participants(conn, &event.pre_hash_hex).await?;
    if participants.is_empty() {
        tracing::warn!(job_hash = %event.pre_hash_hex, "no participants recorded for a confirmed block, direct fee left unassigned");
        return Ok(RewardOutcome::Credited);
    }

    let total_diff: u64 = {
        let mut sum = 0u64;
        for p in &participants {
            sum += storage::diff_for(conn, &event.pre_hash_hex, p).await?;
        }
        sum
    };
    if total_diff == 0 {
        tracing::warn!(job_hash = %event.pre_hash_hex, "zero total diff recorded, skipping direct distribution");
        return Ok(RewardOutcome::Credited);
    }

    let mut ratios = Vec::with_capacity(participants.len());
    for p in &participants {
        let diff = storage::diff_for(conn, &event.pre_hash_hex, p).await?;
        ratios.push((p.clone(), diff as f64 / total_diff as f64));
    }

    let credits = storage::compute_dividend_distribution(
        cfg.reward_mode,
        divide_amount,
        reward_fee,
        direct_fee,
        &ratios,
    );

    // §9 open question, resolved per §8 scenario 6: the finder's proportional
    // share below is credited *in addition to* the `rewardFee` credited
    // above — the two are distinct slices of `amount`, not alternatives.
    for (participant_login, credit_amount) in credits {
        if credit_amount <= 0 {
            continue;
        }
        storage::credit_miner_share(conn, &participant_login, &event.pre_hash_hex, credit_amount, now).await?;
    }

    Ok(RewardOutcome::Credited)
}

fn ration(amount: i64, percent: f64) -> i64 {
    ((amount as f64) * percent / 100.0) as i64
}

/// Build, sign, and submit a single-recipient transaction block carrying
/// the community-fund slice (§4.6 step 4). Uses the same bit-exact block
/// layout as the Payout Engine (§4.7) since both move the chain's native
/// value out of the pool's own address.
async fn transfer_fund_fee(
    rpc: &UpstreamRpcClient,
    pool_keypair: Option<&PoolKeypair>,
    pool_address_hash160: &[u8; 20],
    fund_address: &str,
    fund_fee: i64,
    now: i64,
) -> anyhow::Result<()> {
    let keypair = pool_keypair.ok_or_else(|| anyhow::anyhow!("no pool keypair configured"))?;
    let fund_hash160 = address::decode(fund_address)?;

    let mut from_field = [0u8; 24];
    from_field[..20].copy_from_slice(pool_address_hash160);
    let mut to_field = [0u8; 24];
    to_field[..20].copy_from_slice(&fund_hash160);

    let fixed_value = fund_fee as u64;
    let recipient = Recipient { address_field: to_field, fixed_value };

    let (block, tx_hash) = txblock::build_transaction_block(
        &from_field,
        fixed_value,
        std::slice::from_ref(&recipient),
        "",
        keypair,
        now.max(0) as u64,
    )?;

    let block_hex = hex::encode(block);
    let returned_hash = rpc.send_raw_transaction(&block_hex).await?;
    let expected_hash = hex::encode(tx_hash);
    if !returned_hash.eq_ignore_ascii_case(&expected_hash) {
        anyhow::bail!(
            "upstream accepted a different transaction hash than signed for fund transfer: expected {}, got {}",
            expected_hash,
            returned_hash
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ration_truncates_toward_zero() {
        assert_eq!(ration(100_000_000_000, 3.0), 3_000_000_000);
        assert_eq!(ration(7, 50.0), 3);
    }
}
