//! Share Validator (C4): §4.4 blob assembly, RandomX hashing, hashDiff
//! extraction, and the duplicate/stale/low-difficulty rejection ladder.
//!
//! Pipeline order: duplicate check, nonce decode, blob build, hash,
//! difficulty compare — the first failing step rejects the share.

use anyhow::{anyhow, Result};

use crate::dedup::MinedShares;
use crate::error::PoolError;
use crate::template::{assemble_blob, Job};

/// A fully decoded, not-yet-hashed share submission.
pub struct ShareSubmission<'a> {
    pub job_id: &'a str,
    pub nonce_hex: &'a str,
    pub result_hex: &'a str,
}

/// Outcome of a validated share: what the miner is credited with and
/// whether it is this round's new block candidate.
#[derive(Debug, Clone)]
pub struct ValidatedShare {
    pub blob: [u8; 64],
    pub hash: [u8; 32],
    /// `u64::MAX / shareU64`, the classic difficulty-from-hash conversion;
    /// `0` only when extraction already failed (callers reject before this
    /// point, so in practice always `> 0` here).
    pub hash_diff: u64,
    /// Little-endian u64 view of hash bytes 24..32 — the minimum-share
    /// selector's sort key (§4.5).
    pub share_u64: u64,
}

const NONCE_HEX_RE_LEN: usize = 8;

/// Validate a raw nonce string: exactly 8 lowercase hex characters (§4.4
/// step 1, matching the source's `^[0-9a-f]{8}$`).
pub fn validate_nonce_hex(nonce_hex: &str) -> bool {
    nonce_hex.len() == NONCE_HEX_RE_LEN
        && nonce_hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Extract `hashDiff` from a RandomX digest. Bytes 24..32 read as a
/// little-endian u64 (`shareU64`); `hashDiff = u64::MAX / shareU64`.
/// Returns `None` if `shareU64` is zero (the extraction-failure edge case
/// named in §4.4 step 4, astronomically unlikely but guarded against a
/// division by zero).
pub fn extract_hash_diff(hash: &[u8; 32]) -> Option<(u64, u64)> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash[24..32]);
    let share_u64 = u64::from_le_bytes(buf);
    if share_u64 == 0 {
        return None;
    }
    Some((share_u64, u64::MAX / share_u64))
}

/// The per-session validation pipeline (§4.4).
///
/// `pool_address_hash160` is the pool's own decoded payout address, fixed
/// for the session's lifetime; `difficulty` is the endpoint's configured
/// share difficulty.
pub async fn validate_share(
    job: &mut Job,
    submission: &ShareSubmission<'_>,
    instance_id: &[u8; 4],
    pool_address_hash160: &[u8; 20],
    difficulty: u64,
    dedup: &MinedShares,
    fabric: &crate::template::JobFabric,
) -> Result<ValidatedShare, PoolError> {
    if !validate_nonce_hex(submission.nonce_hex) {
        return Err(PoolError::MalformedRequest);
    }

    if job.check_and_submit(submission.nonce_hex) {
        return Err(PoolError::DuplicateShare);
    }

    let nonce_bytes = hex::decode(submission.nonce_hex).map_err(|_| PoolError::MalformedRequest)?;
    let mut nonce = [0u8; 4];
    nonce.copy_from_slice(&nonce_bytes);

    let mut blob = assemble_blob(
        &template_buffer(job),
        job.extra_nonce,
        instance_id,
        pool_address_hash160,
    );
    blob[39..43].copy_from_slice(&nonce);

    let hash = fabric.hash(&blob).await.map_err(|_| PoolError::Internal)?;

    // §4.4 step 3: the server recomputes the hash and never trusts the
    // miner's claimed result.
    if !result_matches(submission.result_hex, &hash).unwrap_or(false) {
        return Err(PoolError::InvalidShare);
    }

    let (share_u64, hash_diff) = extract_hash_diff(&hash).ok_or(PoolError::Internal)?;

    if hash_diff < difficulty {
        return Err(PoolError::LowDifficulty);
    }

    // §4.4's dedup check is scoped to block-candidate shares only (it lives
    // under "ledger writes on a block-candidate share", not the general
    // per-submit steps): the same (job, nonce) pair replayed under a
    // different connection is only worth catching once a share has already
    // cleared the difficulty bar.
    let blob_key = hex::encode(blob);
    if dedup.check_and_insert(&blob_key) {
        return Err(PoolError::DuplicateShare);
    }

    Ok(ValidatedShare {
        blob,
        hash,
        hash_diff,
        share_u64,
    })
}

fn template_buffer(job: &Job) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&job.blob[0..32]);
    buf
}

/// Decode a hex-encoded RandomX result and compare it to the locally
/// recomputed hash, as a defense against a miner lying about its own
/// result (§4.4 step 3: "the server recomputes, never trusts the wire
/// value").
pub fn result_matches(result_hex: &str, computed: &[u8; 32]) -> Result<bool> {
    let bytes = hex::decode(result_hex).map_err(|e| anyhow!("invalid result hex: {}", e))?;
    Ok(bytes == computed.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_validation_accepts_well_formed() {
        assert!(validate_nonce_hex("0badf00d"));
        assert!(!validate_nonce_hex("0BADF00D"));
        assert!(!validate_nonce_hex("0badf0"));
        assert!(!validate_nonce_hex("0badf00dz"));
    }

    #[test]
    fn hash_diff_extraction_matches_monero_convention() {
        let mut hash = [0u8; 32];
        hash[24..32].copy_from_slice(&1u64.to_le_bytes());
        let (share_u64, diff) = extract_hash_diff(&hash).unwrap();
        assert_eq!(share_u64, 1);
        assert_eq!(diff, u64::MAX);
    }

    #[test]
    fn hash_diff_extraction_fails_on_zero() {
        let hash = [0u8; 32];
        assert!(extract_hash_diff(&hash).is_none());
    }

    #[test]
    fn minimum_law_smaller_share_u64_is_higher_difficulty() {
        let mut a = [0u8; 32];
        a[24..32].copy_from_slice(&100u64.to_le_bytes());
        let mut b = [0u8; 32];
        b[24..32].copy_from_slice(&50u64.to_le_bytes());

        let (_, diff_a) = extract_hash_diff(&a).unwrap();
        let (_, diff_b) = extract_hash_diff(&b).unwrap();
        assert!(diff_b > diff_a, "smaller shareU64 must yield larger hashDiff");
    }
}
