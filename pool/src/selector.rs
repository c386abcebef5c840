//! Minimum-Share Selector (C5): §4.5. Tracks, per job hash, the smallest
//! `shareU64` seen and the finder (login) that submitted it — the pool's
//! block candidate.
//!
//! The comparison itself is plain arithmetic, kept dependency-free so it
//! is unit-testable directly; persistence of the running minimum goes
//! through `mini/<jobHash>` (score + member, §3) and `submit/<jobHash>`
//! (§3: the set of share blobs actually sent upstream).

use redis::AsyncCommands;

/// Decide whether `candidate_share_u64` improves on `current_min` (§4.5:
/// "strictly smaller replaces the incumbent; ties keep the incumbent").
///
/// Pure function: the only state this needs is the previous minimum, so it
/// is testable without a store of any kind.
pub fn is_new_minimum(candidate_share_u64: u64, current_min: Option<u64>) -> bool {
    match current_min {
        None => true,
        Some(min) => candidate_share_u64 < min,
    }
}

/// 30-minute expiry shared by `mini/<jobHash>` and `submit/<jobHash>` (§4.5
/// step 1).
const WINDOW_SECS: i64 = 30 * 60;

/// Redis-backed wrapper around [`is_new_minimum`]. On a win, records the
/// `(shareU64, login)` pair in `mini/<jobHash>` and adds `blob_hex` to
/// `submit/<jobHash>` (the set of blobs the Upstream Bridge is allowed to
/// forward as this job's block candidate) — §4.5 step 1, a single unit of
/// work so the two keys never diverge.
pub async fn update_minimum(
    conn: &mut redis::aio::ConnectionManager,
    job_hash_hex: &str,
    candidate_share_u64: u64,
    login: &str,
    blob_hex: &str,
) -> anyhow::Result<bool> {
    let mini_key = format!("mini/{}", job_hash_hex);
    let submit_key = format!("submit/{}", job_hash_hex);

    let current: Option<String> = conn.hget(&mini_key, "shareU64").await?;
    let current_min = current.and_then(|s| s.parse::<u64>().ok());

    if !is_new_minimum(candidate_share_u64, current_min) {
        return Ok(false);
    }

    let mut pipe = redis::pipe();
    pipe.atomic()
        .hset(&mini_key, "shareU64", candidate_share_u64.to_string())
        .hset(&mini_key, "login", login)
        .expire(&mini_key, WINDOW_SECS)
        .sadd(&submit_key, blob_hex)
        .expire(&submit_key, WINDOW_SECS);
    pipe.query_async(conn).await?;

    Ok(true)
}

/// Current finder login for a job's running minimum, if any (§4.6 step 6:
/// "read the single element of `mini/<preHash>`").
pub async fn current_finder(
    conn: &mut redis::aio::ConnectionManager,
    job_hash_hex: &str,
) -> anyhow::Result<Option<String>> {
    let key = format!("mini/{}", job_hash_hex);
    let login: Option<String> = conn.hget(&key, "login").await?;
    Ok(login)
}

/// `true` iff `blob_hex` was submitted upstream as the block candidate for
/// `job_hash_hex` (§4.6 step 2: "is not a member of submit/<preHash>" ⇒
/// another pool's block).
pub async fn was_submitted(
    conn: &mut redis::aio::ConnectionManager,
    job_hash_hex: &str,
    blob_hex: &str,
) -> anyhow::Result<bool> {
    let key = format!("submit/{}", job_hash_hex);
    let is_member: bool = conn.sismember(&key, blob_hex).await?;
    Ok(is_member)
}

/// Delete `submit/<jobHash>` once a reward has been claimed (§4.6 step 3).
pub async fn clear_submitted(
    conn: &mut redis::aio::ConnectionManager,
    job_hash_hex: &str,
) -> anyhow::Result<()> {
    let key = format!("submit/{}", job_hash_hex);
    let _: () = conn.del(&key).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_law_first_share_always_wins() {
        assert!(is_new_minimum(12345, None));
    }

    #[test]
    fn minimum_law_strictly_smaller_replaces() {
        assert!(is_new_minimum(99, Some(100)));
        assert!(!is_new_minimum(100, Some(100)));
        assert!(!is_new_minimum(101, Some(100)));
    }
}
