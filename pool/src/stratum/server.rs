//! Stratum TCP listener and per-session JSON-RPC dispatch (§4.3, §5, §7).
//!
//! One task per accepted socket: split reader/writer halves, a dedicated
//! writer task draining an `mpsc::UnboundedSender<String>` outbox, and a
//! read-with-timeout loop feeding [`dispatch_line`], which routes the four
//! methods this pool speaks (login/getjob/submit/keepalived) against its
//! Session/Miner/Endpoint data model.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::context::PoolContext;
use crate::error::PoolError;
use crate::metrics;
use crate::session::{Session, SessionId};
use crate::stratum::protocol::{resolve_login, LoginParams, Request, Response, SubmitParams};
use crate::template::JobRing;
use crate::validator::{self, ShareSubmission};
use crate::{address, selector, storage, upstream};

enum DispatchOutcome {
    Continue,
    Close,
}

fn send_line(tx: &mpsc::UnboundedSender<String>, line: String) {
    let _ = tx.send(line);
}

/// Binds `cfg.listen` and runs the accept loop until the process shuts down
/// (§5: "one dispatcher loop per listening port accepts connections and
/// spawns one task per session").
pub async fn serve(ctx: Arc<PoolContext>) -> anyhow::Result<()> {
    let listen_addr = ctx.config_snapshot().await.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "stratum listener bound");

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stratum accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, socket, peer_addr).await {
                tracing::debug!(peer = %peer_addr, error = %e, "stratum connection closed");
            }
        });
    }
}

async fn handle_connection(ctx: Arc<PoolContext>, socket: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
    let cfg = ctx.config_snapshot().await;
    let deadline = Duration::from_secs(cfg.stratum_timeout_secs.max(1));
    let max_frame_bytes = cfg.max_frame_bytes;

    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbox_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    let session_id = ctx.sessions.alloc_id();
    let mut session: Option<Arc<Session>> = None;

    let mut line = String::new();
    let result: anyhow::Result<()> = loop {
        line.clear();
        match tokio::time::timeout(deadline, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => break Ok(()),
            Ok(Ok(_)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.len() > max_frame_bytes {
                    tracing::warn!(peer = %peer_addr, len = trimmed.len(), "stratum frame exceeds max size, closing");
                    break Ok(());
                }

                if let Some(s) = session.as_ref() {
                    s.touch().await;
                }

                match dispatch_line(&ctx, session_id, &mut session, peer_addr, trimmed, &outbox_tx).await {
                    DispatchOutcome::Continue => {}
                    DispatchOutcome::Close => break Ok(()),
                }
            }
            Ok(Err(e)) => break Err(e.into()),
            Err(_) => {
                tracing::debug!(peer = %peer_addr, "stratum read deadline expired, closing");
                break Ok(());
            }
        }
    };

    if session.take().is_some() {
        ctx.sessions.remove(session_id).await;
        metrics::set_active_sessions(ctx.sessions.len().await);
    }
    drop(outbox_tx);
    let _ = writer_task.await;
    result
}

/// Parses and routes one line (§4.3). A malformed frame or a missing/null
/// request id is a fatal protocol error (§7: "Protocol: malformed JSON,
/// missing id, bad method → close session").
async fn dispatch_line(
    ctx: &Arc<PoolContext>,
    session_id: SessionId,
    session: &mut Option<Arc<Session>>,
    peer_addr: SocketAddr,
    line: &str,
    outbox_tx: &mpsc::UnboundedSender<String>,
) -> DispatchOutcome {
    let req: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(peer = %peer_addr, error = %e, "malformed stratum request, closing");
            send_line(outbox_tx, Response::err(Value::Null, PoolError::MalformedRequest.code(), PoolError::MalformedRequest.to_string()).to_line());
            return DispatchOutcome::Close;
        }
    };

    let id = match req.id {
        Some(v) if !v.is_null() => v,
        _ => {
            tracing::debug!(peer = %peer_addr, "stratum request missing id, closing");
            send_line(outbox_tx, Response::err(Value::Null, PoolError::MalformedRequest.code(), "Missing request id").to_line());
            return DispatchOutcome::Close;
        }
    };

    if req.params.is_null() {
        tracing::debug!(peer = %peer_addr, "stratum request missing params, closing");
        send_line(outbox_tx, Response::err(id, PoolError::MalformedRequest.code(), "Missing request params").to_line());
        return DispatchOutcome::Close;
    }

    match req.method.as_str() {
        "login" => handle_login(ctx, session_id, session, peer_addr, id, req.params, outbox_tx).await,
        "getjob" => handle_getjob(ctx, session, id, outbox_tx).await,
        "submit" => handle_submit(ctx, session, id, req.params, outbox_tx).await,
        "keepalived" => {
            if let Some(s) = session.as_ref() {
                ctx.sessions.miner_for(&s.login, &s.worker_id).await.heartbeat();
            }
            send_line(outbox_tx, Response::ok(id, json!({ "status": "KEEPALIVED" })).to_line());
            DispatchOutcome::Continue
        }
        other => {
            tracing::debug!(peer = %peer_addr, method = other, "unknown stratum method, closing");
            send_line(outbox_tx, Response::err(id, -1, "Invalid method").to_line());
            DispatchOutcome::Close
        }
    }
}

/// §4.3 step 1: resolve and validate the login address, register the
/// Session/Miner, and dispense the current job if one exists.
async fn handle_login(
    ctx: &Arc<PoolContext>,
    session_id: SessionId,
    session: &mut Option<Arc<Session>>,
    peer_addr: SocketAddr,
    id: Value,
    params: Value,
    outbox_tx: &mpsc::UnboundedSender<String>,
) -> DispatchOutcome {
    let login_params: LoginParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(_) => {
            send_line(outbox_tx, Response::err(id, PoolError::MalformedRequest.code(), PoolError::MalformedRequest.to_string()).to_line());
            return DispatchOutcome::Close;
        }
    };

    let (login, worker_id) = resolve_login(&login_params.login, &login_params.pass);

    // §4.3: an invalid address replies with an error but keeps the
    // connection open; no further method will succeed until a valid login.
    if !address::is_valid(&login) {
        send_line(outbox_tx, Response::err(id, PoolError::InvalidAddress.code(), PoolError::InvalidAddress.to_string()).to_line());
        return DispatchOutcome::Continue;
    }

    let new_session = Arc::new(Session {
        id: session_id,
        login: login.clone(),
        worker_id: worker_id.clone(),
        uid: format!("{}.{}", login, worker_id),
        ip: peer_addr.ip(),
        endpoint: ctx.endpoint.clone(),
        jobs: tokio::sync::RwLock::new(JobRing::default()),
        last_job_hash: tokio::sync::RwLock::new(None),
        connected_at: std::time::Instant::now(),
        last_activity: tokio::sync::RwLock::new(std::time::Instant::now()),
        outbox: outbox_tx.clone(),
    });

    ctx.sessions.insert(new_session.clone()).await;
    metrics::set_active_sessions(ctx.sessions.len().await);
    ctx.sessions.miner_for(&login, &worker_id).await;

    let job_value = match ctx.job_fabric.current().await {
        Some(template) => {
            let reply = new_session.dispense_job(&template, &ctx.pool_address_hash160).await;
            serde_json::to_value(&reply).unwrap_or(Value::Null)
        }
        None => Value::Null,
    };

    *session = Some(new_session);

    send_line(outbox_tx, Response::ok(id, json!({ "id": worker_id, "job": job_value, "status": "OK" })).to_line());
    DispatchOutcome::Continue
}

/// §4.3 step 2: dispense the current job, or an empty payload if the
/// session's hashlatch already matches it.
async fn handle_getjob(
    ctx: &Arc<PoolContext>,
    session: &mut Option<Arc<Session>>,
    id: Value,
    outbox_tx: &mpsc::UnboundedSender<String>,
) -> DispatchOutcome {
    let Some(s) = session.as_ref() else {
        send_line(outbox_tx, Response::err(id, -1, "Not authenticated").to_line());
        return DispatchOutcome::Continue;
    };

    ctx.sessions.miner_for(&s.login, &s.worker_id).await.heartbeat();

    let Some(template) = ctx.job_fabric.current().await else {
        send_line(outbox_tx, Response::ok(id, json!({})).to_line());
        return DispatchOutcome::Continue;
    };

    let latched = *s.last_job_hash.read().await;
    if latched == Some(template.job_hash) {
        send_line(outbox_tx, Response::ok(id, json!({})).to_line());
        return DispatchOutcome::Continue;
    }

    let reply = s.dispense_job(&template, &ctx.pool_address_hash160).await;
    send_line(outbox_tx, Response::ok(id, serde_json::to_value(&reply).unwrap_or(Value::Null)).to_line());
    DispatchOutcome::Continue
}

/// §4.4: the full per-submit validation pipeline and, on a block-candidate
/// share, the ledger writes and minimum-share race (§4.5).
async fn handle_submit(
    ctx: &Arc<PoolContext>,
    session: &mut Option<Arc<Session>>,
    id: Value,
    params: Value,
    outbox_tx: &mpsc::UnboundedSender<String>,
) -> DispatchOutcome {
    let Some(s) = session.as_ref() else {
        send_line(outbox_tx, Response::err(id, -1, "Not authenticated").to_line());
        return DispatchOutcome::Continue;
    };

    let submit_params: SubmitParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(_) => {
            send_line(outbox_tx, Response::err(id, PoolError::MalformedRequest.code(), PoolError::MalformedRequest.to_string()).to_line());
            return DispatchOutcome::Continue;
        }
    };

    let miner = ctx.sessions.miner_for(&s.login, &s.worker_id).await;
    let current_template = ctx.job_fabric.current().await;

    let outcome = {
        let mut jobs = s.jobs.write().await;
        let Some(job) = jobs.find_mut(&submit_params.job_id) else {
            send_line(outbox_tx, Response::err(id.clone(), PoolError::JobNotFound.code(), PoolError::JobNotFound.to_string()).to_line());
            return DispatchOutcome::Continue;
        };

        let is_stale = match &current_template {
            Some(t) => job.job_hash != t.job_hash,
            None => true,
        };
        if is_stale {
            miner.record_stale();
            metrics::inc_shares_stale();
            send_line(outbox_tx, Response::err(id.clone(), PoolError::StaleShare.code(), PoolError::StaleShare.to_string()).to_line());
            return DispatchOutcome::Continue;
        }

        let submission = ShareSubmission {
            job_id: &submit_params.job_id,
            nonce_hex: &submit_params.nonce,
            result_hex: &submit_params.result,
        };
        let job_hash_hex = hex::encode(job.job_hash);

        validator::validate_share(
            job,
            &submission,
            &s.endpoint.instance_id,
            &ctx.pool_address_hash160,
            s.endpoint.difficulty,
            &ctx.dedup,
            ctx.job_fabric.as_ref(),
        )
        .await
        .map(|validated| (validated, job_hash_hex))
    };

    match outcome {
        Ok((validated, job_hash_hex)) => {
            let now = chrono::Utc::now().timestamp();
            let mut conn = ctx.redis_conn().await;

            if let Err(e) = storage::record_last_share(&mut conn, &s.login, &s.worker_id, now).await {
                tracing::error!(error = %e, "record_last_share failed");
            }
            if let Err(e) = storage::record_diff_contribution(&mut conn, &job_hash_hex, &s.login, s.endpoint.difficulty).await {
                tracing::error!(error = %e, "record_diff_contribution failed");
            }

            let blob_hex = hex::encode(validated.blob);
            match selector::update_minimum(&mut conn, &job_hash_hex, validated.share_u64, &s.login, &blob_hex).await {
                Ok(true) => {
                    if let Err(e) = upstream::submit_share(&ctx.upstream_submit_tx, blob_hex) {
                        tracing::warn!(error = %e, "failed to forward block candidate upstream");
                    } else {
                        metrics::inc_blocks_found();
                        tracing::info!(target: "block", job_hash = %job_hash_hex, login = %s.login, share_u64 = validated.share_u64, "new minimum block candidate submitted upstream");
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "update_minimum failed"),
            }

            miner.record_valid(s.endpoint.difficulty);
            metrics::inc_shares_accepted();
            tracing::info!(target: "share", login = %s.login, worker = %s.worker_id, diff = s.endpoint.difficulty, "share accepted");
            send_line(outbox_tx, Response::ok(id, json!({ "status": "OK" })).to_line());
        }
        Err(e) => {
            let now = chrono::Utc::now().timestamp();
            match e {
                PoolError::LowDifficulty => {
                    miner.record_invalid();
                    metrics::inc_shares_low_diff();
                    let mut conn = ctx.redis_conn().await;
                    if let Err(err) = storage::record_reject_share(&mut conn, &s.login, s.endpoint.difficulty, now).await {
                        tracing::error!(error = %err, "record_reject_share failed");
                    }
                }
                PoolError::DuplicateShare => {
                    miner.record_invalid();
                    metrics::inc_shares_duplicate();
                }
                PoolError::InvalidShare => {
                    miner.record_invalid();
                    metrics::inc_shares_rejected();
                    let mut conn = ctx.redis_conn().await;
                    if let Err(err) = storage::record_invalid_share(&mut conn, &s.login, now).await {
                        tracing::error!(error = %err, "record_invalid_share failed");
                    }
                }
                _ => {}
            }
            send_line(outbox_tx, Response::err(id, e.code(), e.to_string()).to_line());
        }
    }

    DispatchOutcome::Continue
}
