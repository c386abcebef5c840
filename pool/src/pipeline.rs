//! The single in-order consumer of the Upstream Bridge's event queue
//! (§4.1: "a single in-process bounded queue... from which the Job Fabric
//! and Reward Distributor consume in-order"; §5: "another [task] owns the
//! message consumer that feeds C2 and C6 serially").
//!
//! A two-armed `match` over the bridge's `UpstreamEvent`: Task and Reward
//! traffic share one channel and are drained strictly in arrival order.

use std::sync::Arc;

use crate::context::PoolContext;
use crate::metrics;
use crate::upstream::UpstreamEvent;

/// Drains `events` forever, dispatching each Task to the Job Fabric (C2)
/// and each Reward to the Reward Distributor (C6), strictly in the order
/// the bridge observed them.
pub async fn run(ctx: Arc<PoolContext>, mut events: tokio::sync::mpsc::Receiver<UpstreamEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UpstreamEvent::Task(task) => handle_task(&ctx, task).await,
            UpstreamEvent::Reward(event) => handle_reward(&ctx, event).await,
        }
    }
    tracing::error!("upstream event queue closed, pipeline consumer exiting");
}

/// §4.2 steps 1-5: rekey on seed change, publish the new Template, then
/// broadcast a fresh Job to every live session.
async fn handle_task(ctx: &Arc<PoolContext>, task: crate::upstream::Task) {
    let applied = ctx
        .job_fabric
        .apply_task(task.job_hash, task.seed_hash, task.timestamp, task.task_index, task.buffer)
        .await;

    let template = match applied {
        Ok(Some(template)) => template,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(error = %e, "failed to apply upstream task, keeping previous template");
            return;
        }
    };

    metrics::set_template_height(template.task_index);
    ctx.sessions.broadcast_job(&template, &ctx.pool_address_hash160).await;
    metrics::inc_job_broadcasts();
    tracing::info!(
        job_hash = %hex::encode(template.job_hash),
        task_index = template.task_index,
        "new job broadcast to all sessions"
    );
}

/// §4.6: credit the pool/finder/miners for a confirmed block, or record
/// that the block belonged to another pool.
async fn handle_reward(ctx: &Arc<PoolContext>, event: crate::reward::RewardEvent) {
    let cfg = ctx.config_snapshot().await;
    let now = chrono::Utc::now().timestamp();
    let mut conn = ctx.redis_conn().await;

    match crate::reward::apply_reward(
        &mut conn,
        &cfg,
        &event,
        now,
        &ctx.rpc,
        ctx.pool_keypair.as_ref(),
        &ctx.pool_address_hash160,
    )
    .await
    {
        Ok(crate::reward::RewardOutcome::Credited) | Ok(crate::reward::RewardOutcome::NotOurs) => {}
        Err(e) => tracing::error!(error = %e, job_hash = %event.pre_hash_hex, "failed to apply reward event"),
    }
}
