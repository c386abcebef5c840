//! Upstream Bridge (C1): §4.1. A persistent duplex channel to the node: a
//! WebSocket message bus for Task/Reward/Submit traffic, plus a separate
//! JSON-RPC leg (transaction submission) carried over HTTP.
//!
//! The WebSocket leg replaces the transport used for job polling; the RPC
//! leg used for payout submission is a distinct client with its own
//! circuit breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::reward::RewardEvent;

/// Capacity of the in-process queue the Job Fabric and Reward Distributor
/// consume from (§4.1: "a single in-process bounded queue, capacity 512").
pub const QUEUE_CAPACITY: usize = 512;

/// Fixed reconnect delay on the WebSocket leg (§4.1: "retry with a fixed
/// ≥1s delay until connected").
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Task {
    pub job_hash: [u8; 32],
    pub seed_hash: [u8; 32],
    pub timestamp: u64,
    pub task_index: u64,
    pub buffer: [u8; 32],
}

/// What the Job Fabric / Reward Distributor consumer loop sees (§4.1).
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Task(Task),
    Reward(RewardEvent),
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(rename = "msgType")]
    msg_type: u8,
    #[serde(rename = "msgContent")]
    msg_content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TaskContent {
    #[serde(rename = "jobHash")]
    job_hash: String,
    #[serde(rename = "seedHash")]
    seed_hash: String,
    timestamp: u64,
    #[serde(rename = "taskIndex")]
    task_index: u64,
    buffer: String,
}

#[derive(Debug, Deserialize)]
struct RewardContent {
    #[serde(rename = "preHash")]
    pre_hash: String,
    share: String,
    amount: i64,
    #[serde(default)]
    donate: i64,
}

#[derive(Debug, Serialize)]
struct SubmitContent<'a> {
    blob: &'a str,
}

fn hex32(s: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(s)?;
    let mut out = [0u8; 32];
    if bytes.len() != 32 {
        anyhow::bail!("expected 32 bytes, got {}", bytes.len());
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn hex20(s: &str) -> anyhow::Result<[u8; 20]> {
    let bytes = hex::decode(s)?;
    if bytes.len() < 20 {
        anyhow::bail!("expected at least 20 bytes, got {}", bytes.len());
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[0..20]);
    Ok(out)
}

fn parse_wire_message(raw: &str) -> anyhow::Result<Option<UpstreamEvent>> {
    let wire: WireMessage = serde_json::from_str(raw)?;
    match wire.msg_type {
        1 => {
            let content: TaskContent = serde_json::from_value(wire.msg_content)?;
            Ok(Some(UpstreamEvent::Task(Task {
                job_hash: hex32(&content.job_hash)?,
                seed_hash: hex32(&content.seed_hash)?,
                timestamp: content.timestamp,
                task_index: content.task_index,
                buffer: hex32(&content.buffer)?,
            })))
        }
        3 => {
            let content: RewardContent = serde_json::from_value(wire.msg_content)?;
            Ok(Some(UpstreamEvent::Reward(RewardEvent {
                pre_hash_hex: content.pre_hash,
                share_hash160: hex20(&content.share)?,
                amount: content.amount,
                donate: content.donate,
            })))
        }
        other => {
            tracing::debug!(msg_type = other, "ignoring unrecognized upstream message type");
            Ok(None)
        }
    }
}

/// Runs the WebSocket leg: connect, read frames, parse, forward to `events`;
/// drains `outbound_rx` onto the same socket as Submit messages. Reconnects
/// on any error with [`RECONNECT_DELAY`], forever, until the process is
/// cancelled.
pub async fn run_bridge(
    upstream_url: String,
    events: mpsc::Sender<UpstreamEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    loop {
        tracing::info!(url = %upstream_url, "connecting to upstream message bus");
        let stream = match tokio_tungstenite::connect_async(&upstream_url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                tracing::warn!("upstream connect failed: {}; retrying", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        tracing::info!("upstream message bus connected");

        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match parse_wire_message(&text) {
                                Ok(Some(event)) => {
                                    if events.send(event).await.is_err() {
                                        tracing::error!("upstream event queue closed, stopping bridge");
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => tracing::warn!("failed to parse upstream message: {}", e),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::warn!("upstream connection closed, reconnecting");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("upstream read error: {}; reconnecting", e);
                            break;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(blob_hex) => {
                            let content = SubmitContent { blob: &blob_hex };
                            let frame = json!({ "msgType": 2, "msgContent": content }).to_string();
                            if let Err(e) = write.send(WsMessage::Text(frame)).await {
                                tracing::warn!("failed to send submit upstream: {}; reconnecting", e);
                                break;
                            }
                        }
                        None => {
                            tracing::error!("outbound submit channel closed, stopping bridge");
                            return;
                        }
                    }
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Queues a share blob to be sent upstream as a Submit message (§4.1: "if
/// disconnected on submit, fail the submit with a typed error"). The
/// in-memory channel never blocks the caller; a closed channel (bridge
/// task gone) is the only failure mode.
pub fn submit_share(
    outbound_tx: &mpsc::UnboundedSender<String>,
    blob_hex: String,
) -> anyhow::Result<()> {
    outbound_tx
        .send(blob_hex)
        .map_err(|_| anyhow::anyhow!("upstream bridge is not connected"))
}

/// Circuit breaker guarding the RPC leg used for payout transaction
/// submission (§10 "Supplemented features"): trips open after a run of
/// consecutive failures, resets after a cooldown.
#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        if self.failures >= self.max_failures {
            self.is_open = true;
            tracing::error!("RPC circuit breaker tripped after {} failures", self.failures);
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("RPC circuit breaker reset after a successful call");
        }
    }

    fn check(&mut self) -> anyhow::Result<()> {
        if self.is_open {
            if let Some(last) = self.last_failure {
                if last.elapsed() > self.reset_timeout {
                    tracing::info!("RPC circuit breaker half-open, retrying");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    anyhow::bail!("upstream RPC circuit breaker is open");
                }
            }
        }
        Ok(())
    }
}

/// HTTP JSON-RPC client used only for submitting signed payout transaction
/// blocks (§4.7 step 3).
pub struct UpstreamRpcClient {
    rpc_url: String,
    http: reqwest::Client,
    breaker: Arc<RwLock<CircuitBreaker>>,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

impl UpstreamRpcClient {
    pub fn new(rpc_url: String) -> Self {
        Self {
            rpc_url,
            http: reqwest::Client::new(),
            breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        }
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        {
            let mut breaker = self.breaker.write().await;
            breaker.check()?;
        }

        let payload = RpcRequest { jsonrpc: "2.0", id: 1, method, params };
        let result = async {
            let resp = self
                .http
                .post(&self.rpc_url)
                .json(&payload)
                .timeout(Duration::from_secs(30))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("rpc connection failed: {}", e))?;

            if !resp.status().is_success() {
                anyhow::bail!("rpc http error: {}", resp.status());
            }

            let parsed: RpcResponse = resp.json().await?;
            if let Some(err) = parsed.error {
                anyhow::bail!("rpc error: {}", err);
            }
            Ok(parsed.result.unwrap_or(serde_json::Value::Null))
        }
        .await;

        let mut breaker = self.breaker.write().await;
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    /// Submit a signed transaction block; returns the hash the node
    /// computed, which the caller must compare to the locally computed
    /// hash (§4.7 step 3: "mismatch is an error and the chunk is
    /// abandoned").
    pub async fn send_raw_transaction(&self, block_hex: &str) -> anyhow::Result<String> {
        let result = self
            .call("xdag_sendRawTransaction", json!({ "data": block_hex }))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("xdag_sendRawTransaction returned no hash"))
    }

    /// Poll transaction confirmation status for payout confirmation
    /// tracking (§10 supplemented feature).
    pub async fn get_transaction_status(&self, tx_hash: &str) -> anyhow::Result<Option<String>> {
        let result = self.call("xdag_getTransaction", json!([tx_hash])).await?;
        Ok(result.get("status").and_then(|v| v.as_str()).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_message() {
        let raw = json!({
            "msgType": 1,
            "msgContent": {
                "jobHash": "11".repeat(32),
                "seedHash": "22".repeat(32),
                "timestamp": 1_700_000_000u64,
                "taskIndex": 7,
                "buffer": "33".repeat(32),
            }
        })
        .to_string();

        let event = parse_wire_message(&raw).unwrap().unwrap();
        match event {
            UpstreamEvent::Task(t) => {
                assert_eq!(t.job_hash, [0x11; 32]);
                assert_eq!(t.task_index, 7);
            }
            _ => panic!("expected Task"),
        }
    }

    #[test]
    fn parses_reward_message() {
        let raw = json!({
            "msgType": 3,
            "msgContent": {
                "preHash": "ab".repeat(32),
                "share": "cd".repeat(24),
                "amount": 100,
                "donate": 5,
            }
        })
        .to_string();

        let event = parse_wire_message(&raw).unwrap().unwrap();
        match event {
            UpstreamEvent::Reward(r) => {
                assert_eq!(r.amount, 100);
                assert_eq!(r.donate, 5);
                assert_eq!(r.share_hash160, [0xcd; 20]);
            }
            _ => panic!("expected Reward"),
        }
    }

    #[test]
    fn unknown_msg_type_is_ignored() {
        let raw = json!({ "msgType": 99, "msgContent": {} }).to_string();
        assert!(parse_wire_message(&raw).unwrap().is_none());
    }
}
