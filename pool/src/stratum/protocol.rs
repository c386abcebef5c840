//! Wire types for the Stratum JSON-RPC 2.0 dialect (§4.3: login, getjob,
//! submit, keepalived).
//!
//! `id` is tagged `Option<Value>` the way a notification-capable JSON-RPC
//! peer must be; a missing or null `id`, or a missing or null `params`, is
//! a fatal protocol error handled by the dispatcher, not by this module.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    pub fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorObject { code, message: message.into() }),
        }
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }
}

/// `login` method params (§4.3 step 1): `login` is the base58Check payout
/// address, with an optional `.worker_id` suffix stripped by the caller.
#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub login: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub agent: String,
}

/// `submit` method params (§4.4 step 1).
#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    pub id: String,
    pub job_id: String,
    pub nonce: String,
    pub result: String,
}

/// Splits `"address.worker"` into `(address, worker)`; defaults the worker
/// id to `"0"` when no `.` separator is present, matching the source
/// pool's `extractWorkerId`.
pub fn split_login(raw: &str) -> (&str, &str) {
    match raw.split_once('.') {
        Some((addr, worker)) if !worker.is_empty() => (addr, worker),
        _ => (raw, "0"),
    }
}

/// Resolves `(address, worker_id)` from a `login` method's `login`/`pass`
/// fields (§4.3 step 1): the `address.worker` suffix wins if present,
/// otherwise a non-empty `pass` names the worker, otherwise `"0"`.
pub fn resolve_login(login: &str, pass: &str) -> (String, String) {
    let (addr, worker) = split_login(login);
    if addr != login {
        (addr.to_string(), worker.to_string())
    } else if !pass.is_empty() {
        (addr.to_string(), pass.to_string())
    } else {
        (addr.to_string(), "0".to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct JobNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
}

impl JobNotification {
    pub fn new(params: Value) -> Self {
        Self { jsonrpc: "2.0", method: "job", params }
    }

    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_login_defaults_worker_to_zero() {
        assert_eq!(split_login("Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx"), ("Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx", "0"));
    }

    #[test]
    fn split_login_extracts_worker_suffix() {
        assert_eq!(split_login("Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx.rig1"), ("Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx", "rig1"));
    }

    #[test]
    fn request_missing_params_deserializes_to_null() {
        // `params` is optional on the wire, but absent and explicit-null
        // are both rejected by the dispatcher (§4.3: null params closes
        // the connection for every method).
        let req: Request = serde_json::from_str(r#"{"id":1,"method":"keepalived"}"#).unwrap();
        assert_eq!(req.method, "keepalived");
        assert!(req.params.is_null());
    }

    #[test]
    fn resolve_login_prefers_dotted_suffix() {
        let (addr, worker) = resolve_login("Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx.rig1", "x");
        assert_eq!(addr, "Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx");
        assert_eq!(worker, "rig1");
    }

    #[test]
    fn resolve_login_falls_back_to_pass_then_zero() {
        let (_, worker) = resolve_login("Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx", "rig2");
        assert_eq!(worker, "rig2");
        let (_, worker) = resolve_login("Dd2KRkRceHtx7ep3qWHVAHEdjYoyPpAYx", "");
        assert_eq!(worker, "0");
    }
}
