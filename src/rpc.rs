//! Blocking client for the control-plane's local HTTP RPC endpoint.
//!
//! Every call is a POST of `{"type":"call","data":{"func",...}}` to the root
//! path; the answer carries the same envelope with `data.result`.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use reqwest::{blocking::Client, header::CONTENT_TYPE};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ControlPlaneError;

static ECHO_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Logged-in identity reported by `getSelfInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfInfo {
    /// Account id, normalised to a string.
    pub uin: String,
    /// Display name; may be empty while the client is still logging in.
    pub nickname: String,
}

/// Client build information reported by `getDeviceInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Device type string.
    pub dev_type: String,
    /// Client build version.
    pub build_ver: String,
}

/// Thin wrapper over `reqwest::blocking::Client` bound to one control-plane port.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    port: u16,
    base_url: String,
    client: Client,
}

impl ControlPlaneClient {
    /// Builds a client for `http://127.0.0.1:{port}` with a per-request timeout.
    pub fn new(port: u16, timeout: Duration) -> Result<Self, ControlPlaneError> {
        let client = Client::builder().timeout(timeout).no_proxy().build()?;
        Ok(Self {
            port,
            base_url: format!("http://127.0.0.1:{port}"),
            client,
        })
    }

    /// Port this client talks to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL of the endpoint.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Calls `func` and returns its `result` value.
    pub fn call(
        &self,
        func: &str,
        args: Vec<Value>,
        echo: Option<&str>,
    ) -> Result<Value, ControlPlaneError> {
        let mut data = json!({ "func": func, "args": args });
        if let Some(echo) = echo {
            data["echo"] = Value::String(echo.to_string());
        }
        let payload = json!({ "type": "call", "data": data });

        let response = self
            .client
            .post(&self.base_url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(ControlPlaneError::Status(status.as_u16()));
        }

        let body = response.text()?;
        parse_call_envelope(func, &body)
    }

    /// PID of the target process, if the control plane knows it yet.
    pub fn fetch_process_pid(&self) -> Result<Option<u32>, ControlPlaneError> {
        let echo = next_echo_id();
        let result = self.call("getProcessInfo", Vec::new(), Some(&echo))?;
        Ok(pid_from_result(&result))
    }

    /// Identity of the logged-in account; `None` until login completes.
    pub fn fetch_self_info(&self) -> Result<Option<SelfInfo>, ControlPlaneError> {
        let result = self.call("getSelfInfo", Vec::new(), None)?;
        Ok(self_info_from_result(&result))
    }

    /// Client device and build information.
    pub fn fetch_device_info(&self) -> Result<Option<DeviceInfo>, ControlPlaneError> {
        let result = self.call("getDeviceInfo", Vec::new(), None)?;
        Ok(device_info_from_result(&result))
    }
}

/// Unique correlation id for a call.
pub fn next_echo_id() -> String {
    let sequence = ECHO_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("lillia-{}-{sequence}", std::process::id())
}

/// Unwraps the `call` envelope and returns `data.result` (null when absent).
pub(crate) fn parse_call_envelope(func: &str, body: &str) -> Result<Value, ControlPlaneError> {
    let envelope: Value = serde_json::from_str(body)?;

    if envelope.get("type").and_then(Value::as_str) != Some("call") {
        return Err(ControlPlaneError::Malformed("response is not a call envelope"));
    }
    let Some(data) = envelope.get("data") else {
        return Err(ControlPlaneError::Malformed("response has no data"));
    };

    let data = match data {
        Value::String(raw) => serde_json::from_str::<Value>(raw)?,
        other => other.clone(),
    };
    let Value::Object(mut fields) = data else {
        return Err(ControlPlaneError::Malformed("data is not an object"));
    };

    let result = fields.remove("result").unwrap_or(Value::Null);
    if let Value::String(text) = &result
        && text.contains("Error")
    {
        debug!("'{func}' reported failure: {text}");
        return Err(ControlPlaneError::Remote {
            func: func.to_string(),
            message: text.clone(),
        });
    }

    Ok(result)
}

fn pid_from_result(result: &Value) -> Option<u32> {
    result
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .filter(|pid| *pid > 0)
}

fn self_info_from_result(result: &Value) -> Option<SelfInfo> {
    let uin = match result.get("uin")? {
        Value::String(text) if !text.is_empty() => text.clone(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    if uin == "0" {
        return None;
    }

    let nickname = ["nickName", "nickname", "nick"]
        .iter()
        .filter_map(|key| result.get(*key).and_then(Value::as_str))
        .find(|name| !name.is_empty())
        .unwrap_or_default()
        .to_string();

    Some(SelfInfo { uin, nickname })
}

fn device_info_from_result(result: &Value) -> Option<DeviceInfo> {
    let fields = result.as_object()?;
    let text = |key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Some(DeviceInfo {
        dev_type: text("devType"),
        build_ver: text("buildVer"),
    })
}
