//! JSON-RPC 2.0 envelope handling: request construction, inbound frame
//! classification, and the closed set of RPC methods this client speaks.

use serde_json::Value;

/// `src` field stamped on every outgoing request.
pub const CLIENT_ID: &str = "shusefs-client";

// ---------------------------------------------------------------------------
// Method set
// ---------------------------------------------------------------------------

/// Every RPC method this client issues. Dispatch is by exact match on the
/// stored request's `method` field — `Switch.SetConfig` can never be
/// mistaken for `Switch.Set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    SysGetConfig,
    SysSetConfig,
    MqttGetConfig,
    MqttSetConfig,
    SwitchGetConfig,
    SwitchSetConfig,
    SwitchSet,
    SwitchGetStatus,
    InputGetConfig,
    InputSetConfig,
    InputGetStatus,
    ScriptList,
    ScriptGetCode,
    ScriptPutCode,
    ScheduleList,
    ScheduleCreate,
    ScheduleUpdate,
    ScheduleDelete,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcMethod::SysGetConfig => "Sys.GetConfig",
            RpcMethod::SysSetConfig => "Sys.SetConfig",
            RpcMethod::MqttGetConfig => "MQTT.GetConfig",
            RpcMethod::MqttSetConfig => "MQTT.SetConfig",
            RpcMethod::SwitchGetConfig => "Switch.GetConfig",
            RpcMethod::SwitchSetConfig => "Switch.SetConfig",
            RpcMethod::SwitchSet => "Switch.Set",
            RpcMethod::SwitchGetStatus => "Switch.GetStatus",
            RpcMethod::InputGetConfig => "Input.GetConfig",
            RpcMethod::InputSetConfig => "Input.SetConfig",
            RpcMethod::InputGetStatus => "Input.GetStatus",
            RpcMethod::ScriptList => "Script.List",
            RpcMethod::ScriptGetCode => "Script.GetCode",
            RpcMethod::ScriptPutCode => "Script.PutCode",
            RpcMethod::ScheduleList => "Schedule.List",
            RpcMethod::ScheduleCreate => "Schedule.Create",
            RpcMethod::ScheduleUpdate => "Schedule.Update",
            RpcMethod::ScheduleDelete => "Schedule.Delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Sys.GetConfig" => RpcMethod::SysGetConfig,
            "Sys.SetConfig" => RpcMethod::SysSetConfig,
            "MQTT.GetConfig" => RpcMethod::MqttGetConfig,
            "MQTT.SetConfig" => RpcMethod::MqttSetConfig,
            "Switch.GetConfig" => RpcMethod::SwitchGetConfig,
            "Switch.SetConfig" => RpcMethod::SwitchSetConfig,
            "Switch.Set" => RpcMethod::SwitchSet,
            "Switch.GetStatus" => RpcMethod::SwitchGetStatus,
            "Input.GetConfig" => RpcMethod::InputGetConfig,
            "Input.SetConfig" => RpcMethod::InputSetConfig,
            "Input.GetStatus" => RpcMethod::InputGetStatus,
            "Script.List" => RpcMethod::ScriptList,
            "Script.GetCode" => RpcMethod::ScriptGetCode,
            "Script.PutCode" => RpcMethod::ScriptPutCode,
            "Schedule.List" => RpcMethod::ScheduleList,
            "Schedule.Create" => RpcMethod::ScheduleCreate,
            "Schedule.Update" => RpcMethod::ScheduleUpdate,
            "Schedule.Delete" => RpcMethod::ScheduleDelete,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Request construction
// ---------------------------------------------------------------------------

/// Build a request envelope. `params` is omitted entirely when `None`.
pub fn build_request(method: RpcMethod, id: u64, params: Option<&Value>) -> String {
    match params {
        Some(p) => format!(
            r#"{{"jsonrpc":"2.0","id":{id},"src":"{CLIENT_ID}","method":"{}","params":{p}}}"#,
            method.as_str()
        ),
        None => format!(
            r#"{{"jsonrpc":"2.0","id":{id},"src":"{CLIENT_ID}","method":"{}"}}"#,
            method.as_str()
        ),
    }
}

/// Parse the method of a stored request back out of its envelope.
pub fn method_of_request(request: &str) -> Option<RpcMethod> {
    let v: Value = serde_json::from_str(request).ok()?;
    RpcMethod::parse(v.get("method")?.as_str()?)
}

/// Extract `params.id` from a stored request (switch / input / script id).
pub fn instance_id_of_request(request: &str) -> Option<usize> {
    let v: Value = serde_json::from_str(request).ok()?;
    let id = v.get("params")?.get("id")?.as_i64()?;
    usize::try_from(id).ok()
}

// ---------------------------------------------------------------------------
// Inbound frame classification
// ---------------------------------------------------------------------------

/// An inbound frame, classified.
#[derive(Debug)]
pub enum Frame {
    /// Solicited reply: numeric `id` plus a `result` or `error` member.
    Response { id: u64, body: Value },
    /// Device-initiated notification (`NotifyStatus`, `NotifyEvent`, …).
    Notification { method: String, params: Option<Value> },
}

/// Classify one WebSocket text frame. Frames that are not JSON objects
/// parse-fail; the caller logs and skips them.
pub fn classify(text: &str) -> Result<Frame, serde_json::Error> {
    let v: Value = serde_json::from_str(text)?;

    let id = v.get("id").and_then(Value::as_u64);
    let has_result_or_error = v.get("result").is_some() || v.get("error").is_some();

    if let (Some(id), true) = (id, has_result_or_error) {
        return Ok(Frame::Response { id, body: v });
    }

    let method = v
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = v.get("params").cloned();
    Ok(Frame::Notification { method, params })
}

/// If the response body carries an `error` member, return its message.
pub fn error_message(body: &Value) -> Option<String> {
    let err = body.get("error")?;
    Some(
        err.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
    )
}

// ===========================================================================
// Tests
// ===========================================================================
