//! Supervisor wire frames: one JSON object per `\n`-terminated UTF-8 line.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use uabridge_engine::BrowseProgress;
use uabridge_model::DriverSettings;

/// Inbound supervisor command.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum SupervisorRequest {
    GetTagsValues {
        #[serde(rename = "transID")]
        trans_id: u64,
        #[serde(rename = "deviceUid")]
        device_uid: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    SetTagsValues {
        #[serde(rename = "transID")]
        trans_id: u64,
        #[serde(rename = "deviceUid")]
        device_uid: String,
        #[serde(default)]
        tags: Vec<Map<String, Value>>,
    },
    PingDevice {
        #[serde(rename = "transID", default)]
        trans_id: u64,
        uid: String,
    },
    UpdateTagListFromDevice {
        #[serde(rename = "transID", default)]
        trans_id: u64,
        #[serde(rename = "deviceUid")]
        device_uid: String,
    },
    RestartDevice {
        #[serde(rename = "transID", default)]
        trans_id: u64,
        uid: String,
    },
    /// Config edit forwarded by the supervisor. Destroys the connection when
    /// the edited option is flagged `restartOnChange`.
    SetTag {
        #[serde(rename = "transID", default)]
        trans_id: u64,
        #[serde(rename = "deviceUid")]
        device_uid: String,
        #[serde(rename = "tagUid", default)]
        tag_uid: Option<String>,
        #[serde(default)]
        option: Option<String>,
    },
}

impl SupervisorRequest {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn trans_id(&self) -> u64 {
        match self {
            SupervisorRequest::GetTagsValues { trans_id, .. }
            | SupervisorRequest::SetTagsValues { trans_id, .. }
            | SupervisorRequest::PingDevice { trans_id, .. }
            | SupervisorRequest::UpdateTagListFromDevice { trans_id, .. }
            | SupervisorRequest::RestartDevice { trans_id, .. }
            | SupervisorRequest::SetTag { trans_id, .. } => *trans_id,
        }
    }

    pub fn cmd(&self) -> &'static str {
        match self {
            SupervisorRequest::GetTagsValues { .. } => "getTagsValues",
            SupervisorRequest::SetTagsValues { .. } => "setTagsValues",
            SupervisorRequest::PingDevice { .. } => "pingDevice",
            SupervisorRequest::UpdateTagListFromDevice { .. } => "updateTagListFromDevice",
            SupervisorRequest::RestartDevice { .. } => "restartDevice",
            SupervisorRequest::SetTag { .. } => "setTag",
        }
    }
}

pub fn handshake_frame(settings: &DriverSettings) -> Value {
    let mut frame = json!({
        "cmd": "connect",
        "uid": settings.uid,
        "version": settings.version,
        "transID": 0,
    });
    if let Some(password) = &settings.password {
        frame["password"] = Value::from(password.clone());
    }
    frame
}

pub fn response_ok(cmd: &str, trans_id: u64) -> Value {
    json!({"cmd": cmd, "transID": trans_id})
}

pub fn response_error(cmd: &str, trans_id: u64, token: &str) -> Value {
    json!({"cmd": cmd, "transID": trans_id, "errorTxt": token})
}

pub fn response_values(trans_id: u64, values: Vec<Value>) -> Value {
    json!({"cmd": "getTagsValues", "transID": trans_id, "values": values})
}

pub fn response_active(trans_id: u64, active: bool) -> Value {
    json!({"cmd": "pingDevice", "transID": trans_id, "active": active})
}

pub fn async_values_frame(trans_id: u64, device_uid: &str, values: Map<String, Value>) -> Value {
    json!({
        "cmd": "asyncTagsValues",
        "transID": trans_id,
        "deviceUid": device_uid,
        "values": values,
    })
}

pub fn progress_frame(trans_id: u64, update: &BrowseProgress) -> Value {
    json!({
        "cmd": "updateTagListFromDevice",
        "transID": trans_id,
        "progressTxt": update.text,
        "progressId": update.progress_id,
        "done": update.done,
    })
}
