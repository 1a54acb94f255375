//! Inbound command dispatch into the engine.

use crate::{
    batcher::TransIdGen,
    commands::{
        progress_frame, response_active, response_error, response_ok, response_values,
        SupervisorRequest,
    },
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uabridge_engine::{BrowseProgress, OpcEngine, ProgressSink, ReadOutcome};

/// Forwards browse progress to the supervisor. The engine echoes the
/// originating request id in every frame, so frames of a running scan keep
/// that request's `transID` even when later triggers are rejected.
pub struct ProgressForwarder {
    outbound: mpsc::UnboundedSender<String>,
}

impl ProgressForwarder {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self { outbound }
    }
}

impl ProgressSink for ProgressForwarder {
    fn progress(&self, update: BrowseProgress) {
        let frame = progress_frame(update.request_id, &update);
        if self.outbound.send(frame.to_string()).is_err() {
            debug!("outbound channel closed, progress frame dropped");
        }
    }
}

/// Parses request lines and routes them to the engine. One dispatcher serves
/// the whole link; requests are handled on their own tasks so a slow browse
/// never blocks reads of the socket.
pub struct Dispatcher {
    engine: Arc<OpcEngine>,
    ids: Arc<TransIdGen>,
    outbound: mpsc::UnboundedSender<String>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<OpcEngine>,
        ids: Arc<TransIdGen>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            engine,
            ids,
            outbound,
        }
    }

    pub async fn handle_line(&self, line: String) {
        let request = match SupervisorRequest::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "unparseable supervisor frame");
                // Best effort: answer with the raw transID if one is present.
                if let Ok(raw) = serde_json::from_str::<Value>(&line) {
                    if let (Some(cmd), Some(trans_id)) =
                        (raw["cmd"].as_str(), raw["transID"].as_u64())
                    {
                        self.send(response_error(cmd, trans_id, "ConfigError"));
                    }
                }
                return;
            }
        };
        self.ids.note_request(request.trans_id());
        let reply = self.dispatch(request).await;
        self.send(reply);
    }

    async fn dispatch(&self, request: SupervisorRequest) -> Value {
        match request {
            SupervisorRequest::GetTagsValues {
                trans_id,
                device_uid,
                tags,
            } => match self.engine.read(&device_uid, &tags).await {
                Ok(outcomes) => {
                    let values = outcomes
                        .into_iter()
                        .map(|outcome| match outcome {
                            ReadOutcome::Value(Some(v)) => v.to_json(),
                            ReadOutcome::Value(None) => Value::Null,
                            ReadOutcome::Error(token) => {
                                serde_json::json!({"errorTxt": token})
                            }
                        })
                        .collect();
                    response_values(trans_id, values)
                }
                Err(e) => response_error("getTagsValues", trans_id, e.wire_token()),
            },
            SupervisorRequest::SetTagsValues {
                trans_id,
                device_uid,
                tags,
            } => {
                let entries: Vec<(String, Value)> = tags
                    .into_iter()
                    .flat_map(|entry| entry.into_iter())
                    .collect();
                match self.engine.write(&device_uid, &entries).await {
                    Ok(()) => response_ok("setTagsValues", trans_id),
                    Err(e) => response_error("setTagsValues", trans_id, e.wire_token()),
                }
            }
            SupervisorRequest::PingDevice { trans_id, uid } => {
                match self.engine.status(&uid).await {
                    Ok(active) => response_active(trans_id, active),
                    Err(e) => response_error("pingDevice", trans_id, e.wire_token()),
                }
            }
            SupervisorRequest::UpdateTagListFromDevice {
                trans_id,
                device_uid,
            } => match self.engine.browse_device(&device_uid, trans_id).await {
                Ok(()) => response_ok("updateTagListFromDevice", trans_id),
                Err(e) => response_error("updateTagListFromDevice", trans_id, e.wire_token()),
            },
            SupervisorRequest::RestartDevice { trans_id, uid } => {
                match self.engine.restart(&uid).await {
                    Ok(()) => response_ok("restartDevice", trans_id),
                    Err(e) => response_error("restartDevice", trans_id, e.wire_token()),
                }
            }
            SupervisorRequest::SetTag {
                trans_id,
                device_uid,
                tag_uid,
                option,
            } => {
                let result = match &option {
                    Some(option) => {
                        self.engine
                            .option_changed(&device_uid, option, tag_uid.is_some())
                            .await
                    }
                    // No option named: treat the edit as an explicit restart.
                    None => self.engine.restart(&device_uid).await,
                };
                match result {
                    Ok(()) => response_ok("setTag", trans_id),
                    Err(e) => response_error("setTag", trans_id, e.wire_token()),
                }
            }
        }
    }

    fn send(&self, frame: Value) {
        if self.outbound.send(frame.to_string()).is_err() {
            debug!("outbound channel closed, response dropped");
        }
    }
}
