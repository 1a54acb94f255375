use crate::connection::ConnectionRecord;
use opcua::types::{
    enums::MonitoringMode, MonitoredItemCreateRequest, MonitoringParameters, NodeId, ReadValueId,
    TimestampsToReturn,
};
use std::{str::FromStr, sync::Arc};
use tracing::warn;
use uabridge_model::TagConfig;

const SAMPLING_INTERVAL_MS: f64 = 1000.0;
const QUEUE_SIZE: u32 = 10;

/// Register any tag not yet known to the connection.
///
/// Tags whose node is already monitored join that node's fan-out list and
/// are seeded from its last raw value; each genuinely new node gets exactly
/// one monitored item. Per-node creation failures are logged and never tear
/// the connection down.
///
/// Must run under the device gate so two concurrent registrations of the
/// same node cannot both create monitored items.
pub(crate) async fn register_tags(record: &Arc<ConnectionRecord>, tags: &[TagConfig]) {
    let mut to_create: Vec<(NodeId, u32)> = Vec::new();
    {
        let mut state = record.monitors.lock().expect("monitor state lock poisoned");
        for cfg in tags {
            if state.contains_tag(&cfg.name) {
                continue;
            }
            let node_id = match NodeId::from_str(&cfg.node_id) {
                Ok(id) => id,
                Err(_) => {
                    warn!(
                        tag = %cfg.name,
                        node_id = %cfg.node_id,
                        "invalid node id, tag will not be monitored"
                    );
                    continue;
                }
            };
            if state.insert_tag(cfg.clone(), node_id.clone()) {
                to_create.push((node_id, record.next_handle()));
            }
        }
    }
    if to_create.is_empty() {
        return;
    }

    let requests: Vec<MonitoredItemCreateRequest> = to_create
        .iter()
        .map(|(node_id, client_handle)| MonitoredItemCreateRequest {
            item_to_monitor: ReadValueId::new_value(node_id.clone()),
            monitoring_mode: MonitoringMode::Reporting,
            requested_parameters: MonitoringParameters {
                client_handle: *client_handle,
                sampling_interval: SAMPLING_INTERVAL_MS,
                filter: Default::default(),
                queue_size: QUEUE_SIZE,
                discard_oldest: true,
            },
        })
        .collect();

    match record
        .session
        .create_monitored_items(record.subscription_id(), TimestampsToReturn::Both, requests)
        .await
    {
        Ok(results) => {
            for (i, res) in results.into_iter().enumerate() {
                let status = res.status_code;
                if !status.is_good() {
                    warn!(
                        device = %record.key.device_uid,
                        node = ?to_create.get(i).map(|(n, _)| n),
                        %status,
                        "monitored item creation failed"
                    );
                }
            }
        }
        Err(status) => {
            warn!(
                device = %record.key.device_uid,
                %status,
                "create_monitored_items call failed"
            );
        }
    }
}
