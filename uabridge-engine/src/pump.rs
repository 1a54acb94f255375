use crate::{connection::ConnectionRecord, engine::ChangeSink};
use opcua::types::{DataValue, NodeId};
use std::sync::atomic::Ordering;

/// Entry point for OPC UA data-change callbacks.
///
/// Runs synchronously on the publish path: update the node's raw value,
/// reproject every fan-out tag, and hand the subscribed subset to the
/// supervisor adapter. Notifications racing a teardown are dropped.
pub(crate) fn on_data_change(
    record: &ConnectionRecord,
    node_id: &NodeId,
    dv: DataValue,
    sink: &dyn ChangeSink,
) {
    if record.closing.load(Ordering::Acquire) {
        return;
    }
    if dv.status.as_ref().map(|s| s.is_bad()).unwrap_or(false) {
        return;
    }
    let bucket = {
        let mut state = record.monitors.lock().expect("monitor state lock poisoned");
        state.apply_change(node_id, dv.value)
    };
    if !bucket.is_empty() {
        sink.publish(&record.key.device_uid, bucket);
    }
}
