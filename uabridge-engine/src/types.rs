use crate::codec;
use opcua::types::{NodeId, Variant};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use uabridge_model::TagConfig;

/// Supervisor-facing value of a tag.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TagValue::Int(n) => serde_json::Value::from(*n),
            TagValue::Float(f) => serde_json::Value::from(*f),
            TagValue::Text(s) => serde_json::Value::from(s.clone()),
        }
    }
}

/// Per-tag element of a read reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Last projected value, `None` until the first publish arrives.
    Value(Option<TagValue>),
    /// Wire error token for this tag (unknown name, unreadable options).
    Error(&'static str),
}

/// Connection map key. A single endpoint may host several logical devices,
/// so the device uid is always part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub endpoint_url: String,
    pub device_uid: String,
}

/// Runtime snapshot of one tag plus its observed state.
#[derive(Debug)]
pub struct TagRecord {
    pub cfg: TagConfig,
    /// True once the supervisor has asked for this tag by name.
    pub subscribed: AtomicBool,
    value: Mutex<Option<TagValue>>,
}

impl TagRecord {
    pub fn new(cfg: TagConfig) -> Self {
        Self {
            cfg,
            subscribed: AtomicBool::new(false),
            value: Mutex::new(None),
        }
    }

    pub fn value(&self) -> Option<TagValue> {
        self.value.lock().expect("tag value lock poisoned").clone()
    }

    pub fn set_value(&self, v: Option<TagValue>) {
        *self.value.lock().expect("tag value lock poisoned") = v;
    }
}

/// Fan-out index entry: one monitored item serves every tag that references
/// the node, each with its own array index and type projection.
#[derive(Debug, Default)]
pub struct NodeRecord {
    pub original: Option<Variant>,
    pub tags: Vec<Arc<TagRecord>>,
}

/// Registry maps of one connection: tag-name -> record and node-id -> fan-out.
#[derive(Debug, Default)]
pub struct MonitorState {
    tags: HashMap<String, Arc<TagRecord>>,
    ns: HashMap<NodeId, NodeRecord>,
}

impl MonitorState {
    /// Add a tag to the registry. Returns `true` when the node is new and a
    /// monitored item must be created; a tag whose node is already monitored
    /// joins the fan-out list and is seeded from the node's last raw value.
    pub fn insert_tag(&mut self, cfg: TagConfig, node_id: NodeId) -> bool {
        debug_assert!(!self.tags.contains_key(&cfg.name));
        let record = Arc::new(TagRecord::new(cfg));
        self.tags.insert(record.cfg.name.clone(), Arc::clone(&record));
        match self.ns.get_mut(&node_id) {
            Some(node) => {
                record.set_value(codec::project_value(&record.cfg, node.original.as_ref()));
                node.tags.push(record);
                false
            }
            None => {
                self.ns.insert(
                    node_id,
                    NodeRecord {
                        original: None,
                        tags: vec![record],
                    },
                );
                true
            }
        }
    }

    pub fn contains_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn tag(&self, name: &str) -> Option<&Arc<TagRecord>> {
        self.tags.get(name)
    }

    pub fn original_value(&self, node_id: &NodeId) -> Option<Variant> {
        self.ns.get(node_id).and_then(|n| n.original.clone())
    }

    /// Apply a raw data change: store the original value, reproject every
    /// fan-out tag in list order, and return the `(name, value)` bucket of
    /// subscribed tags for the supervisor batcher.
    pub fn apply_change(
        &mut self,
        node_id: &NodeId,
        raw: Option<Variant>,
    ) -> Vec<(String, Option<TagValue>)> {
        let Some(node) = self.ns.get_mut(node_id) else {
            // Raced with teardown or an unknown item; drop the notification.
            return Vec::new();
        };
        node.original = raw;
        let mut bucket = Vec::with_capacity(node.tags.len());
        for tag in &node.tags {
            let projected = codec::project_value(&tag.cfg, node.original.as_ref());
            tag.set_value(projected.clone());
            if tag.subscribed.load(Ordering::Acquire) {
                bucket.push((tag.cfg.name.clone(), projected));
            }
        }
        bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcua::types::{Array, VariantScalarTypeId};
    use uabridge_model::TagKind;

    fn cfg(name: &str, array_index: i64) -> TagConfig {
        TagConfig {
            name: name.into(),
            kind: TagKind::Int,
            read: true,
            write: true,
            node_id: "ns=2;s=Arr".into(),
            node_type: 6,
            array_index,
        }
    }

    fn node() -> NodeId {
        "ns=2;s=Arr".parse().unwrap()
    }

    fn array(values: &[i32]) -> Variant {
        let arr = Array::new(
            VariantScalarTypeId::Int32,
            values.iter().map(|v| Variant::Int32(*v)).collect::<Vec<_>>(),
        )
        .unwrap();
        Variant::Array(Box::new(arr))
    }

    #[test]
    fn second_tag_on_same_node_needs_no_monitor() {
        let mut st = MonitorState::default();
        assert!(st.insert_tag(cfg("a0", 0), node()));
        assert!(!st.insert_tag(cfg("a3", 3), node()));
    }

    #[test]
    fn fan_out_projects_every_tag_in_list_order() {
        let mut st = MonitorState::default();
        st.insert_tag(cfg("a0", 0), node());
        st.insert_tag(cfg("a3", 3), node());
        st.tag("a0").unwrap().subscribed.store(true, Ordering::Release);
        st.tag("a3").unwrap().subscribed.store(true, Ordering::Release);

        let bucket = st.apply_change(&node(), Some(array(&[1, 2, 3, 4])));
        assert_eq!(
            bucket,
            vec![
                ("a0".to_string(), Some(TagValue::Int(1))),
                ("a3".to_string(), Some(TagValue::Int(4))),
            ]
        );
        assert_eq!(st.tag("a0").unwrap().value(), Some(TagValue::Int(1)));
        assert_eq!(st.tag("a3").unwrap().value(), Some(TagValue::Int(4)));
    }

    #[test]
    fn unsubscribed_tags_update_silently() {
        let mut st = MonitorState::default();
        st.insert_tag(cfg("a0", 0), node());
        let bucket = st.apply_change(&node(), Some(array(&[9])));
        assert!(bucket.is_empty());
        assert_eq!(st.tag("a0").unwrap().value(), Some(TagValue::Int(9)));
    }

    #[test]
    fn late_registration_is_seeded_from_original_value() {
        let mut st = MonitorState::default();
        st.insert_tag(cfg("a0", 0), node());
        st.apply_change(&node(), Some(array(&[5, 6])));

        // a1 registers after the publish and sees a value immediately
        assert!(!st.insert_tag(cfg("a1", 1), node()));
        assert_eq!(st.tag("a1").unwrap().value(), Some(TagValue::Int(6)));
    }

    #[test]
    fn change_for_unknown_node_is_dropped() {
        let mut st = MonitorState::default();
        let other: NodeId = "ns=2;s=Other".parse().unwrap();
        assert!(st.apply_change(&other, Some(Variant::Int32(1))).is_empty());
    }
}
