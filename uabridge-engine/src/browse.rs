use crate::codec;
use futures::future::BoxFuture;
use opcua::{
    client::Session,
    types::{
        BrowseDescription, BrowseDescriptionResultMask, BrowseDirection, NodeClass, NodeId,
        ObjectId, ReadValueId, ReferenceDescription, ReferenceTypeId, StatusCode,
        TimestampsToReturn, Variant,
    },
};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::debug;
use uabridge_error::BridgeResult;
use uabridge_model::DiscoveredTag;

const MAX_REFERENCES_PER_NODE: u32 = 1000;

struct WalkContext {
    out: Vec<DiscoveredTag>,
    visited: HashSet<NodeId>,
    counter: Arc<AtomicU64>,
}

/// Recursive descent over the server address space from RootFolder.
///
/// Emits one flat, insertion-ordered entry per discovered value (one per
/// index for one-dimensional arrays). Per-node failures are logged and the
/// traversal keeps whatever it has collected.
pub(crate) async fn walk_address_space(
    session: &Arc<Session>,
    counter: Arc<AtomicU64>,
) -> BridgeResult<Vec<DiscoveredTag>> {
    let root: NodeId = ObjectId::RootFolder.into();
    let mut ctx = WalkContext {
        out: Vec::new(),
        visited: HashSet::from([root.clone()]),
        counter,
    };
    walk(session, root, String::new(), &mut ctx).await;
    Ok(ctx.out)
}

fn walk<'a>(
    session: &'a Arc<Session>,
    node_id: NodeId,
    path: String,
    ctx: &'a mut WalkContext,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let references = match browse_children(session, &node_id).await {
            Ok(refs) => refs,
            Err(status) => {
                debug!(node = %node_id, %status, "browse failed, subtree skipped");
                return;
            }
        };
        for reference in references {
            let target = reference.node_id.node_id.clone();
            if !ctx.visited.insert(target.clone()) {
                continue;
            }
            let display = display_name(&reference);
            let child_path = if path.is_empty() {
                display
            } else {
                format!("{path}/{display}")
            };
            if matches!(reference.node_class, NodeClass::Variable | NodeClass::Object) {
                emit_value_entries(session, &target, &child_path, ctx).await;
            }
            // Objects and Variables may both have descendants worth visiting.
            walk(session, target, child_path, ctx).await;
        }
    })
}

/// Read the node's current value and emit discovered entries for it: one per
/// index for one-dimensional arrays, a single `arrayIndex = -1` entry
/// otherwise. Nodes without a readable value (typically Objects) emit
/// nothing.
async fn emit_value_entries(
    session: &Arc<Session>,
    node_id: &NodeId,
    path: &str,
    ctx: &mut WalkContext,
) {
    let read = session
        .read(
            &[ReadValueId::new_value(node_id.clone())],
            TimestampsToReturn::Neither,
            0.0,
        )
        .await;
    let dv = match read {
        Ok(mut values) if !values.is_empty() => values.remove(0),
        Ok(_) => return,
        Err(status) => {
            debug!(node = %node_id, %status, "value read failed during browse");
            return;
        }
    };
    if dv.status.as_ref().map(|s| s.is_bad()).unwrap_or(false) {
        return;
    }
    let Some(variant) = dv.value else { return };

    let node_str = node_id.to_string();
    match &variant {
        Variant::Array(arr) if one_dimensional(arr) => {
            let node_type = codec::variant_data_type_code(&variant);
            let size = arr.values.len().max(1);
            for index in 0..size {
                ctx.out.push(DiscoveredTag {
                    name: format!("{path}/_value[{index}]"),
                    node_id: node_str.clone(),
                    node_type,
                    array_index: index as i64,
                });
                ctx.counter.fetch_add(1, Ordering::Release);
            }
        }
        other => {
            ctx.out.push(DiscoveredTag {
                name: format!("{path}/_value"),
                node_id: node_str,
                node_type: codec::variant_data_type_code(other),
                array_index: -1,
            });
            ctx.counter.fetch_add(1, Ordering::Release);
        }
    }
}

fn one_dimensional(arr: &opcua::types::Array) -> bool {
    arr.dimensions
        .as_ref()
        .map(|dims| dims.len() <= 1)
        .unwrap_or(true)
}

async fn browse_children(
    session: &Arc<Session>,
    node_id: &NodeId,
) -> Result<Vec<ReferenceDescription>, StatusCode> {
    let description = BrowseDescription {
        node_id: node_id.clone(),
        browse_direction: BrowseDirection::Forward,
        reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
        include_subtypes: true,
        node_class_mask: 0,
        result_mask: BrowseDescriptionResultMask::all().bits(),
    };
    let mut results = session
        .browse(&[description], MAX_REFERENCES_PER_NODE, None)
        .await?;
    if results.is_empty() {
        return Ok(Vec::new());
    }
    let result = results.remove(0);
    if result.status_code.is_bad() {
        return Err(result.status_code);
    }
    Ok(result.references.unwrap_or_default())
}

fn display_name(reference: &ReferenceDescription) -> String {
    let display = reference.display_name.text.as_ref();
    if display.is_empty() {
        reference.browse_name.name.as_ref().to_string()
    } else {
        display.to_string()
    }
}
