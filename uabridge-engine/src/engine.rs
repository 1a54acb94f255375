use crate::{
    browse, codec,
    connection::{ConnectionManager, DestroyReason},
    types::{ReadOutcome, TagValue},
};
use opcua::types::{NodeId, WriteValue};
use serde_json::Value as JsonValue;
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uabridge_error::{BridgeError, BridgeResult};
use uabridge_model::{ConfigStore, ConfigView, TagConfig};

/// Receiver of per-change notifications. Called synchronously from the OPC UA
/// publish path; the supervisor adapter owns batching and coalescing.
pub trait ChangeSink: Send + Sync {
    fn publish(&self, device_uid: &str, values: Vec<(String, Option<TagValue>)>);
}

/// Receiver of browse progress frames.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, update: BrowseProgress);
}

/// Invoked once after a successful browse population so the host can persist
/// the updated configuration.
pub trait ConfigPersist: Send + Sync {
    fn persist(&self) -> BridgeResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseProgress {
    pub text: String,
    pub progress_id: u64,
    pub done: bool,
    /// Opaque correlation id of the request this frame answers, echoed back
    /// so the adapter can tag frames with the originating `transID`. Frames
    /// of a running scan always carry the id of the request that started it.
    pub request_id: u64,
}

/// Driver-level browse state. Browsing is single-flight across all devices,
/// so this lives on the engine, not in any connection record.
struct BrowseShared {
    running: AtomicBool,
    progress_id: AtomicU64,
    counter: Arc<AtomicU64>,
}

/// The OPC UA driver engine: request dispatch over per-device connections.
pub struct OpcEngine {
    store: ConfigStore,
    view: ConfigView,
    conn: Arc<ConnectionManager>,
    browse: BrowseShared,
    progress: Arc<dyn ProgressSink>,
    persist: Arc<dyn ConfigPersist>,
}

impl OpcEngine {
    pub fn new(
        store: ConfigStore,
        change_sink: Arc<dyn ChangeSink>,
        progress_sink: Arc<dyn ProgressSink>,
        persist: Arc<dyn ConfigPersist>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let view = store.view();
        let conn = Arc::new(ConnectionManager::new(view.clone(), change_sink, cancel));
        Arc::new(Self {
            store,
            view,
            conn,
            browse: BrowseShared {
                running: AtomicBool::new(false),
                progress_id: AtomicU64::new(0),
                counter: Arc::new(AtomicU64::new(0)),
            },
            progress: progress_sink,
            persist,
        })
    }

    /// `pingDevice`: true iff a live, subscribed connection exists. When it
    /// does not, a background connect is seeded with the device's first tag
    /// and `false` is returned immediately.
    pub async fn status(&self, device_uid: &str) -> BridgeResult<bool> {
        let settings = self
            .view
            .device_settings(device_uid)
            .ok_or(BridgeError::DeviceIdNotFound)?;
        if settings.endpoint_url.is_none() {
            return Err(BridgeError::DeviceIdNotFound);
        }
        if let Some(record) = self.conn.peek(device_uid) {
            if record.connected.load(Ordering::Acquire) && !record.closing.load(Ordering::Acquire)
            {
                return Ok(true);
            }
        }
        let seed: Vec<TagConfig> = self
            .view
            .first_tag(device_uid)
            .and_then(|tag| TagConfig::from_tag(&tag).ok())
            .into_iter()
            .collect();
        let conn = Arc::clone(&self.conn);
        let uid = device_uid.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.ensure(&uid, &seed).await {
                debug!(device = %uid, error = %e, "background connect failed");
            }
        });
        Ok(false)
    }

    /// `getTagsValues`: last projected value per requested tag, from the
    /// subscription cache. Unknown or misconfigured tags carry their error
    /// token in place; the first use of a tag registers it.
    pub async fn read(
        &self,
        device_uid: &str,
        names: &[String],
    ) -> BridgeResult<Vec<ReadOutcome>> {
        if !self.view.device_exists(device_uid) {
            return Err(BridgeError::DeviceIdNotFound);
        }
        let resolved: Vec<Result<TagConfig, &'static str>> = names
            .iter()
            .map(|name| match self.view.find_tag(device_uid, name) {
                None => Err("TagNotFound"),
                Some(tag) => TagConfig::from_tag(&tag).map_err(|_| "ConfigError"),
            })
            .collect();
        let known: Vec<TagConfig> = resolved
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .cloned()
            .collect();

        let record = self.conn.ensure(device_uid, &known).await?;
        let state = record.monitors.lock().expect("monitor state lock poisoned");
        Ok(resolved
            .into_iter()
            .map(|entry| match entry {
                Err(token) => ReadOutcome::Error(token),
                Ok(cfg) => match state.tag(&cfg.name) {
                    Some(tag) => {
                        tag.subscribed.store(true, Ordering::Release);
                        ReadOutcome::Value(tag.value())
                    }
                    // Registered nowhere: the node id did not parse.
                    None => ReadOutcome::Error("ConfigError"),
                },
            })
            .collect())
    }

    /// `setTagsValues`: coerce and write every entry; the first per-tag
    /// error fails the whole write and nothing is sent for it.
    pub async fn write(
        &self,
        device_uid: &str,
        entries: &[(String, JsonValue)],
    ) -> BridgeResult<()> {
        if !self.view.device_exists(device_uid) {
            return Err(BridgeError::DeviceIdNotFound);
        }
        let mut first_error: Option<BridgeError> = None;
        let mut cfgs: Vec<Option<TagConfig>> = Vec::with_capacity(entries.len());
        for (name, _) in entries {
            let outcome = match self.view.find_tag(device_uid, name) {
                None => Err(BridgeError::TagNotFound(name.clone())),
                Some(tag) if !tag.write => Err(BridgeError::TagNotWriteable(name.clone())),
                Some(tag) => TagConfig::from_tag(&tag),
            };
            match outcome {
                Ok(cfg) => cfgs.push(Some(cfg)),
                Err(e) => {
                    cfgs.push(None);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let cfgs: Vec<TagConfig> = cfgs.into_iter().flatten().collect();
        let record = self.conn.ensure(device_uid, &cfgs).await?;

        let mut writes: Vec<WriteValue> = Vec::with_capacity(entries.len());
        for (cfg, (_, value)) in cfgs.iter().zip(entries) {
            let node_id = NodeId::from_str(&cfg.node_id).map_err(|_| {
                BridgeError::ConfigError(format!("tag {}: bad node id {}", cfg.name, cfg.node_id))
            })?;
            let variant = if cfg.array_index >= 0 {
                // An indexed write needs a previously observed array value.
                let original = record
                    .monitors
                    .lock()
                    .expect("monitor state lock poisoned")
                    .original_value(&node_id)
                    .ok_or_else(|| {
                        BridgeError::WriteFail(format!(
                            "tag {}: no observed array value for indexed write",
                            cfg.name
                        ))
                    })?;
                codec::splice_array_element(&original, cfg, value)?
            } else {
                codec::set_value_to_variant(cfg, value)?
            };
            writes.push(WriteValue::value_attr(node_id, variant));
        }

        if record.closing.load(Ordering::Acquire) {
            return Err(record.destroy_error());
        }
        if !record.connected.load(Ordering::Acquire) {
            return Err(BridgeError::EmptySession);
        }
        let statuses = record
            .session
            .write(&writes)
            .await
            .map_err(|status| BridgeError::WriteFail(format!("write call: {status}")))?;
        if let Some(bad) = statuses.iter().find(|s| !s.is_good()) {
            return Err(BridgeError::WriteFail(format!("write status: {bad}")));
        }
        Ok(())
    }

    /// `updateTagListFromDevice`: browse the device's address space, merge
    /// the discovered tags into the configuration, and persist. Only one
    /// browse runs at a time; a concurrent trigger gets the current progress
    /// snapshot (tagged with its own `request_id`) and does not start a new
    /// scan, while the running scan's frames keep the id of the request that
    /// started it.
    pub async fn browse_device(&self, device_uid: &str, request_id: u64) -> BridgeResult<()> {
        if !self.view.device_exists(device_uid) {
            return Err(BridgeError::DeviceIdNotFound);
        }
        if self.browse.running.swap(true, Ordering::SeqCst) {
            self.progress.progress(BrowseProgress {
                text: progress_text(self.browse.counter.load(Ordering::Acquire)),
                progress_id: self.browse.progress_id.load(Ordering::Acquire),
                done: false,
                request_id,
            });
            return Ok(());
        }

        let progress_id = self.browse.progress_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.browse.counter.store(0, Ordering::Release);
        let ticker = self.spawn_progress_ticker(progress_id, request_id);

        let result = self.run_browse(device_uid).await;

        self.browse.running.store(false, Ordering::SeqCst);
        ticker.abort();
        self.progress.progress(BrowseProgress {
            text: progress_text(self.browse.counter.load(Ordering::Acquire)),
            progress_id,
            done: true,
            request_id,
        });
        result
    }

    /// `restartDevice`: destroy the connection; the next read or write
    /// reconnects.
    pub async fn restart(&self, device_uid: &str) -> BridgeResult<()> {
        if !self.view.device_exists(device_uid) {
            return Err(BridgeError::DeviceIdNotFound);
        }
        self.conn
            .destroy_for_device(device_uid, DestroyReason::Restart)
            .await;
        Ok(())
    }

    /// A configuration option was edited. Options flagged `restartOnChange`
    /// in the scheme destroy the device connection and report
    /// `RestartOnChangeParams`; the next request reconnects with the new
    /// parameters.
    pub async fn option_changed(
        &self,
        device_uid: &str,
        option: &str,
        tag_scope: bool,
    ) -> BridgeResult<()> {
        let flagged = if tag_scope {
            self.view.restart_on_change_tag_option(option)
        } else {
            self.view.restart_on_change_device_option(option)
        };
        if flagged {
            info!(device = %device_uid, option, "restart-on-change option edited");
            let destroyed = self
                .conn
                .destroy_for_device(device_uid, DestroyReason::RestartOnChange)
                .await;
            if destroyed {
                return Err(BridgeError::RestartOnChangeParams);
            }
        }
        Ok(())
    }

    async fn run_browse(&self, device_uid: &str) -> BridgeResult<()> {
        let record = self.conn.ensure(device_uid, &[]).await?;
        let discovered =
            browse::walk_address_space(&record.session, Arc::clone(&self.browse.counter)).await?;
        info!(
            device = %device_uid,
            discovered = discovered.len(),
            "address space browse complete"
        );
        self.store.update(|doc| {
            if let Some(device) = doc.devices.get_mut(device_uid) {
                device.apply_browse(&discovered);
            }
        });
        if let Err(e) = self.persist.persist() {
            warn!(error = %e, "config persist after browse failed");
        }
        Ok(())
    }

    fn spawn_progress_ticker(&self, progress_id: u64, request_id: u64) -> tokio::task::JoinHandle<()> {
        let sink = Arc::clone(&self.progress);
        let counter = Arc::clone(&self.browse.counter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1000));
            interval.tick().await; // immediate tick
            loop {
                interval.tick().await;
                sink.progress(BrowseProgress {
                    text: progress_text(counter.load(Ordering::Acquire)),
                    progress_id,
                    done: false,
                    request_id,
                });
            }
        })
    }
}

fn progress_text(count: u64) -> String {
    format!("Tag browsing in progress: {count}")
}
