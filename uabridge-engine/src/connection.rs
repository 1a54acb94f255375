use crate::{
    engine::ChangeSink,
    pump, registry,
    types::{ConnKey, MonitorState},
};
use arc_swap::ArcSwapOption;
use futures::{pin_mut, StreamExt};
use opcua::{
    client::{
        ClientBuilder, IdentityToken, MonitoredItem, Session, SessionEventLoop,
        SessionPollResult, SubscriptionCallbacks,
    },
    crypto::SecurityPolicy as UaSecurityPolicy,
    types::{DataValue, EndpointDescription, MessageSecurityMode},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uabridge_error::{BridgeError, BridgeResult};
use uabridge_model::{
    ConfigView, DeviceSettings, SecurityModeName, SecurityPolicyName, TagConfig,
};
use url::Url;

const PUBLISHING_INTERVAL: Duration = Duration::from_millis(1000);
const LIFETIME_COUNT: u32 = 100;
const MAX_KEEP_ALIVE_COUNT: u32 = 10;
const MAX_NOTIFICATIONS_PER_PUBLISH: u32 = 10;
const SUBSCRIPTION_PRIORITY: u8 = 10;
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(2000);
const RECONNECT_MAX_DELAY_FLOOR_MS: u64 = 10_000;
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Why a connection record is being torn down. Every variant ends in the
/// record's removal; the next request rebuilds from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DestroyReason {
    SubscriptionTerminated,
    SubscriptionError,
    HostClose,
    Restart,
    RestartOnChange,
    Shutdown,
}

impl DestroyReason {
    fn as_str(self) -> &'static str {
        match self {
            DestroyReason::SubscriptionTerminated => "subscription_terminated",
            DestroyReason::SubscriptionError => "subscription_error",
            DestroyReason::HostClose => "host_close",
            DestroyReason::Restart => "restart",
            DestroyReason::RestartOnChange => "restart_on_change",
            DestroyReason::Shutdown => "shutdown",
        }
    }

    /// Error kind a caller awaiting the destroyed connection receives.
    pub(crate) fn to_error(self) -> BridgeError {
        match self {
            DestroyReason::SubscriptionTerminated | DestroyReason::SubscriptionError => {
                BridgeError::SubscriptionTerminated
            }
            DestroyReason::HostClose => BridgeError::HostClose,
            DestroyReason::RestartOnChange => BridgeError::RestartOnChangeParams,
            DestroyReason::Restart | DestroyReason::Shutdown => BridgeError::EmptySession,
        }
    }
}

/// Live state of one `(endpointUrl, deviceUid)` connection.
pub(crate) struct ConnectionRecord {
    pub key: ConnKey,
    pub session: Arc<Session>,
    subscription_id: AtomicU32,
    pub connected: AtomicBool,
    pub closing: AtomicBool,
    /// Why this record is being torn down, recorded by the teardown winner
    /// so callers that still hold the record observe the failure reason.
    destroy_reason: Mutex<Option<DestroyReason>>,
    pub monitors: Mutex<MonitorState>,
    next_client_handle: AtomicU32,
}

impl ConnectionRecord {
    fn new(key: ConnKey, session: Arc<Session>) -> Self {
        Self {
            key,
            session,
            subscription_id: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            destroy_reason: Mutex::new(None),
            monitors: Mutex::new(MonitorState::default()),
            next_client_handle: AtomicU32::new(1),
        }
    }

    pub fn subscription_id(&self) -> u32 {
        self.subscription_id.load(Ordering::Acquire)
    }

    pub fn next_handle(&self) -> u32 {
        self.next_client_handle.fetch_add(1, Ordering::AcqRel)
    }

    /// Error kind for callers that caught this record mid-teardown.
    pub fn destroy_error(&self) -> BridgeError {
        self.destroy_reason
            .lock()
            .expect("destroy reason lock poisoned")
            .map(DestroyReason::to_error)
            .unwrap_or(BridgeError::EmptySession)
    }
}

/// Per-device slot: the async gate serializes connect and monitored-item
/// registration for one device; the record swaps in and out beneath it.
struct DeviceSlot {
    gate: tokio::sync::Mutex<()>,
    record: ArcSwapOption<ConnectionRecord>,
}

impl DeviceSlot {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            record: ArcSwapOption::from(None),
        }
    }
}

/// Per-device OPC UA client lifecycle.
///
/// There is no background reconnect: any teardown removes the record and the
/// next incoming request triggers a fresh connect.
pub(crate) struct ConnectionManager {
    view: ConfigView,
    sink: Arc<dyn ChangeSink>,
    slots: RwLock<HashMap<ConnKey, Arc<DeviceSlot>>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(view: ConfigView, sink: Arc<dyn ChangeSink>, cancel: CancellationToken) -> Self {
        Self {
            view,
            sink,
            slots: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    /// Resolve the device, make sure a subscribed connection exists, and
    /// register any of `tags` that are not yet monitored.
    pub async fn ensure(
        self: &Arc<Self>,
        device_uid: &str,
        tags: &[TagConfig],
    ) -> BridgeResult<Arc<ConnectionRecord>> {
        let settings = self
            .view
            .device_settings(device_uid)
            .ok_or(BridgeError::DeviceIdNotFound)?;
        let endpoint_url = settings
            .endpoint_url
            .clone()
            .ok_or(BridgeError::DeviceIdNotFound)?;
        let key = ConnKey {
            endpoint_url,
            device_uid: device_uid.to_string(),
        };
        let slot = self.slot(&key);
        let _gate = slot.gate.lock().await;

        if let Some(record) = slot.record.load_full() {
            // A record caught mid-teardown surfaces the destroy reason to
            // this caller; the record is gone by the next request, which
            // then reconnects from scratch.
            if record.closing.load(Ordering::Acquire) {
                return Err(record.destroy_error());
            }
            if record.connected.load(Ordering::Acquire) {
                registry::register_tags(&record, tags).await;
                return Ok(record);
            }
        }

        let record = self.open(&key, &settings).await?;
        slot.record.store(Some(Arc::clone(&record)));
        registry::register_tags(&record, tags).await;
        Ok(record)
    }

    /// Current record for a device, if any.
    pub fn peek(&self, device_uid: &str) -> Option<Arc<ConnectionRecord>> {
        let slots = self.slots.read().expect("slot map lock poisoned");
        slots
            .iter()
            .find(|(key, _)| key.device_uid == device_uid)
            .and_then(|(_, slot)| slot.record.load_full())
    }

    /// Destroy every connection of a device. Returns true if a live record
    /// was actually torn down.
    pub async fn destroy_for_device(&self, device_uid: &str, reason: DestroyReason) -> bool {
        let records: Vec<Arc<ConnectionRecord>> = {
            let slots = self.slots.read().expect("slot map lock poisoned");
            slots
                .iter()
                .filter(|(key, _)| key.device_uid == device_uid)
                .filter_map(|(_, slot)| slot.record.load_full())
                .collect()
        };
        let mut destroyed = false;
        for record in records {
            destroyed |= self.destroy_record(&record, reason).await;
        }
        destroyed
    }

    /// Tear one connection down: close/disconnect attempts are swallowed and
    /// the record is removed only after both have completed. Removal is tied
    /// to this exact record so a replacement opened in the meantime is never
    /// wiped out.
    pub(crate) async fn destroy_record(
        &self,
        record: &Arc<ConnectionRecord>,
        reason: DestroyReason,
    ) -> bool {
        if record.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        *record
            .destroy_reason
            .lock()
            .expect("destroy reason lock poisoned") = Some(reason);
        record.connected.store(false, Ordering::Release);
        warn!(
            device = %record.key.device_uid,
            endpoint = %record.key.endpoint_url,
            reason = reason.as_str(),
            "destroying OPC UA connection"
        );
        record.session.disable_reconnects();
        let session = Arc::clone(&record.session);
        let _ = timeout(TEARDOWN_GRACE, session.disconnect()).await;
        if let Some(slot) = self.slot_if_present(&record.key) {
            let current = slot.record.load();
            if current
                .as_ref()
                .map(|c| Arc::ptr_eq(c, record))
                .unwrap_or(false)
            {
                let _ = slot.record.compare_and_swap(&*current, None);
            }
        }
        true
    }

    fn slot_if_present(&self, key: &ConnKey) -> Option<Arc<DeviceSlot>> {
        self.slots
            .read()
            .expect("slot map lock poisoned")
            .get(key)
            .cloned()
    }

    fn slot(&self, key: &ConnKey) -> Arc<DeviceSlot> {
        if let Some(slot) = self.slots.read().expect("slot map lock poisoned").get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().expect("slot map lock poisoned");
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(DeviceSlot::new())),
        )
    }

    /// Connect, wait for the transport to become active, then create the
    /// device subscription. Any failure tears the half-open client down and
    /// surfaces as `OpcReject`.
    async fn open(
        self: &Arc<Self>,
        key: &ConnKey,
        settings: &DeviceSettings,
    ) -> BridgeResult<Arc<ConnectionRecord>> {
        info!(
            device = %key.device_uid,
            endpoint = %key.endpoint_url,
            "opening OPC UA connection"
        );
        let mut client = build_client(settings)?
            .client()
            .map_err(|e| BridgeError::OpcReject(format!("client build: {e:?}")))?;

        let url = key.endpoint_url.trim();
        let endpoints = client
            .get_server_endpoints_from_url(url)
            .await
            .map_err(|e| BridgeError::OpcReject(format!("get endpoints from {url}: {e}")))?;

        let desired_policy = map_policy(settings.security_policy);
        let desired_mode = map_mode(settings.security_mode);
        let mut selected = endpoints
            .into_iter()
            .find(|ep| {
                ep.security_mode == desired_mode
                    && UaSecurityPolicy::from_uri(ep.security_policy_uri.as_ref())
                        == desired_policy
            })
            .ok_or_else(|| {
                BridgeError::OpcReject(format!(
                    "no endpoint at {url} matches policy {desired_policy:?} mode {desired_mode:?}"
                ))
            })?;
        override_endpoint_host(&mut selected, url);

        let identity = identity_for(settings);
        let (session, event_loop) = client
            .connect_to_endpoint_directly(selected, identity)
            .map_err(|e| BridgeError::OpcReject(format!("connect: {e}")))?;

        let record = Arc::new(ConnectionRecord::new(key.clone(), Arc::clone(&session)));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_session(
            Arc::clone(self),
            key.clone(),
            Arc::downgrade(&record),
            event_loop,
            ready_tx,
            teardown_rx,
            self.cancel.child_token(),
        ));

        let connect_wait =
            Duration::from_millis(settings.timeout_ms.max(RECONNECT_MAX_DELAY_FLOOR_MS));
        let became_active = matches!(timeout(connect_wait, ready_rx).await, Ok(Ok(())));
        if !became_active {
            let s = Arc::clone(&session);
            let _ = timeout(TEARDOWN_GRACE, s.disconnect()).await;
            return Err(BridgeError::OpcReject(format!(
                "transport to {url} never became active"
            )));
        }

        let callbacks = subscription_callbacks(
            Arc::downgrade(&record),
            Arc::clone(&self.sink),
            teardown_tx,
        );
        let subscription_id = match session
            .create_subscription(
                PUBLISHING_INTERVAL,
                LIFETIME_COUNT,
                MAX_KEEP_ALIVE_COUNT,
                MAX_NOTIFICATIONS_PER_PUBLISH,
                SUBSCRIPTION_PRIORITY,
                true,
                callbacks,
            )
            .await
        {
            Ok(id) => id,
            Err(status) => {
                let s = Arc::clone(&session);
                let _ = timeout(TEARDOWN_GRACE, s.disconnect()).await;
                return Err(BridgeError::OpcReject(format!(
                    "create subscription: {status}"
                )));
            }
        };
        record.subscription_id.store(subscription_id, Ordering::Release);
        record.connected.store(true, Ordering::Release);
        info!(
            device = %key.device_uid,
            subscription_id,
            "OPC UA session subscribed"
        );
        Ok(record)
    }
}

/// Drive one session's event loop until it dies, then tear its record down.
async fn drive_session(
    mgr: Arc<ConnectionManager>,
    key: ConnKey,
    record: Weak<ConnectionRecord>,
    event_loop: SessionEventLoop,
    ready_tx: oneshot::Sender<()>,
    mut teardown_rx: mpsc::UnboundedReceiver<DestroyReason>,
    cancel: CancellationToken,
) {
    let stream = event_loop.enter();
    pin_mut!(stream);
    let mut ready = Some(ready_tx);
    let teardown = |reason: DestroyReason| {
        let mgr = Arc::clone(&mgr);
        let record = record.clone();
        async move {
            if let Some(record) = record.upgrade() {
                mgr.destroy_record(&record, reason).await;
            }
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                teardown(DestroyReason::Shutdown).await;
                return;
            }
            Some(reason) = teardown_rx.recv() => {
                teardown(reason).await;
                return;
            }
            item = stream.next() => match item {
                Some(Ok(SessionPollResult::Transport(_) | SessionPollResult::Reconnected(_))) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
                Some(Ok(SessionPollResult::ConnectionLost(status))) => {
                    warn!(device = %key.device_uid, %status, "OPC UA transport lost");
                    teardown(DestroyReason::HostClose).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(status)) => {
                    warn!(device = %key.device_uid, %status, "OPC UA session event loop error");
                    teardown(DestroyReason::SubscriptionTerminated).await;
                    return;
                }
                None => {
                    debug!(device = %key.device_uid, "OPC UA session event loop ended");
                    teardown(DestroyReason::SubscriptionTerminated).await;
                    return;
                }
            }
        }
    }
}

fn subscription_callbacks(
    record: Weak<ConnectionRecord>,
    sink: Arc<dyn ChangeSink>,
    teardown: mpsc::UnboundedSender<DestroyReason>,
) -> SubscriptionCallbacks {
    SubscriptionCallbacks::new(
        move |status| {
            warn!(?status, "subscription status change");
            let _ = teardown.send(DestroyReason::SubscriptionError);
        },
        move |dv: DataValue, item: &MonitoredItem| {
            // The record may be mid-teardown; a dead weak drops the update.
            if let Some(rec) = record.upgrade() {
                pump::on_data_change(&rec, &item.item_to_monitor().node_id, dv, sink.as_ref());
            }
        },
        |_status, _item| {},
    )
}

fn build_client(settings: &DeviceSettings) -> BridgeResult<ClientBuilder> {
    let secured = settings.security_policy != SecurityPolicyName::None
        && settings.security_mode != SecurityModeName::None;

    let mut builder = ClientBuilder::new()
        .application_name("uabridge")
        .application_uri("urn:uabridge:driver")
        .product_uri("urn:uabridge:driver")
        .pki_dir("./pki")
        .session_retry_limit(1)
        .session_retry_initial(RECONNECT_INITIAL_DELAY)
        .session_retry_max(Duration::from_millis(
            settings.timeout_ms.max(RECONNECT_MAX_DELAY_FLOOR_MS),
        ));

    // Key material is consumed from the configured paths; the driver never
    // generates its own.
    if let (Some(cert), Some(key)) = (&settings.certificate_file, &settings.private_key_file) {
        builder = builder.certificate_path(cert).private_key_path(key);
    }
    builder = builder
        .create_sample_keypair(false)
        .trust_server_certs(secured);
    Ok(builder)
}

fn identity_for(settings: &DeviceSettings) -> IdentityToken {
    if settings.anonymous {
        IdentityToken::Anonymous
    } else {
        IdentityToken::UserName(
            settings.user_name.clone().unwrap_or_default(),
            settings.password.clone().unwrap_or_default(),
        )
    }
}

fn map_mode(mode: SecurityModeName) -> MessageSecurityMode {
    match mode {
        SecurityModeName::None => MessageSecurityMode::None,
        SecurityModeName::Sign => MessageSecurityMode::Sign,
        SecurityModeName::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
    }
}

/// Map declared policy names onto the policies the client stack ships.
/// Historic policies without a counterpart fall back to the nearest one.
fn map_policy(policy: SecurityPolicyName) -> UaSecurityPolicy {
    match policy {
        SecurityPolicyName::None => UaSecurityPolicy::None,
        SecurityPolicyName::Basic128Rsa15 => UaSecurityPolicy::Basic128Rsa15,
        SecurityPolicyName::Basic128 => {
            warn!("security policy Basic128 mapped to Basic128Rsa15");
            UaSecurityPolicy::Basic128Rsa15
        }
        SecurityPolicyName::Basic192
        | SecurityPolicyName::Basic192Rsa15
        | SecurityPolicyName::Basic256Rsa15 => {
            warn!(?policy, "legacy security policy mapped to Basic256");
            UaSecurityPolicy::Basic256
        }
        SecurityPolicyName::Basic256 => UaSecurityPolicy::Basic256,
        SecurityPolicyName::Basic256Sha256 => UaSecurityPolicy::Basic256Sha256,
        SecurityPolicyName::Aes128Sha256RsaOaep => UaSecurityPolicy::Aes128Sha256RsaOaep,
        SecurityPolicyName::Aes256Sha256RsaPss => UaSecurityPolicy::Aes256Sha256RsaPss,
    }
}

/// Servers often advertise an endpoint host that is not reachable from the
/// client. Treat the configured URL as authoritative for transport while
/// honoring the advertised security policy and mode.
fn override_endpoint_host(selected: &mut EndpointDescription, configured: &str) {
    if let (Ok(cfg_uri), Ok(mut ep_uri)) =
        (Url::parse(configured), Url::parse(selected.endpoint_url.as_ref()))
    {
        if let Some(host) = cfg_uri.host_str() {
            if let Err(err) = ep_uri.set_host(Some(host)) {
                debug!(error = ?err, "failed to override endpoint host");
            }
        }
        if let Some(port) = cfg_uri.port() {
            if ep_uri.set_port(Some(port)).is_err() {
                debug!("failed to override endpoint port");
            }
        }
        selected.endpoint_url = ep_uri.to_string().into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_policies_map_to_supported_ones() {
        assert_eq!(
            map_policy(SecurityPolicyName::Basic128),
            UaSecurityPolicy::Basic128Rsa15
        );
        assert_eq!(
            map_policy(SecurityPolicyName::Basic192Rsa15),
            UaSecurityPolicy::Basic256
        );
        assert_eq!(
            map_policy(SecurityPolicyName::Aes256Sha256RsaPss),
            UaSecurityPolicy::Aes256Sha256RsaPss
        );
    }

    #[test]
    fn modes_map_one_to_one() {
        assert_eq!(map_mode(SecurityModeName::None), MessageSecurityMode::None);
        assert_eq!(map_mode(SecurityModeName::Sign), MessageSecurityMode::Sign);
        assert_eq!(
            map_mode(SecurityModeName::SignAndEncrypt),
            MessageSecurityMode::SignAndEncrypt
        );
    }

    #[test]
    fn destroy_reasons_map_to_caller_error_kinds() {
        assert!(matches!(
            DestroyReason::HostClose.to_error(),
            BridgeError::HostClose
        ));
        assert!(matches!(
            DestroyReason::SubscriptionTerminated.to_error(),
            BridgeError::SubscriptionTerminated
        ));
        assert!(matches!(
            DestroyReason::SubscriptionError.to_error(),
            BridgeError::SubscriptionTerminated
        ));
        assert!(matches!(
            DestroyReason::RestartOnChange.to_error(),
            BridgeError::RestartOnChangeParams
        ));
        assert!(matches!(
            DestroyReason::Restart.to_error(),
            BridgeError::EmptySession
        ));
    }

    #[test]
    fn endpoint_host_override_prefers_configured_url() {
        let mut ep = EndpointDescription {
            endpoint_url: "opc.tcp://advertised-host:4840/server".into(),
            ..Default::default()
        };
        override_endpoint_host(&mut ep, "opc.tcp://10.1.2.3:14840");
        assert_eq!(
            ep.endpoint_url.as_ref(),
            "opc.tcp://10.1.2.3:14840/server"
        );
    }
}
