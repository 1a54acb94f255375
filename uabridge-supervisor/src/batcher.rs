//! Change batching toward the supervisor.
//!
//! The engine emits one notification per raw update; this actor coalesces
//! them over a 100 ms window (latest value wins per `(device, tag)`), groups
//! the result by device and emits `asyncTagsValues` frames whose generated
//! `transID` stays at least 10 away from the last request id.

use crate::commands::async_values_frame;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uabridge_engine::{ChangeSink, TagValue};

const BATCH_WINDOW: Duration = Duration::from_millis(100);
const TRANS_ID_DISTANCE: u64 = 10;

/// One engine notification: the subscribed fan-out bucket of a single node
/// update.
#[derive(Debug)]
pub struct ChangeEvent {
    pub device_uid: String,
    pub values: Vec<(String, Option<TagValue>)>,
}

/// Generates `transID`s for driver-originated frames, keeping the required
/// distance from the ids the supervisor uses for requests.
#[derive(Debug, Default)]
pub struct TransIdGen {
    last_request: AtomicU64,
    next: Mutex<u64>,
}

impl TransIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_request(&self, trans_id: u64) {
        self.last_request.store(trans_id, Ordering::Release);
    }

    pub fn next_async(&self) -> u64 {
        let mut next = self.next.lock().expect("trans id lock poisoned");
        let floor = self.last_request.load(Ordering::Acquire) + TRANS_ID_DISTANCE;
        if *next < floor {
            *next = floor;
        }
        let id = *next;
        *next += 1;
        id
    }
}

/// `ChangeSink` half handed to the engine; forwards into the batcher actor.
pub struct BatcherSink {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl BatcherSink {
    pub fn new(tx: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        Self { tx }
    }
}

impl ChangeSink for BatcherSink {
    fn publish(&self, device_uid: &str, values: Vec<(String, Option<TagValue>)>) {
        let _ = self.tx.send(ChangeEvent {
            device_uid: device_uid.to_string(),
            values,
        });
    }
}

/// One batching window: per-device buckets in first-seen order, latest value
/// per tag.
#[derive(Debug, Default)]
struct WindowBuffer {
    buckets: IndexMap<String, IndexMap<String, Value>>,
}

impl WindowBuffer {
    fn absorb(&mut self, event: ChangeEvent) {
        let bucket = self.buckets.entry(event.device_uid).or_default();
        for (name, value) in event.values {
            let json = value.map(|v| v.to_json()).unwrap_or(Value::Null);
            bucket.insert(name, json);
        }
    }

    fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn drain(&mut self) -> Vec<(String, Map<String, Value>)> {
        std::mem::take(&mut self.buckets)
            .into_iter()
            .map(|(device, bucket)| (device, bucket.into_iter().collect::<Map<String, Value>>()))
            .collect()
    }
}

/// Actor that owns the window and the outbound frame emission.
pub struct Batcher {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    outbound: mpsc::UnboundedSender<String>,
    ids: std::sync::Arc<TransIdGen>,
    cancel: CancellationToken,
}

impl Batcher {
    pub fn new(
        rx: mpsc::UnboundedReceiver<ChangeEvent>,
        outbound: mpsc::UnboundedSender<String>,
        ids: std::sync::Arc<TransIdGen>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            outbound,
            ids,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut window = WindowBuffer::default();
        let mut tick = tokio::time::interval(BATCH_WINDOW);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.flush(&mut window);
                    return;
                }
                event = self.rx.recv() => match event {
                    Some(event) => window.absorb(event),
                    None => {
                        self.flush(&mut window);
                        return;
                    }
                },
                _ = tick.tick() => self.flush(&mut window),
            }
        }
    }

    fn flush(&self, window: &mut WindowBuffer) {
        if window.is_empty() {
            return;
        }
        for (device_uid, values) in window.drain() {
            let frame = async_values_frame(self.ids.next_async(), &device_uid, values);
            if self.outbound.send(frame.to_string()).is_err() {
                debug!("outbound channel closed, change frame dropped");
            }
        }
    }
}
