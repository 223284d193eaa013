//! Process-local registry of open server-sent-event streams.
//!
//! Each registry maps a stream key (a trip id for status streams, a driver id
//! for offer streams) to the handles of every connection listening on it, in
//! registration order. Handles are bounded channel senders; the HTTP layer
//! drains the matching receiver into the SSE response.
//!
//! The registry only reaches clients attached to this process. Running more
//! than one instance needs sticky routing per trip or a shared broker in place
//! of this map.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::metrics;

/// A serialised payload, shared by every connection it is written to.
pub type Frame = Arc<str>;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Outcome of one fan-out: successful writes and failed writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutTally {
    pub connections: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    kind: &'static str,
    buffer: usize,
    streams: Arc<RwLock<HashMap<String, Vec<ConnectionHandle>>>>,
}

impl ConnectionRegistry {
    /// `kind` labels log lines and metrics; `buffer` bounds each connection's queue.
    pub fn new(kind: &'static str, buffer: usize) -> Self {
        Self {
            kind,
            buffer: buffer.max(1),
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn add_connection(&self, key: &str, handle: ConnectionHandle) {
        let handle_id = handle.id;
        self.streams
            .write()
            .entry(key.to_string())
            .or_default()
            .push(handle);
        metrics::OPEN_STREAMS.with_label_values(&[self.kind]).inc();
        debug!(stream = self.kind, key, handle_id, "connection registered");
    }

    /// Returns whether the handle was present. Empty keys are dropped from the map.
    pub fn remove_connection(&self, key: &str, handle_id: u64) -> bool {
        let removed = {
            let mut guard = self.streams.write();
            remove_handles(&mut guard, key, &[handle_id])
        };
        if removed > 0 {
            metrics::OPEN_STREAMS
                .with_label_values(&[self.kind])
                .sub(removed as i64);
            debug!(stream = self.kind, key, handle_id, "connection removed");
        }
        removed > 0
    }

    /// Serialise `payload` once and write it to every connection under `key`.
    ///
    /// Writes never wait: a closed or saturated connection counts as failed and is
    /// dropped from the registry, and the remaining connections are still written.
    pub fn broadcast<T: Serialize>(&self, key: &str, payload: &T) -> FanoutTally {
        match serde_json::to_string(payload) {
            Ok(json) => self.broadcast_frame(key, Frame::from(json)),
            Err(err) => {
                let listeners = self.connection_count(Some(key));
                error!(stream = self.kind, key, error = %err, "failed to serialise broadcast payload");
                FanoutTally {
                    connections: 0,
                    failed: listeners,
                }
            }
        }
    }

    pub fn broadcast_frame(&self, key: &str, frame: Frame) -> FanoutTally {
        let handles = match self.streams.read().get(key) {
            Some(handles) => handles.clone(),
            None => return FanoutTally::default(),
        };

        let mut tally = FanoutTally::default();
        let mut dead = Vec::new();
        for handle in &handles {
            match handle.tx.try_send(frame.clone()) {
                Ok(()) => tally.connections += 1,
                Err(err) => {
                    tally.failed += 1;
                    dead.push(handle.id);
                    debug!(
                        stream = self.kind,
                        key,
                        handle_id = handle.id,
                        closed = matches!(err, mpsc::error::TrySendError::Closed(_)),
                        "stream write failed; dropping connection"
                    );
                }
            }
        }

        if !dead.is_empty() {
            let removed = {
                let mut guard = self.streams.write();
                remove_handles(&mut guard, key, &dead)
            };
            metrics::OPEN_STREAMS
                .with_label_values(&[self.kind])
                .sub(removed as i64);
        }
        metrics::STREAM_WRITES
            .with_label_values(&[self.kind, "ok"])
            .inc_by(tally.connections as u64);
        metrics::STREAM_WRITES
            .with_label_values(&[self.kind, "failed"])
            .inc_by(tally.failed as u64);
        tally
    }

    /// Connections for one key, or across every key when `key` is `None`.
    pub fn connection_count(&self, key: Option<&str>) -> usize {
        let guard = self.streams.read();
        match key {
            Some(key) => guard.get(key).map_or(0, Vec::len),
            None => guard.values().map(Vec::len).sum(),
        }
    }

    /// Keys with at least one open connection, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .streams
            .read()
            .iter()
            .filter(|(_, handles)| !handles.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Open a connection under `key`. It deregisters itself when dropped.
    pub fn subscribe(&self, key: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let handle = ConnectionHandle::new(tx);
        let handle_id = handle.id;
        self.add_connection(key, handle);
        Subscription {
            key: key.to_string(),
            handle_id,
            registry: self.clone(),
            frames: ReceiverStream::new(rx),
        }
    }
}

fn remove_handles(
    streams: &mut HashMap<String, Vec<ConnectionHandle>>,
    key: &str,
    ids: &[u64],
) -> usize {
    let Some(handles) = streams.get_mut(key) else {
        return 0;
    };
    let before = handles.len();
    handles.retain(|h| !ids.contains(&h.id));
    let removed = before - handles.len();
    if handles.is_empty() {
        streams.remove(key);
    }
    removed
}

/// Receiving end of a registered connection.
pub struct Subscription {
    key: String,
    handle_id: u64,
    registry: ConnectionRegistry,
    frames: ReceiverStream<Frame>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().frames).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove_connection(&self.key, self.handle_id);
    }
}
