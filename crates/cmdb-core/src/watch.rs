//! Change notifications delivered by storage watchers.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::DecodeError;
use crate::object::Object;

/// Default buffer size of a watcher's output.
pub const DEFAULT_WATCH_CHAN_SIZE: usize = 100;

/// What happened to the watched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Create,
    Update,
    Delete,
    /// The watch stream itself failed and can no longer be trusted.
    Error,
}

impl WatchEventType {
    /// Wire tag used by backends that encode the type as a single byte.
    pub fn tag(self) -> u8 {
        match self {
            WatchEventType::Create => 0x01,
            WatchEventType::Update => 0x02,
            WatchEventType::Delete => 0x04,
            WatchEventType::Error => 0x08,
        }
    }

    /// Display name of a raw wire tag, `<invalid>` for anything unknown.
    pub fn name_of(tag: u8) -> &'static str {
        Self::from_tag(tag).map_or("<invalid>", Self::as_str)
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(WatchEventType::Create),
            0x02 => Some(WatchEventType::Update),
            0x04 => Some(WatchEventType::Delete),
            0x08 => Some(WatchEventType::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WatchEventType::Create => "CREATE",
            WatchEventType::Update => "UPDATE",
            WatchEventType::Delete => "DELETE",
            WatchEventType::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub kind: String,
    pub key: String,
    pub value: Vec<u8>,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, kind: &str, key: &str, value: Vec<u8>) -> Self {
        Self {
            event_type,
            kind: kind.to_string(),
            key: key.to_string(),
            value,
        }
    }

    /// An `ERROR` event. The message is diagnostic only and not decodable.
    pub fn error(kind: &str, key: &str, message: &str) -> Self {
        Self::new(WatchEventType::Error, kind, key, message.as_bytes().to_vec())
    }

    /// Deserializes the payload into an object of type `O`.
    pub fn decode<O: Object>(&self) -> Result<O, DecodeError> {
        serde_json::from_slice(&self.value).map_err(|source| DecodeError {
            kind: self.kind.clone(),
            key: self.key.clone(),
            source,
        })
    }
}

/// How a watch selects keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Every object of the target's kind.
    OnKind,
    /// Only the object with the target's exact key.
    OnName,
}

/// Resolved key filter of a watch registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchScope {
    Prefix(String),
    Exact(String),
}

impl WatchScope {
    pub fn for_target<O: Object>(target: &O, mode: WatchMode) -> Self {
        match mode {
            WatchMode::OnKind => WatchScope::Prefix(O::kind_prefix()),
            WatchMode::OnName => WatchScope::Exact(target.key()),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchScope::Prefix(prefix) => key.starts_with(prefix.as_str()),
            WatchScope::Exact(exact) => key == exact,
        }
    }
}

/// Creates a connected sender/watcher pair.
pub fn channel(capacity: usize) -> (WatchSender, Watcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflow = Arc::new(Mutex::new(None));
    (
        WatchSender {
            tx,
            overflow: Arc::clone(&overflow),
        },
        Watcher {
            rx,
            overflow,
            closed: false,
        },
    )
}

/// Backend half of a watch.
#[derive(Debug, Clone)]
pub struct WatchSender {
    tx: mpsc::Sender<WatchEvent>,
    /// Terminal `ERROR` handed to the watcher once its buffer has drained.
    overflow: Arc<Mutex<Option<WatchEvent>>>,
}

impl WatchSender {
    /// Delivers without waiting. Returns `false` once the registration is
    /// finished so the backend drops it.
    ///
    /// A watcher that cannot keep up loses its subscription: the events it
    /// already buffered are still yielded, followed by a single `ERROR` and
    /// the end of the stream.
    pub fn deliver(&self, event: WatchEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    key = %event.key,
                    event_type = %event.event_type,
                    "⚠️ Watcher is lagging, ending its stream"
                );
                let mut overflow = self.overflow.lock().unwrap_or_else(|e| e.into_inner());
                overflow.get_or_insert_with(|| {
                    WatchEvent::error(&event.kind, &event.key, "watcher lagged behind")
                });
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a watch. Single consumer, not restartable.
#[derive(Debug)]
pub struct Watcher {
    rx: mpsc::Receiver<WatchEvent>,
    overflow: Arc<Mutex<Option<WatchEvent>>>,
    closed: bool,
}

impl Watcher {
    /// Ends the subscription. Calling it again is a no-op.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rx.close();
            // Discard anything already buffered so the sequence ends now.
            while self.rx.try_recv().is_ok() {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_overflow(&self) -> Option<WatchEvent> {
        self.overflow.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Stream for Watcher {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => Poll::Ready(self.take_overflow()),
            other => other,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}
