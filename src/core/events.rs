//! Execution lifecycle events and the publish/subscribe handle that fans
//! them out.
//!
//! The bus is an explicit handle: components receive a clone of it instead
//! of reaching for ambient state. Every subscriber owns an unbounded channel,
//! so a slow consumer never causes another to miss events, and events for a
//! single execution reach each subscriber in publication order.
//!
//! The bus also owns the derived per-target status map. Status is updated
//! under a single write lock before an event is fanned out, so readers only
//! ever see whole transitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::execution::{Execution, ExecutionId, ExecutionStatus};

/// A lifecycle event published by the execution manager.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    #[serde(rename = "start")]
    Started { id: ExecutionId, info: Execution },

    #[serde(rename = "output")]
    Output { id: ExecutionId, chunk: String },

    #[serde(rename = "complete")]
    Completed { id: ExecutionId, info: Execution },

    #[serde(rename = "error")]
    Errored {
        id: ExecutionId,
        info: Execution,
        message: String,
    },

    #[serde(rename = "cancel")]
    Cancelled { id: ExecutionId, info: Execution },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::Started { id, .. }
            | ExecutionEvent::Output { id, .. }
            | ExecutionEvent::Completed { id, .. }
            | ExecutionEvent::Errored { id, .. }
            | ExecutionEvent::Cancelled { id, .. } => id,
        }
    }

    /// The execution record carried by lifecycle events.
    pub fn info(&self) -> Option<&Execution> {
        match self {
            ExecutionEvent::Output { .. } => None,
            ExecutionEvent::Started { info, .. }
            | ExecutionEvent::Completed { info, .. }
            | ExecutionEvent::Errored { info, .. }
            | ExecutionEvent::Cancelled { info, .. } => Some(info),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Completed { .. }
                | ExecutionEvent::Errored { .. }
                | ExecutionEvent::Cancelled { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::Started { .. } => "start",
            ExecutionEvent::Output { .. } => "output",
            ExecutionEvent::Completed { .. } => "complete",
            ExecutionEvent::Errored { .. } => "error",
            ExecutionEvent::Cancelled { .. } => "cancel",
        }
    }
}

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// Every event, output included.
    All,
    /// Start and terminal events for every execution.
    Lifecycle,
    /// Everything about one execution. Closes after its terminal event.
    Execution(ExecutionId),
}

impl Interest {
    fn matches(&self, event: &ExecutionEvent) -> bool {
        match self {
            Interest::All => true,
            Interest::Lifecycle => !matches!(event, ExecutionEvent::Output { .. }),
            Interest::Execution(id) => event.execution_id() == id,
        }
    }

    fn closes_on(&self, event: &ExecutionEvent) -> bool {
        matches!(self, Interest::Execution(id) if event.is_terminal() && event.execution_id() == id)
    }
}

/// Derived status of a target.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub running: bool,
    pub last_status: ExecutionStatus,
    pub execution_id: ExecutionId,
    pub updated_at: DateTime<Utc>,
}

struct Subscriber {
    id: u64,
    interest: Interest,
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    status: RwLock<BTreeMap<String, TargetStatus>>,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, id: u64) {
        self.subscribers().retain(|s| s.id != id);
    }
}

/// Publish/subscribe handle. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                status: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Attach a new subscriber.
    pub fn subscribe(&self, interest: Interest) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.subscribers().push(Subscriber {
            id,
            interest: interest.clone(),
            tx,
        });
        tracing::trace!("Subscriber {} attached ({:?})", id, interest);

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every interested subscriber.
    pub fn publish(&self, event: ExecutionEvent) {
        self.apply_status(&event);

        let mut subscribers = self.inner.subscribers();
        subscribers.retain(|subscriber| {
            if !subscriber.interest.matches(&event) {
                return true;
            }
            if subscriber.tx.send(event.clone()).is_err() {
                tracing::trace!("Dropping closed subscriber {}", subscriber.id);
                return false;
            }
            !subscriber.interest.closes_on(&event)
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Snapshot of every known target's status.
    pub fn target_statuses(&self) -> BTreeMap<String, TargetStatus> {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn target_status(&self, key: &str) -> Option<TargetStatus> {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn apply_status(&self, event: &ExecutionEvent) {
        let Some(info) = event.info() else {
            return;
        };

        let mut status = self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let key = info.target_key();

        // A late terminal event for an older execution must not clear the
        // running flag of a newer one on the same target.
        if let Some(current) = status.get(&key) {
            if current.running && current.execution_id != info.id && event.is_terminal() {
                return;
            }
        }

        status.insert(
            key,
            TargetStatus {
                running: info.status == ExecutionStatus::Running,
                last_status: info.status,
                execution_id: info.id.clone(),
                updated_at: Utc::now(),
            },
        );
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription. Detaches from the bus when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ExecutionEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.try_recv().ok()
    }

    /// Consume into a stream. The bus prunes the subscriber on its next
    /// publish after the stream is dropped.
    pub fn into_stream(mut self) -> UnboundedReceiverStream<ExecutionEvent> {
        let (_, empty) = mpsc::unbounded_channel();
        let rx = std::mem::replace(&mut self.rx, empty);
        // Keep the subscriber registered; only the receiver moves.
        self.bus = Weak::new();
        UnboundedReceiverStream::new(rx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.detach(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::execution::{DispatchRequest, Source, Target};

    fn record(id: &str, status: ExecutionStatus) -> Execution {
        let request = DispatchRequest::new(Source::Web, Target::orchestrator(), "hello");
        let mut execution = Execution::running(id.to_string(), &request, None);
        execution.status = status;
        execution
    }

    #[tokio::test]
    async fn execution_subscription_filters_and_closes() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Interest::Execution("e1".into()));

        bus.publish(ExecutionEvent::Output {
            id: "e2".into(),
            chunk: "other".into(),
        });
        bus.publish(ExecutionEvent::Output {
            id: "e1".into(),
            chunk: "mine".into(),
        });
        bus.publish(ExecutionEvent::Completed {
            id: "e1".into(),
            info: record("e1", ExecutionStatus::Completed),
        });

        assert!(matches!(sub.recv().await, Some(ExecutionEvent::Output { chunk, .. }) if chunk == "mine"));
        assert!(matches!(sub.recv().await, Some(ExecutionEvent::Completed { .. })));
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lifecycle_interest_skips_output() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Interest::Lifecycle);

        bus.publish(ExecutionEvent::Started {
            id: "e1".into(),
            info: record("e1", ExecutionStatus::Running),
        });
        bus.publish(ExecutionEvent::Output {
            id: "e1".into(),
            chunk: "x".into(),
        });

        assert_eq!(sub.recv().await.map(|e| e.kind()), Some("start"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_event() {
        use tokio_stream::StreamExt;

        let bus = EventBus::new();
        let stream = bus.subscribe(Interest::Execution("e1".into())).into_stream();
        bus.publish(ExecutionEvent::Output {
            id: "e1".into(),
            chunk: "a".into(),
        });
        bus.publish(ExecutionEvent::Cancelled {
            id: "e1".into(),
            info: record("e1", ExecutionStatus::Cancelled),
        });

        let kinds: Vec<_> = stream.map(|e| e.kind()).collect().await;
        assert_eq!(kinds, ["output", "cancel"]);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dropping_subscription_detaches() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Interest::All);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn status_tracks_latest_execution_per_target() {
        let bus = EventBus::new();
        bus.publish(ExecutionEvent::Started {
            id: "e1".into(),
            info: record("e1", ExecutionStatus::Running),
        });

        let status = bus.target_status("orchestrator:default").unwrap();
        assert!(status.running);
        assert_eq!(status.execution_id, "e1");

        bus.publish(ExecutionEvent::Errored {
            id: "e1".into(),
            info: record("e1", ExecutionStatus::Error),
            message: "boom".into(),
        });

        let status = bus.target_status("orchestrator:default").unwrap();
        assert!(!status.running);
        assert_eq!(status.last_status, ExecutionStatus::Error);
    }

    #[test]
    fn events_serialize_with_wire_tags() {
        let event = ExecutionEvent::Output {
            id: "e1".into(),
            chunk: "hi".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["chunk"], "hi");

        let event = ExecutionEvent::Cancelled {
            id: "e1".into(),
            info: record("e1", ExecutionStatus::Cancelled),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cancel");
        assert_eq!(json["info"]["status"], "cancelled");
        assert_eq!(json["info"]["targetType"], "orchestrator");
    }
}
