//! Per-target FIFO admission control.
//!
//! Every request is given the next global sequence number and appended to
//! its target's queue, then the target is drained: while the target has no
//! running execution, the oldest pending item is handed to the execution
//! manager. Admission and queue mutation happen under one async mutex, so two
//! requests for the same target can never both observe it free.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::events::Subscription;
use super::execution::{DispatchRequest, ExecutionId};
use super::manager::ExecutionManager;

/// A request waiting for its target to become free.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub seq_id: u64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub request: DispatchRequest,
}

/// Result of submitting a request.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// The target was free; the request is running.
    Started { id: ExecutionId, seq_id: u64 },
    /// The target was busy; `position` is 1-based within its queue.
    Queued { item: QueueItem, position: usize },
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    pending: BTreeMap<String, VecDeque<QueueItem>>,
    /// Set on shutdown; nothing is promoted afterwards.
    closed: bool,
}

impl QueueState {
    fn enqueue(&mut self, request: DispatchRequest) -> QueueItem {
        self.next_seq += 1;
        let item = QueueItem {
            seq_id: self.next_seq,
            enqueued_at: Utc::now(),
            request,
        };
        self.pending
            .entry(item.request.target_key())
            .or_default()
            .push_back(item.clone());
        item
    }

    fn pop_front(&mut self, key: &str) -> Option<QueueItem> {
        let queue = self.pending.get_mut(key)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(key);
        }
        item
    }

    fn position(&self, seq_id: u64) -> Option<usize> {
        self.pending.values().find_map(|queue| {
            queue
                .iter()
                .position(|item| item.seq_id == seq_id)
                .map(|index| index + 1)
        })
    }
}

pub struct CommandQueue {
    manager: Arc<ExecutionManager>,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new(manager: Arc<ExecutionManager>) -> Self {
        Self {
            manager,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Admit a request: run it now if its target is free and nothing is
    /// waiting ahead of it, otherwise leave it queued. Once the queue is
    /// closed every request stays queued.
    pub async fn submit(&self, request: DispatchRequest) -> Dispatch {
        let key = request.target_key();
        let mut state = self.state.lock().await;

        let item = state.enqueue(request);
        let started = self.drain_locked(&mut state, &key);

        if let Some((_, id)) = started.into_iter().find(|(seq, _)| *seq == item.seq_id) {
            return Dispatch::Started {
                id,
                seq_id: item.seq_id,
            };
        }

        let position = state.position(item.seq_id).unwrap_or(1);
        tracing::info!(
            "Queued #{} for busy target {} (position {})",
            item.seq_id,
            key,
            position
        );
        Dispatch::Queued { item, position }
    }

    /// Dispatch pending items for a target until it is busy or its queue is
    /// empty. Returns the `(seq_id, execution_id)` pairs started.
    pub async fn drain(&self, target_key: &str) -> Vec<(u64, ExecutionId)> {
        let mut state = self.state.lock().await;
        self.drain_locked(&mut state, target_key)
    }

    fn drain_locked(&self, state: &mut QueueState, key: &str) -> Vec<(u64, ExecutionId)> {
        let mut started = Vec::new();
        if state.closed {
            return started;
        }
        while !self.manager.is_target_active(key) {
            let Some(item) = state.pop_front(key) else {
                break;
            };
            let seq_id = item.seq_id;
            let id = self.manager.start(item.request, Some(seq_id));
            tracing::debug!("Dispatched #{} on {} as {}", seq_id, key, id);
            started.push((seq_id, id));
        }
        started
    }

    /// Stop promoting pending items. Returns how many are left waiting.
    pub async fn close(&self) -> usize {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.pending.values().map(VecDeque::len).sum()
    }

    /// Remove a pending item. False if unknown or already dispatched.
    pub async fn remove(&self, seq_id: u64) -> bool {
        let mut state = self.state.lock().await;
        let Some(key) = state
            .pending
            .iter()
            .find(|(_, queue)| queue.iter().any(|item| item.seq_id == seq_id))
            .map(|(key, _)| key.clone())
        else {
            return false;
        };

        if let Some(queue) = state.pending.get_mut(&key) {
            queue.retain(|item| item.seq_id != seq_id);
            if queue.is_empty() {
                state.pending.remove(&key);
            }
        }
        tracing::info!("Removed queued #{} from {}", seq_id, key);
        true
    }

    /// Every pending item in sequence order.
    pub async fn get_all(&self) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        let mut items: Vec<QueueItem> = state.pending.values().flatten().cloned().collect();
        items.sort_by_key(|item| item.seq_id);
        items
    }

    /// Pending items grouped by target key, each group in FIFO order.
    pub async fn get_grouped(&self) -> BTreeMap<String, Vec<QueueItem>> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .map(|(key, queue)| (key.clone(), queue.iter().cloned().collect()))
            .collect()
    }

    /// 1-based position of a pending item within its target's queue.
    pub async fn position(&self, seq_id: u64) -> Option<usize> {
        self.state.lock().await.position(seq_id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.values().map(VecDeque::len).sum()
    }

    /// Drain loop: on every terminal event, promote the next item for that
    /// event's target.
    pub async fn run_drain(self: Arc<Self>, mut events: Subscription) {
        while let Some(event) = events.recv().await {
            if !event.is_terminal() {
                continue;
            }
            let Some(info) = event.info() else {
                continue;
            };

            let key = info.target_key();
            for (seq_id, id) in self.drain(&key).await {
                tracing::info!("Promoted queued #{} on {} to execution {}", seq_id, key, id);
            }
        }
        tracing::debug!("Queue drain loop stopped");
    }
}
