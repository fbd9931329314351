use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: i32,
    seq: u64,
    id: Uuid,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Shared ready queue: FIFO within a priority level.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    timers: AtomicUsize,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut BinaryHeap<Entry>) -> R) -> R {
        match self.heap.lock() {
            Ok(mut heap) => f(&mut heap),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn push(&self, id: Uuid, priority: i32) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.with(|heap| heap.push(Entry { priority, seq, id }));
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Uuid> {
        self.with(|heap| heap.pop().map(|e| e.id))
    }

    /// Wait for the next ready action.
    pub async fn pop(&self) -> Uuid {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(id) = self.try_pop() {
                return id;
            }
            notified.await;
        }
    }

    /// Push `id` after `delay` without holding a worker.
    pub fn defer(self: &Arc<Self>, id: Uuid, priority: i32, delay: Duration) {
        self.timers.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(id, priority);
            queue.timers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.with(|heap| heap.iter().any(|e| e.id == id))
    }

    pub fn len(&self) -> usize {
        self.with(|heap| heap.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deferred pushes that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.timers.load(Ordering::SeqCst)
    }
}
