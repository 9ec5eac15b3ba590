use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet, VecDeque},
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::sync::{watch, Semaphore};

use crate::error::QueueError;

/// What a duplicate-suppressing queue does with an item that is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Silently drop the new item.
    Drop,
    /// Refuse it with [`QueueError::Duplicate`].
    Reject,
}

enum Pushed {
    Queued,
    Dropped,
}

trait Store<T>: Send {
    fn push(&mut self, item: T) -> Result<Pushed, QueueError>;
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;
    fn release(&mut self, _item: &T) {}
}

struct Fifo<T>(VecDeque<T>);

impl<T: Send> Store<T> for Fifo<T> {
    fn push(&mut self, item: T) -> Result<Pushed, QueueError> {
        self.0.push_back(item);
        Ok(Pushed::Queued)
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Smallest item first. Equal items come out in no particular order.
struct Priority<T>(BinaryHeap<Reverse<T>>);

impl<T: Ord + Send> Store<T> for Priority<T> {
    fn push(&mut self, item: T) -> Result<Pushed, QueueError> {
        self.0.push(Reverse(item));
        Ok(Pushed::Queued)
    }

    fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|Reverse(item)| item)
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

struct Unique<T, K> {
    items: VecDeque<T>,
    seen: HashSet<K>,
    key: Box<dyn Fn(&T) -> K + Send + Sync>,
    policy: DuplicatePolicy,
    explicit_release: bool,
}

impl<T: Send, K: Hash + Eq + Send> Store<T> for Unique<T, K> {
    fn push(&mut self, item: T) -> Result<Pushed, QueueError> {
        if !self.seen.insert((self.key)(&item)) {
            return match self.policy {
                DuplicatePolicy::Drop => Ok(Pushed::Dropped),
                DuplicatePolicy::Reject => Err(QueueError::Duplicate),
            };
        }
        self.items.push_back(item);
        Ok(Pushed::Queued)
    }

    fn pop(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        if !self.explicit_release {
            self.seen.remove(&(self.key)(&item));
        }
        Some(item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn release(&mut self, item: &T) {
        if self.explicit_release {
            self.seen.remove(&(self.key)(item));
        }
    }
}

/// A blocking, optionally bounded, multi-consumer queue.
///
/// Three disciplines are available: FIFO, priority (smallest first) and
/// duplicate-suppressing FIFO. A bounded queue makes `put` wait while it is
/// full, which can deadlock a producer that is also the consumer; keeping
/// producers and consumers apart is up to the caller.
///
/// Closing the queue refuses new items; items already queued are still
/// handed out, after which every `get` reports [`QueueError::Closed`].
pub struct WorkQueue<T> {
    store: Mutex<Box<dyn Store<T>>>,
    items: Semaphore,
    slots: Option<Semaphore>,
    max_items: usize,
    unfinished: watch::Sender<usize>,
    closed: AtomicBool,
}

impl<T: Send + 'static> WorkQueue<T> {
    fn with_store(max_items: usize, store: Box<dyn Store<T>>) -> Self {
        let (unfinished, _) = watch::channel(0);
        Self {
            store: Mutex::new(store),
            items: Semaphore::new(0),
            slots: (max_items > 0).then(|| Semaphore::new(max_items)),
            max_items,
            unfinished,
            closed: AtomicBool::new(false),
        }
    }

    /// First in, first out. `max_items == 0` means unbounded.
    pub fn fifo(max_items: usize) -> Self {
        Self::with_store(max_items, Box::new(Fifo(VecDeque::new())))
    }

    /// Smallest item first.
    pub fn priority(max_items: usize) -> Self
    where
        T: Ord,
    {
        Self::with_store(max_items, Box::new(Priority(BinaryHeap::new())))
    }

    /// FIFO that suppresses items whose key is already present.
    ///
    /// With `explicit_release`, a key stays "present" after its item was
    /// taken off the queue until [`WorkQueue::release`] is called for it, so
    /// an item still being processed cannot be queued again.
    pub fn unique_by<K, F>(
        max_items: usize,
        policy: DuplicatePolicy,
        explicit_release: bool,
        key: F,
    ) -> Self
    where
        K: Hash + Eq + Send + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self::with_store(
            max_items,
            Box::new(Unique {
                items: VecDeque::new(),
                seen: HashSet::new(),
                key: Box::new(key),
                policy,
                explicit_release,
            }),
        )
    }

    /// FIFO that suppresses items equal to one already queued.
    pub fn unique(max_items: usize, policy: DuplicatePolicy) -> Self
    where
        T: Hash + Eq + Clone,
    {
        Self::unique_by(max_items, policy, false, T::clone)
    }
}

impl<T> WorkQueue<T> {
    fn store(&self) -> std::sync::MutexGuard<'_, Box<dyn Store<T>>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn free_slot(&self) {
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
    }

    fn push(&self, item: T) -> Result<(), QueueError> {
        let pushed = self.store().push(item);
        match pushed {
            Ok(Pushed::Queued) => {
                self.unfinished.send_modify(|n| *n += 1);
                self.items.add_permits(1);
                Ok(())
            }
            Ok(Pushed::Dropped) => {
                self.free_slot();
                Ok(())
            }
            Err(e) => {
                self.free_slot();
                Err(e)
            }
        }
    }

    /// Queues `item`, waiting for room if the queue is bounded and full.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if let Some(slots) = &self.slots {
            slots
                .acquire()
                .await
                .map_err(|_| QueueError::Closed)?
                .forget();
        }
        self.push(item)
    }

    /// Queues `item` without waiting; fails with [`QueueError::Full`] instead.
    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if let Some(slots) = &self.slots {
            slots
                .try_acquire()
                .map_err(|_| QueueError::Full)?
                .forget();
        }
        self.push(item)
    }

    /// Takes the next item, waiting until one is available.
    pub async fn get(&self) -> Result<T, QueueError> {
        let item = match self.items.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.store().pop()
            }
            Err(_) => self.store().pop(),
        };
        match item {
            Some(item) => {
                self.free_slot();
                Ok(item)
            }
            None => Err(QueueError::Closed),
        }
    }

    /// Like [`WorkQueue::get`], but `Ok(None)` once `timeout` elapsed.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueError> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Marks one previously taken item as fully processed.
    pub fn task_done(&self) {
        self.unfinished.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Waits until every queued item was taken and marked done.
    pub async fn join(&self) {
        let mut rx = self.unfinished.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Allows a duplicate-suppressing queue to accept `item` again.
    pub fn release(&self, item: &T) {
        self.store().release(item);
    }

    /// Removes every queued item and marks it done. Returns how many were
    /// removed.
    pub fn clear(&self) -> usize {
        let removed: Vec<T> = {
            let mut store = self.store();
            std::iter::from_fn(|| store.pop()).collect()
        };
        for _ in &removed {
            if let Ok(permit) = self.items.try_acquire() {
                permit.forget();
            }
            self.free_slot();
        }
        let count = removed.len();
        self.unfinished.send_modify(|n| *n = n.saturating_sub(count));
        count
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.items.close();
        if let Some(slots) = &self.slots {
            slots.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured bound; 0 means unbounded.
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Items put but not yet marked done.
    pub fn unfinished(&self) -> usize {
        *self.unfinished.borrow()
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .field("max_items", &self.max_items)
            .field("closed", &self.is_closed())
            .finish()
    }
}
