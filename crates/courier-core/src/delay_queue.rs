//! Deadline-ordered delay queue with a single forwarding worker.
//!
//! Entries live in a slot arena indexed by key; the min-heap holds
//! `(deadline, seq, slot, generation)` tuples. Replacing or removing an entry
//! bumps the slot generation, which turns any heap node still pointing at it
//! into a tombstone that the worker discards when it reaches the top.
//!
//! The worker forwards each expired key on an `mpsc` channel. It sleeps until
//! the earliest deadline and is woken early by [`DelayQueue::push`] /
//! [`DelayQueue::remove`] through a [`Notify`], or stopped through a `watch`
//! shutdown signal. The state lock is never held across an await.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, sleep_until};

/// Delay queue errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Key index and slot arena disagree
    #[error("delay queue index corrupted: {0}")]
    Corrupted(&'static str),

    /// A thread panicked while holding the queue lock
    #[error("delay queue lock poisoned")]
    Poisoned,
}

type HeapEntry = Reverse<(Instant, u64, usize, u64)>;

struct Slot<K> {
    key: Option<K>,
    deadline: Instant,
    generation: u64,
}

struct State<K> {
    heap: BinaryHeap<HeapEntry>,
    slots: Vec<Slot<K>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    seq: u64,
}

enum Next<K> {
    Fire(K),
    Wait(Option<Instant>),
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    fn is_live(&self, slot: usize, generation: u64) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| s.generation == generation && s.key.is_some())
    }

    fn head_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, _, slot, generation))) = self.heap.peek().copied() {
            if self.is_live(slot, generation) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    fn push(&mut self, key: K, deadline: Instant) {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = match self.free.pop() {
                    Some(slot) => slot,
                    None => {
                        self.slots.push(Slot {
                            key: None,
                            deadline,
                            generation: 0,
                        });
                        self.slots.len() - 1
                    }
                };
                self.index.insert(key.clone(), slot);
                slot
            }
        };

        let entry = &mut self.slots[slot];
        entry.generation += 1;
        entry.key = Some(key);
        entry.deadline = deadline;
        let generation = entry.generation;

        self.seq += 1;
        self.heap
            .push(Reverse((deadline, self.seq, slot, generation)));
    }

    fn release(&mut self, slot: usize) -> Option<K> {
        let entry = self.slots.get_mut(slot)?;
        let key = entry.key.take()?;
        entry.generation += 1;
        self.free.push(slot);
        Some(key)
    }

    fn remove(&mut self, key: &K) -> Result<Option<Instant>, QueueError> {
        let Some(slot) = self.index.remove(key) else {
            return Ok(None);
        };
        let deadline = match self.slots.get(slot) {
            Some(entry) if entry.key.as_ref() == Some(key) => entry.deadline,
            _ => return Err(QueueError::Corrupted("index points at a foreign slot")),
        };
        self.release(slot);
        Ok(Some(deadline))
    }

    fn poll(&mut self, now: Instant) -> Result<Next<K>, QueueError> {
        let Some(deadline) = self.head_deadline() else {
            return Ok(Next::Wait(None));
        };
        if deadline > now {
            return Ok(Next::Wait(Some(deadline)));
        }
        let Some(Reverse((_, _, slot, _))) = self.heap.pop() else {
            return Ok(Next::Wait(None));
        };
        let key = self
            .release(slot)
            .ok_or(QueueError::Corrupted("live heap head without a key"))?;
        if self.index.remove(&key).is_none() {
            return Err(QueueError::Corrupted("expired key missing from index"));
        }
        Ok(Next::Fire(key))
    }
}

struct Shared<K> {
    state: Mutex<State<K>>,
    wake: Notify,
}

/// Time-ordered queue that forwards each key once its deadline passes.
///
/// Holds at most one entry per key; pushing an existing key replaces its
/// deadline. Dropping the queue stops the worker.
pub struct DelayQueue<K> {
    shared: Arc<Shared<K>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<K> DelayQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue and spawn its worker on the current tokio runtime.
    ///
    /// Expired keys are sent on `forward`.
    pub fn new(forward: mpsc::Sender<K>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            wake: Notify::new(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_worker(Arc::clone(&shared), forward, shutdown_rx));

        Self {
            shared,
            shutdown_tx,
        }
    }

    /// Schedule `key` at `deadline`, replacing any pending entry for it.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Poisoned` if the queue state is unusable.
    pub fn push(&self, key: K, deadline: Instant) -> Result<(), QueueError> {
        {
            let mut state = self.shared.state.lock().map_err(|_| QueueError::Poisoned)?;
            state.push(key, deadline);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Cancel the pending entry for `key`.
    ///
    /// Returns `Ok(false)` if there is none (already fired or removed).
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Corrupted` if the key index and slot arena
    /// disagree, or `QueueError::Poisoned` if the lock is poisoned.
    pub fn remove(&self, key: &K) -> Result<bool, QueueError> {
        let was_head = {
            let mut state = self.shared.state.lock().map_err(|_| QueueError::Poisoned)?;
            let head = state.head_deadline();
            match state.remove(key)? {
                Some(deadline) => Some(Some(deadline) == head),
                None => None,
            }
        };
        match was_head {
            Some(true) => {
                self.shared.wake.notify_one();
                Ok(true)
            }
            Some(false) => Ok(true),
            None => Ok(false),
        }
    }

    /// Number of pending entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.index.len())
            .unwrap_or(0)
    }

    /// Whether no entries are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.head_deadline())
    }

    /// Stop the worker. Pending entries are never forwarded. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn poll_shared<K: Clone + Eq + Hash>(shared: &Shared<K>) -> Result<Next<K>, QueueError> {
    let mut state = shared.state.lock().map_err(|_| QueueError::Poisoned)?;
    state.poll(Instant::now())
}

async fn run_worker<K>(
    shared: Arc<Shared<K>>,
    forward: mpsc::Sender<K>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    K: Clone + Eq + Hash + Send + 'static,
{
    tracing::debug!("Delay queue worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match poll_shared(&shared) {
            Ok(Next::Fire(key)) => {
                tokio::select! {
                    result = forward.send(key) => {
                        if result.is_err() {
                            tracing::error!("Delay queue consumer dropped; expired entry lost");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            Ok(Next::Wait(deadline)) => {
                tokio::select! {
                    () = sleep_until_deadline(deadline) => {}
                    () = shared.wake.notified() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Delay queue worker stopping: {}", e);
                return;
            }
        }
    }

    tracing::debug!("Delay queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> (DelayQueue<u32>, mpsc::Receiver<u32>) {
        let (tx, rx) = mpsc::channel(16);
        (DelayQueue::new(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_in_deadline_order() {
        let (queue, mut rx) = queue();
        let start = Instant::now();

        queue.push(3, start + Duration::from_secs(3)).unwrap();
        queue.push(1, start + Duration::from_secs(1)).unwrap();
        queue.push(2, start + Duration::from_secs(2)).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.next_deadline(), Some(start + Duration::from_secs(1)));

        for expected in 1..=3u32 {
            assert_eq!(rx.recv().await, Some(expected));
            assert!(Instant::now() >= start + Duration::from_secs(u64::from(expected)));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_key_never_forwarded() {
        let (queue, mut rx) = queue();
        let start = Instant::now();

        queue.push(1, start + Duration::from_secs(1)).unwrap();
        queue.push(2, start + Duration::from_secs(2)).unwrap();
        assert_eq!(queue.remove(&1), Ok(true));

        assert_eq!(rx.recv().await, Some(2));
        assert!(Instant::now() >= start + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_absent_is_noop() {
        let (queue, mut rx) = queue();
        assert_eq!(queue.remove(&7), Ok(false));

        queue.push(7, Instant::now()).unwrap();
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(queue.remove(&7), Ok(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_replaces_existing_entry() {
        let (queue, mut rx) = queue();
        let start = Instant::now();

        queue.push(1, start + Duration::from_secs(1)).unwrap();
        queue.push(2, start + Duration::from_secs(3)).unwrap();
        queue.push(1, start + Duration::from_secs(5)).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(1));
        assert!(Instant::now() >= start + Duration::from_secs(5));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_wakes_idle_worker() {
        let (queue, mut rx) = queue();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let deadline = Instant::now() + Duration::from_millis(100);
        queue.push(9, deadline).unwrap();
        assert_eq!(rx.recv().await, Some(9));
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_push_preempts_sleep() {
        let (queue, mut rx) = queue();
        let start = Instant::now();

        queue.push(1, start + Duration::from_secs(10)).unwrap();
        tokio::task::yield_now().await;
        queue.push(2, start + Duration::from_secs(1)).unwrap();

        assert_eq!(rx.recv().await, Some(2));
        assert!(Instant::now() < start + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker() {
        let (queue, mut rx) = queue();
        queue.push(1, Instant::now() + Duration::from_secs(1)).unwrap();
        queue.shutdown();
        queue.shutdown();

        // Worker exit drops the forwarding sender
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_reused() {
        let (queue, mut rx) = queue();
        for round in 0..4u32 {
            queue.push(round, Instant::now()).unwrap();
            assert_eq!(rx.recv().await, Some(round));
        }
        let state = queue.shared.state.lock().unwrap();
        assert_eq!(state.slots.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_index_reported() {
        let (queue, _rx) = queue();
        queue.push(5, Instant::now() + Duration::from_secs(1)).unwrap();
        {
            let mut state = queue.shared.state.lock().unwrap();
            let slot = state.index[&5];
            state.slots[slot].key = Some(6);
        }
        assert!(matches!(queue.remove(&5), Err(QueueError::Corrupted(_))));
    }
}
