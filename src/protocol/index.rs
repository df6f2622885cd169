//! Bounded pool of correlation indices for one connection.
//!
//! An index is handed out once and only comes back after its response was
//! consumed (or the wait for it was abandoned). Released indices go to the
//! back of the queue so a late response is unlikely to meet a reused index.

use super::envelope::CorrelationIndex;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const DEFAULT_POOL_SIZE: u32 = 256;

struct PoolState {
    free: VecDeque<CorrelationIndex>,
    in_use: HashSet<CorrelationIndex>,
}

pub struct IndexPool {
    state: Mutex<PoolState>,
    released: Notify,
    capacity: u32,
}

impl IndexPool {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(PoolState {
                free: (0..capacity).collect(),
                in_use: HashSet::new(),
            }),
            released: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn try_acquire(&self) -> Option<CorrelationIndex> {
        let mut state = self.state.lock();
        let index = state.free.pop_front()?;
        state.in_use.insert(index);
        Some(index)
    }

    /// Waits up to `wait` for an index to become free.
    pub async fn acquire(&self, wait: Duration) -> Option<CorrelationIndex> {
        let deadline = Instant::now() + wait;
        loop {
            let released = self.released.notified();
            if let Some(index) = self.try_acquire() {
                return Some(index);
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return self.try_acquire();
            }
        }
    }

    /// Returns an index to the pool. Releasing an index that is not in use is
    /// a no-op and returns false.
    pub fn release(&self, index: CorrelationIndex) -> bool {
        let mut state = self.state.lock();
        if !state.in_use.remove(&index) {
            return false;
        }
        state.free.push_back(index);
        drop(state);
        self.released.notify_one();
        true
    }

    pub fn is_outstanding(&self, index: CorrelationIndex) -> bool {
        self.state.lock().in_use.contains(&index)
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().in_use.len()
    }
}
