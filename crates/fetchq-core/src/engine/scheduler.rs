//! Admission scheduler
//!
//! Keeps queued downloads ordered by priority (highest first) and then by
//! enqueue sequence, and decides how many of them may start.

use fetchq_types::{Download, Priority};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    sequence: u64,
    id: Uuid,
}

impl QueueKey {
    fn of(download: &Download) -> Self {
        Self {
            priority: Reverse(download.priority()),
            sequence: download.sequence,
            id: download.id,
        }
    }
}

/// Waiting set and admission state of one namespace
#[derive(Debug)]
pub(crate) struct Scheduler {
    waiting: BTreeSet<QueueKey>,
    keys: HashMap<Uuid, QueueKey>,
    limit: u32,
    frozen: bool,
    /// Downloads paused by the current freeze
    frozen_ids: HashSet<Uuid>,
}

impl Scheduler {
    pub fn new(limit: u32) -> Self {
        Self {
            waiting: BTreeSet::new(),
            keys: HashMap::new(),
            limit,
            frozen: false,
            frozen_ids: HashSet::new(),
        }
    }

    /// Add a queued download, or re-key it if its priority changed
    pub fn enqueue(&mut self, download: &Download) {
        self.withdraw(download.id);
        let key = QueueKey::of(download);
        self.waiting.insert(key);
        self.keys.insert(download.id, key);
    }

    /// Take a download out of the waiting set
    pub fn withdraw(&mut self, id: Uuid) -> bool {
        match self.keys.remove(&id) {
            Some(key) => self.waiting.remove(&key),
            None => false,
        }
    }

    pub fn is_waiting(&self, id: Uuid) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Waiting ids in admission order
    pub fn ordered(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.waiting.iter().map(|key| key.id)
    }

    /// Free admission slots given the number of running transfers
    pub fn free_slots(&self, active: usize) -> usize {
        if self.frozen {
            return 0;
        }
        (self.limit as usize).saturating_sub(active)
    }

    /// Pick up to `free_slots(active)` waiting ids that `eligible` accepts,
    /// in admission order
    pub fn next_batch(&self, active: usize, mut eligible: impl FnMut(Uuid) -> bool) -> Vec<Uuid> {
        let slots = self.free_slots(active);
        if slots == 0 {
            return Vec::new();
        }
        self.ordered().filter(|id| eligible(*id)).take(slots).collect()
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Stop admitting until [`Scheduler::unfreeze`]
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Remember a download paused by the current freeze
    pub fn remember_frozen(&mut self, id: Uuid) {
        self.frozen_ids.insert(id);
    }

    /// Leave the frozen state, returning the downloads the freeze paused
    pub fn unfreeze(&mut self) -> Vec<Uuid> {
        self.frozen = false;
        self.frozen_ids.drain().collect()
    }

    /// Forget a download the freeze paused (it was resumed or dropped)
    pub fn forget_frozen(&mut self, id: Uuid) {
        self.frozen_ids.remove(&id);
    }
}
