//! Bounded bookkeeping for out-of-order and duplicate delivery.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::cipher::MessageKey;

/// Position of a message: the sender's ratchet public key and the message
/// number within that chain.
pub type ChainIndex = ([u8; 32], u32);

/// Message keys derived for messages that have not arrived yet.
///
/// Holds at most `capacity` keys; inserting beyond that evicts the oldest,
/// whose message then becomes permanently undecryptable.
pub struct SkippedKeyCache {
    capacity: usize,
    order: VecDeque<ChainIndex>,
    keys: HashMap<ChainIndex, MessageKey>,
}

impl SkippedKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            keys: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: &ChainIndex) -> Option<&MessageKey> {
        self.keys.get(index)
    }

    /// Take a key out for its single use.
    pub fn remove(&mut self, index: &ChainIndex) -> Option<MessageKey> {
        let key = self.keys.remove(index)?;
        self.order.retain(|i| i != index);
        Some(key)
    }

    /// Returns how many keys were evicted to make room.
    pub fn insert(&mut self, index: ChainIndex, key: MessageKey) -> usize {
        if self.capacity == 0 {
            return 1;
        }
        if self.keys.insert(index, key).is_none() {
            self.order.push_back(index);
        }
        let mut evicted = 0;
        while self.keys.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.keys.remove(&oldest);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, capacity = self.capacity, "skipped message keys evicted");
        }
        evicted
    }

    /// A copy holding the same keys, for staging.
    pub(crate) fn fork(&self) -> Self {
        Self {
            capacity: self.capacity,
            order: self.order.clone(),
            keys: self
                .keys
                .iter()
                .map(|(index, key)| (*index, MessageKey::from_bytes(*key.as_bytes())))
                .collect(),
        }
    }

    /// Entries oldest first.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&ChainIndex, &MessageKey)> {
        self.order
            .iter()
            .filter_map(|index| self.keys.get(index).map(|key| (index, key)))
    }
}

/// The most recent consumed message positions.
///
/// A position in the window has been decrypted before; delivering it again
/// is a replay. Positions older than the window fall back to the chain
/// counters, which report them as expired.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    capacity: usize,
    order: VecDeque<ChainIndex>,
    seen: HashSet<ChainIndex>,
}

impl ReplayWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, index: &ChainIndex) -> bool {
        self.seen.contains(index)
    }

    pub fn record(&mut self, index: ChainIndex) {
        if self.capacity == 0 || !self.seen.insert(index) {
            return;
        }
        self.order.push_back(index);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    /// Positions oldest first.
    pub(crate) fn positions(&self) -> impl Iterator<Item = &ChainIndex> {
        self.order.iter()
    }
}
