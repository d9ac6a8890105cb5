//! Transaction Cache (§4.2): a bounded, insertion-ordered map from
//! txid to `ParsedTransaction` plus metadata. Driven by exactly one
//! owning task (§5 single-writer discipline); the struct itself holds
//! no internal synchronization because the Orchestrator serializes all
//! mutation through a channel.
//!
//! Backed by a doubly-linked list threaded through a slab so `remove`
//! and LRU eviction are O(1); `HashMap<Txid, usize>` maps a txid to its
//! slot.

use crate::models::{ParsedTransaction, Txid};
use std::collections::HashMap;

struct Node {
    tx: ParsedTransaction,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU transaction cache, bounded by `max_size`. Eviction order equals
/// insertion order among entries not re-inserted (§4.2 invariant).
pub struct TransactionCache {
    max_size: usize,
    index: HashMap<Txid, usize>,
    slab: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>, // oldest
    tail: Option<usize>, // newest
}

/// Reported when `insert` evicts an entry at capacity, so the
/// Aggregator can remove its contribution.
#[derive(Debug, Clone)]
pub struct Evicted {
    pub txid: Txid,
}

impl TransactionCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            index: HashMap::new(),
            slab: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.index.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<&ParsedTransaction> {
        let slot = *self.index.get(txid)?;
        self.slab[slot].as_ref().map(|n| &n.tx)
    }

    /// Insert or replace `tx`, moving it to the most-recently-inserted
    /// end. Evicts the oldest entry if this insert would exceed
    /// `max_size` (unless it replaces an existing txid).
    pub fn insert(&mut self, tx: ParsedTransaction) -> Option<Evicted> {
        let txid = tx.txid;

        if let Some(&slot) = self.index.get(&txid) {
            self.detach(slot);
            self.slab[slot] = Some(Node {
                tx,
                prev: None,
                next: None,
            });
            self.push_back(slot);
            return None;
        }

        let mut evicted = None;
        if self.index.len() >= self.max_size {
            evicted = self.evict_oldest();
        }

        let slot = self.alloc(tx);
        self.index.insert(txid, slot);
        self.push_back(slot);
        evicted
    }

    /// Remove an entry; a no-op (not an error) if `txid` is absent.
    pub fn remove(&mut self, txid: &Txid) -> Option<ParsedTransaction> {
        let slot = self.index.remove(txid)?;
        self.detach(slot);
        let node = self.slab[slot].take().expect("indexed slot must be occupied");
        self.free.push(slot);
        Some(node.tx)
    }

    pub fn snapshot_oldest_timestamp(&self) -> Option<std::time::Instant> {
        let slot = self.head?;
        self.slab[slot].as_ref().map(|n| n.tx.first_seen_at)
    }

    /// Evict oldest entries until `len() <= target`, and lower the
    /// capacity bound itself so subsequent inserts don't immediately
    /// grow back past it. Used by the memory watchdog's soft-limit
    /// downscale (§5).
    pub fn shrink_to(&mut self, target: usize) {
        while self.index.len() > target {
            if self.evict_oldest().is_none() {
                break;
            }
        }
        self.max_size = self.max_size.min(target.max(1));
    }

    fn evict_oldest(&mut self) -> Option<Evicted> {
        let slot = self.head?;
        let txid = self.slab[slot].as_ref()?.tx.txid;
        self.index.remove(&txid);
        self.detach(slot);
        self.slab[slot] = None;
        self.free.push(slot);
        Some(Evicted { txid })
    }

    fn alloc(&mut self, tx: ParsedTransaction) -> usize {
        let node = Node {
            tx,
            prev: None,
            next: None,
        };
        if let Some(slot) = self.free.pop() {
            self.slab[slot] = Some(node);
            slot
        } else {
            self.slab.push(Some(node));
            self.slab.len() - 1
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = match &self.slab[slot] {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.slab[p].as_mut() {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slab[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_back(&mut self, slot: usize) {
        if let Some(tail) = self.tail {
            if let Some(n) = self.slab[tail].as_mut() {
                n.next = Some(slot);
            }
        } else {
            self.head = Some(slot);
        }
        if let Some(n) = self.slab[slot].as_mut() {
            n.prev = self.tail;
            n.next = None;
        }
        self.tail = Some(slot);
    }
}
