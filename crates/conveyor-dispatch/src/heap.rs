//! Binary-heap item ordering.
//!
//! Items whose destination is blocked are parked per destination so the
//! dispatcher does not pop them again on every tick.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use conveyor_protocols::WorkItem;

/// Heap entry ordered for a max-heap.
///
/// Higher priority first, then earlier enqueue time, then admission
/// sequence so equal timestamps stay FIFO.
#[derive(Debug, Clone)]
pub(crate) struct HeapEntry {
    pub(crate) item: WorkItem,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.item.enqueued_at.cmp(&self.item.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority heap of pending work items.
#[derive(Debug, Default)]
pub struct ItemHeap {
    heap: BinaryHeap<HeapEntry>,
    parked: HashMap<String, Vec<HeapEntry>>,
    parked_len: usize,
    next_seq: u64,
}

impl ItemHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an item. O(log n).
    pub fn push(&mut self, item: WorkItem) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { item, seq });
    }

    /// Pop the highest-ranked unparked item. O(log n).
    pub fn pop(&mut self) -> Option<WorkItem> {
        self.heap.pop().map(|entry| entry.item)
    }

    /// Pop keeping the admission sequence, for items that will be put back.
    pub(crate) fn pop_entry(&mut self) -> Option<HeapEntry> {
        self.heap.pop()
    }

    /// Put back an entry popped with [`ItemHeap::pop_entry`].
    pub(crate) fn restore(&mut self, entry: HeapEntry) {
        self.heap.push(entry);
    }

    /// Set aside an entry whose destination cannot be dispatched yet.
    pub(crate) fn park(&mut self, entry: HeapEntry) {
        self.parked_len += 1;
        self.parked
            .entry(entry.item.destination.clone())
            .or_default()
            .push(entry);
    }

    /// Destinations holding parked entries.
    pub(crate) fn parked_destinations(&self) -> impl Iterator<Item = &String> {
        self.parked.keys()
    }

    /// Return a destination's parked entries to the heap, keeping their
    /// original positions.
    pub(crate) fn unpark(&mut self, destination: &str) {
        if let Some(entries) = self.parked.remove(destination) {
            self.parked_len -= entries.len();
            self.heap.extend(entries);
        }
    }

    /// Peek at the highest-ranked unparked item.
    pub fn peek(&self) -> Option<&WorkItem> {
        self.heap.peek().map(|entry| &entry.item)
    }

    /// Queued items, parked ones included, in rank order. O(n log n), for
    /// inspection only.
    pub fn sorted(&self) -> Vec<WorkItem> {
        let mut entries: Vec<HeapEntry> = self
            .heap
            .iter()
            .chain(self.parked.values().flatten())
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.item).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len() + self.parked_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued item.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.parked.clear();
        self.parked_len = 0;
    }
}
