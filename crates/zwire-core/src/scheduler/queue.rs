//! The transaction queue: strict priority, stable FIFO within a band.
//!
//! Kept as a vector ordered by `(priority, seq)`. Queue sizes here are
//! tens of entries, so ordered insertion beats a heap: reducers need
//! in-place iteration with removal, and heaps give neither stability nor
//! that.

use super::transaction::{Priority, Transaction};

/// Priority queue over transactions.
#[derive(Default)]
pub struct TransactionQueue {
    entries: Vec<Transaction>,
}

impl TransactionQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Number of queued transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert behind every entry of the same or more urgent priority.
    pub fn insert(&mut self, transaction: Transaction) {
        let at = self
            .entries
            .partition_point(|queued| queued.priority <= transaction.priority);
        self.entries.insert(at, transaction);
    }

    /// Remove and return the most urgent transaction.
    pub fn pop(&mut self) -> Option<Transaction> {
        if self.entries.is_empty() { None } else { Some(self.entries.remove(0)) }
    }

    /// Remove and return the most urgent transaction `eligible` accepts,
    /// leaving ineligible entries (parked wake-up traffic) in place.
    pub fn pop_where(
        &mut self,
        mut eligible: impl FnMut(&Transaction) -> bool,
    ) -> Option<Transaction> {
        let index = self.entries.iter().position(|entry| eligible(entry))?;
        Some(self.entries.remove(index))
    }

    /// Peek at the most urgent transaction.
    #[must_use]
    pub fn front(&self) -> Option<&Transaction> {
        self.entries.first()
    }

    /// Iterate in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.entries.iter()
    }

    /// Drain every entry, preserving dequeue order. Used by reducers,
    /// which re-insert the survivors.
    pub fn drain(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.entries)
    }

    /// Re-sort after external priority mutation. Stable, so FIFO within a
    /// band survives.
    pub fn resort(&mut self) {
        self.entries.sort_by_key(|transaction| (transaction.priority, transaction.seq));
    }

    /// Count of queued transactions in the given band.
    #[must_use]
    pub fn count_at(&self, priority: Priority) -> usize {
        self.entries.iter().filter(|queued| queued.priority == priority).count()
    }
}
