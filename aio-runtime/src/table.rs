//! Lookup Table
//!
//! A growable slot table mapping small integer indices to live channels.
//! The index is packed into every [`CallId`](crate::record::CallId), so a
//! completion event resolves back to its channel with one bounds-checked
//! array access instead of a hash lookup.
//!
//! # Design
//!
//! - Capacity grows by a fixed increment, not by doubling. Existing indices
//!   are preserved across growth.
//! - Freed slots go on a free list and are handed out again by `add`.
//! - One mutex guards the slot array; entries are `Arc`s so `lookup` hands
//!   out a reference without holding the lock.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{AioError, Result};

struct Slots<T> {
    entries: Vec<Option<Arc<T>>>,
    free: Vec<usize>,
    occupied: usize,
}

/// Index-addressed table of shared elements.
pub struct LookupTable<T> {
    slots: Mutex<Slots<T>>,
    increment: usize,
    max_capacity: usize,
}

impl<T> LookupTable<T> {
    /// Create a table with `initial` slots, growing by `increment` up to
    /// `max_capacity`.
    pub fn new(initial: usize, increment: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(1);
        let initial = initial.min(max_capacity);
        let mut slots = Slots {
            entries: Vec::new(),
            free: Vec::new(),
            occupied: 0,
        };
        Self::extend(&mut slots, initial);
        Self {
            slots: Mutex::new(slots),
            increment: increment.max(1),
            max_capacity,
        }
    }

    /// Store `element` in a free slot and return its index.
    ///
    /// Fails with [`AioError::ResourceExhausted`] once `max_capacity` slots
    /// are occupied.
    pub fn add(&self, element: Arc<T>) -> Result<usize> {
        let mut slots = self.slots.lock();
        if slots.free.is_empty() {
            let capacity = slots.entries.len();
            if capacity >= self.max_capacity {
                return Err(AioError::ResourceExhausted {
                    resource: "lookup table",
                });
            }
            let grow = self.increment.min(self.max_capacity - capacity);
            Self::extend(&mut slots, grow);
        }
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                return Err(AioError::ResourceExhausted {
                    resource: "lookup table",
                })
            }
        };
        slots.entries[index] = Some(element);
        slots.occupied += 1;
        Ok(index)
    }

    /// Element at `index`, or `None` if out of range or unoccupied.
    pub fn lookup(&self, index: usize) -> Option<Arc<T>> {
        self.slots.lock().entries.get(index).and_then(Clone::clone)
    }

    /// Clear `index` and make it available for reuse.
    pub fn remove(&self, index: usize) -> Result<Arc<T>> {
        let mut slots = self.slots.lock();
        let removed = slots
            .entries
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(AioError::InvalidIndex { index })?;
        slots.free.push(index);
        slots.occupied -= 1;
        Ok(removed)
    }

    /// Index holding exactly this element. Linear scan; diagnostics only.
    pub fn find(&self, element: &Arc<T>) -> Option<usize> {
        self.slots
            .lock()
            .entries
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |e| Arc::ptr_eq(e, element)))
    }

    /// Every occupied entry, in index order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.slots.lock().entries.iter().flatten().cloned().collect()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.lock().occupied
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().entries.len()
    }

    fn extend(slots: &mut Slots<T>, count: usize) {
        let start = slots.entries.len();
        slots.entries.resize_with(start + count, || None);
        // Reverse so the lowest new index is popped first.
        slots.free.extend((start..start + count).rev());
    }
}

impl<T> fmt::Debug for LookupTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("LookupTable")
            .field("occupied", &slots.occupied)
            .field("capacity", &slots.entries.len())
            .field("increment", &self.increment)
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_lookup() {
        let table = LookupTable::new(4, 4, 64);
        let index = table.add(Arc::new("a")).unwrap();
        assert_eq!(*table.lookup(index).unwrap(), "a");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_then_lookup_is_empty() {
        let table = LookupTable::new(4, 4, 64);
        let index = table.add(Arc::new(1)).unwrap();
        assert_eq!(*table.remove(index).unwrap(), 1);
        assert!(table.lookup(index).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_freed_index_is_reused() {
        let table = LookupTable::new(4, 4, 64);
        let a = table.add(Arc::new(1)).unwrap();
        let _b = table.add(Arc::new(2)).unwrap();
        table.remove(a).unwrap();
        assert_eq!(table.add(Arc::new(3)).unwrap(), a);
    }

    #[test]
    fn test_grows_by_increment_preserving_entries() {
        let table = LookupTable::new(2, 3, 64);
        let indices: Vec<usize> = (0..5).map(|i| table.add(Arc::new(i)).unwrap()).collect();
        assert_eq!(table.capacity(), 5);
        let sixth = table.add(Arc::new(5)).unwrap();
        assert_eq!(table.capacity(), 8);
        for (value, index) in indices.iter().enumerate() {
            assert_eq!(*table.lookup(*index).unwrap(), value);
        }
        assert_eq!(*table.lookup(sixth).unwrap(), 5);
    }

    #[test]
    fn test_overflow_is_resource_exhausted() {
        let table = LookupTable::new(1, 1, 2);
        table.add(Arc::new(0)).unwrap();
        table.add(Arc::new(1)).unwrap();
        let err = table.add(Arc::new(2)).unwrap_err();
        assert!(matches!(err, AioError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_growth_clamped_to_max_capacity() {
        let table = LookupTable::new(1, 10, 3);
        for i in 0..3 {
            table.add(Arc::new(i)).unwrap();
        }
        assert_eq!(table.capacity(), 3);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let table: LookupTable<u8> = LookupTable::new(2, 2, 8);
        assert!(table.lookup(100).is_none());
    }

    #[test]
    fn test_remove_unoccupied_is_error() {
        let table: LookupTable<u8> = LookupTable::new(2, 2, 8);
        assert!(matches!(table.remove(0), Err(AioError::InvalidIndex { index: 0 })));
        assert!(matches!(table.remove(50), Err(AioError::InvalidIndex { index: 50 })));
    }

    #[test]
    fn test_find_by_identity() {
        let table = LookupTable::new(4, 4, 8);
        let a = Arc::new(7);
        let twin = Arc::new(7);
        let index = table.add(a.clone()).unwrap();
        assert_eq!(table.find(&a), Some(index));
        assert_eq!(table.find(&twin), None);
    }

    #[test]
    fn test_concurrent_adds_get_distinct_indices() {
        let table = Arc::new(LookupTable::new(1, 1, 1024));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..32).map(|i| table.add(Arc::new(t * 100 + i)).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 256);
        assert_eq!(table.len(), 256);
    }
}
