use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;

/// Number of slots in every segment of a [`GrowingCollection`].
const SEGMENT_SIZE: usize = 32;

struct Segment<T> {
    /// Position of this segment in the chain, counting from the oldest segment.
    ordinal: usize,
    /// Number of slots handed out to writers. May exceed `SEGMENT_SIZE` on overflow.
    reserved: AtomicUsize,
    slots: Box<[OnceLock<T>]>,
    next: Option<Arc<Segment<T>>>,
}

impl<T> Segment<T> {
    fn new(next: Option<Arc<Segment<T>>>) -> Self {
        Self {
            ordinal: next.as_ref().map_or(0, |n| n.ordinal + 1),
            reserved: AtomicUsize::new(0),
            slots: (0..SEGMENT_SIZE).map(|_| OnceLock::new()).collect(),
            next,
        }
    }

    fn reserved_count(&self) -> usize {
        self.reserved.load(Ordering::Acquire).min(SEGMENT_SIZE)
    }

    /// Returns the value at `index`, waiting for a writer that reserved the slot to publish it.
    fn published(&self, index: usize) -> &T {
        let slot = &self.slots[index];
        loop {
            if let Some(value) = slot.get() {
                return value;
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        // Unlink the chain iteratively, long chains would otherwise overflow the stack.
        let mut next = self.next.take();
        while let Some(segment) = next {
            match Arc::try_unwrap(segment) {
                Ok(mut segment) => next = segment.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// An append-only list that supports concurrent writers without locking.
///
/// Values are stored in fixed-size segments linked newest-first. Appending reserves a slot in the
/// head segment with a single atomic increment. When the head segment is exhausted, a new empty
/// segment is swapped in as the head and the append is retried.
///
/// Reading works on a [`Snapshot`], which observes exactly the values that were reserved when it
/// was taken. The iteration order is not meaningful.
pub struct GrowingCollection<T> {
    head: ArcSwap<Segment<T>>,
}

impl<T> GrowingCollection<T> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self {
            head: ArcSwap::from_pointee(Segment::new(None)),
        }
    }

    /// Appends a value to the collection.
    pub fn add(&self, value: T) {
        let mut value = Some(value);

        loop {
            let head = self.head.load_full();
            let index = head.reserved.fetch_add(1, Ordering::AcqRel);

            if index < SEGMENT_SIZE {
                if let Some(value) = value.take() {
                    // The index is unique to this writer, so the slot is always vacant.
                    let _ = head.slots[index].set(value);
                }
                return;
            }

            // The head is full. Only one of the competing writers installs the new segment, all
            // of them retry against whatever head is current afterwards.
            let segment = Arc::new(Segment::new(Some(head.clone())));
            let _ = self.head.compare_and_swap(&head, segment);
        }
    }

    /// Returns the number of values added so far.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Returns `true` if no value has been added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Captures the current contents of the collection.
    ///
    /// Values appended after this call are not visible through the snapshot.
    pub fn snapshot(&self) -> Snapshot<T> {
        let head = self.head.load_full();
        let head_count = head.reserved_count();
        Snapshot { head, head_count }
    }
}

impl<T> Default for GrowingCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for GrowingCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrowingCollection")
            .field("len", &self.len())
            .finish()
    }
}

/// A stable view of a [`GrowingCollection`].
pub struct Snapshot<T> {
    head: Arc<Segment<T>>,
    head_count: usize,
}

impl<T> Snapshot<T> {
    /// Returns the number of values in the snapshot.
    pub fn len(&self) -> usize {
        // All segments behind the head are full.
        self.head.ordinal * SEGMENT_SIZE + self.head_count
    }

    /// Returns `true` if the snapshot holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the values, newest segment first.
    pub fn iter(&self) -> SnapshotIter<'_, T> {
        SnapshotIter {
            segment: Some(&*self.head),
            index: self.head_count,
        }
    }
}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a T;
    type IntoIter = SnapshotIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the values of a [`Snapshot`].
pub struct SnapshotIter<'a, T> {
    segment: Option<&'a Segment<T>>,
    index: usize,
}

impl<'a, T> Iterator for SnapshotIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let segment = self.segment?;
            if self.index > 0 {
                self.index -= 1;
                return Some(segment.published(self.index));
            }

            self.segment = segment.next.as_deref();
            self.index = SEGMENT_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::thread;

    use super::*;

    #[test]
    fn test_empty() {
        let collection = GrowingCollection::<u32>::new();
        assert!(collection.is_empty());
        assert_eq!(collection.snapshot().iter().count(), 0);
    }

    #[test]
    fn test_add_across_segments() {
        let collection = GrowingCollection::new();
        for i in 0..100 {
            collection.add(i);
        }

        let snapshot = collection.snapshot();
        assert_eq!(snapshot.len(), 100);

        let values: BTreeSet<_> = snapshot.iter().copied().collect();
        similar_asserts::assert_eq!(values, (0..100).collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_snapshot_isolation() {
        let collection = GrowingCollection::new();
        for i in 0..40 {
            collection.add(i);
        }

        let snapshot = collection.snapshot();
        for i in 40..80 {
            collection.add(i);
        }

        assert_eq!(snapshot.len(), 40);
        assert_eq!(snapshot.iter().count(), 40);
        assert!(snapshot.iter().all(|v| *v < 40));
        assert_eq!(collection.len(), 80);
    }

    #[test]
    fn test_concurrent_add() {
        let collection = Arc::new(GrowingCollection::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let collection = collection.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        collection.add(t * 1000 + i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = collection.snapshot();
        assert_eq!(snapshot.len(), 8000);

        let values: BTreeSet<_> = snapshot.iter().copied().collect();
        assert_eq!(values.len(), 8000);
    }

    #[test]
    fn test_drop_long_chain() {
        let collection = GrowingCollection::new();
        for i in 0..200_000 {
            collection.add(i);
        }
        drop(collection);
    }
}
