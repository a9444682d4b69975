use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use courier_common::InterlockedThrottle;
use courier_statsd::metric;
use parking_lot::{Mutex, RwLock};

use crate::TelemetryItem;
use crate::statsd::{ChannelCounters, ChannelGauges};

/// An error returned by [`TelemetryBuffer::enqueue`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum BufferError {
    /// The buffer holds the maximum number of items and the new item was dropped.
    #[error("telemetry backlog of {0} items exceeded")]
    BacklogExceeded(usize),
}

type FullCallback = Arc<dyn Fn() + Send + Sync>;

/// In-memory queue of telemetry items waiting for transmission.
///
/// The buffer has two limits. When the number of items reaches the `capacity`, the registered
/// callback fires to request an early transmission. When it reaches the `backlog_size`, further
/// items are dropped until the buffer is drained.
pub struct TelemetryBuffer {
    items: Mutex<Vec<TelemetryItem>>,
    capacity: usize,
    backlog_size: usize,
    on_full: RwLock<Option<FullCallback>>,
    drop_throttle: InterlockedThrottle,
}

impl TelemetryBuffer {
    /// Creates an empty buffer.
    ///
    /// A `backlog_size` below `capacity` is raised to `capacity`.
    pub fn new(capacity: usize, backlog_size: usize, diagnostics_interval: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(Vec::new()),
            capacity,
            backlog_size: backlog_size.max(capacity),
            on_full: RwLock::new(None),
            drop_throttle: InterlockedThrottle::new(diagnostics_interval),
        }
    }

    /// Returns the number of items that triggers the full callback.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the maximum number of items held by the buffer.
    pub fn backlog_size(&self) -> usize {
        self.backlog_size
    }

    /// Returns the number of buffered items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns `true` if no items are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers the callback invoked when the buffer fills up to its capacity.
    ///
    /// The callback runs on the enqueuing thread after the buffer lock has been released, once
    /// each time the number of items crosses the capacity.
    pub fn set_full_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_full.write() = Some(Arc::new(callback));
    }

    /// Appends an item to the buffer.
    ///
    /// Returns an error and drops the item if the backlog is exhausted.
    pub fn enqueue(&self, item: TelemetryItem) -> Result<(), BufferError> {
        let dropped = self.enqueue_all(std::iter::once(item));
        if dropped > 0 {
            return Err(BufferError::BacklogExceeded(self.backlog_size));
        }
        Ok(())
    }

    /// Appends multiple items, dropping those that exceed the backlog.
    ///
    /// Returns the number of dropped items.
    pub fn enqueue_all<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = TelemetryItem>,
    {
        let mut dropped = 0;

        let crossed = {
            let mut buffer = self.items.lock();
            let before = buffer.len();

            for item in items {
                if buffer.len() >= self.backlog_size {
                    dropped += 1;
                } else {
                    buffer.push(item);
                }
            }

            before < self.capacity && buffer.len() >= self.capacity
        };

        if dropped > 0 {
            metric!(
                counter(ChannelCounters::ItemsDropped) += dropped as i64,
                reason = "backlog"
            );
            self.drop_throttle.try_run(|| {
                courier_log::warn!(
                    backlog_size = self.backlog_size,
                    dropped,
                    "telemetry buffer is full, dropping items"
                );
            });
        }

        if crossed {
            let callback = self.on_full.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }

        dropped
    }

    /// Removes and returns all buffered items in insertion order.
    pub fn dequeue(&self) -> Vec<TelemetryItem> {
        let items = mem::take(&mut *self.items.lock());
        metric!(gauge(ChannelGauges::BufferSize) = items.len() as u64);
        items
    }
}

impl fmt::Debug for TelemetryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("backlog_size", &self.backlog_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn buffer(capacity: usize, backlog: usize) -> (TelemetryBuffer, Arc<AtomicUsize>) {
        let buffer = TelemetryBuffer::new(capacity, backlog, Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        buffer.set_full_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (buffer, calls)
    }

    fn item(index: usize) -> TelemetryItem {
        TelemetryItem::event(format!("event-{index}"))
    }

    #[test]
    fn test_below_capacity_does_not_signal() {
        let (buffer, calls) = buffer(5, 100);
        for i in 0..4 {
            buffer.enqueue(item(i)).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_capacity_signals_once() {
        let (buffer, calls) = buffer(5, 100);
        for i in 0..8 {
            buffer.enqueue(item(i)).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        buffer.dequeue();
        for i in 0..5 {
            buffer.enqueue(item(i)).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backlog_drops_excess() {
        let (buffer, _) = buffer(2, 10);
        let mut rejected = 0;
        for i in 0..13 {
            if buffer.enqueue(item(i)).is_err() {
                rejected += 1;
            }
        }

        assert_eq!(rejected, 3);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_enqueue_all_reports_dropped() {
        let (buffer, calls) = buffer(3, 4);
        let dropped = buffer.enqueue_all((0..6).map(item));

        assert_eq!(dropped, 2);
        assert_eq!(buffer.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dequeue_preserves_order() {
        let (buffer, _) = buffer(10, 10);
        buffer.enqueue_all((0..3).map(item));

        let names: Vec<_> = buffer
            .dequeue()
            .into_iter()
            .map(|item| match item.data {
                crate::TelemetryData::Event { name } => name,
                _ => unreachable!(),
            })
            .collect();

        assert_eq!(names, ["event-0", "event-1", "event-2"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_backlog_clamped_to_capacity() {
        let buffer = TelemetryBuffer::new(50, 10, Duration::from_secs(10));
        assert_eq!(buffer.backlog_size(), 50);
    }

    #[test]
    fn test_concurrent_enqueue_respects_backlog() {
        let (buffer, calls) = buffer(100, 1000);
        let buffer = Arc::new(buffer);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        buffer.enqueue(item(i)).ok();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.len(), 1000);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
