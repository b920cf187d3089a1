//! Latest-value publication from a capture thread to any number of readers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// One immutable published value with its publication metadata.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: T,
    /// 1-based publication counter; increases by one per publish.
    pub version: u64,
    pub published_at: Instant,
}

/// Single-writer, multi-reader slot holding the most recent snapshot.
///
/// Readers get an `Arc` to an immutable snapshot, so a reader never sees
/// a value the writer is still filling in. The lock is held only for the
/// pointer swap or clone.
pub struct Published<T> {
    slot: Mutex<Option<Arc<Snapshot<T>>>>,
    version: AtomicU64,
}

impl<T> Default for Published<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            version: AtomicU64::new(0),
        }
    }
}

impl<T> Published<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot with `value`.
    pub fn publish(&self, value: T) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let version = self.version.load(Ordering::Relaxed) + 1;
        *slot = Some(Arc::new(Snapshot {
            value,
            version,
            published_at: Instant::now(),
        }));
        self.version.store(version, Ordering::Release);
    }

    /// Most recent snapshot, or `None` before the first publish.
    pub fn latest(&self) -> Option<Arc<Snapshot<T>>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of publishes so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_empty_until_published() {
        let p: Published<u32> = Published::new();
        assert!(p.latest().is_none());
        assert_eq!(p.version(), 0);
    }

    #[test]
    fn test_latest_replaces_whole_value() {
        let p = Published::new();
        p.publish(vec![1, 1, 1]);
        let first = p.latest().unwrap();
        p.publish(vec![2, 2, 2]);
        // The earlier handle is unaffected by the later publish.
        assert_eq!(first.value, vec![1, 1, 1]);
        assert_eq!(first.version, 1);
        let second = p.latest().unwrap();
        assert_eq!(second.value, vec![2, 2, 2]);
        assert_eq!(second.version, 2);
        assert!(second.published_at >= first.published_at);
    }

    #[test]
    fn test_readers_never_see_mixed_values() {
        let p = Arc::new(Published::new());
        let writer = {
            let p = Arc::clone(&p);
            thread::spawn(move || {
                for i in 0..2000u32 {
                    p.publish(vec![i; 64]);
                }
            })
        };
        let mut last_version = 0;
        while !writer.is_finished() {
            if let Some(snap) = p.latest() {
                let first = snap.value[0];
                assert!(snap.value.iter().all(|&v| v == first));
                assert!(snap.version >= last_version);
                last_version = snap.version;
            }
        }
        writer.join().unwrap();
        assert_eq!(p.version(), 2000);
    }
}
