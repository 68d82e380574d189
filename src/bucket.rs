//! Per-size-class free lists.

use crate::handler::{HandlerError, ResourceHandler};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A single size class: idle resources all sharing one canonical capacity.
///
/// Buckets are created lazily on first demand for their index and live until
/// the pool closes. Every mutation happens under the pool lock; the shared
/// `pooled` counter tracks resident bytes across all of a pool's buckets.
pub(crate) struct Bucket<R> {
    entry_capacity: u64,
    /// The most recently released resource sits at the tail (LIFO, so reuse
    /// favors cache-warm memory).
    free: Vec<R>,
    pooled: Arc<AtomicU64>,
}

impl<R: Send> Bucket<R> {
    pub(crate) fn new(entry_capacity: u64, pooled: Arc<AtomicU64>) -> Self {
        Self {
            entry_capacity,
            free: Vec::new(),
            pooled,
        }
    }

    pub(crate) const fn entry_capacity(&self) -> u64 {
        self.entry_capacity
    }

    /// Pops the most recently released resource, or creates one when the free
    /// list is empty and `may_create` allows it.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the bucket's entry capacity; the pool routes
    /// requests so that this cannot happen.
    pub(crate) fn acquire<H>(
        &mut self,
        handler: &H,
        size: u64,
        may_create: bool,
    ) -> Result<Option<R>, HandlerError>
    where
        H: ResourceHandler<Resource = R>,
    {
        assert!(
            size <= self.entry_capacity,
            "size {size} exceeds entry capacity {}",
            self.entry_capacity
        );
        if let Some(mut resource) = self.free.pop() {
            self.pooled.fetch_sub(self.entry_capacity, Ordering::Relaxed);
            handler.setup(&mut resource, size, false);
            return Ok(Some(resource));
        }
        if !may_create {
            return Ok(None);
        }
        let mut resource = handler.create(self.entry_capacity)?;
        handler.setup(&mut resource, size, true);
        Ok(Some(resource))
    }

    /// Returns `resource` to the free list, or destroys it when `may_pool` is
    /// false. Returns whether the resource was pooled.
    pub(crate) fn release<H>(&mut self, handler: &H, mut resource: R, may_pool: bool) -> bool
    where
        H: ResourceHandler<Resource = R>,
    {
        if !may_pool {
            handler.cleanup(&mut resource, true);
            handler.destroy(resource);
            return false;
        }
        handler.cleanup(&mut resource, false);
        self.free.push(resource);
        self.pooled.fetch_add(self.entry_capacity, Ordering::Relaxed);
        true
    }

    /// Destroys idle entries until at least `min_bytes_to_release` bytes have
    /// been released or the free list is empty. Returns the bytes released.
    ///
    /// The pooled counter is decremented before each destroy so a panicking
    /// handler cannot leave phantom pooled bytes behind.
    pub(crate) fn clear<H>(&mut self, handler: &H, min_bytes_to_release: u64) -> u64
    where
        H: ResourceHandler<Resource = R>,
    {
        let mut released = 0;
        while released < min_bytes_to_release {
            let Some(resource) = self.free.pop() else {
                break;
            };
            self.pooled.fetch_sub(self.entry_capacity, Ordering::Relaxed);
            released += handler.capacity_of(&resource);
            handler.destroy(resource);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Eq)]
    struct Chunk {
        id: u64,
        capacity: u64,
        size: u64,
    }

    /// Records lifecycle calls so tests can assert ordering.
    #[derive(Default)]
    struct RecordingHandler {
        next_id: AtomicU64,
        destroyed: Mutex<Vec<u64>>,
        setups: Mutex<Vec<(u64, bool)>>,
        cleanups: Mutex<Vec<(u64, bool)>>,
    }

    impl ResourceHandler for RecordingHandler {
        type Resource = Chunk;

        fn create(&self, capacity: u64) -> Result<Chunk, HandlerError> {
            Ok(Chunk {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                capacity,
                size: 0,
            })
        }

        fn destroy(&self, resource: Chunk) {
            self.destroyed.lock().unwrap().push(resource.id);
        }

        fn capacity_of(&self, resource: &Chunk) -> u64 {
            resource.capacity
        }

        fn setup(&self, resource: &mut Chunk, size: u64, after_create: bool) {
            resource.size = size;
            self.setups.lock().unwrap().push((resource.id, after_create));
        }

        fn cleanup(&self, resource: &mut Chunk, before_destroy: bool) {
            resource.size = 0;
            self.cleanups
                .lock()
                .unwrap()
                .push((resource.id, before_destroy));
        }
    }

    fn bucket(entry_capacity: u64) -> (Bucket<Chunk>, Arc<AtomicU64>) {
        let pooled = Arc::new(AtomicU64::new(0));
        (Bucket::new(entry_capacity, pooled.clone()), pooled)
    }

    #[test]
    fn test_acquire_creates_when_allowed() {
        let handler = RecordingHandler::default();
        let (mut bucket, pooled) = bucket(64);

        assert!(bucket.acquire(&handler, 10, false).unwrap().is_none());

        let chunk = bucket.acquire(&handler, 10, true).unwrap().unwrap();
        assert_eq!(chunk.capacity, 64);
        assert_eq!(chunk.size, 10);
        assert_eq!(*handler.setups.lock().unwrap(), vec![(chunk.id, true)]);
        assert_eq!(pooled.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_reuse_is_lifo() {
        let handler = RecordingHandler::default();
        let (mut bucket, pooled) = bucket(64);

        let a = bucket.acquire(&handler, 64, true).unwrap().unwrap();
        let b = bucket.acquire(&handler, 64, true).unwrap().unwrap();
        let (a_id, b_id) = (a.id, b.id);
        assert!(bucket.release(&handler, a, true));
        assert!(bucket.release(&handler, b, true));
        assert_eq!(pooled.load(Ordering::Relaxed), 128);

        // The most recently released resource comes back first.
        let first = bucket.acquire(&handler, 16, false).unwrap().unwrap();
        assert_eq!(first.id, b_id);
        assert_eq!(first.size, 16);
        let second = bucket.acquire(&handler, 16, false).unwrap().unwrap();
        assert_eq!(second.id, a_id);
        assert_eq!(pooled.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_release_without_pooling_destroys() {
        let handler = RecordingHandler::default();
        let (mut bucket, pooled) = bucket(64);

        let chunk = bucket.acquire(&handler, 64, true).unwrap().unwrap();
        let id = chunk.id;
        assert!(!bucket.release(&handler, chunk, false));
        assert_eq!(*handler.destroyed.lock().unwrap(), vec![id]);
        assert_eq!(*handler.cleanups.lock().unwrap(), vec![(id, true)]);
        assert_eq!(pooled.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_clear_stops_at_threshold() {
        let handler = RecordingHandler::default();
        let (mut bucket, pooled) = bucket(64);

        let x = bucket.acquire(&handler, 64, true).unwrap().unwrap();
        let y = bucket.acquire(&handler, 64, true).unwrap().unwrap();
        let z = bucket.acquire(&handler, 64, true).unwrap().unwrap();
        for chunk in [x, y, z] {
            let _ = bucket.release(&handler, chunk, true);
        }
        assert_eq!(pooled.load(Ordering::Relaxed), 192);

        // 100 bytes requested: two 64-byte entries cover it.
        assert_eq!(bucket.clear(&handler, 100), 128);
        assert_eq!(handler.destroyed.lock().unwrap().len(), 2);
        assert_eq!(pooled.load(Ordering::Relaxed), 64);

        // Zero bytes requested releases nothing.
        assert_eq!(bucket.clear(&handler, 0), 0);
        assert_eq!(pooled.load(Ordering::Relaxed), 64);

        // Draining past the remaining entries stops at an empty list.
        assert_eq!(bucket.clear(&handler, 1000), 64);
        assert_eq!(pooled.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "exceeds entry capacity")]
    fn test_acquire_rejects_oversized_request() {
        let handler = RecordingHandler::default();
        let (mut bucket, _) = bucket(64);
        let _ = bucket.acquire(&handler, 65, false);
    }
}
