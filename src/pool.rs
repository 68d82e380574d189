//! The lock-protected pool core: capacity accounting, size-class routing,
//! the blocking acquire protocol, release, reclamation, and close.

use crate::{
    bucket::Bucket,
    handler::ResourceHandler,
    metrics::Metrics,
    sizer::{suggest_factor, BucketSizer, Exponential},
    waiter::Wait,
    Error,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use prometheus_client::registry::Registry;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, trace};

/// Controls how an acquire widens its reservation to the canonical capacity
/// of its bucket.
///
/// A widened resource reports the bucket's entry capacity and is therefore
/// eligible for re-pooling on release; a non-widened resource is destroyed
/// when released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WideningPolicy {
    /// Widen only when `not_pooled + pooled` bytes already cover the
    /// canonical capacity; otherwise reserve exactly the (adjusted)
    /// requested size.
    #[default]
    UseAvailableCapacity,
    /// Always widen, even when the canonical capacity exceeds what is
    /// currently available and the caller must block for it.
    EnforcePoolableCapacity,
}

type AdjustFn = Box<dyn Fn(u64) -> u64 + Send + Sync>;
type GateFn<R> = Box<dyn Fn(&R, u64, u64) -> bool + Send + Sync>;

/// Outcome of the locked portion of an acquire.
enum Acquired<R> {
    /// Satisfied from a free list.
    Pooled(R),
    /// Capacity reserved; the resource is created after unlocking.
    Reserved,
}

/// State guarded by the pool mutex.
struct State<R> {
    /// Buckets sorted by descending index, so reclamation visits the largest
    /// capacities first.
    buckets: Vec<(u64, Bucket<R>)>,
    /// Bytes neither held by clients nor resident in a bucket.
    not_pooled: u64,
    /// Blocked acquirers in arrival order; only the head is ever signalled.
    waiters: VecDeque<Arc<Condvar>>,
    closed: bool,
}

/// Bounded, size-classed pool of fixed-capacity resources.
///
/// All mutating operations serialize on a single mutex; `acquire` parks on a
/// per-waiter condition variable while capacity is short, and resource
/// creation runs outside the lock. The pool is `Send + Sync` and is shared
/// across threads behind an `Arc`.
///
/// Dropping the pool closes it, destroying every pooled resource through the
/// handler.
pub struct Pool<H: ResourceHandler> {
    handler: H,
    sizer: Box<dyn BucketSizer>,
    total_capacity: u64,
    poolable_capacity: u64,
    widening: WideningPolicy,
    adjust: Option<AdjustFn>,
    gate: Option<GateFn<H::Resource>>,
    /// Sum of bytes resident in bucket free lists; shared with every bucket.
    pooled: Arc<AtomicU64>,
    state: Mutex<State<H::Resource>>,
    metrics: Metrics,
}

impl<H: ResourceHandler> Pool<H> {
    /// Starts building a pool with the given handler and hard capacity
    /// ceiling.
    pub fn builder(handler: H, total_capacity: u64) -> PoolBuilder<H> {
        PoolBuilder {
            handler,
            total_capacity,
            poolable_capacity: None,
            sizer: None,
            widening: WideningPolicy::default(),
            adjust: None,
            gate: None,
        }
    }

    /// Acquires a resource of at least `size` bytes, blocking without limit
    /// until enough capacity is available.
    pub fn acquire(&self, size: u64) -> Result<H::Resource, Error> {
        self.acquire_with(size, Wait::unlimited())
    }

    /// Acquires a resource of at least `size` bytes, waiting at most
    /// `max_wait` for capacity. Fails with [Error::Timeout] when the wait
    /// elapses first; no capacity is leaked on failure.
    pub fn acquire_timeout(&self, size: u64, max_wait: Duration) -> Result<H::Resource, Error> {
        self.acquire_with(size, Wait::bounded(max_wait))
    }

    fn acquire_with(&self, requested: u64, mut wait: Wait) -> Result<H::Resource, Error> {
        let original = requested;
        if requested > self.total_capacity {
            return Err(Error::InvalidArgument(format!(
                "requested {requested} bytes exceeds total pool capacity {}",
                self.total_capacity
            )));
        }
        let mut size = match &self.adjust {
            Some(adjust) => adjust(requested),
            None => requested,
        };
        if size < original {
            return Err(Error::InvalidArgument(format!(
                "adjusted allocation size {size} is less than the requested size {original}"
            )));
        }
        if size > self.total_capacity {
            return Err(Error::InvalidArgument(format!(
                "adjusted allocation size {size} (requested {original}) exceeds total pool \
                 capacity {}",
                self.total_capacity
            )));
        }

        let mut guard = self.state.lock();
        if guard.closed {
            return Err(Error::Closed);
        }

        let index = self.sizer.size_to_index(size);
        let position = Self::bucket_position(
            &mut guard,
            index,
            self.sizer.index_to_capacity(index),
            &self.pooled,
        );
        // At least the adjusted size, by the sizer round-trip invariant.
        let entry_capacity = guard.buckets[position].1.entry_capacity();

        let result =
            self.acquire_locked(&mut guard, index, original, &mut size, entry_capacity, &mut wait);
        self.update_gauges(&guard);
        self.signal_first_waiter(&mut guard, false);
        drop(guard);

        let acquired = match result {
            Ok(acquired) => acquired,
            Err(error) => {
                if matches!(error, Error::Timeout) {
                    self.metrics.timeouts.inc();
                }
                return Err(error);
            }
        };

        let resource = match acquired {
            Acquired::Pooled(resource) => resource,
            Acquired::Reserved => {
                // Create outside the lock; creation may block on the OS but
                // never on pool state.
                match self.handler.create(size) {
                    Ok(mut resource) => {
                        trace!(size, original, "created resource");
                        self.handler.setup(&mut resource, original, true);
                        self.metrics.creates.inc();
                        resource
                    }
                    Err(error) => {
                        // Return the reservation and let the next waiter run.
                        debug!(size, "resource creation failed");
                        let mut guard = self.state.lock();
                        guard.not_pooled += size;
                        self.update_gauges(&guard);
                        self.signal_first_waiter(&mut guard, true);
                        drop(guard);
                        return Err(Error::Handler(error));
                    }
                }
            }
        };
        self.metrics.acquires.inc();
        Ok(resource)
    }

    /// The portion of an acquire that runs under the pool lock: the free-list
    /// fast path, accounting, and the blocking loop.
    ///
    /// `size` is widened in place to the bucket's entry capacity when the
    /// widening policy admits it.
    fn acquire_locked(
        &self,
        guard: &mut MutexGuard<'_, State<H::Resource>>,
        index: u64,
        original: u64,
        size: &mut u64,
        entry_capacity: u64,
        wait: &mut Wait,
    ) -> Result<Acquired<H::Resource>, Error> {
        // Fast path: an idle resource of the right class.
        let position = Self::find_bucket(guard, index);
        if let Some(resource) = guard.buckets[position]
            .1
            .acquire(&self.handler, original, false)
            .map_err(Error::Handler)?
        {
            trace!(size = original, entry_capacity, "acquire satisfied from free list");
            return Ok(Acquired::Pooled(resource));
        }

        let available = guard.not_pooled + self.pooled.load(Ordering::Relaxed);
        if available >= entry_capacity || self.widening == WideningPolicy::EnforcePoolableCapacity {
            // Reserve the canonical size so the resource can pool on release.
            *size = entry_capacity;
        }
        if available >= *size {
            // Enough unreserved or pooled bytes to satisfy the request now;
            // evict pooled entries as needed and take the reservation.
            self.reclaim_locked(guard, *size);
            guard.not_pooled -= *size;
            return Ok(Acquired::Reserved);
        }

        // Out of capacity: join the waiter queue and accumulate bytes as
        // releases and reclamations free them up.
        debug!(size = *size, available, "waiting for pool capacity");
        let cv = Arc::new(Condvar::new());
        guard.waiters.push_back(cv.clone());
        self.metrics.waiters.inc();

        let mut accumulated: u64 = 0;
        let outcome = loop {
            wait.await_next(&cv, guard);
            if guard.closed {
                break Err(Error::Closed);
            }
            if let Err(error) = wait.check_time_elapsed() {
                break Err(error);
            }

            // A release may have re-pooled a matching resource; only worth
            // checking before any bytes were reserved.
            if accumulated == 0 {
                let position = Self::find_bucket(guard, index);
                match guard.buckets[position]
                    .1
                    .acquire(&self.handler, original, false)
                {
                    Ok(Some(resource)) => break Ok(Some(resource)),
                    Ok(None) => {}
                    Err(error) => break Err(Error::Handler(error)),
                }
            }

            let shortfall = *size - accumulated;
            self.reclaim_locked(guard, shortfall);
            let got = shortfall.min(guard.not_pooled);
            guard.not_pooled -= got;
            accumulated += got;
            if accumulated >= *size {
                break Ok(None);
            }
        };

        // Leave the queue; failed exits hand back whatever was reserved.
        if outcome.is_err() {
            guard.not_pooled += accumulated;
        }
        guard.waiters.retain(|waiter| !Arc::ptr_eq(waiter, &cv));
        self.metrics.waiters.dec();

        match outcome? {
            Some(resource) => Ok(Acquired::Pooled(resource)),
            None => Ok(Acquired::Reserved),
        }
    }

    /// Returns `resource` to the pool. It is re-pooled when its capacity is
    /// the canonical capacity of its class, the pool is open, and the pooling
    /// gate admits it; otherwise it is destroyed and its bytes return to the
    /// free reservoir. The head waiter is signalled either way.
    pub fn release(&self, resource: H::Resource) {
        let capacity = self.handler.capacity_of(&resource);
        let mut guard = self.state.lock();

        let index = self.sizer.size_to_index(capacity);
        let entry_capacity = self.sizer.index_to_capacity(index);
        if capacity == entry_capacity {
            let may_pool = !guard.closed && self.may_pool(&resource, capacity);
            let position = Self::bucket_position(&mut guard, index, entry_capacity, &self.pooled);
            if !guard.buckets[position]
                .1
                .release(&self.handler, resource, may_pool)
            {
                guard.not_pooled += capacity;
            }
        } else {
            // Off-class capacity (an unwidened allocation): never pooled.
            let mut resource = resource;
            self.handler.cleanup(&mut resource, true);
            self.handler.destroy(resource);
            guard.not_pooled += capacity;
        }

        self.metrics.releases.inc();
        self.update_gauges(&guard);
        self.signal_first_waiter(&mut guard, true);
    }

    /// Destroys pooled entries, largest capacities first, until at least
    /// `bytes_to_release` bytes have moved back to the free reservoir or no
    /// pooled entries remain. Returns the bytes actually released.
    pub fn reclaim(&self, bytes_to_release: u64) -> u64 {
        if bytes_to_release == 0 {
            return 0;
        }
        let mut guard = self.state.lock();
        let mut released = 0;
        {
            let State {
                buckets,
                not_pooled,
                ..
            } = &mut *guard;
            for (_, bucket) in buckets.iter_mut() {
                if released >= bytes_to_release {
                    break;
                }
                let delta = bucket.clear(&self.handler, bytes_to_release - released);
                *not_pooled += delta;
                released += delta;
            }
        }
        if released > 0 {
            debug!(released, "reclaimed pooled bytes");
            self.metrics.reclaimed_bytes.inc_by(released);
            self.update_gauges(&guard);
            self.signal_first_waiter(&mut guard, true);
        }
        released
    }

    /// Closes the pool. Pending and future acquires fail with
    /// [Error::Closed], every pooled entry is destroyed, and in-flight
    /// resources may still be released afterwards (their bytes return to the
    /// reservoir without re-pooling). Idempotent.
    pub fn close(&self) {
        let mut guard = self.state.lock();
        if guard.closed {
            return;
        }
        guard.closed = true;
        for waiter in &guard.waiters {
            waiter.notify_one();
        }
        {
            let State {
                buckets,
                not_pooled,
                ..
            } = &mut *guard;
            for (_, bucket) in buckets.iter_mut() {
                *not_pooled += bucket.clear(&self.handler, self.total_capacity);
            }
            buckets.clear();
        }
        debug!("pool closed");
        self.update_gauges(&guard);
    }

    /// The total free capacity: unreserved bytes plus bytes reclaimable from
    /// free lists.
    pub fn available_capacity(&self) -> u64 {
        let guard = self.state.lock();
        guard.not_pooled + self.pooled.load(Ordering::Relaxed)
    }

    /// Bytes neither held by clients nor resident in a bucket.
    pub fn unused_capacity(&self) -> u64 {
        self.state.lock().not_pooled
    }

    /// Bytes currently resident in bucket free lists.
    pub fn pooled_bytes(&self) -> u64 {
        self.pooled.load(Ordering::Relaxed)
    }

    /// The number of threads blocked waiting for capacity.
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// The hard ceiling on in-use + pooled + unreserved bytes.
    pub const fn total_capacity(&self) -> u64 {
        self.total_capacity
    }

    /// The ceiling on bytes resident in free lists.
    pub const fn poolable_capacity(&self) -> u64 {
        self.poolable_capacity
    }

    /// Registers the pool's metrics into `registry`.
    pub fn register_metrics(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// Finds the bucket for `index`, inserting an empty one at its sorted
    /// (descending) position when absent. Returns its position.
    fn bucket_position(
        state: &mut State<H::Resource>,
        index: u64,
        entry_capacity: u64,
        pooled: &Arc<AtomicU64>,
    ) -> usize {
        match state.buckets.binary_search_by(|(i, _)| index.cmp(i)) {
            Ok(position) => position,
            Err(position) => {
                state
                    .buckets
                    .insert(position, (index, Bucket::new(entry_capacity, pooled.clone())));
                position
            }
        }
    }

    /// Finds the position of an existing bucket. Positions shift while the
    /// lock is released during waits, so they are re-resolved after every
    /// wake-up.
    fn find_bucket(state: &State<H::Resource>, index: u64) -> usize {
        state
            .buckets
            .binary_search_by(|(i, _)| index.cmp(i))
            .expect("bucket exists for routed index")
    }

    /// Ensures `not_pooled >= required` by destroying pooled entries, largest
    /// capacities first, while any remain.
    fn reclaim_locked(&self, state: &mut State<H::Resource>, required: u64) {
        if state.not_pooled >= required {
            return;
        }
        let State {
            buckets,
            not_pooled,
            ..
        } = state;
        let mut released = 0;
        for (_, bucket) in buckets.iter_mut() {
            if *not_pooled >= required {
                break;
            }
            let delta = bucket.clear(&self.handler, required - *not_pooled);
            *not_pooled += delta;
            released += delta;
        }
        if released > 0 {
            self.metrics.reclaimed_bytes.inc_by(released);
        }
    }

    /// Wakes the head waiter. Non-forced signals are suppressed unless some
    /// capacity is actually free for the waiter to take.
    fn signal_first_waiter(&self, state: &mut State<H::Resource>, force: bool) {
        let Some(head) = state.waiters.front() else {
            return;
        };
        if force || state.not_pooled > 0 || self.pooled.load(Ordering::Relaxed) > 0 {
            head.notify_one();
        }
    }

    fn may_pool(&self, resource: &H::Resource, capacity: u64) -> bool {
        let pooled = self.pooled.load(Ordering::Relaxed);
        match &self.gate {
            Some(gate) => gate(resource, capacity, pooled),
            None => pooled + capacity <= self.poolable_capacity,
        }
    }

    fn update_gauges(&self, state: &State<H::Resource>) {
        self.metrics
            .pooled_bytes
            .set(self.pooled.load(Ordering::Relaxed) as i64);
        self.metrics.unused_capacity.set(state.not_pooled as i64);
    }
}

impl<H: ResourceHandler> Drop for Pool<H> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<H: ResourceHandler> fmt::Debug for Pool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pool")
            .field("total_capacity", &self.total_capacity)
            .field("poolable_capacity", &self.poolable_capacity)
            .field(
                "available_capacity",
                &(state.not_pooled + self.pooled.load(Ordering::Relaxed)),
            )
            .field("pooled_bytes", &self.pooled.load(Ordering::Relaxed))
            .field("queued", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Configures and constructs a [Pool].
pub struct PoolBuilder<H: ResourceHandler> {
    handler: H,
    total_capacity: u64,
    poolable_capacity: Option<u64>,
    sizer: Option<Box<dyn BucketSizer>>,
    widening: WideningPolicy,
    adjust: Option<AdjustFn>,
    gate: Option<GateFn<H::Resource>>,
}

impl<H: ResourceHandler> PoolBuilder<H> {
    /// Sets the ceiling on bytes resident in free lists. Defaults to the
    /// total capacity.
    pub fn poolable_capacity(mut self, poolable_capacity: u64) -> Self {
        self.poolable_capacity = Some(poolable_capacity);
        self
    }

    /// Sets the size-class strategy. Defaults to an exponential sizer whose
    /// factor spans the poolable capacity in 32 steps (256 above 1 MiB),
    /// aligned to 64 bytes.
    pub fn bucket_sizer(mut self, sizer: impl BucketSizer + 'static) -> Self {
        self.sizer = Some(Box::new(sizer));
        self
    }

    /// Sets the reservation-widening policy.
    pub fn widening(mut self, widening: WideningPolicy) -> Self {
        self.widening = widening;
        self
    }

    /// Overrides the allocation-size adjustment applied to every request
    /// before routing (identity by default). The adjusted size must not be
    /// smaller than the requested size; a violating adjuster fails the
    /// acquire with [Error::InvalidArgument].
    pub fn allocation_adjuster(
        mut self,
        adjust: impl Fn(u64) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.adjust = Some(Box::new(adjust));
        self
    }

    /// Overrides the test deciding whether a released resource may be pooled.
    /// Receives the resource, its capacity, and the bytes currently pooled;
    /// the default admits the resource while `pooled + capacity` stays within
    /// the poolable ceiling.
    pub fn pooling_gate(
        mut self,
        gate: impl Fn(&H::Resource, u64, u64) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.gate = Some(Box::new(gate));
        self
    }

    /// Builds the pool.
    ///
    /// # Panics
    ///
    /// Panics if `total_capacity` is zero or `poolable_capacity` exceeds it.
    pub fn build(self) -> Pool<H> {
        assert!(
            self.total_capacity > 0,
            "total_capacity must be greater than zero"
        );
        let poolable_capacity = self.poolable_capacity.unwrap_or(self.total_capacity);
        assert!(
            poolable_capacity <= self.total_capacity,
            "poolable_capacity ({poolable_capacity}) exceeds total_capacity ({})",
            self.total_capacity
        );
        let sizer = self
            .sizer
            .unwrap_or_else(|| default_sizer(poolable_capacity));

        Pool {
            handler: self.handler,
            sizer,
            total_capacity: self.total_capacity,
            poolable_capacity,
            widening: self.widening,
            adjust: self.adjust,
            gate: self.gate,
            pooled: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(State {
                buckets: Vec::new(),
                not_pooled: self.total_capacity,
                waiters: VecDeque::new(),
                closed: false,
            }),
            metrics: Metrics::default(),
        }
    }
}

/// The sizer used when none is configured: exponential with a factor spanning
/// the poolable capacity in a fixed number of steps, aligned to 64 bytes.
fn default_sizer(poolable_capacity: u64) -> Box<dyn BucketSizer> {
    let steps = if poolable_capacity <= 1 << 20 { 32 } else { 256 };
    let factor = suggest_factor(poolable_capacity, steps, 2.0);
    Box::new(Exponential::new(factor).with_alignment(64))
}
