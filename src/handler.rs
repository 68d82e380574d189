//! Pluggable lifecycle for pooled resources.

/// Failure produced by [ResourceHandler::create].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle operations the pool requires of a resource type.
///
/// The pool owns a single handler for its lifetime and invokes it from the
/// calling thread: [create](Self::create) runs outside the pool lock,
/// [destroy](Self::destroy) runs inside it when accounting demands (release
/// without pooling, reclamation, close). Implementations must not call back
/// into the pool.
pub trait ResourceHandler: Send + Sync {
    /// The pooled resource type.
    type Resource: Send;

    /// Produces a resource whose reported capacity is exactly `capacity`.
    ///
    /// May fail (e.g. the underlying allocator is out of memory); the pool
    /// reverts its accounting and surfaces the failure to the acquiring
    /// caller.
    fn create(&self, capacity: u64) -> Result<Self::Resource, HandlerError>;

    /// Releases the underlying storage. Irreversible.
    fn destroy(&self, resource: Self::Resource);

    /// Reports the capacity of `resource`. Must be stable for a given
    /// resource and equal to the `capacity` it was created with.
    fn capacity_of(&self, resource: &Self::Resource) -> u64;

    /// Prepares `resource` for a client requesting `size` bytes. Called once
    /// per acquire; `after_create` is true for freshly created resources and
    /// false for resources reused from a free list.
    fn setup(&self, resource: &mut Self::Resource, size: u64, after_create: bool) {
        let _ = (resource, size, after_create);
    }

    /// Called once per release; `before_destroy` is true when the pool will
    /// destroy the resource immediately afterwards.
    fn cleanup(&self, resource: &mut Self::Resource, before_destroy: bool) {
        let _ = (resource, before_destroy);
    }
}

// The pool takes its handler by value; sharing one handler between a pool and
// other observers works by handing the pool an Arc.
impl<H: ResourceHandler> ResourceHandler for std::sync::Arc<H> {
    type Resource = H::Resource;

    fn create(&self, capacity: u64) -> Result<Self::Resource, HandlerError> {
        (**self).create(capacity)
    }

    fn destroy(&self, resource: Self::Resource) {
        (**self).destroy(resource)
    }

    fn capacity_of(&self, resource: &Self::Resource) -> u64 {
        (**self).capacity_of(resource)
    }

    fn setup(&self, resource: &mut Self::Resource, size: u64, after_create: bool) {
        (**self).setup(resource, size, after_create)
    }

    fn cleanup(&self, resource: &mut Self::Resource, before_destroy: bool) {
        (**self).cleanup(resource, before_destroy)
    }
}
