//! Bounded, size-classed pooling of fixed-capacity memory resources.
//!
//! A [Pool] hands out resources (typically aligned byte buffers) of at least a
//! requested size. Retired resources are kept on per-size-class free lists and
//! reused for later requests of the same class; new resources are only created
//! while the sum of in-use, pooled, and unreserved bytes stays under a hard
//! `total_capacity` ceiling. When the ceiling is reached, [Pool::acquire]
//! blocks the calling thread until enough capacity is released or reclaimed,
//! waking blocked callers in FIFO order.
//!
//! # Size Classes
//!
//! Requested sizes are mapped to dense bucket indexes by a [BucketSizer]: a
//! linear strategy (`capacity = index * m`), an exponential strategy
//! (`capacity = f^index`), and decorators that set a minimum capacity for
//! bucket 0 or align capacities upward. Every resource routed to a bucket has
//! that bucket's canonical capacity, so a released resource can serve any
//! later request in the same class.
//!
//! # Resource Lifecycle
//!
//! The pool is polymorphic over a [ResourceHandler] that creates, destroys,
//! measures, and prepares resources. [buffer::AlignedBufferHandler] is a
//! ready-made handler pooling alignment-constrained heap buffers; custom
//! handlers can pool any owned type whose capacity is fixed at creation.
//!
//! # Example
//!
//! ```
//! use respool::{buffer::AlignedBufferHandler, sizer::Linear, Pool};
//!
//! let pool = Pool::builder(AlignedBufferHandler::new(64), 1 << 20)
//!     .bucket_sizer(Linear::new(4096))
//!     .build();
//!
//! let buffer = pool.acquire(1000).unwrap();
//! assert!(buffer.capacity() >= 1000);
//! assert_eq!(buffer.len(), 1000);
//!
//! // Returning the buffer makes its bytes available to later acquires.
//! pool.release(buffer);
//! assert_eq!(pool.available_capacity(), 1 << 20);
//! ```

pub mod buffer;
pub mod sizer;

mod bucket;
mod handler;
mod metrics;
mod pool;
mod waiter;

pub use handler::{HandlerError, ResourceHandler};
pub use pool::{Pool, PoolBuilder, WideningPolicy};
pub use sizer::BucketSizer;

use thiserror::Error;

/// Errors surfaced by [Pool] operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied size or hook result is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The pool was closed before or during the operation.
    #[error("pool is closed")]
    Closed,
    /// A bounded wait elapsed before enough capacity was reserved.
    #[error("wait time elapsed waiting for free pool capacity")]
    Timeout,
    /// The resource handler failed to create a resource. Pool accounting has
    /// already been reverted when this is returned.
    #[error("resource creation failed: {0}")]
    Handler(#[source] HandlerError),
}
