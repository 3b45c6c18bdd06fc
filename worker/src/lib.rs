//! data-portal-worker — turns remote datasets into chunk-store entries.
//!
//! Workers subscribe to the portal channel, open datasets behind the
//! pluggable [`backends`] seam, derive consolidated store metadata and
//! encode chunks on demand into the shared cache.

pub mod aggregator;
pub mod backends;
pub mod codec;
pub mod dataset;
pub mod error;
pub mod queue;
pub mod zmeta;

pub use error::WorkerError;
pub use queue::ProcessQueue;
