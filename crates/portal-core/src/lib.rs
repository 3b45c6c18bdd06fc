//! Shared vocabulary of the data-portal pipeline.
//!
//! The HTTP front-end and the load workers only ever meet through two
//! channels: JSON messages on the `data-portal` pub/sub channel and records
//! in the shared cache. Everything that crosses those two boundaries lives
//! here so both sides agree on the wire format.

pub mod dtype;
pub mod message;
pub mod status;
pub mod zmeta;

pub use dtype::Dtype;
pub use message::{ChunkRequest, LoadRequest, PortalMessage};
pub use status::{LoadState, LoadStatus};
pub use zmeta::{Codec, ZArray, Zmetadata};

use uuid::Uuid;

/// Pub/sub channel both sides listen/publish on.
pub const PORTAL_CHANNEL: &str = "data-portal";

/// Default time-to-live of a load-status record in the cache (seconds).
pub const STATUS_TTL: u64 = 3600;

/// Time-to-live of an encoded chunk in the cache (seconds).
pub const CHUNK_TTL: u64 = 360;

/// Deterministic dataset id: the same uri always maps to the same store.
pub fn dataset_uuid(uri: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, uri.as_bytes())
}

/// Cache key of one encoded chunk, `<uuid>-<variable>-<i.j.k>`.
pub fn chunk_key(uuid: &str, variable: &str, chunk: &str) -> String {
    format!("{uuid}-{variable}-{chunk}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_uuid_is_deterministic() {
        let a = dataset_uuid("/arch/model/tas_day.nc");
        let b = dataset_uuid("/arch/model/tas_day.nc");
        assert_eq!(a, b);
        assert_ne!(a, dataset_uuid("/arch/model/pr_day.nc"));
    }

    #[test]
    fn test_chunk_key_layout() {
        assert_eq!(chunk_key("abc", "tas", "0.1.2"), "abc-tas-0.1.2");
    }
}
