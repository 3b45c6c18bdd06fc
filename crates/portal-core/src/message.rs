//! JSON envelopes published on the `data-portal` channel.

use serde::{Deserialize, Serialize};

/// A message on the portal channel, either a dataset load request or a
/// request to materialize one chunk of an already loaded dataset.
///
/// The externally tagged representation is the wire format:
/// `{"uri": {"path": …, "uuid": …}}` or
/// `{"chunk": {"uuid": …, "variable": …, "chunk": "i.j.k"}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PortalMessage {
    #[serde(rename = "uri")]
    Uri(LoadRequest),
    #[serde(rename = "chunk")]
    Chunk(ChunkRequest),
}

/// Ask a worker to open a dataset and derive its store metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Source uri of the dataset.
    pub path: String,
    /// Deterministic v5 uuid of `path`, also the cache key.
    pub uuid: String,
}

/// Ask a worker to encode one chunk of a loaded dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub uuid: String,
    pub variable: String,
    /// Dot-joined block indices, e.g. `0.0.3`.
    pub chunk: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_message_wire_format() {
        let msg = PortalMessage::Uri(LoadRequest {
            path: "/arch/tas.nc".to_string(),
            uuid: "deadbeef".to_string(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["uri"]["path"], "/arch/tas.nc");
        assert_eq!(json["uri"]["uuid"], "deadbeef");
    }

    #[test]
    fn test_chunk_message_round_trip() {
        let raw = r#"{"chunk":{"uuid":"u","variable":"tas","chunk":"0.1.2"}}"#;
        let msg: PortalMessage = serde_json::from_str(raw).unwrap();
        match &msg {
            PortalMessage::Chunk(req) => {
                assert_eq!(req.variable, "tas");
                assert_eq!(req.chunk, "0.1.2");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(serde_json::to_string(&msg).unwrap(), raw);
    }
}
