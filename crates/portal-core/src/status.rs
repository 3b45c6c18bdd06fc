//! Load-status records shared between HTTP replicas and load workers.
//!
//! The record is stored as JSON under the dataset uuid with a bounded TTL,
//! so a crashed worker leaves nothing behind that needs cleanup. No process
//! keeps an authoritative copy in memory; the cache is the only truth.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::zmeta::Zmetadata;

/// State of a submitted load job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    /// Finished successfully, metadata is available.
    Ok = 0,
    /// Finished with an error, `reason` explains why.
    Failed = 1,
    /// Submitted, no worker has picked it up yet.
    Waiting = 2,
    /// A worker is currently opening the dataset.
    InProgress = 3,
}

impl LoadState {
    /// Human readable form, used in status responses and error reasons.
    pub fn describe(self) -> &'static str {
        match self {
            LoadState::Ok => "finished, ok",
            LoadState::Failed => "finished, failed",
            LoadState::Waiting => "waiting",
            LoadState::InProgress => "processing",
        }
    }

    /// Whether the job still deserves polling.
    pub fn is_pending(self) -> bool {
        matches!(self, LoadState::Waiting | LoadState::InProgress)
    }
}

// The wire format keeps the original integer codes so records written by
// either side of the pipeline stay interchangeable.
impl From<LoadState> for u8 {
    fn from(state: LoadState) -> u8 {
        state as u8
    }
}

/// The self-describing record stored under the dataset uuid.
///
/// Invariants: `state == Ok` implies `meta` and `json_meta` are present;
/// `state == Failed` implies a non-empty `reason`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadStatus {
    /// Integer state code, see [`LoadState`].
    pub status: u8,
    /// Public url of the chunk store once finished.
    pub obj_url: String,
    /// Source path/uri of the dataset, so any worker can re-open it.
    pub path: String,
    /// Failure reason, empty unless `status == Failed`.
    pub reason: String,
    /// Consolidated store metadata.
    pub meta: Option<Zmetadata>,
    /// JSON rendition of `meta` as served under `.zmetadata`.
    pub json_meta: Option<Value>,
}

impl LoadStatus {
    /// Fresh record for a job that has just been queued.
    pub fn waiting(path: &str, obj_url: &str) -> Self {
        Self {
            status: LoadState::Waiting.into(),
            obj_url: obj_url.to_string(),
            path: path.to_string(),
            reason: String::new(),
            meta: None,
            json_meta: None,
        }
    }

    pub fn state(&self) -> LoadState {
        match self.status {
            0 => LoadState::Ok,
            1 => LoadState::Failed,
            3 => LoadState::InProgress,
            _ => LoadState::Waiting,
        }
    }

    pub fn set_state(&mut self, state: LoadState) {
        self.status = state.into();
    }

    /// Mark the record failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = LoadState::Failed.into();
        self.reason = reason.into();
        self.meta = None;
        self.json_meta = None;
    }

    /// Mark the record done and attach the derived metadata.
    pub fn finish(&mut self, meta: Zmetadata, json_meta: Value) {
        self.status = LoadState::Ok.into();
        self.reason = String::new();
        self.meta = Some(meta);
        self.json_meta = Some(json_meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for state in [
            LoadState::Ok,
            LoadState::Failed,
            LoadState::Waiting,
            LoadState::InProgress,
        ] {
            let mut status = LoadStatus::waiting("/p", "http://x/zarr/u.zarr");
            status.set_state(state);
            assert_eq!(status.state(), state);
        }
    }

    #[test]
    fn test_serialized_record_keeps_integer_codes() {
        let status = LoadStatus::waiting("/arch/tas.nc", "http://x/zarr/u.zarr");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], 2);
        assert_eq!(json["path"], "/arch/tas.nc");
        let back: LoadStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back.state(), LoadState::Waiting);
    }

    #[test]
    fn test_fail_clears_metadata() {
        let mut status = LoadStatus::waiting("/p", "");
        status.finish(Zmetadata::new(), serde_json::json!({}));
        assert_eq!(status.state(), LoadState::Ok);
        status.fail("no such file");
        assert_eq!(status.state(), LoadState::Failed);
        assert!(status.meta.is_none());
        assert_eq!(status.reason, "no such file");
    }
}
