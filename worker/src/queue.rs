//! The worker's consume loop.
//!
//! Subscribes to the portal channel and processes load and chunk requests.
//! All coordination with HTTP replicas and other workers happens through
//! status records and chunk bytes in the shared cache; the opened dataset
//! handle itself stays worker-local and is re-materialized from the
//! recorded source path when a chunk request lands on a different worker.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use data_portal_core::{
    chunk_key, ChunkRequest, LoadRequest, LoadState, LoadStatus, PortalMessage, CHUNK_TTL,
    PORTAL_CHANNEL,
};

use crate::aggregator::load_and_aggregate;
use crate::codec::{encode_chunk, pad_block};
use crate::dataset::Dataset;
use crate::error::WorkerError;
use crate::zmeta::create_zmetadata;

pub struct ProcessQueue {
    redis_url: String,
    cache_exp: u64,
    proxy: String,
    local: Mutex<HashMap<String, Arc<Dataset>>>,
}

impl ProcessQueue {
    pub fn new(redis_url: String, cache_exp: u64, proxy: String) -> Self {
        Self {
            redis_url,
            cache_exp,
            proxy,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the portal channel and process messages until the
    /// connection drops.
    pub async fn run_forever(&self) -> Result<(), WorkerError> {
        info!("starting data-loading daemon");
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = ConnectionManager::new(client.clone()).await?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(PORTAL_CHANNEL).await?;
        info!(channel = PORTAL_CHANNEL, "broker will listen for messages now");
        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: Vec<u8> = match message.get_payload() {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(error = %error, "could not read message payload");
                    continue;
                }
            };
            match serde_json::from_slice::<PortalMessage>(&payload) {
                Ok(PortalMessage::Uri(request)) => self.load_dataset(&mut conn, request).await,
                Ok(PortalMessage::Chunk(request)) => self.load_chunk(&mut conn, request).await,
                Err(_) => warn!("could not decode message"),
            }
        }
        Ok(())
    }

    async fn read_status(
        &self,
        conn: &mut ConnectionManager,
        uuid: &str,
    ) -> Option<LoadStatus> {
        let raw: Option<Vec<u8>> = conn.get(uuid).await.ok().flatten();
        raw.and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    async fn write_status(&self, conn: &mut ConnectionManager, uuid: &str, status: &LoadStatus) {
        let payload = match serde_json::to_vec(status) {
            Ok(payload) => payload,
            Err(error) => {
                error!(error = %error, "could not serialize status record");
                return;
            }
        };
        if let Err(error) = conn
            .set_ex::<_, _, ()>(uuid, payload, self.cache_exp)
            .await
        {
            error!(error = %error, "could not persist status record");
        }
    }

    /// Open a dataset and persist its store metadata.
    async fn load_dataset(&self, conn: &mut ConnectionManager, request: LoadRequest) {
        debug!(path = request.path.as_str(), uuid = request.uuid.as_str(), "load request");
        let obj_url = format!(
            "{}/api/freva-nextgen/data-portal/zarr/{}.zarr",
            self.proxy, request.uuid
        );
        let mut status = match self.read_status(conn, &request.uuid).await {
            Some(status) if !matches!(status.state(), LoadState::Waiting | LoadState::Failed) => {
                debug!(uuid = request.uuid.as_str(), "load already handled");
                return;
            }
            Some(status) => status,
            None => LoadStatus::waiting(&request.path, &obj_url),
        };
        status.set_state(LoadState::InProgress);
        self.write_status(conn, &request.uuid, &status).await;

        let path = request.path.clone();
        let opened = tokio::task::spawn_blocking(move || open_with_aggregation(&path)).await;
        match opened {
            Ok(Ok(dataset)) => match create_zmetadata(&dataset) {
                Ok((meta, json_meta)) => {
                    status.finish(meta, json_meta);
                    self.local
                        .lock()
                        .await
                        .insert(request.uuid.clone(), Arc::new(dataset));
                }
                Err(error) => {
                    error!(uuid = request.uuid.as_str(), error = %error, "could not process dataset");
                    status.fail(error.to_string());
                }
            },
            Ok(Err(error)) => {
                error!(uuid = request.uuid.as_str(), error = %error, "could not process dataset");
                status.fail(error.to_string());
            }
            Err(error) => {
                error!(uuid = request.uuid.as_str(), error = %error, "load task panicked");
                status.fail("internal error while opening the dataset".to_string());
            }
        }
        self.write_status(conn, &request.uuid, &status).await;
    }

    /// The worker-local dataset handle, re-materialized when this worker
    /// did not perform the original load.
    async fn dataset_handle(
        &self,
        conn: &mut ConnectionManager,
        uuid: &str,
    ) -> Result<Arc<Dataset>, WorkerError> {
        if let Some(dataset) = self.local.lock().await.get(uuid) {
            return Ok(dataset.clone());
        }
        let status = self
            .read_status(conn, uuid)
            .await
            .ok_or_else(|| WorkerError::InvalidDataset(format!("{uuid} not in cache")))?;
        let path = status.path.clone();
        let dataset = tokio::task::spawn_blocking(move || open_with_aggregation(&path))
            .await
            .map_err(|_| WorkerError::InvalidDataset("load task panicked".to_string()))??;
        let dataset = Arc::new(dataset);
        self.local
            .lock()
            .await
            .insert(uuid.to_string(), dataset.clone());
        Ok(dataset)
    }

    /// Materialize one chunk: extract, pad, filter, compress, cache.
    async fn load_chunk(&self, conn: &mut ConnectionManager, request: ChunkRequest) {
        debug!(
            uuid = request.uuid.as_str(),
            variable = request.variable.as_str(),
            chunk = request.chunk.as_str(),
            "chunk request"
        );
        let result = self.encode_requested_chunk(conn, &request).await;
        match result {
            Ok(bytes) => {
                let key = chunk_key(&request.uuid, &request.variable, &request.chunk);
                if let Err(error) = conn.set_ex::<_, _, ()>(&key, bytes, CHUNK_TTL).await {
                    error!(key = key.as_str(), error = %error, "could not cache chunk");
                }
            }
            Err(error) => {
                warn!(
                    uuid = request.uuid.as_str(),
                    variable = request.variable.as_str(),
                    chunk = request.chunk.as_str(),
                    error = %error,
                    "could not materialize chunk"
                );
            }
        }
    }

    async fn encode_requested_chunk(
        &self,
        conn: &mut ConnectionManager,
        request: &ChunkRequest,
    ) -> Result<Vec<u8>, WorkerError> {
        let dataset = self.dataset_handle(conn, &request.uuid).await?;
        let variable = dataset
            .variables
            .get(&request.variable)
            .ok_or_else(|| WorkerError::UnknownVariable(request.variable.clone()))?;
        let indices: Vec<u64> = request
            .chunk
            .split('.')
            .map(|part| {
                part.parse()
                    .map_err(|_| WorkerError::InvalidChunk(request.chunk.clone()))
            })
            .collect::<Result<_, _>>()?;
        variable.block_extent(&indices)?;
        let block = variable.data.read_block(&indices)?;
        let fill = variable.dtype.encode_fill_value(variable.fill_value);
        let padded = pad_block(block, &variable.chunks, variable.dtype, &fill);
        let compressor = variable
            .compressor
            .clone()
            .or_else(|| Some(data_portal_core::zmeta::default_compressor()));
        encode_chunk(padded, variable.filters.as_deref(), compressor.as_ref())
    }
}

/// Open one uri; a comma-separated uri is a multi-file dataset whose
/// members are loaded on a bounded pool and aggregated.
fn open_with_aggregation(path: &str) -> Result<Dataset, WorkerError> {
    let members: Vec<String> = path
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    match members.len() {
        0 => Err(WorkerError::InvalidDataset("empty dataset path".to_string())),
        1 => crate::backends::open_dataset(&members[0]),
        _ => load_and_aggregate(&members),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_member_paths_split() {
        let err = open_with_aggregation(" ,  ").unwrap_err();
        assert!(matches!(err, WorkerError::InvalidDataset(_)));
    }
}
