//! Document-store access: search analytics and the user-data replica.
//!
//! The index stays authoritative for search membership; these collections
//! only serve analytics and listings. Every write here is best effort:
//! failures are logged, counted where needed, and never fail a request.
//! A broken connection is power-cycled lazily on the next use.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::{doc, Bson, DateTime, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;

const SEARCH_COLLECTION: &str = "search_queries";
const USERDATA_COLLECTION: &str = "user_data";

#[derive(Clone, Debug)]
pub struct Mongo {
    config: Arc<ServerConfig>,
    client: Arc<Mutex<Option<Client>>>,
}

impl Mongo {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config, client: Arc::new(Mutex::new(None)) }
    }

    async fn client(&self) -> Result<Client, ApiError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let mut options = ClientOptions::parse(self.config.mongo_url())
            .await
            .map_err(|error| {
                warn!(error = %error, "could not parse document store url");
                ApiError::Unavailable("Could not connect to the document store".to_string())
            })?;
        options.server_selection_timeout = Some(Duration::from_secs(5));
        let client = Client::with_options(options).map_err(|error| {
            warn!(error = %error, "could not create document store client");
            ApiError::Unavailable("Could not connect to the document store".to_string())
        })?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached client so the next use reconnects.
    pub async fn power_cycle(&self) {
        *self.client.lock().await = None;
    }

    async fn collection(&self, name: &str) -> Result<Collection<Document>, ApiError> {
        Ok(self
            .client()
            .await?
            .database(&self.config.mongo_db)
            .collection(name))
    }

    /// Append one search to the analytics collection.
    ///
    /// Called detached from the request path; zero-result searches are not
    /// recorded and every failure is swallowed after a log line.
    pub async fn record_search(
        &self,
        num_results: u64,
        server_status: u16,
        flavour: &str,
        uniq_key: &str,
        facets: &BTreeMap<String, Vec<String>>,
    ) {
        if num_results == 0 {
            return;
        }
        let query: Document = facets
            .iter()
            .map(|(k, v)| (k.clone(), Bson::String(v.join("&"))))
            .collect();
        let entry = doc! {
            "metadata": {
                "num_results": num_results as i64,
                "flavour": flavour,
                "uniq_key": uniq_key,
                "server_status": server_status as i32,
                "date": DateTime::now(),
            },
            "query": query,
        };
        let result = match self.collection(SEARCH_COLLECTION).await {
            Ok(collection) => collection.insert_one(entry).await.map(|_| ()).map_err(
                |error| ApiError::Internal(error.to_string()),
            ),
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            warn!(error = %error, "could not add search stats to the document store");
            self.power_cycle().await;
        }
    }

    /// Upsert one ingest batch, keyed on `(file, uri)`.
    ///
    /// Returns the number of records written; single-document failures are
    /// logged and skipped.
    pub async fn upsert_userdata(&self, batch: &[BTreeMap<String, Value>]) -> usize {
        let collection = match self.collection(USERDATA_COLLECTION).await {
            Ok(collection) => collection,
            Err(error) => {
                warn!(error = %error, "could not reach the document store");
                return 0;
            }
        };
        let mut written = 0;
        for record in batch {
            let filter = doc! {
                "file": record.get("file").and_then(Value::as_str).unwrap_or_default(),
                "uri": record.get("uri").and_then(Value::as_str).unwrap_or_default(),
            };
            let update = match mongodb::bson::to_document(record) {
                Ok(document) => doc! { "$set": document },
                Err(error) => {
                    warn!(error = %error, "skipping record the document store cannot encode");
                    continue;
                }
            };
            match collection.update_one(filter, update).upsert(true).await {
                Ok(_) => written += 1,
                Err(error) => {
                    warn!(error = %error, "could not upsert metadata");
                    self.power_cycle().await;
                }
            }
        }
        info!(written = written, "updated user-data replica");
        written
    }

    /// Delete user-data replica entries matching the search keys.
    ///
    /// Values are lowercased except for `file`, mirroring how the records
    /// were normalized at ingest time.
    pub async fn delete_userdata(&self, search_keys: &BTreeMap<String, String>) {
        let query: Document = search_keys
            .iter()
            .map(|(key, value)| {
                let value = if key.to_lowercase() == "file" {
                    value.clone()
                } else {
                    value.to_lowercase()
                };
                (key.clone(), Bson::String(value))
            })
            .collect();
        match self.collection(USERDATA_COLLECTION).await {
            Ok(collection) => {
                if let Err(error) = collection.delete_many(query.clone()).await {
                    warn!(error = %error, "could not remove metadata");
                    self.power_cycle().await;
                } else {
                    info!(query = %query, "deleted user-data replica entries");
                }
            }
            Err(error) => warn!(error = %error, "could not remove metadata"),
        }
    }
}
