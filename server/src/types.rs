//! Shared server state and small vocabulary types.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::auth::SafeAuth;
use crate::cache::Cache;
use crate::config::ServerConfig;
use crate::flavour::FACET_HIERARCHY;
use crate::mongo::Mongo;

/// Timeout for every call against the search index.
pub const SOLR_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows fetched per cursor page and records written per ingest batch.
pub const BATCH_SIZE: usize = 150;

/// The per-record identifier type a caller wants back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniqKey {
    File,
    Uri,
}

impl UniqKey {
    pub fn as_str(self) -> &'static str {
        match self {
            UniqKey::File => "file",
            UniqKey::Uri => "uri",
        }
    }
}

impl fmt::Display for UniqKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UniqKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(UniqKey::File),
            "uri" => Ok(UniqKey::Uri),
            other => Err(format!("unknown uniq key: {other}")),
        }
    }
}

/// Application state handed to every handler.
///
/// The mongo client and the cache handle are process-wide singletons that
/// initialize lazily and never cache a failed init beyond the current
/// request.
#[derive(Clone, Debug)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub http: reqwest::Client,
    pub mongo: Mongo,
    pub cache: Cache,
    pub auth: Arc<SafeAuth>,
    solr_fields: Arc<OnceCell<Vec<String>>>,
}

impl AppContext {
    pub fn new(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let http = reqwest::Client::builder()
            .timeout(SOLR_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            mongo: Mongo::new(config.clone()),
            cache: Cache::new(config.clone()),
            auth: Arc::new(SafeAuth::new(config.oidc_discovery_url.clone(), http.clone())),
            solr_fields: Arc::new(OnceCell::new()),
            config,
            http,
        }
    }

    /// Facet fields used for faceting and catalog columns.
    ///
    /// Fetched once from the index schema (fields of the generic facet
    /// types, minus the file name fields); the canonical vocabulary serves
    /// as fallback so the server works without a reachable backend.
    pub async fn solr_fields(&self) -> Vec<String> {
        self.solr_fields
            .get_or_init(|| async {
                match self.fetch_schema_fields().await {
                    Ok(fields) if !fields.is_empty() => fields,
                    Ok(_) | Err(_) => fallback_fields(),
                }
            })
            .await
            .clone()
    }

    async fn fetch_schema_fields(&self) -> Result<Vec<String>, reqwest::Error> {
        let url = format!(
            "{}/schema/fields",
            self.config.core_url(&self.config.solr_cores().1)
        );
        let body: serde_json::Value = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .json()
            .await?;
        let fields = body
            .get("fields")
            .and_then(|f| f.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| {
                        matches!(
                            entry.get("type").and_then(|t| t.as_str()),
                            Some("extra_facet") | Some("text_general")
                        )
                    })
                    .filter_map(|entry| entry.get("name").and_then(|n| n.as_str()))
                    .filter(|name| !["file_name", "file", "file_no_version"].contains(name))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(fields)
    }
}

/// The canonical facet fields used when the schema cannot be read.
fn fallback_fields() -> Vec<String> {
    FACET_HIERARCHY
        .iter()
        .map(|f| f.to_string())
        .chain(
            ["time_aggregation", "dataset", "driving_model", "level_type", "rcm_name",
             "rcm_version", "user"]
                .iter()
                .map(|f| f.to_string()),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniq_key_parsing() {
        assert_eq!("file".parse::<UniqKey>().unwrap(), UniqKey::File);
        assert_eq!("uri".parse::<UniqKey>().unwrap(), UniqKey::Uri);
        assert!("path".parse::<UniqKey>().is_err());
    }

    #[test]
    fn test_fallback_fields_cover_hierarchy() {
        let fields = fallback_fields();
        for facet in FACET_HIERARCHY {
            assert!(fields.contains(&facet.to_string()), "missing {facet}");
        }
        assert!(!fields.contains(&"file".to_string()));
    }
}
