//! The search facade over the external inverted index.
//!
//! One instance is built per request from validated parameters. All index
//! I/O funnels through two wrappers (`session_get`/`session_post`) that map
//! connection failures to 503 and pass upstream status codes through with
//! an empty body, so handlers can reuse the backend status.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::error::ApiError;
use crate::flavour::{Flavour, Translator, FACET_HIERARCHY};
use crate::query::{
    adjust_bbox_string, adjust_time_string, escape_phrase, filter_queries, SelectMethod, UNIQ_KEYS,
};
use crate::types::{AppContext, UniqKey, BATCH_SIZE};

/// Result of a metadata or extended search.
#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub total_count: u64,
    /// Facet name → flat `[value, count, value, count, …]` list, sorted
    /// alphabetically by name.
    pub facets: BTreeMap<String, Vec<Value>>,
    pub search_results: Vec<Map<String, Value>>,
    pub facet_mapping: BTreeMap<String, String>,
    pub primary_facets: Vec<String>,
}

/// Header of an analysis-ready catalog export.
#[derive(Clone, Debug, Serialize)]
pub struct IntakeCatalogue {
    pub esmcat_version: String,
    pub attributes: Vec<IntakeAttribute>,
    pub assets: IntakeAssets,
    pub id: String,
    pub description: String,
    pub title: String,
    pub last_updated: String,
    pub aggregation_control: AggregationControl,
}

#[derive(Clone, Debug, Serialize)]
pub struct IntakeAttribute {
    pub column_name: String,
    pub vocabulary: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct IntakeAssets {
    pub column_name: String,
    pub format_column_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AggregationControl {
    pub variable_column_name: String,
    pub groupby_attrs: Vec<String>,
    pub aggregations: Vec<Aggregation>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Aggregation {
    #[serde(rename = "type")]
    pub kind: String,
    pub attribute_name: String,
    pub options: Map<String, Value>,
}

/// A validated search against the index.
#[derive(Debug)]
pub struct Solr {
    pub ctx: AppContext,
    pub translator: Translator,
    pub uniq_key: UniqKey,
    pub multi_version: bool,
    pub start: usize,
    /// Canonical facet constraints of this search.
    pub facets: BTreeMap<String, Vec<String>>,
    time_fq: Option<String>,
    bbox_fq: Option<String>,
}

impl Solr {
    /// Validate raw query parameters and build the facade.
    ///
    /// Unknown parameter names are rejected with a validation error; broken
    /// `time`/`bbox` expressions surface as internal parse errors, matching
    /// the error table of the HTTP surface.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_parameters(
        ctx: AppContext,
        flavour: Flavour,
        uniq_key: UniqKey,
        start: usize,
        multi_version: bool,
        translate: bool,
        params: &[(String, String)],
    ) -> Result<Self, ApiError> {
        let translator = Translator::new(flavour, translate);
        let valid = translator.valid_facets();
        let mut time = String::new();
        let mut time_select = SelectMethod::default();
        let mut bbox = String::new();
        let mut bbox_select = SelectMethod::default();
        let mut facets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in params {
            let bare = key.to_lowercase().replace("_not_", "");
            match bare.as_str() {
                "time" => time = value.clone(),
                "bbox" => bbox = value.clone(),
                "time_select" => {
                    time_select = SelectMethod::parse(value)
                        .map_err(|e| ApiError::BadInput(format!("Choose `time_select` {e}")))?;
                }
                "bbox_select" => {
                    bbox_select = SelectMethod::parse(value)
                        .map_err(|e| ApiError::BadInput(format!("Choose `bbox_select` {e}")))?;
                }
                _ => {
                    if !valid.contains(&bare.as_str()) && !UNIQ_KEYS.contains(&bare.as_str()) {
                        return Err(ApiError::Validation("Could not validate input.".to_string()));
                    }
                    facets.entry(key.clone()).or_default().push(value.clone());
                }
            }
        }
        let time_fq = adjust_time_string(&time, time_select).map_err(ApiError::BadInput)?;
        let bbox_fq = adjust_bbox_string(&bbox, bbox_select).map_err(ApiError::BadInput)?;
        let facets = translator.translate_query(facets, true);
        Ok(Self {
            ctx,
            translator,
            uniq_key,
            multi_version,
            start,
            facets,
            time_fq,
            bbox_fq,
        })
    }

    /// The select url of the shard this search targets.
    fn select_url(&self) -> String {
        let (historical, latest) = self.ctx.config.solr_cores();
        let core = if self.multi_version { historical } else { latest };
        format!("{}/select/", self.ctx.config.core_url(&core))
    }

    /// The update url for ingest and delete operations; user data always
    /// lives in the latest shard.
    fn update_url(&self) -> String {
        let (_, latest) = self.ctx.config.solr_cores();
        format!(
            "{}/update/json?commit=true&overwrite=false",
            self.ctx.config.core_url(&latest)
        )
    }

    /// Filter queries of this search, in predicate order.
    pub fn filter_queries(&self) -> Vec<String> {
        filter_queries(
            &self.facets,
            self.time_fq.as_deref(),
            self.bbox_fq.as_deref(),
            self.translator.flavour,
        )
    }

    fn base_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("q".to_string(), "*:*".to_string())];
        params.extend(
            self.filter_queries()
                .into_iter()
                .map(|fq| ("fq".to_string(), fq)),
        );
        params.push(("sort".to_string(), format!("{} desc", self.uniq_key)));
        params.push(("wt".to_string(), "json".to_string()));
        params
    }

    /// GET against the index; connection problems map to 503, upstream
    /// error statuses pass through with an empty body.
    async fn session_get(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<(u16, Value), ApiError> {
        info!(url = url, uniq_key = %self.uniq_key, "querying the search index");
        let response = self
            .ctx
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|err| {
                error!(url = url, error = %err, "connection to the search index failed");
                ApiError::Unavailable("Could not connect to Solr server".to_string())
            })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            error!(url = url, status = status, "search index returned an error");
            return Ok((status, json!({})));
        }
        let body = response.json().await.unwrap_or_else(|_| json!({}));
        Ok((status, body))
    }

    /// POST against the index, same error contract as [`Self::session_get`].
    async fn session_post(&self, url: &str, payload: &Value) -> Result<(u16, Value), ApiError> {
        info!(url = url, "posting to the search index");
        let response = self
            .ctx
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                error!(url = url, error = %err, "connection to the search index failed");
                ApiError::Unavailable("Could not connect to the instance".to_string())
            })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            error!(url = url, status = status, "index write failed");
            return Ok((status, json!({})));
        }
        let body = response.json().await.unwrap_or_else(|_| json!({}));
        Ok((status, body))
    }

    /// Faceted search returning counts, the facet mapping and up to
    /// `max_results` result rows.
    pub async fn extended_search(
        &self,
        facet_params: &[String],
        max_results: usize,
    ) -> Result<(u16, SearchResult), ApiError> {
        let selected: Vec<String> = facet_params
            .iter()
            .filter(|f| !matches!(f.as_str(), "*" | "all"))
            .cloned()
            .collect();
        let fields = if selected.is_empty() {
            self.ctx.solr_fields().await
        } else {
            selected
        };
        let facet_fields: Vec<String> = fields
            .iter()
            .map(|f| self.translator.translate_facet(f, true))
            .collect();

        let mut params = self.base_params();
        params.push(("start".to_string(), self.start.to_string()));
        params.push(("facet".to_string(), "true".to_string()));
        params.push(("rows".to_string(), max_results.to_string()));
        params.push(("facet.sort".to_string(), "index".to_string()));
        params.push(("facet.mincount".to_string(), "1".to_string()));
        params.push(("facet.limit".to_string(), "-1".to_string()));
        for field in &facet_fields {
            params.push(("facet.field".to_string(), field.clone()));
        }
        params.push(("fl".to_string(), self.uniq_key.to_string()));
        params.push(("fl".to_string(), "fs_type".to_string()));

        let (status, search) = self.session_get(&self.select_url(), &params).await?;
        let total_count = search["response"]["numFound"].as_u64().unwrap_or(0);
        let raw_facets: BTreeMap<String, Vec<Value>> = search["facet_counts"]["facet_fields"]
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_array().cloned().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();
        let facets = self.translator.translate_query(raw_facets, false);
        let search_results = search["response"]["docs"]
            .as_array()
            .map(|docs| {
                docs.iter()
                    .map(|doc| {
                        let mut row = Map::new();
                        row.insert(
                            self.uniq_key.to_string(),
                            doc.get(self.uniq_key.as_str()).cloned().unwrap_or(Value::Null),
                        );
                        row.insert(
                            "fs_type".to_string(),
                            doc.get("fs_type").cloned().unwrap_or_else(|| json!("posix")),
                        );
                        row
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok((
            status,
            SearchResult {
                total_count,
                facets,
                search_results,
                facet_mapping: self.translator.facet_mapping(&facet_fields),
                primary_facets: self.translator.primary_keys(),
            },
        ))
    }

    /// First query of a record stream, returning the backend status and the
    /// total hit count.
    pub async fn init_stream(&self) -> Result<(u16, u64), ApiError> {
        let mut params = self.base_params();
        params.push(("start".to_string(), self.start.to_string()));
        params.push(("fl".to_string(), "file".to_string()));
        params.push(("fl".to_string(), "uri".to_string()));
        let (status, search) = self.session_get(&self.select_url(), &params).await?;
        Ok((status, search["response"]["numFound"].as_u64().unwrap_or(0)))
    }

    /// Record the finished search in the analytics collection, detached
    /// from the request.
    pub fn store_results(&self, num_results: u64, status: u16) {
        let mongo = self.ctx.mongo.clone();
        let flavour = self.translator.flavour.to_string();
        let uniq_key = self.uniq_key.to_string();
        let facets = self.facets.clone();
        tokio::spawn(async move {
            mongo
                .record_search(num_results, status, &flavour, &uniq_key, &facets)
                .await;
        });
    }

    /// All result documents, page by page, in backend sort order.
    ///
    /// Pagination follows the backend cursor mark; the stream ends when the
    /// returned cursor equals the submitted one. An error mid-stream ends
    /// the stream after a log line, since partial pages are already on the
    /// wire.
    pub(crate) fn page_stream(
        self,
        extra_fields: Vec<(String, String)>,
    ) -> impl Stream<Item = Vec<Value>> {
        async_stream::stream! {
            let url = self.select_url();
            let mut cursor = "*".to_string();
            loop {
                let mut params = self.base_params();
                params.push(("rows".to_string(), BATCH_SIZE.to_string()));
                params.extend(extra_fields.iter().cloned());
                params.push(("cursorMark".to_string(), cursor.clone()));
                let results = match self.session_get(&url, &params).await {
                    Ok((_, results)) => results,
                    Err(err) => {
                        error!(error = %err, "search stream aborted");
                        break;
                    }
                };
                if let Some(docs) = results["response"]["docs"].as_array() {
                    yield docs.clone();
                }
                match results["nextCursorMark"].as_str() {
                    Some(next) if next != cursor => cursor = next.to_string(),
                    _ => break,
                }
            }
        }
    }

    /// Stream of `uniq_key\n` lines for the data-search endpoint.
    pub fn stream_response(self) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        let uniq_key = self.uniq_key;
        async_stream::stream! {
            let pages = self.page_stream(vec![
                ("fl".to_string(), uniq_key.to_string()),
            ]);
            futures::pin_mut!(pages);
            while let Some(docs) = futures::StreamExt::next(&mut pages).await {
                for doc in docs {
                    if let Some(value) = doc.get(uniq_key.as_str()).and_then(Value::as_str) {
                        yield Ok(Bytes::from(format!("{value}\n")));
                    }
                }
            }
        }
    }

    /// Build the catalog header from an initial faceted query.
    pub async fn init_intake_catalogue(
        &self,
    ) -> Result<(u16, IntakeCatalogue, u64), ApiError> {
        let solr_fields = self.ctx.solr_fields().await;
        let mut params = self.base_params();
        params.push(("facet".to_string(), "true".to_string()));
        params.push(("facet.mincount".to_string(), "1".to_string()));
        params.push(("facet.limit".to_string(), "-1".to_string()));
        params.push(("rows".to_string(), BATCH_SIZE.to_string()));
        for field in &solr_fields {
            params.push(("facet.field".to_string(), field.clone()));
        }
        params.push(("fl".to_string(), self.uniq_key.to_string()));
        let (status, search) = self.session_get(&self.select_url(), &params).await?;
        let total_count = search["response"]["numFound"].as_u64().unwrap_or(0);
        let facet_fields = &search["facet_counts"]["facet_fields"];
        let attributes: Vec<String> = FACET_HIERARCHY
            .iter()
            .filter(|facet| {
                facet_fields
                    .get(**facet)
                    .and_then(Value::as_array)
                    .is_some_and(|counts| !counts.is_empty())
            })
            .map(|facet| self.translator.translate_facet(facet, false))
            .collect();
        Ok((status, self.build_catalogue(&attributes), total_count))
    }

    fn build_catalogue(&self, attributes: &[String]) -> IntakeCatalogue {
        let variable_column = self.translator.translate_facet("variable", false);
        IntakeCatalogue {
            esmcat_version: "0.1.0".to_string(),
            attributes: attributes
                .iter()
                .map(|column| IntakeAttribute {
                    column_name: column.clone(),
                    vocabulary: String::new(),
                })
                .collect(),
            assets: IntakeAssets {
                column_name: self.uniq_key.to_string(),
                format_column_name: "format".to_string(),
            },
            id: "freva".to_string(),
            description: format!(
                "Catalogue from freva-databrowser v{}",
                env!("CARGO_PKG_VERSION")
            ),
            title: "freva-databrowser catalogue".to_string(),
            last_updated: Utc::now().to_rfc3339(),
            aggregation_control: AggregationControl {
                variable_column_name: variable_column,
                groupby_attrs: Vec::new(),
                aggregations: attributes
                    .iter()
                    .map(|column| Aggregation {
                        kind: "union".to_string(),
                        attribute_name: column.clone(),
                        options: Map::new(),
                    })
                    .collect(),
            },
        }
    }

    /// Fields requested for catalog rows: the uniq key plus every facet
    /// column.
    pub(crate) fn catalogue_fields(&self, solr_fields: &[String]) -> Vec<(String, String)> {
        let mut fl = vec![("fl".to_string(), self.uniq_key.to_string())];
        fl.extend(solr_fields.iter().map(|f| ("fl".to_string(), f.clone())));
        fl
    }

    /// Stream the full catalog export: header followed by one JSON object
    /// per record, flushed page by page.
    pub fn intake_stream(
        self,
        catalogue: IntakeCatalogue,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        async_stream::stream! {
            yield Ok(Bytes::from(catalogue_header(&catalogue)));
            yield Ok(Bytes::from(",\n   \"catalog_dict\": "));
            let uniq_key = self.uniq_key;
            let fl = self.catalogue_fields(&self.ctx.solr_fields().await);
            let pages = self.page_stream(fl);
            futures::pin_mut!(pages);
            let mut first = true;
            while let Some(docs) = futures::StreamExt::next(&mut pages).await {
                let mut chunk = String::new();
                for doc in &docs {
                    let sep = if first { "[" } else { "," };
                    first = false;
                    let entry = Value::Object(catalogue_row(doc, uniq_key));
                    chunk.push_str(&format!("{sep}\n   {}", compact(&entry)));
                }
                yield Ok(Bytes::from(chunk));
            }
            if first {
                yield Ok(Bytes::from("["));
            }
            yield Ok(Bytes::from("\n   ]\n}"));
        }
    }
}

/// Pretty-printed header with the closing brace removed, so the streamed
/// `catalog_dict` key can be appended to the same JSON object.
pub fn catalogue_header(catalogue: &IntakeCatalogue) -> String {
    let rendered = serde_json::to_string_pretty(catalogue).unwrap_or_else(|_| "{}".to_string());
    rendered.trim_end().trim_end_matches('}').trim_end().to_string()
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Reduce one result document to its non-null catalog columns, in
/// hierarchy order, unwrapping single-element lists.
pub fn catalogue_row(doc: &Value, uniq_key: UniqKey) -> Map<String, Value> {
    let mut row = Map::new();
    for key in std::iter::once(uniq_key.as_str()).chain(FACET_HIERARCHY) {
        let value = match doc.get(key) {
            Some(Value::Array(items)) if items.len() == 1 => items[0].clone(),
            Some(Value::Array(items)) if items.is_empty() => continue,
            Some(Value::Null) | None => continue,
            Some(other) => other.clone(),
        };
        row.insert(key.to_string(), value);
    }
    row
}

// ---------------------------------------------------------------------------
// Ingest-facing index operations
// ---------------------------------------------------------------------------

impl Solr {
    /// Whether a record with this uri or file path already exists in the
    /// latest shard.
    pub async fn is_duplicate(&self, uri: &str, file: &str) -> Result<bool, ApiError> {
        let (_, latest) = self.ctx.config.solr_cores();
        let url = format!("{}/select", self.ctx.config.core_url(&latest));
        let query = format!(
            "uri:\"{}\" OR file:\"{}\"",
            escape_phrase(uri),
            escape_phrase(file)
        );
        let params = vec![
            ("q".to_string(), query),
            ("fl".to_string(), "id".to_string()),
            ("rows".to_string(), "1".to_string()),
            ("wt".to_string(), "json".to_string()),
        ];
        let (status, search) = self.session_get(&url, &params).await?;
        Ok(status == 200 && search["response"]["numFound"].as_u64().unwrap_or(0) > 0)
    }

    /// Write one batch to the index, one document per request so every
    /// accepted record is counted individually.
    pub async fn add_batch_to_index(
        &self,
        batch: &[Map<String, Value>],
    ) -> Result<usize, ApiError> {
        let url = self.update_url();
        let mut ingested = 0;
        for record in batch {
            let (status, _) = self
                .session_post(&url, &Value::Array(vec![Value::Object(record.clone())]))
                .await?;
            if status == 200 {
                ingested += 1;
            }
        }
        Ok(ingested)
    }

    /// Delete everything matching an AND-joined key/value query from the
    /// latest shard.
    pub async fn delete_by_query(&self, query: &str) -> Result<(), ApiError> {
        let url = self.update_url();
        self.session_post(&url, &json!({ "delete": { "query": query } }))
            .await?;
        Ok(())
    }
}
