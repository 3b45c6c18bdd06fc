//! HTTP handlers of the databrowser API.
//!
//! Routes are mounted under `/api/freva-nextgen/databrowser` by the main
//! server. List endpoints stream `text/plain` lines flushed per backend
//! page; catalog exports stream one JSON attachment.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::extract::{Json, Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::get_userinfo;
use crate::error::ApiError;
use crate::flavour::{Flavour, Translator, CORDEX_KEYS, FLAVOURS};
use crate::ingest;
use crate::query::parse_query_pairs;
use crate::solr::Solr;
use crate::types::{AppContext, UniqKey};

/// Typed options shared by all search endpoints, split off the residual
/// facet parameters.
#[derive(Debug)]
pub struct SearchOpts {
    pub start: usize,
    pub multi_version: bool,
    pub translate: bool,
    pub max_results: Option<i64>,
    pub facets: Vec<String>,
    pub catalogue_type: Option<String>,
    pub residual: Vec<(String, String)>,
}

impl SearchOpts {
    /// Parse a raw query string; option values that fail to parse are a
    /// validation error, everything unknown stays in `residual` for facet
    /// validation downstream.
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        let mut opts = SearchOpts {
            start: 0,
            multi_version: false,
            translate: true,
            max_results: None,
            facets: Vec::new(),
            catalogue_type: None,
            residual: Vec::new(),
        };
        let invalid = || ApiError::Validation("Could not validate input.".to_string());
        for (key, value) in parse_query_pairs(raw) {
            match key.as_str() {
                "start" => opts.start = value.parse().map_err(|_| invalid())?,
                "multi-version" | "multi_version" => {
                    opts.multi_version = parse_bool(&value).ok_or_else(invalid)?
                }
                "translate" => opts.translate = parse_bool(&value).ok_or_else(invalid)?,
                "max-results" | "max_results" => {
                    opts.max_results = Some(value.parse().map_err(|_| invalid())?)
                }
                "facets" => opts.facets.push(value),
                "catalogue-type" => opts.catalogue_type = Some(value),
                _ => opts.residual.push((key, value)),
            }
        }
        Ok(opts)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_path(flavour: &str, uniq_key: &str) -> Result<(Flavour, UniqKey), ApiError> {
    let flavour = flavour.parse().map_err(ApiError::Validation)?;
    let uniq_key = uniq_key.parse().map_err(ApiError::Validation)?;
    Ok((flavour, uniq_key))
}

fn build_solr(
    ctx: AppContext,
    flavour: Flavour,
    uniq_key: UniqKey,
    opts: &SearchOpts,
) -> Result<Solr, ApiError> {
    Solr::validate_parameters(
        ctx,
        flavour,
        uniq_key,
        opts.start,
        opts.multi_version,
        opts.translate,
        &opts.residual,
    )
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

/// Flavours and their visible facets.
#[derive(Serialize)]
pub struct SearchFlavours {
    pub flavours: Vec<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// `GET /databrowser/overview` — static listing of flavours and facets.
pub async fn overview() -> Json<SearchFlavours> {
    let mut attributes = BTreeMap::new();
    for flavour in FLAVOURS {
        let translator = Translator::new(flavour, true);
        let facets: Vec<String> = translator
            .ordered_facets()
            .into_iter()
            .filter(|facet| {
                flavour == Flavour::Cordex || !CORDEX_KEYS.contains(facet)
            })
            .map(str::to_string)
            .collect();
        attributes.insert(flavour.to_string(), facets);
    }
    Json(SearchFlavours {
        flavours: FLAVOURS.iter().map(|f| f.to_string()).collect(),
        attributes,
    })
}

// ---------------------------------------------------------------------------
// Search endpoints
// ---------------------------------------------------------------------------

/// `GET /databrowser/data-search/{flavour}/{uniq_key}` — stream matching
/// uniq keys as plain-text lines.
pub async fn data_search(
    State(ctx): State<AppContext>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let (flavour, uniq_key) = parse_path(&flavour, &uniq_key)?;
    let opts = SearchOpts::parse(raw.as_deref())?;
    let solr = build_solr(ctx, flavour, uniq_key, &opts)?;
    let (status, total_count) = solr.init_stream().await?;
    solr.store_results(total_count, status);
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(solr.stream_response()))
        .map_err(|error| ApiError::Internal(error.to_string()))
}

/// `GET /databrowser/metadata-search/{flavour}/{uniq_key}` — facet counts
/// without result rows.
pub async fn metadata_search(
    State(ctx): State<AppContext>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let (flavour, uniq_key) = parse_path(&flavour, &uniq_key)?;
    let opts = SearchOpts::parse(raw.as_deref())?;
    let solr = build_solr(ctx, flavour, uniq_key, &opts)?;
    let (status, result) = solr.extended_search(&opts.facets, 0).await?;
    solr.store_results(result.total_count, status);
    let mut output = serde_json::to_value(&result)
        .map_err(|error| ApiError::Internal(error.to_string()))?;
    if let Some(map) = output.as_object_mut() {
        map.remove("search_results");
    }
    Ok((
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        Json(output),
    )
        .into_response())
}

/// `GET /databrowser/extended-search/{flavour}/{uniq_key}` — facet counts
/// plus up to `max-results` result rows.
pub async fn extended_search(
    State(ctx): State<AppContext>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let (flavour, uniq_key) = parse_path(&flavour, &uniq_key)?;
    let opts = SearchOpts::parse(raw.as_deref())?;
    let max_results = opts.max_results.unwrap_or(150).max(0) as usize;
    let solr = build_solr(ctx, flavour, uniq_key, &opts)?;
    let (status, result) = solr.extended_search(&opts.facets, max_results).await?;
    solr.store_results(result.total_count, status);
    Ok((
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        Json(result),
    )
        .into_response())
}

/// `GET /databrowser/intake-catalogue/{flavour}/{uniq_key}` — streamed
/// catalog attachment.
pub async fn intake_catalogue(
    State(ctx): State<AppContext>,
    Path((flavour, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let (flavour, uniq_key) = parse_path(&flavour, &uniq_key)?;
    let opts = SearchOpts::parse(raw.as_deref())?;
    let solr = build_solr(ctx, flavour, uniq_key, &opts)?;
    let (status, catalogue, total_count) = solr.init_intake_catalogue().await?;
    solr.store_results(total_count, status);
    if total_count == 0 {
        return Err(ApiError::NotFound("No results found.".to_string()));
    }
    if let Some(max_results) = opts.max_results.filter(|m| *m > 0) {
        if total_count > max_results as u64 {
            return Err(ApiError::TooLarge("Result stream too big.".to_string()));
        }
    }
    let file_name = format!("IntakeEsmCatalogue_{flavour}_{uniq_key}.json");
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from_stream(solr.intake_stream(catalogue)))
        .map_err(|error| ApiError::Internal(error.to_string()))
}

// ---------------------------------------------------------------------------
// User data
// ---------------------------------------------------------------------------

/// Request body of the user-data ingest endpoint.
#[derive(Deserialize)]
pub struct UserDataRequest {
    pub user_metadata: Vec<Map<String, Value>>,
    #[serde(default)]
    pub facets: BTreeMap<String, String>,
}

/// Username of a validated token, preferring the provider claims.
async fn current_username(ctx: &AppContext, headers: &HeaderMap) -> Result<String, ApiError> {
    let payload = ctx.auth.required(headers).await?;
    let mut claims = payload.extra.clone();
    claims.insert("sub".to_string(), Value::from(payload.sub.clone()));
    Ok(get_userinfo(&claims)
        .map(|info| info.username)
        .unwrap_or(payload.sub))
}

/// `POST /databrowser/userdata` — validate and ingest user records.
pub async fn post_userdata(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(request): Json<UserDataRequest>,
) -> Result<Response, ApiError> {
    let user_name = current_username(&ctx, &headers).await?;
    let solr = Solr::validate_parameters(
        ctx,
        Flavour::Freva,
        UniqKey::File,
        0,
        false,
        true,
        &[],
    )?;
    let status =
        ingest::add_user_metadata(&solr, &user_name, request.user_metadata, &request.facets)
            .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": status })),
    )
        .into_response())
}

/// `DELETE /databrowser/userdata` — delete user records by search keys.
pub async fn delete_userdata(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(search_keys): Json<BTreeMap<String, Value>>,
) -> Result<Response, ApiError> {
    let user_name = current_username(&ctx, &headers).await?;
    let solr = Solr::validate_parameters(
        ctx,
        Flavour::Freva,
        UniqKey::File,
        0,
        false,
        true,
        &[],
    )?;
    let search_keys: BTreeMap<String, String> = search_keys
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();
    ingest::delete_user_metadata(&solr, &user_name, search_keys).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "metadata has been deleted successfully" })),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_opts_typed_and_residual() {
        let opts = SearchOpts::parse(Some(
            "start=30&multi-version=true&translate=false&project=cmip5&variable=tas&variable=pr",
        ))
        .unwrap();
        assert_eq!(opts.start, 30);
        assert!(opts.multi_version);
        assert!(!opts.translate);
        assert_eq!(opts.residual.len(), 3);
    }

    #[test]
    fn test_search_opts_rejects_bad_booleans() {
        assert!(SearchOpts::parse(Some("multi-version=maybe")).is_err());
        assert!(SearchOpts::parse(Some("start=soon")).is_err());
    }

    #[test]
    fn test_search_opts_facet_selection() {
        let opts = SearchOpts::parse(Some("facets=experiment&facets=model")).unwrap();
        assert_eq!(opts.facets, vec!["experiment", "model"]);
        assert!(opts.residual.is_empty());
    }

    #[test]
    fn test_parse_path_rejects_unknown_values() {
        assert!(parse_path("cmip6", "file").is_ok());
        assert!(parse_path("cmip9", "file").is_err());
        assert!(parse_path("cmip6", "path").is_err());
    }
}
