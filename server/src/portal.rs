//! Chunk-store front-end.
//!
//! Turns uri search hits into deterministic store urls, publishes load jobs
//! on the portal channel and serves store keys (`.zmetadata`, `.zgroup`,
//! `.zattrs`, `.zarray`, chunk coordinates, `status`) straight from the
//! shared cache. Workers do the heavy lifting; this side only publishes
//! and polls.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

use data_portal_core::{
    chunk_key, dataset_uuid, ChunkRequest, LoadRequest, LoadState, PortalMessage,
};

use crate::api::SearchOpts;
use crate::error::ApiError;
use crate::solr::{catalogue_header, catalogue_row, Solr};
use crate::types::{AppContext, UniqKey};

/// How long a chunk request waits for a worker by default.
const CHUNK_TIMEOUT_SECS: u64 = 10;
/// Upper bound for caller-supplied timeouts.
const MAX_TIMEOUT_SECS: u64 = 60;
/// Poll interval while waiting for chunk bytes.
const CHUNK_POLL: Duration = Duration::from_millis(500);
/// Poll interval while waiting for a load status transition.
const STATUS_POLL: Duration = Duration::from_secs(1);

/// `GET /databrowser/load/{flavour}` — stream store urls for every hit.
pub async fn load_data(
    State(ctx): State<AppContext>,
    Path(flavour): Path<String>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    ctx.auth.required(&headers).await?;
    if !ctx.config.services().contains("zarr-stream") {
        return Err(ApiError::Unavailable("Service not enabled.".to_string()));
    }
    let flavour = flavour.parse().map_err(ApiError::Validation)?;
    let opts = SearchOpts::parse(raw.as_deref())?;
    let solr = Solr::validate_parameters(
        ctx,
        flavour,
        UniqKey::Uri,
        opts.start,
        opts.multi_version,
        opts.translate,
        &opts.residual,
    )?;
    let (_, total_count) = solr.init_stream().await?;
    let status = if total_count < 1 {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::CREATED
    };
    solr.store_results(total_count, status.as_u16());
    let body = Body::from_stream(zarr_stream(solr, opts.catalogue_type, total_count));
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(body)
        .map_err(|error| ApiError::Internal(error.to_string()))
}

/// The streamed body of a load request: one store url per hit, optionally
/// wrapped in the intake envelope.
fn zarr_stream(
    solr: Solr,
    catalogue_type: Option<String>,
    num_results: u64,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let api_path = format!(
            "{}/api/freva-nextgen/data-portal/zarr",
            solr.ctx.config.proxy
        );
        let cache = solr.ctx.cache.clone();
        let uniq_key = solr.uniq_key;
        let intake = catalogue_type.as_deref() == Some("intake");
        let fl = if intake {
            solr.catalogue_fields(&solr.ctx.solr_fields().await)
        } else {
            vec![("fl".to_string(), uniq_key.to_string())]
        };
        if intake {
            match solr.init_intake_catalogue().await {
                Ok((_, catalogue, _)) => {
                    yield Ok(Bytes::from(catalogue_header(&catalogue)));
                    yield Ok(Bytes::from(",\n   \"catalog_dict\": ["));
                }
                Err(err) => {
                    error!(error = %err, "could not build catalogue header");
                    return;
                }
            }
        }
        let pages = solr.page_stream(fl);
        futures::pin_mut!(pages);
        let mut num = 1u64;
        while let Some(docs) = futures::StreamExt::next(&mut pages).await {
            for mut doc in docs {
                let Some(uri) = doc.get(uniq_key.as_str()).and_then(Value::as_str) else {
                    continue;
                };
                let uri = uri.to_string();
                let uuid = dataset_uuid(&uri).to_string();
                let message = PortalMessage::Uri(LoadRequest {
                    path: uri.clone(),
                    uuid: uuid.clone(),
                });
                if let Err(err) = cache.publish(&message).await {
                    error!(error = %err, "could not publish load job");
                    yield Ok(Bytes::from("Internal error, service not available\n"));
                    continue;
                }
                let output = format!("{api_path}/{uuid}.zarr");
                let line = if intake {
                    doc[uniq_key.as_str()] = Value::from(output);
                    let suffix = if num < num_results { "," } else { "" };
                    let row = Value::Object(catalogue_row(&doc, uniq_key));
                    let rendered = serde_json::to_string_pretty(&row)
                        .unwrap_or_else(|_| "{}".to_string());
                    format!("   {rendered}{suffix}\n")
                } else {
                    format!("{output}\n")
                };
                num += 1;
                yield Ok(Bytes::from(line));
            }
        }
        if intake {
            yield Ok(Bytes::from("\n   ]\n}"));
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeoutParam {
    #[serde(default)]
    timeout: Option<u64>,
}

/// `GET /data-portal/zarr/{store}.zarr/{*key}` — serve one store key.
pub async fn zarr_key(
    State(ctx): State<AppContext>,
    Path((store, key)): Path<(String, String)>,
    Query(params): Query<TimeoutParam>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ctx.auth.required(&headers).await?;
    let uuid = store
        .strip_suffix(".zarr")
        .ok_or_else(|| ApiError::NotFound(format!("{store}: no such store")))?
        .to_string();
    match key.as_str() {
        "status" => {
            status_response(&ctx, &uuid, params.timeout.unwrap_or(1)).await
        }
        ".zmetadata" => {
            let meta = ready_metadata(&ctx, &uuid).await?;
            Ok(Json(meta).into_response())
        }
        ".zgroup" | ".zattrs" => {
            let meta = ready_metadata(&ctx, &uuid).await?;
            metadata_key(&meta, &key)
        }
        _ => match key.rsplit_once('/') {
            Some((variable, sub @ (".zarray" | ".zattrs"))) => {
                let meta = ready_metadata(&ctx, &uuid).await?;
                metadata_key(&meta, &format!("{variable}/{sub}"))
            }
            Some((variable, chunk)) if is_chunk_id(chunk) => {
                chunk_response(&ctx, &uuid, variable, chunk, params.timeout).await
            }
            _ => Err(ApiError::NotFound(format!("{key}: no such store key"))),
        },
    }
}

fn is_chunk_id(key: &str) -> bool {
    !key.is_empty() && key.split('.').all(|part| part.chars().all(|c| c.is_ascii_digit()))
}

/// The consolidated metadata of a finished load, or the matching error.
async fn ready_metadata(ctx: &AppContext, uuid: &str) -> Result<Value, ApiError> {
    let status = ctx
        .cache
        .get_status(uuid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{uuid} uuid does not exist (anymore).")))?;
    match status.state() {
        LoadState::Ok => status
            .json_meta
            .ok_or_else(|| ApiError::Internal("status record misses metadata".to_string())),
        LoadState::Failed => Err(ApiError::Internal(status.reason)),
        _ => Err(ApiError::Unavailable("Dataset not ready, try again later.".to_string())),
    }
}

fn metadata_key(meta: &Value, key: &str) -> Result<Response, ApiError> {
    meta.get("metadata")
        .and_then(|m| m.get(key))
        .cloned()
        .map(|value| Json(value).into_response())
        .ok_or_else(|| ApiError::NotFound(format!("{key}: no such store key")))
}

/// Poll the status record until it settles or the deadline passes.
async fn status_response(
    ctx: &AppContext,
    uuid: &str,
    timeout_secs: u64,
) -> Result<Response, ApiError> {
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(timeout_secs.min(MAX_TIMEOUT_SECS));
    loop {
        let status = ctx
            .cache
            .get_status(uuid)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("{uuid} uuid does not exist (anymore).")))?;
        match status.state() {
            LoadState::Ok => {
                return Ok(Json(serde_json::json!({
                    "status": status.status,
                    "obj_url": status.obj_url,
                    "reason": status.reason,
                }))
                .into_response());
            }
            LoadState::Failed => return Err(ApiError::Internal(status.reason)),
            _ if tokio::time::Instant::now() >= deadline => {
                return Err(ApiError::Timeout(format!(
                    "dataset still {}",
                    status.state().describe()
                )));
            }
            _ => tokio::time::sleep(STATUS_POLL).await,
        }
    }
}

/// Serve one encoded chunk, requesting materialization on a cache miss.
async fn chunk_response(
    ctx: &AppContext,
    uuid: &str,
    variable: &str,
    chunk: &str,
    timeout: Option<u64>,
) -> Result<Response, ApiError> {
    let key = chunk_key(uuid, variable, chunk);
    let mut published = false;
    let timeout_secs = timeout.unwrap_or(CHUNK_TIMEOUT_SECS).min(MAX_TIMEOUT_SECS);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if let Some(bytes) = ctx.cache.get_bytes(&key).await? {
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from(bytes))
                .map_err(|error| ApiError::Internal(error.to_string()));
        }
        if !published {
            ready_metadata(ctx, uuid).await?;
            ctx.cache
                .publish(&PortalMessage::Chunk(ChunkRequest {
                    uuid: uuid.to_string(),
                    variable: variable.to_string(),
                    chunk: chunk.to_string(),
                }))
                .await?;
            published = true;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ApiError::Timeout(format!(
                "chunk {chunk} of {variable} not materialized in time"
            )));
        }
        tokio::time::sleep(CHUNK_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_detection() {
        assert!(is_chunk_id("0"));
        assert!(is_chunk_id("0.0.0"));
        assert!(is_chunk_id("12.3.4.5"));
        assert!(!is_chunk_id(".zarray"));
        assert!(!is_chunk_id("tas"));
        assert!(!is_chunk_id(""));
    }
}
