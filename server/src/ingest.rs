//! User-data ingestion: validate, deduplicate and dual-write records.
//!
//! The index write is authoritative for subsequent searches; the document
//! store keeps a replica for analytics and listings. The two writes are
//! independent: a failure on either side is logged and the other side
//! proceeds.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::query::escape;
use crate::solr::Solr;
use crate::types::BATCH_SIZE;

/// Fields every submitted record must carry.
const REQUIRED_FIELDS: [&str; 4] = ["file", "variable", "time", "time_frequency"];

/// Drop records missing required fields; error when nothing survives.
pub fn validate_user_metadata(
    user_metadata: Vec<Map<String, Value>>,
) -> Result<Vec<Map<String, Value>>, ApiError> {
    let validated: Vec<Map<String, Value>> = user_metadata
        .into_iter()
        .filter(|record| {
            let complete = REQUIRED_FIELDS.iter().all(|field| record.contains_key(*field));
            if !complete {
                warn!(
                    required = ?REQUIRED_FIELDS,
                    "invalid metadata: missing one or more required fields"
                );
            }
            complete
        })
        .collect();
    if validated.is_empty() {
        return Err(ApiError::Validation(
            "No valid metadata found in the input.".to_string(),
        ));
    }
    Ok(validated)
}

/// Stamp ownership and defaults onto a record and normalize its values.
///
/// `uri` falls back to `file`, the owner and `fs_type=posix` are merged in
/// together with any extra facets, and every string value except the uniq
/// keys is lowercased.
pub fn normalize_record(
    record: &mut Map<String, Value>,
    user_name: &str,
    extra_facets: &BTreeMap<String, String>,
) {
    if !record.contains_key("uri") {
        let file = record.get("file").cloned().unwrap_or(Value::Null);
        record.insert("uri".to_string(), file);
    }
    record.insert("user".to_string(), Value::from(user_name));
    record
        .entry("fs_type".to_string())
        .or_insert_with(|| Value::from("posix"));
    for (key, value) in extra_facets {
        record.insert(key.clone(), Value::from(value.clone()));
    }
    for (key, value) in record.iter_mut() {
        if key == "file" || key == "uri" {
            continue;
        }
        if let Value::String(s) = value {
            *s = s.to_lowercase();
        }
    }
}

/// Collapse records that serialize identically within one batch.
fn dedupe_batch(batch: Vec<Map<String, Value>>) -> Vec<Map<String, Value>> {
    let mut seen = BTreeSet::new();
    batch
        .into_iter()
        .filter(|record| {
            seen.insert(serde_json::to_string(record).unwrap_or_default())
        })
        .collect()
}

/// Compose the AND-joined delete query from search keys.
///
/// Values are Lucene-escaped; everything except `file` is lowercased to
/// match how records were normalized at ingest time.
pub fn compose_delete_query(search_keys: &BTreeMap<String, String>) -> String {
    search_keys
        .iter()
        .map(|(key, value)| {
            let key = key.to_lowercase();
            let value = if key == "file" {
                escape(value)
            } else {
                escape(&value.to_lowercase())
            };
            format!("{key}:{value}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Validate, deduplicate and ingest user records in batches, returning a
/// human-readable summary.
pub async fn add_user_metadata(
    solr: &Solr,
    user_name: &str,
    user_metadata: Vec<Map<String, Value>>,
    extra_facets: &BTreeMap<String, String>,
) -> Result<String, ApiError> {
    let mut records = validate_user_metadata(user_metadata)?;
    for record in &mut records {
        normalize_record(record, user_name, extra_facets);
    }

    let mut total_ingested = 0usize;
    let mut total_duplicated = 0usize;
    for batch in records.chunks(BATCH_SIZE) {
        let batch = dedupe_batch(batch.to_vec());
        let batch_len = batch.len();
        let mut survivors = Vec::with_capacity(batch_len);
        for record in batch {
            let uri = record.get("uri").and_then(Value::as_str).unwrap_or_default();
            let file = record.get("file").and_then(Value::as_str).unwrap_or_default();
            if uri.is_empty() && file.is_empty() {
                continue;
            }
            if !solr.is_duplicate(uri, file).await? {
                survivors.push(record);
            }
        }
        total_duplicated += batch_len - survivors.len();
        if survivors.is_empty() {
            continue;
        }
        total_ingested += solr.add_batch_to_index(&survivors).await?;
        let replica: Vec<BTreeMap<String, Value>> = survivors
            .iter()
            .map(|record| record.clone().into_iter().collect())
            .collect();
        solr.ctx.mongo.upsert_userdata(&replica).await;
    }

    info!(
        ingested = total_ingested,
        duplicates = total_duplicated,
        "ingested user files into the index and the document store"
    );
    if total_ingested == 0 {
        Ok(format!(
            "No data was added to the databrowser. {total_duplicated} files \
             were duplicates and not added."
        ))
    } else {
        Ok(format!(
            "{total_ingested} have been successfully added to the databrowser. \
             {total_duplicated} files were duplicates and not added."
        ))
    }
}

/// Delete user records matching the search keys from the index and the
/// document store, always scoped to the calling user.
pub async fn delete_user_metadata(
    solr: &Solr,
    user_name: &str,
    mut search_keys: BTreeMap<String, String>,
) -> Result<(), ApiError> {
    search_keys.insert("user".to_string(), user_name.to_string());
    let query = compose_delete_query(&search_keys);
    solr.delete_by_query(&query).await?;
    solr.ctx.mongo.delete_userdata(&search_keys).await;
    info!(query = query.as_str(), "deleted user files from the index");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(fields: &[(&str, &str)]) -> Map<String, Value> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_validation_skips_incomplete_records() {
        let records = vec![
            record(&[("file", "/a.nc"), ("variable", "tas"), ("time", "x"), ("time_frequency", "day")]),
            record(&[("file", "/b.nc"), ("variable", "pr")]),
        ];
        let validated = validate_user_metadata(records).unwrap();
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0]["file"], json!("/a.nc"));
    }

    #[test]
    fn test_validation_fails_when_nothing_survives() {
        let records = vec![record(&[("file", "/b.nc")])];
        assert!(validate_user_metadata(records).is_err());
    }

    #[test]
    fn test_normalize_sets_owner_defaults_and_case() {
        let mut rec = record(&[
            ("file", "/Arch/TAS.nc"),
            ("variable", "TAS"),
            ("time", "[2000 TO 2010]"),
            ("time_frequency", "Day"),
        ]);
        normalize_record(&mut rec, "jdoe", &BTreeMap::new());
        assert_eq!(rec["uri"], json!("/Arch/TAS.nc"));
        assert_eq!(rec["user"], json!("jdoe"));
        assert_eq!(rec["fs_type"], json!("posix"));
        assert_eq!(rec["variable"], json!("tas"));
        assert_eq!(rec["file"], json!("/Arch/TAS.nc"));
    }

    #[test]
    fn test_normalize_extra_facets_override() {
        let mut rec = record(&[
            ("file", "s3://bucket/a.zarr"),
            ("variable", "tas"),
            ("time", "x"),
            ("time_frequency", "day"),
        ]);
        let extra: BTreeMap<String, String> =
            [("fs_type".to_string(), "swift".to_string())].into();
        normalize_record(&mut rec, "jdoe", &extra);
        assert_eq!(rec["fs_type"], json!("swift"));
    }

    #[test]
    fn test_dedupe_batch_collapses_identical_records() {
        let rec = record(&[("file", "/a.nc"), ("variable", "tas")]);
        let deduped = dedupe_batch(vec![rec.clone(), rec.clone()]);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn test_compose_delete_query() {
        let keys: BTreeMap<String, String> = [
            ("file".to_string(), "/Arch/TAS.nc".to_string()),
            ("user".to_string(), "JDoe".to_string()),
        ]
        .into();
        let query = compose_delete_query(&keys);
        assert_eq!(query, "file:\\/Arch\\/TAS.nc AND user:jdoe");
    }
}
