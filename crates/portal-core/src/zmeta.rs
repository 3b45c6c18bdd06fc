//! Consolidated metadata model of the chunk store (format v2).
//!
//! A store is addressed through a handful of well-known keys: a top level
//! `.zgroup`/`.zattrs` pair, per variable `.zarray`/`.zattrs` entries, and
//! the consolidated `.zmetadata` document that bundles them all. Workers
//! build this model once per dataset; the front-end serves slices of it
//! straight from the cache.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::dtype::Dtype;

pub const ZARR_FORMAT: u8 = 2;
pub const ZARR_CONSOLIDATED_FORMAT: u8 = 1;
pub const METADATA_KEY: &str = ".zmetadata";
pub const GROUP_META_KEY: &str = ".zgroup";
pub const ATTRS_KEY: &str = ".zattrs";
pub const ARRAY_META_KEY: &str = ".zarray";
/// Attribute naming the dimensions of a variable, in index order.
pub const DIMENSION_KEY: &str = "_ARRAY_DIMENSIONS";

/// A numcodecs-style codec configuration.
///
/// Serialized in config form, e.g. `{"id": "zlib", "level": 1}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Codec {
    Zlib { level: u32 },
    Shuffle { elementsize: usize },
}

/// The compressor applied when a variable does not declare one.
pub fn default_compressor() -> Codec {
    Codec::Zlib { level: 1 }
}

/// Array metadata served under `<variable>/.zarray`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZArray {
    pub zarr_format: u8,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: String,
    pub compressor: Option<Codec>,
    pub filters: Option<Vec<Codec>>,
    pub fill_value: Value,
    pub order: String,
}

impl ZArray {
    pub fn new(
        shape: Vec<u64>,
        chunks: Vec<u64>,
        dtype: Dtype,
        compressor: Option<Codec>,
        filters: Option<Vec<Codec>>,
        fill_value: Value,
    ) -> Self {
        Self {
            zarr_format: ZARR_FORMAT,
            shape,
            chunks,
            dtype: dtype.as_str().to_string(),
            compressor,
            filters,
            fill_value,
            order: "C".to_string(),
        }
    }

    pub fn dtype(&self) -> Result<Dtype, String> {
        self.dtype.parse()
    }

    /// Number of blocks along every axis, `ceil(shape / chunks)`.
    pub fn chunk_grid(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(s, c)| if *c == 0 { 0 } else { s.div_ceil(*c) })
            .collect()
    }
}

/// The consolidated `.zmetadata` document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Zmetadata {
    pub zarr_consolidated_format: u8,
    /// Flat map from store key to metadata document.
    pub metadata: BTreeMap<String, Value>,
}

impl Default for Zmetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Zmetadata {
    /// Empty consolidated document with a group entry and no attributes.
    pub fn new() -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            GROUP_META_KEY.to_string(),
            json!({ "zarr_format": ZARR_FORMAT }),
        );
        metadata.insert(ATTRS_KEY.to_string(), json!({}));
        Self {
            zarr_consolidated_format: ZARR_CONSOLIDATED_FORMAT,
            metadata,
        }
    }

    pub fn set_group_attrs(&mut self, attrs: Value) {
        self.metadata.insert(ATTRS_KEY.to_string(), attrs);
    }

    /// Register a variable with its array metadata and attributes.
    pub fn insert_variable(&mut self, name: &str, array: &ZArray, attrs: Value) {
        self.metadata.insert(
            format!("{name}/{ARRAY_META_KEY}"),
            serde_json::to_value(array).unwrap_or(Value::Null),
        );
        self.metadata.insert(format!("{name}/{ATTRS_KEY}"), attrs);
    }

    /// Look up one store key, e.g. `.zgroup` or `tas/.zarray`.
    pub fn key(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Typed view of a variable's array metadata.
    pub fn array_meta(&self, variable: &str) -> Option<ZArray> {
        self.metadata
            .get(&format!("{variable}/{ARRAY_META_KEY}"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Names of all registered variables.
    pub fn variables(&self) -> Vec<String> {
        self.metadata
            .keys()
            .filter_map(|k| k.strip_suffix(&format!("/{ARRAY_META_KEY}")))
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_array() -> ZArray {
        ZArray::new(
            vec![10, 6],
            vec![4, 4],
            Dtype::Float32,
            Some(default_compressor()),
            None,
            json!("NaN"),
        )
    }

    #[test]
    fn test_codec_config_form() {
        let json = serde_json::to_value(default_compressor()).unwrap();
        assert_eq!(json, json!({"id": "zlib", "level": 1}));
        let shuffle: Codec =
            serde_json::from_value(json!({"id": "shuffle", "elementsize": 4})).unwrap();
        assert_eq!(shuffle, Codec::Shuffle { elementsize: 4 });
    }

    #[test]
    fn test_chunk_grid_rounds_up() {
        assert_eq!(sample_array().chunk_grid(), vec![3, 2]);
    }

    #[test]
    fn test_consolidated_keys() {
        let mut meta = Zmetadata::new();
        meta.insert_variable("tas", &sample_array(), json!({DIMENSION_KEY: ["time", "lat"]}));
        assert!(meta.key(GROUP_META_KEY).is_some());
        assert!(meta.key("tas/.zarray").is_some());
        assert_eq!(meta.variables(), vec!["tas".to_string()]);
        let array = meta.array_meta("tas").unwrap();
        assert_eq!(array.dtype().unwrap(), Dtype::Float32);
    }
}
