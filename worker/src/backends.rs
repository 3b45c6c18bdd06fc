//! Dataset readers, keyed by URL scheme.
//!
//! Real readers (netcdf, grib, object stores) plug in here; the crate
//! ships the seam plus a self-describing JSON reader used for wiring,
//! demos and tests. Paths without a scheme are treated as POSIX files.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use data_portal_core::{Codec, Dtype};

use crate::dataset::{Dataset, MemorySource, Variable};
use crate::error::WorkerError;

/// Open one dataset by uri, dispatching on its scheme.
pub fn open_dataset(path: &str) -> Result<Dataset, WorkerError> {
    let scheme = match path.split_once("://") {
        Some((scheme, _)) => scheme,
        None => "",
    };
    match scheme {
        "" | "file" => load_posix(path.trim_start_matches("file://")),
        other => Err(WorkerError::UnsupportedScheme(other.to_string())),
    }
}

/// On-disk form of a dataset: a JSON document describing variables with
/// their flat data.
#[derive(Deserialize)]
struct DatasetSpec {
    #[serde(default)]
    attrs: Map<String, Value>,
    variables: BTreeMap<String, VariableSpec>,
}

#[derive(Deserialize)]
struct VariableSpec {
    dims: Vec<String>,
    shape: Vec<u64>,
    #[serde(default)]
    chunks: Option<Vec<u64>>,
    dtype: String,
    #[serde(default)]
    attrs: Map<String, Value>,
    #[serde(default)]
    compressor: Option<Codec>,
    #[serde(default)]
    filters: Option<Vec<Codec>>,
    data: Vec<f64>,
}

fn load_posix(path: &str) -> Result<Dataset, WorkerError> {
    let raw = std::fs::read_to_string(path).map_err(|source| WorkerError::Io {
        path: path.to_string(),
        source,
    })?;
    let spec: DatasetSpec = serde_json::from_str(&raw)?;
    let mut variables = BTreeMap::new();
    for (name, var) in spec.variables {
        variables.insert(name.clone(), build_variable(&name, var)?);
    }
    Ok(Dataset { attrs: spec.attrs, variables })
}

fn build_variable(name: &str, spec: VariableSpec) -> Result<Variable, WorkerError> {
    let dtype: Dtype = spec
        .dtype
        .parse()
        .map_err(WorkerError::InvalidDataset)?;
    if spec.dims.len() != spec.shape.len() {
        return Err(WorkerError::InvalidDataset(format!(
            "{name}: {} dims for {} axes",
            spec.dims.len(),
            spec.shape.len()
        )));
    }
    let total: u64 = spec.shape.iter().product();
    if spec.data.len() as u64 != total {
        return Err(WorkerError::InvalidDataset(format!(
            "{name}: expected {total} values, got {}",
            spec.data.len()
        )));
    }
    let chunks = match spec.chunks {
        Some(chunks) if chunks.len() == spec.shape.len() && chunks.iter().all(|c| *c > 0) => {
            chunks
        }
        Some(_) => {
            return Err(WorkerError::InvalidDataset(format!(
                "{name}: invalid chunk tuple"
            )))
        }
        None => spec.shape.clone(),
    };
    let bytes = encode_values(dtype, &spec.data);
    let fill_value = spec.attrs.get("_FillValue").and_then(Value::as_f64);
    Ok(Variable {
        data: Arc::new(MemorySource::new(
            spec.shape.clone(),
            chunks.clone(),
            dtype.item_size(),
            bytes,
        )),
        dims: spec.dims,
        shape: spec.shape,
        chunks,
        dtype,
        attrs: spec.attrs,
        fill_value,
        compressor: spec.compressor,
        filters: spec.filters,
    })
}

fn encode_values(dtype: Dtype, values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * dtype.item_size());
    for v in values {
        match dtype {
            Dtype::Float64 => bytes.extend_from_slice(&v.to_le_bytes()),
            Dtype::Float32 => bytes.extend_from_slice(&(*v as f32).to_le_bytes()),
            Dtype::Int64 => bytes.extend_from_slice(&(*v as i64).to_le_bytes()),
            Dtype::Int32 => bytes.extend_from_slice(&(*v as i32).to_le_bytes()),
            Dtype::Int16 => bytes.extend_from_slice(&(*v as i16).to_le_bytes()),
            Dtype::Int8 => bytes.extend_from_slice(&(*v as i8).to_le_bytes()),
            Dtype::UInt8 | Dtype::Bool => bytes.push(*v as u8),
        }
    }
    bytes
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE_DATASET: &str = r#"{
        "attrs": {"Conventions": "CF-1.7", "source": "test"},
        "variables": {
            "tas": {
                "dims": ["time", "lat"],
                "shape": [4, 3],
                "chunks": [2, 2],
                "dtype": "<f4",
                "attrs": {"units": "K", "_FillValue": -9999.0},
                "data": [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]
            },
            "time": {
                "dims": ["time"],
                "shape": [4],
                "dtype": "<i8",
                "attrs": {"units": "days since 2000-01-01"},
                "data": [0, 1, 2, 3]
            }
        }
    }"#;

    pub(crate) fn write_sample(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("tas_day.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE_DATASET.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_open_posix_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let dataset = open_dataset(path.to_str().unwrap()).unwrap();
        assert_eq!(dataset.variables.len(), 2);
        let tas = &dataset.variables["tas"];
        assert_eq!(tas.shape, vec![4, 3]);
        assert_eq!(tas.chunks, vec![2, 2]);
        assert_eq!(tas.fill_value, Some(-9999.0));
        // unchunked variables default to one chunk spanning the shape
        assert_eq!(dataset.variables["time"].chunks, vec![4]);
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        match open_dataset("hsm://arch/foo.nc") {
            Err(WorkerError::UnsupportedScheme(scheme)) => assert_eq!(scheme, "hsm"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(
            &path,
            r#"{"variables": {"x": {"dims": ["a"], "shape": [3], "dtype": "<f8", "data": [1]}}}"#,
        )
        .unwrap();
        assert!(open_dataset(path.to_str().unwrap()).is_err());
    }
}
