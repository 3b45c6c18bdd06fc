//! Derivation of consolidated store metadata from an opened dataset.

use serde_json::{json, Value};

use data_portal_core::zmeta::{default_compressor, DIMENSION_KEY};
use data_portal_core::{ZArray, Zmetadata};

use crate::dataset::Dataset;
use crate::error::WorkerError;

/// Build the consolidated descriptor of a dataset.
///
/// Per variable: `.zattrs` carries the attributes minus `_FillValue` plus
/// `_ARRAY_DIMENSIONS`; `.zarray` carries shape, the native chunk tuple,
/// the dtype string, the compressor (default when unset), filters and the
/// encoded fill value.
pub fn create_zmetadata(dataset: &Dataset) -> Result<(Zmetadata, Value), WorkerError> {
    let mut meta = Zmetadata::new();
    meta.set_group_attrs(Value::Object(dataset.attrs.clone()));
    for (name, variable) in &dataset.variables {
        let mut zattrs = variable.attrs.clone();
        zattrs.remove("_FillValue");
        zattrs.insert(DIMENSION_KEY.to_string(), json!(variable.dims));
        let zarray = ZArray::new(
            variable.shape.clone(),
            variable.chunks.clone(),
            variable.dtype,
            variable
                .compressor
                .clone()
                .or_else(|| Some(default_compressor())),
            variable.filters.clone(),
            variable.dtype.encode_fill_value(variable.fill_value),
        );
        meta.insert_variable(name, &zarray, Value::Object(zattrs));
    }
    let json_meta = serde_json::to_value(&meta)
        .map_err(|error| WorkerError::InvalidDataset(error.to_string()))?;
    Ok((meta, json_meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::open_dataset;
    use data_portal_core::Dtype;

    fn sample() -> Dataset {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::backends::tests::write_sample(dir.path());
        open_dataset(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_consolidated_keys_per_variable() {
        let (meta, json_meta) = create_zmetadata(&sample()).unwrap();
        for key in ["tas/.zarray", "tas/.zattrs", "time/.zarray", ".zgroup", ".zattrs"] {
            assert!(meta.key(key).is_some(), "missing {key}");
            assert!(json_meta["metadata"][key].is_object(), "missing {key} in json");
        }
    }

    #[test]
    fn test_fill_value_moves_to_zarray() {
        let (meta, _) = create_zmetadata(&sample()).unwrap();
        let zattrs = meta.key("tas/.zattrs").unwrap();
        assert!(zattrs.get("_FillValue").is_none());
        let zarray = meta.array_meta("tas").unwrap();
        assert_eq!(zarray.fill_value, serde_json::json!(-9999.0));
    }

    #[test]
    fn test_dimensions_attribute() {
        let (meta, _) = create_zmetadata(&sample()).unwrap();
        let zattrs = meta.key("tas/.zattrs").unwrap();
        assert_eq!(zattrs[DIMENSION_KEY], serde_json::json!(["time", "lat"]));
    }

    #[test]
    fn test_default_compressor_applied() {
        let (meta, _) = create_zmetadata(&sample()).unwrap();
        let zarray = meta.array_meta("tas").unwrap();
        assert_eq!(zarray.compressor, Some(default_compressor()));
        assert_eq!(zarray.dtype().unwrap(), Dtype::Float32);
        assert_eq!(zarray.order, "C");
        assert_eq!(zarray.zarr_format, 2);
    }
}
