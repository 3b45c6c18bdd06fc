//! Integration tests for the load pipeline: open a dataset, derive its
//! store metadata, and materialize chunks the way a worker would.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;

use data_portal_worker::aggregator::load_and_aggregate;
use data_portal_worker::backends::open_dataset;
use data_portal_worker::codec::{encode_chunk, pad_block};
use data_portal_worker::zmeta::create_zmetadata;

const UA_DATASET: &str = r#"{
    "attrs": {"Conventions": "CF-1.7", "experiment": "amip"},
    "variables": {
        "ua": {
            "dims": ["time", "plev", "lat", "lon"],
            "shape": [2, 2, 3, 3],
            "chunks": [1, 2, 2, 2],
            "dtype": "<f4",
            "attrs": {"units": "m s-1", "_FillValue": -9999.0},
            "data": [
                0, 1, 2, 3, 4, 5, 6, 7, 8,
                9, 10, 11, 12, 13, 14, 15, 16, 17,
                18, 19, 20, 21, 22, 23, 24, 25, 26,
                27, 28, 29, 30, 31, 32, 33, 34, 35
            ]
        }
    }
}"#;

fn time_slice(path: &Path, name: &str, times: &[i64]) -> PathBuf {
    let data: Vec<String> = times.iter().map(|t| t.to_string()).collect();
    let tas: Vec<String> = times.iter().map(|t| (t * 10).to_string()).collect();
    let doc = format!(
        r#"{{
            "variables": {{
                "time": {{"dims": ["time"], "shape": [{len}], "dtype": "<i8",
                          "data": [{time}]}},
                "tas": {{"dims": ["time"], "shape": [{len}], "dtype": "<f8",
                         "data": [{tas}]}}
            }}
        }}"#,
        len = times.len(),
        time = data.join(","),
        tas = tas.join(","),
    );
    let file = path.join(name);
    std::fs::write(&file, doc).unwrap();
    file
}

#[test]
fn test_zmetadata_contains_variable_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ua_day.json");
    std::fs::write(&path, UA_DATASET).unwrap();

    let dataset = open_dataset(path.to_str().unwrap()).unwrap();
    let (_, json_meta) = create_zmetadata(&dataset).unwrap();

    let metadata = json_meta["metadata"].as_object().unwrap();
    assert!(metadata.contains_key("ua/.zarray"));
    assert!(metadata.contains_key("ua/.zattrs"));
    let zarray = &metadata["ua/.zarray"];
    assert_eq!(zarray["shape"], serde_json::json!([2, 2, 3, 3]));
    assert_eq!(zarray["chunks"], serde_json::json!([1, 2, 2, 2]));
    assert_eq!(zarray["zarr_format"], 2);
    assert_eq!(zarray["order"], "C");
    assert_eq!(zarray["compressor"]["id"], "zlib");
    assert_eq!(zarray["fill_value"], serde_json::json!(-9999.0));
}

#[test]
fn test_chunk_bytes_decode_to_declared_chunk_shape() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ua_day.json");
    std::fs::write(&path, UA_DATASET).unwrap();

    let dataset = open_dataset(path.to_str().unwrap()).unwrap();
    let ua = &dataset.variables["ua"];

    // edge block: lat and lon are clipped to one element each
    let block = ua.data.read_block(&[0, 0, 1, 1]).unwrap();
    assert_eq!(block.shape, vec![1, 2, 1, 1]);

    let fill = ua.dtype.encode_fill_value(ua.fill_value);
    let padded = pad_block(block, &ua.chunks, ua.dtype, &fill);
    let encoded = encode_chunk(
        padded.clone(),
        ua.filters.as_deref(),
        Some(&data_portal_core::zmeta::default_compressor()),
    )
    .unwrap();

    let mut decoded = Vec::new();
    ZlibDecoder::new(encoded.as_slice())
        .read_to_end(&mut decoded)
        .unwrap();
    let declared: u64 = ua.chunks.iter().product();
    assert_eq!(decoded.len() as u64, declared * 4);
    assert_eq!(decoded, padded);

    // data sits in the leading slice, fill everywhere else
    let values: Vec<f32> = decoded
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    assert_eq!(values[0], 8.0);
    assert_eq!(values[1], -9999.0);
    assert_eq!(values[4], 17.0);
}

#[test]
fn test_multi_file_dataset_aggregates_along_time() {
    let dir = tempfile::tempdir().unwrap();
    let first = time_slice(dir.path(), "tas_2000.json", &[0, 1]);
    let second = time_slice(dir.path(), "tas_2001.json", &[2, 3]);

    let aggregated = load_and_aggregate(&[
        first.to_str().unwrap().to_string(),
        second.to_str().unwrap().to_string(),
    ])
    .unwrap();
    assert_eq!(aggregated.variables["time"].shape, vec![4]);
    assert_eq!(aggregated.variables["tas"].shape, vec![4]);

    let (meta, _) = create_zmetadata(&aggregated).unwrap();
    assert_eq!(meta.array_meta("tas").unwrap().shape, vec![4]);
}
