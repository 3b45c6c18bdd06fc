//! Aggregation of multi-file datasets.
//!
//! Members load on a bounded thread pool, then group by their dimension
//! and coordinate structure, merge variables within a group and
//! concatenate along the time dimension where coordinate sets match.
//! Anything that cannot be combined stays a separate dataset.

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::backends::open_dataset;
use crate::dataset::{copy_block, Dataset, MemorySource, Variable};
use crate::error::WorkerError;

/// The time dimension concatenation happens along.
const CONCAT_DIM: &str = "time";

/// Pool size for parallel member loading: `clamp(1, 2 * cpus - 1, N)`.
fn pool_threads(num_datasets: usize) -> usize {
    let num_threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        * 2
        - 1;
    num_threads.clamp(1, num_datasets.max(1))
}

/// Load all members in parallel; failed members are logged and skipped.
pub fn load_datasets(paths: &[String]) -> Vec<Dataset> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(pool_threads(paths.len()))
        .build();
    let load = |paths: &[String]| -> Vec<Dataset> {
        paths
            .par_iter()
            .filter_map(|path| match open_dataset(path) {
                Ok(dataset) => Some(dataset),
                Err(error) => {
                    warn!(path = path.as_str(), error = %error, "failed to load dataset");
                    None
                }
            })
            .collect()
    };
    match pool {
        Ok(pool) => pool.install(|| load(paths)),
        Err(_) => load(paths),
    }
}

type GroupKey = (Vec<(String, u64)>, Vec<String>);

fn group_key(dataset: &Dataset) -> GroupKey {
    (
        dataset.dims().into_iter().collect(),
        dataset.coord_names(),
    )
}

/// Group datasets by their dimension sizes and coordinate names.
fn group_datasets(datasets: Vec<Dataset>) -> BTreeMap<GroupKey, Vec<Dataset>> {
    let mut grouped: BTreeMap<GroupKey, Vec<Dataset>> = BTreeMap::new();
    for dataset in datasets {
        grouped.entry(group_key(&dataset)).or_default().push(dataset);
    }
    grouped
}

/// Merge the variables of one group into a single dataset.
///
/// A variable name showing up twice makes the group unmergeable; its
/// members are kept separate.
fn merge_group(group: Vec<Dataset>) -> Vec<Dataset> {
    if group.len() < 2 {
        return group;
    }
    let mut merged = Dataset {
        attrs: group[0].attrs.clone(),
        variables: BTreeMap::new(),
    };
    for dataset in &group {
        for (name, variable) in &dataset.variables {
            let duplicate_data =
                merged.variables.contains_key(name) && !variable.dims.contains(&name.to_string());
            if duplicate_data {
                warn!(variable = name.as_str(), "failed to merge datasets, keeping them apart");
                return group;
            }
            merged
                .variables
                .entry(name.clone())
                .or_insert_with(|| variable.clone());
        }
    }
    debug!(members = group.len(), "merged datasets into one");
    vec![merged]
}

/// Concatenate two variables along the time axis.
fn concat_variable(a: &Variable, b: &Variable) -> Result<Variable, WorkerError> {
    if a.dims != b.dims || a.dtype != b.dtype {
        return Err(WorkerError::InvalidDataset(
            "variables do not line up for concatenation".to_string(),
        ));
    }
    let axis = a
        .dims
        .iter()
        .position(|d| d == CONCAT_DIM)
        .ok_or_else(|| WorkerError::InvalidDataset("no time dimension".to_string()))?;
    for (d, (sa, sb)) in a.shape.iter().zip(&b.shape).enumerate() {
        if d != axis && sa != sb {
            return Err(WorkerError::InvalidDataset(
                "variables do not line up for concatenation".to_string(),
            ));
        }
    }
    let mut shape = a.shape.clone();
    shape[axis] += b.shape[axis];
    let itemsize = a.dtype.item_size();
    let total: u64 = shape.iter().product();
    let mut bytes = vec![0u8; total as usize * itemsize];
    let zeros = vec![0u64; shape.len()];
    let bytes_a = a.materialize()?;
    copy_block(&bytes_a, &a.shape, &zeros, &mut bytes, &shape, &zeros, &a.shape, itemsize);
    let mut origin = zeros.clone();
    origin[axis] = a.shape[axis];
    let bytes_b = b.materialize()?;
    copy_block(&bytes_b, &b.shape, &zeros, &mut bytes, &shape, &origin, &b.shape, itemsize);
    let chunks: Vec<u64> = a
        .chunks
        .iter()
        .zip(&shape)
        .map(|(c, s)| (*c).min(*s))
        .collect();
    Ok(Variable {
        data: std::sync::Arc::new(MemorySource::new(
            shape.clone(),
            chunks.clone(),
            itemsize,
            bytes,
        )),
        dims: a.dims.clone(),
        shape,
        chunks,
        dtype: a.dtype,
        attrs: a.attrs.clone(),
        fill_value: a.fill_value,
        compressor: a.compressor.clone(),
        filters: a.filters.clone(),
    })
}

fn concat_pair(a: &Dataset, b: &Dataset) -> Result<Dataset, WorkerError> {
    let mut variables = BTreeMap::new();
    for (name, variable) in &a.variables {
        let combined = if variable.dims.iter().any(|d| d == CONCAT_DIM) {
            let other = b
                .variables
                .get(name)
                .ok_or_else(|| WorkerError::InvalidDataset(format!("{name} missing")))?;
            concat_variable(variable, other)?
        } else {
            variable.clone()
        };
        variables.insert(name.clone(), combined);
    }
    Ok(Dataset { attrs: a.attrs.clone(), variables })
}

/// Concatenate datasets with matching coordinate sets along time.
fn concat_datasets(mut datasets: Vec<Dataset>) -> Vec<Dataset> {
    let mut finished = Vec::new();
    while let Some(mut current) = datasets.first().cloned() {
        datasets.remove(0);
        let coords = current.coord_names();
        let mut rest = Vec::new();
        for candidate in datasets {
            if candidate.coord_names() == coords {
                match concat_pair(&current, &candidate) {
                    Ok(combined) => {
                        debug!("concatenated datasets along the time dimension");
                        current = combined;
                    }
                    Err(error) => {
                        warn!(error = %error, "failed to concatenate datasets");
                        finished.push(candidate);
                    }
                }
            } else {
                rest.push(candidate);
            }
        }
        datasets = rest;
        finished.push(current);
    }
    finished
}

/// Reduce a list of datasets to the minimal set of aggregates.
pub fn aggregate(datasets: Vec<Dataset>) -> Vec<Dataset> {
    debug!(members = datasets.len(), "starting dataset aggregation");
    let merged: Vec<Dataset> = group_datasets(datasets)
        .into_values()
        .flat_map(merge_group)
        .collect();
    let aggregated = concat_datasets(merged);
    debug!(aggregates = aggregated.len(), "aggregation complete");
    aggregated
}

/// Load a multi-file dataset and aggregate it down to one dataset.
pub fn load_and_aggregate(paths: &[String]) -> Result<Dataset, WorkerError> {
    let datasets = load_datasets(paths);
    if datasets.is_empty() {
        return Err(WorkerError::InvalidDataset(
            "none of the dataset members could be loaded".to_string(),
        ));
    }
    let mut aggregated = aggregate(datasets);
    if aggregated.len() > 1 {
        warn!(
            aggregates = aggregated.len(),
            "dataset members could not be fully aggregated, serving the first aggregate"
        );
    }
    Ok(aggregated.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::Arc;

    use data_portal_core::Dtype;

    fn i32_bytes(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn time_series(name: &str, times: &[i32]) -> Dataset {
        let len = times.len() as u64;
        let mut variables = BTreeMap::new();
        variables.insert(
            "time".to_string(),
            Variable {
                dims: vec!["time".to_string()],
                shape: vec![len],
                chunks: vec![len],
                dtype: Dtype::Int32,
                attrs: Map::new(),
                fill_value: None,
                compressor: None,
                filters: None,
                data: Arc::new(MemorySource::new(vec![len], vec![len], 4, i32_bytes(times))),
            },
        );
        variables.insert(
            name.to_string(),
            Variable {
                dims: vec!["time".to_string()],
                shape: vec![len],
                chunks: vec![len],
                dtype: Dtype::Int32,
                attrs: Map::new(),
                fill_value: None,
                compressor: None,
                filters: None,
                data: Arc::new(MemorySource::new(
                    vec![len],
                    vec![len],
                    4,
                    i32_bytes(&times.iter().map(|t| t * 10).collect::<Vec<_>>()),
                )),
            },
        );
        Dataset { attrs: Map::new(), variables }
    }

    #[test]
    fn test_concat_along_time() {
        let combined = concat_pair(
            &time_series("tas", &[0, 1]),
            &time_series("tas", &[2, 3]),
        )
        .unwrap();
        let tas = &combined.variables["tas"];
        assert_eq!(tas.shape, vec![4]);
        assert_eq!(tas.materialize().unwrap(), i32_bytes(&[0, 10, 20, 30]));
    }

    #[test]
    fn test_aggregate_concatenates_same_coords() {
        let aggregated = aggregate(vec![
            time_series("tas", &[0, 1]),
            time_series("tas", &[2, 3]),
        ]);
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].variables["time"].shape, vec![4]);
    }

    #[test]
    fn test_merge_different_variables_same_grid() {
        let merged = aggregate(vec![
            time_series("tas", &[0, 1]),
            time_series("pr", &[0, 1]),
        ]);
        // same dims and coords: variables merge onto one grid
        assert_eq!(merged.len(), 1);
        assert!(merged[0].variables.contains_key("tas"));
        assert!(merged[0].variables.contains_key("pr"));
    }

    #[test]
    fn test_different_lengths_concat_across_groups() {
        let aggregated = aggregate(vec![
            time_series("tas", &[0, 1]),
            time_series("tas", &[2, 3, 4]),
        ]);
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].variables["time"].shape, vec![5]);
    }

    #[test]
    fn test_colliding_data_variables_stay_separate() {
        let a = time_series("tas", &[0, 1]);
        let mut b = time_series("tas", &[0, 1]);
        b.attrs.insert("member".to_string(), serde_json::json!("r2"));
        // identical grids with the same data variable cannot merge; concat
        // still combines them along time afterwards
        let aggregated = aggregate(vec![a, b]);
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].variables["tas"].shape, vec![4]);
    }

    #[test]
    fn test_pool_threads_bounds() {
        assert_eq!(pool_threads(0), 1);
        assert_eq!(pool_threads(1), 1);
        assert!(pool_threads(64) >= 1);
    }
}
