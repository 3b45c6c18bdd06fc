//! The dataset model behind the pluggable `open_dataset` seam.
//!
//! A dataset is a set of named variables with dimensions, attributes and a
//! lazy chunk index. Readers produce this model; everything downstream
//! (metadata derivation, chunk encoding, aggregation) only sees it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use data_portal_core::{Codec, Dtype};

use crate::error::WorkerError;

/// One block of raw array data, row major, little endian.
pub struct Block {
    /// Actual extent of the block; edge blocks may be smaller than the
    /// declared chunk shape.
    pub shape: Vec<u64>,
    pub bytes: Vec<u8>,
}

/// Lazy access to the blocks of one variable.
pub trait ChunkSource: Send + Sync {
    /// Read the block at the given grid indices.
    fn read_block(&self, indices: &[u64]) -> Result<Block, WorkerError>;
}

/// A named array with its metadata and a lazy chunk index.
#[derive(Clone)]
pub struct Variable {
    pub dims: Vec<String>,
    pub shape: Vec<u64>,
    /// Native chunk tuple; equals `shape` for unchunked data.
    pub chunks: Vec<u64>,
    pub dtype: Dtype,
    pub attrs: Map<String, Value>,
    pub fill_value: Option<f64>,
    pub compressor: Option<Codec>,
    pub filters: Option<Vec<Codec>>,
    pub data: Arc<dyn ChunkSource>,
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("dims", &self.dims)
            .field("shape", &self.shape)
            .field("chunks", &self.chunks)
            .field("dtype", &self.dtype)
            .field("attrs", &self.attrs)
            .field("fill_value", &self.fill_value)
            .field("compressor", &self.compressor)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

impl Variable {
    /// Number of blocks along every axis.
    pub fn chunk_grid(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(s, c)| if *c == 0 { 0 } else { s.div_ceil(*c) })
            .collect()
    }

    /// Extent of the block at `indices`, clipped at the array bounds.
    pub fn block_extent(&self, indices: &[u64]) -> Result<Vec<u64>, WorkerError> {
        if indices.len() != self.shape.len() {
            return Err(WorkerError::InvalidChunk(format!(
                "expected {} indices, got {}",
                self.shape.len(),
                indices.len()
            )));
        }
        indices
            .iter()
            .zip(self.shape.iter().zip(&self.chunks))
            .map(|(idx, (size, chunk))| {
                let start = idx * chunk;
                if start >= *size {
                    Err(WorkerError::InvalidChunk(format!(
                        "block index {idx} out of range"
                    )))
                } else {
                    Ok((size - start).min(*chunk))
                }
            })
            .collect()
    }

    /// Assemble the full array from its blocks.
    pub fn materialize(&self) -> Result<Vec<u8>, WorkerError> {
        let itemsize = self.dtype.item_size();
        let total: u64 = self.shape.iter().product();
        let mut full = vec![0u8; total as usize * itemsize];
        for indices in grid_indices(&self.chunk_grid()) {
            let block = self.data.read_block(&indices)?;
            let origin: Vec<u64> = indices
                .iter()
                .zip(&self.chunks)
                .map(|(i, c)| i * c)
                .collect();
            copy_block(
                &block.bytes,
                &block.shape,
                &vec![0; block.shape.len()],
                &mut full,
                &self.shape,
                &origin,
                &block.shape,
                itemsize,
            );
        }
        Ok(full)
    }
}

/// A dataset of named variables plus global attributes.
#[derive(Clone, Debug)]
pub struct Dataset {
    pub attrs: Map<String, Value>,
    pub variables: BTreeMap<String, Variable>,
}

impl Dataset {
    /// Dimension name → size over all variables.
    pub fn dims(&self) -> BTreeMap<String, u64> {
        let mut dims = BTreeMap::new();
        for variable in self.variables.values() {
            for (dim, size) in variable.dims.iter().zip(&variable.shape) {
                dims.insert(dim.clone(), *size);
            }
        }
        dims
    }

    /// Names of coordinate variables (variables indexed by themselves).
    pub fn coord_names(&self) -> Vec<String> {
        self.variables
            .iter()
            .filter(|(name, variable)| variable.dims == [name.to_string()])
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// All index tuples of a block grid, row-major order.
pub fn grid_indices(grid: &[u64]) -> Vec<Vec<u64>> {
    let mut out = vec![vec![]];
    for axis_len in grid {
        let mut next = Vec::new();
        for prefix in &out {
            for i in 0..*axis_len {
                let mut indices = prefix.clone();
                indices.push(i);
                next.push(indices);
            }
        }
        out = next;
    }
    out
}

fn element_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Copy an n-dimensional sub-block between row-major byte buffers.
///
/// `extent` elements starting at `src_origin` in `src` are written to
/// `dst_origin` in `dst`. Scalars (`ndim == 0`) copy one element.
#[allow(clippy::too_many_arguments)]
pub fn copy_block(
    src: &[u8],
    src_shape: &[u64],
    src_origin: &[u64],
    dst: &mut [u8],
    dst_shape: &[u64],
    dst_origin: &[u64],
    extent: &[u64],
    itemsize: usize,
) {
    let ndim = extent.len();
    if ndim == 0 {
        dst[..itemsize].copy_from_slice(&src[..itemsize]);
        return;
    }
    let src_strides = element_strides(src_shape);
    let dst_strides = element_strides(dst_shape);
    let run = extent[ndim - 1] as usize * itemsize;
    let outer: Vec<u64> = extent[..ndim - 1].to_vec();
    for idx in grid_indices(&outer) {
        let mut src_off = src_origin[ndim - 1];
        let mut dst_off = dst_origin[ndim - 1];
        for d in 0..ndim - 1 {
            src_off += (src_origin[d] + idx[d]) * src_strides[d];
            dst_off += (dst_origin[d] + idx[d]) * dst_strides[d];
        }
        let src_start = src_off as usize * itemsize;
        let dst_start = dst_off as usize * itemsize;
        dst[dst_start..dst_start + run].copy_from_slice(&src[src_start..src_start + run]);
    }
}

/// An in-memory chunk source over one contiguous row-major buffer.
pub struct MemorySource {
    shape: Vec<u64>,
    chunks: Vec<u64>,
    itemsize: usize,
    bytes: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(shape: Vec<u64>, chunks: Vec<u64>, itemsize: usize, bytes: Vec<u8>) -> Self {
        Self { shape, chunks, itemsize, bytes: Arc::new(bytes) }
    }
}

impl ChunkSource for MemorySource {
    fn read_block(&self, indices: &[u64]) -> Result<Block, WorkerError> {
        if indices.len() != self.shape.len() {
            return Err(WorkerError::InvalidChunk(format!(
                "expected {} indices, got {}",
                self.shape.len(),
                indices.len()
            )));
        }
        let origin: Vec<u64> = indices.iter().zip(&self.chunks).map(|(i, c)| i * c).collect();
        let extent: Vec<u64> = origin
            .iter()
            .zip(self.shape.iter().zip(&self.chunks))
            .map(|(start, (size, chunk))| {
                if start >= size {
                    Err(WorkerError::InvalidChunk("block index out of range".to_string()))
                } else {
                    Ok((size - start).min(*chunk))
                }
            })
            .collect::<Result<_, _>>()?;
        let total: u64 = extent.iter().product();
        let mut bytes = vec![0u8; total as usize * self.itemsize];
        copy_block(
            &self.bytes,
            &self.shape,
            &origin,
            &mut bytes,
            &extent,
            &vec![0; extent.len()],
            &extent,
            self.itemsize,
        );
        Ok(Block { shape: extent, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub(crate) fn sample_variable() -> Variable {
        // 4x3 array, chunked 2x2, values 0..12
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        Variable {
            dims: vec!["time".to_string(), "lat".to_string()],
            shape: vec![4, 3],
            chunks: vec![2, 2],
            dtype: Dtype::Float32,
            attrs: Map::from_iter([("units".to_string(), json!("K"))]),
            fill_value: None,
            compressor: None,
            filters: None,
            data: Arc::new(MemorySource::new(
                vec![4, 3],
                vec![2, 2],
                4,
                f32_bytes(&values),
            )),
        }
    }

    #[test]
    fn test_grid_indices_row_major() {
        assert_eq!(
            grid_indices(&[2, 2]),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert_eq!(grid_indices(&[]), vec![Vec::<u64>::new()]);
    }

    #[test]
    fn test_chunk_grid_and_edge_extent() {
        let variable = sample_variable();
        assert_eq!(variable.chunk_grid(), vec![2, 2]);
        assert_eq!(variable.block_extent(&[0, 0]).unwrap(), vec![2, 2]);
        assert_eq!(variable.block_extent(&[1, 1]).unwrap(), vec![2, 1]);
        assert!(variable.block_extent(&[2, 0]).is_err());
    }

    #[test]
    fn test_read_interior_block() {
        let variable = sample_variable();
        let block = variable.data.read_block(&[0, 0]).unwrap();
        assert_eq!(block.shape, vec![2, 2]);
        // rows 0..2, cols 0..2 of a 4x3 array: 0,1,3,4
        assert_eq!(block.bytes, f32_bytes(&[0.0, 1.0, 3.0, 4.0]));
    }

    #[test]
    fn test_read_edge_block_is_clipped() {
        let variable = sample_variable();
        let block = variable.data.read_block(&[1, 1]).unwrap();
        assert_eq!(block.shape, vec![2, 1]);
        // rows 2..4, col 2: 8, 11
        assert_eq!(block.bytes, f32_bytes(&[8.0, 11.0]));
    }

    #[test]
    fn test_materialize_round_trips() {
        let variable = sample_variable();
        let full = variable.materialize().unwrap();
        assert_eq!(full, f32_bytes(&(0..12).map(|v| v as f32).collect::<Vec<_>>()));
    }

    #[test]
    fn test_coord_names() {
        let mut variables = BTreeMap::new();
        variables.insert("tas".to_string(), sample_variable());
        let mut time = sample_variable();
        time.dims = vec!["time".to_string()];
        time.shape = vec![4];
        time.chunks = vec![4];
        variables.insert("time".to_string(), time);
        let dataset = Dataset { attrs: Map::new(), variables };
        assert_eq!(dataset.coord_names(), vec!["time".to_string()]);
        assert_eq!(dataset.dims()["lat"], 3);
    }
}
