//! Chunk encoding: edge padding, filters and compression.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use data_portal_core::{Codec, Dtype};

use crate::dataset::{copy_block, Block};
use crate::error::WorkerError;

/// Pad an incomplete edge block to the declared chunk shape.
///
/// The original data lands in the leading slice of every axis; the rest is
/// the variable's fill value.
pub fn pad_block(block: Block, chunk_shape: &[u64], dtype: Dtype, fill: &serde_json::Value) -> Vec<u8> {
    if block.shape == chunk_shape {
        return block.bytes;
    }
    let itemsize = dtype.item_size();
    let total: u64 = chunk_shape.iter().product();
    let fill_bytes = dtype.fill_bytes(fill);
    let mut padded = Vec::with_capacity(total as usize * itemsize);
    for _ in 0..total {
        padded.extend_from_slice(&fill_bytes);
    }
    let zeros = vec![0u64; block.shape.len()];
    copy_block(
        &block.bytes,
        &block.shape,
        &zeros,
        &mut padded,
        chunk_shape,
        &zeros,
        &block.shape,
        itemsize,
    );
    padded
}

fn apply_codec(codec: &Codec, bytes: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
    match codec {
        Codec::Zlib { level } => {
            let mut encoder =
                ZlibEncoder::new(Vec::new(), Compression::new((*level).min(9)));
            encoder
                .write_all(&bytes)
                .and_then(|_| encoder.finish())
                .map_err(|error| WorkerError::InvalidDataset(format!("zlib: {error}")))
        }
        Codec::Shuffle { elementsize } => Ok(shuffle(&bytes, (*elementsize).max(1))),
    }
}

/// Byte shuffle: transpose the element/byte matrix so same-significance
/// bytes become adjacent, which compresses better.
fn shuffle(bytes: &[u8], elementsize: usize) -> Vec<u8> {
    if elementsize <= 1 || bytes.len() % elementsize != 0 {
        return bytes.to_vec();
    }
    let count = bytes.len() / elementsize;
    let mut out = vec![0u8; bytes.len()];
    for (i, element) in bytes.chunks_exact(elementsize).enumerate() {
        for (j, byte) in element.iter().enumerate() {
            out[j * count + i] = *byte;
        }
    }
    out
}

/// Run a chunk through its filters in order, then the compressor.
pub fn encode_chunk(
    bytes: Vec<u8>,
    filters: Option<&[Codec]>,
    compressor: Option<&Codec>,
) -> Result<Vec<u8>, WorkerError> {
    let mut bytes = bytes;
    for filter in filters.unwrap_or_default() {
        bytes = apply_codec(filter, bytes)?;
    }
    match compressor {
        Some(codec) => apply_codec(codec, bytes),
        None => Ok(bytes),
    }
}
