//! Block compression back ends.
//!
//! The table builder tries the configured codec and stores the block
//! uncompressed when compression does not pay for itself; readers dispatch
//! on the type byte in the block trailer.

use crate::config::CompressionType;
use crate::error::{Error, Result};

pub fn compress(ctype: CompressionType, level: i32, raw: &[u8]) -> Result<Vec<u8>> {
    match ctype {
        CompressionType::None => Ok(raw.to_vec()),
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(raw)
            .map_err(|e| Error::io(format!("snappy compress: {e}"))),
        CompressionType::Zstd => zstd::stream::encode_all(raw, level)
            .map_err(|e| Error::io(format!("zstd compress: {e}"))),
    }
}

pub fn decompress(ctype: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match ctype {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|_| Error::corruption("corrupted snappy compressed block")),
        CompressionType::Zstd => zstd::stream::decode_all(data)
            .map_err(|_| Error::corruption("corrupted zstd compressed block")),
    }
}
