use crate::{Error, Result};
use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use lzzzz::{lz4, lz4f};
use std::io::{self, Write};

fn size_mismatch(expected: usize, actual: usize) -> Error {
    Error::InvalidData(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("payload decompressed to {actual} bytes where {expected} were expected"),
    ))
}

fn codec_error<E: ToString>(err: E) -> Error {
    Error::InvalidData(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

/// Inflates a zlib stream into exactly `decompressed_len` bytes.
pub(crate) fn zlib_decompress(bytes: &[u8], decompressed_len: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::with_capacity(decompressed_len));
    decoder.write_all(bytes)?;
    let out = decoder.finish()?;
    if out.len() == decompressed_len {
        Ok(out)
    } else {
        Err(size_mismatch(decompressed_len, out.len()))
    }
}

/// Inflates a legacy payload whose first four bytes carry the decompressed
/// size of the zlib stream that follows.
pub(crate) fn zlib_decompress_prefixed(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < 4 {
        return Err(Error::InvalidData(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "compressed payload is missing its size prefix",
        )));
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&bytes[..4]);
    zlib_decompress(&bytes[4..], u32::from_le_bytes(prefix) as usize)
}

pub(crate) fn zlib_compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decodes a single LZ4 frame into exactly `decompressed_len` bytes.
pub(crate) fn lz4f_decompress(bytes: &[u8], decompressed_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(decompressed_len);
    lz4f::decompress_to_vec(bytes, &mut out).map_err(codec_error)?;
    if out.len() == decompressed_len {
        Ok(out)
    } else {
        Err(size_mismatch(decompressed_len, out.len()))
    }
}

/// Decodes an independent LZ4 block whose output length is known up front.
pub(crate) fn lz4_block_decompress(bytes: &[u8], decompressed_len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; decompressed_len];
    let written = lz4::decompress(bytes, &mut out).map_err(codec_error)?;
    if written == decompressed_len {
        Ok(out)
    } else {
        Err(size_mismatch(decompressed_len, written))
    }
}
