//! # Command Compression
//!
//! Compressed commands carry a 9-byte header ahead of the data:
//!
//! ```text
//! +----------+----------------+-----------------------+
//! | flags u8 | total_len u32  | decompressed_len u32  |
//! +----------+----------------+-----------------------+
//! ```
//!
//! Lengths are little-endian; `total_len` includes the header. Flag bit 0
//! selects raw DEFLATE, otherwise the bytes are stored as is. Stored output
//! is used whenever DEFLATE does not shrink the input.
//!
//! Both directions write into caller-sized buffers. Size them with
//! [`compressed_size`] and [`decompressed_size`].

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::CompressionError;

pub const HEADER_SIZE: usize = 9;

/// Slack added to both buffer size estimates.
const SIZE_MARGIN: usize = 400;
const FLAG_DEFLATE: u8 = 0x01;

/// Output buffer size sufficient to compress `len` input bytes.
#[inline]
pub fn compressed_size(len: usize) -> usize {
    (len + SIZE_MARGIN).max(24)
}

/// Output buffer size sufficient to decompress `payload`, or 0 when the
/// payload is too short to carry a header.
pub fn decompressed_size(payload: &[u8]) -> usize {
    match read_header(payload) {
        Some(header) => header.decompressed_len + SIZE_MARGIN,
        None => 0,
    }
}

struct Header {
    flags: u8,
    total_len: usize,
    decompressed_len: usize,
}

fn read_header(payload: &[u8]) -> Option<Header> {
    if payload.len() < HEADER_SIZE {
        return None;
    }
    let total_len = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let decompressed_len = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
    Some(Header {
        flags: payload[0],
        total_len: total_len as usize,
        decompressed_len: decompressed_len as usize,
    })
}

fn write_header(out: &mut [u8], flags: u8, total_len: usize, decompressed_len: usize) {
    out[0] = flags;
    out[1..5].copy_from_slice(&(total_len as u32).to_le_bytes());
    out[5..9].copy_from_slice(&(decompressed_len as u32).to_le_bytes());
}

// ─── Compress ───────────────────────────────────────────────────────────────

/// Compress `input` into `output`, returning the number of bytes written.
pub fn compress(input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {
    let required = compressed_size(input.len());
    if output.len() < required {
        return Err(CompressionError::BufferTooSmall {
            available: output.len(),
            required,
        });
    }

    let mut deflater = Compress::new(Compression::fast(), false);
    let status = deflater
        .compress(input, &mut output[HEADER_SIZE..], FlushCompress::Finish)
        .map_err(|e| CompressionError::Codec(e.to_string()))?;

    let deflated = deflater.total_out() as usize;
    let written = if status == Status::StreamEnd && deflated < input.len() {
        write_header(output, FLAG_DEFLATE, HEADER_SIZE + deflated, input.len());
        HEADER_SIZE + deflated
    } else {
        output[HEADER_SIZE..HEADER_SIZE + input.len()].copy_from_slice(input);
        write_header(output, 0, HEADER_SIZE + input.len(), input.len());
        HEADER_SIZE + input.len()
    };

    assert!(written <= output.len(), "compressor overran its output buffer");
    Ok(written)
}

/// Allocating wrapper around [`compress`].
pub fn compress_to_vec(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut out = vec![0u8; compressed_size(input.len())];
    let len = compress(input, &mut out)?;
    out.truncate(len);
    Ok(out)
}

// ─── Decompress ─────────────────────────────────────────────────────────────

/// Decompress `input` into `output`, returning the decompressed length.
pub fn decompress(input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {
    let header = read_header(input).ok_or(CompressionError::TooShort(input.len()))?;
    if header.total_len != input.len() {
        return Err(CompressionError::LengthMismatch {
            declared: header.total_len,
            actual: input.len(),
        });
    }
    if output.len() < header.decompressed_len {
        return Err(CompressionError::BufferTooSmall {
            available: output.len(),
            required: header.decompressed_len,
        });
    }

    let data = &input[HEADER_SIZE..];

    if header.flags & FLAG_DEFLATE == 0 {
        let target = &mut output[..header.decompressed_len];
        if data.len() != target.len() {
            return Err(CompressionError::LengthMismatch {
                declared: header.decompressed_len,
                actual: data.len(),
            });
        }
        target.copy_from_slice(data);
        return Ok(header.decompressed_len);
    }

    let mut inflater = Decompress::new(false);
    let status = inflater
        .decompress(data, output, FlushDecompress::Finish)
        .map_err(|e| CompressionError::Codec(e.to_string()))?;
    let produced = inflater.total_out() as usize;
    if status != Status::StreamEnd || produced != header.decompressed_len {
        return Err(CompressionError::Codec(format!(
            "stream ended after {produced} of {} bytes",
            header.decompressed_len
        )));
    }
    Ok(produced)
}

/// Decompress into a fresh buffer, rejecting payloads that declare more than
/// `max_size` bytes before allocating.
pub fn decompress_to_vec(input: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
    let size = decompressed_size(input);
    if size == 0 {
        return Err(CompressionError::TooShort(input.len()));
    }
    if size > max_size {
        return Err(CompressionError::TooLarge {
            declared: size,
            max: max_size,
        });
    }
    let mut out = vec![0u8; size];
    let len = decompress(input, &mut out)?;
    out.truncate(len);
    Ok(out)
}
