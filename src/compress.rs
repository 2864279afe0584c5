//! LZ4 payload compression with an acceptance gate.
//!
//! Inner packets are compressed opportunistically: tiny payloads and
//! payloads that barely shrink (already-compressed or encrypted traffic)
//! travel verbatim, signalled by the compressed flag in the record header.
//! The LZ4 *frame* format is used so the receiver can decode without an
//! out-of-band length.

use std::borrow::Cow;
use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::error::{Error, Result};

/// Payloads below this size are never compressed.
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Compressed/original ratio at or above which compression is discarded
/// (0.9 = require at least 10% savings).
pub const MAX_ACCEPT_RATIO: f64 = 0.9;

/// Compress a payload, returning the bytes to send and the compressed flag.
///
/// The input is passed through unchanged when it is below
/// [`MIN_COMPRESS_SIZE`] or when LZ4 fails to shave off at least 10%.
pub fn compress(data: &[u8]) -> Result<(Cow<'_, [u8]>, bool)> {
    if data.len() < MIN_COMPRESS_SIZE {
        return Ok((Cow::Borrowed(data), false));
    }

    let mut encoder = FrameEncoder::new(Vec::with_capacity(data.len() / 2));
    encoder
        .write_all(data)
        .map_err(|e| Error::compression(format!("lz4 encode failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::compression(format!("lz4 finish failed: {e}")))?;

    let ratio = compressed.len() as f64 / data.len() as f64;
    if ratio >= MAX_ACCEPT_RATIO {
        return Ok((Cow::Borrowed(data), false));
    }

    Ok((Cow::Owned(compressed), true))
}

/// Undo [`compress`] according to the received flag.
///
/// A flagged payload must be a complete LZ4 frame; decoding it to zero
/// bytes is an error, since no inner IP packet is empty.
pub fn decompress(data: &[u8], compressed: bool) -> Result<Cow<'_, [u8]>> {
    if !compressed {
        return Ok(Cow::Borrowed(data));
    }

    let mut out = Vec::with_capacity(data.len() * 2);
    FrameDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::compression(format!("lz4 decode failed: {e}")))?;

    if out.is_empty() {
        return Err(Error::compression("decompressed to zero bytes"));
    }

    Ok(Cow::Owned(out))
}
