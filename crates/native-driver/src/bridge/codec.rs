//! Framed codec for driver communication.
//!
//! Uses AnyDelimiterCodec for newline framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplex streams, etc).
//!
//! Lines are framed as raw bytes, so the framing never fails on content.
//! Decoding keeps going past bad lines: a line that is not a valid message
//! (including one that is not UTF-8) is surfaced as [`Frame::Invalid`] instead
//! of failing the stream, so the caller decides how to classify it and the
//! next line is still readable.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

/// Longest prefix of an offending line kept for diagnostics.
const MAX_REPORTED_LINE: usize = 256;

/// One decoded line.
#[derive(Debug)]
pub enum Frame<T> {
    Valid(T),
    Invalid {
        line: String,
        error: serde_json::Error,
    },
}

/// Codec that frames messages by newline and serializes with JSON.
///
/// Wraps AnyDelimiterCodec and adds serde_json serialization. Lines are
/// unbounded: the only limit on reading is the caller's deadline.
pub struct JsonLinesCodec<T> {
    inner: AnyDelimiterCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec()),
            _phantom: PhantomData,
        }
    }
}

fn frame_from_line<T: DeserializeOwned>(line: &[u8]) -> Frame<T> {
    match serde_json::from_slice(line) {
        Ok(item) => Frame::Valid(item),
        Err(error) => Frame::Invalid {
            line: reported_line(line),
            error,
        },
    }
}

/// Lossy, truncated rendering of a bad line for logs and errors.
fn reported_line(line: &[u8]) -> String {
    let prefix = &line[..line.len().min(MAX_REPORTED_LINE)];
    let mut line = String::from_utf8_lossy(prefix).into_owned();
    truncate_on_char_boundary(&mut line, MAX_REPORTED_LINE);
    line
}

fn truncate_on_char_boundary(line: &mut String, max: usize) {
    if line.len() <= max {
        return;
    }
    let cut = (0..=max)
        .rev()
        .find(|&i| line.is_char_boundary(i))
        .unwrap_or(0);
    line.truncate(cut);
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Frame<T>;
    type Error = AnyDelimiterCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(|line| frame_from_line(&line)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode_eof(src)?.map(|line| frame_from_line(&line)))
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = AnyDelimiterCodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(json, dst)
    }
}
