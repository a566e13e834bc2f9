//! Byte-chunk reassembly — raw stream fragments in, complete rows out.
//!
//! Network fragments split anywhere, including in the middle of a
//! multi-byte character. Rows are framed by `0x0A`, which never appears
//! inside a UTF-8 continuation sequence, so the buffer splits at the byte
//! level first and decodes each completed row as a whole. A character cut
//! by a fragment boundary is simply reassembled in the buffer before its
//! row is decoded.

use bytes::{Buf, BytesMut};

/// Accumulates fragments and emits complete rows.
///
/// Holds only the unterminated tail between calls; emission is pure.
/// No upper bound on row size beyond available memory.
#[derive(Debug, Default)]
pub struct RowBuffer {
    buf: BytesMut,
}

impl RowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns every row completed by it, in order.
    /// Empty rows are skipped. A completed row that is not valid UTF-8 is
    /// a framing error.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Vec<String>, ReassembleError> {
        self.buf.extend_from_slice(fragment);

        let mut rows = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            let text = std::str::from_utf8(&line)?;
            rows.push(text.to_string());
        }
        Ok(rows)
    }

    /// Flush a trailing unterminated row, if any. Called when the stream
    /// signals completion.
    pub fn finish(&mut self) -> Result<Option<String>, ReassembleError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let text = std::str::from_utf8(&self.buf)?.to_string();
        self.buf.advance(self.buf.len());
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }

    /// Bytes currently buffered (the incomplete tail).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReassembleError {
    #[error("completed row is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}
