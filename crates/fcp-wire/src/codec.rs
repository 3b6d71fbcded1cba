// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Frame FCP messages as name, field lines, terminator and optional bulk bytes.
// Author: Lukas Bower

//! Encode/decode helpers for FCP wire messages.

use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;

use log::trace;
use thiserror::Error;

use crate::bulk::{BulkData, SectionChain};
use crate::fieldset::{FieldSet, FieldSetError};

/// Terminator for messages without a bulk section.
pub const END_MESSAGE_MARKER: &str = "EndMessage";
/// Short terminator accepted on input.
pub const END_MARKER: &str = "End";
/// Upper bound on the buffer reserved before bulk bytes arrive.
const BULK_CHUNK: usize = 64 * 1024;
/// Terminator announcing `DataLength` raw bytes.
pub const DATA_MARKER: &str = "Data";
/// Field declaring the bulk section length.
pub const DATA_LENGTH: &str = "DataLength";
/// Longest line accepted by [`MessageReader`].
pub const MAX_LINE_LEN: usize = 64 * 1024;
/// Default ceiling on a single bulk section.
pub const MAX_DATA_LEN: u64 = 1 << 31;

/// Connection-fatal framing and transport failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Stream ended inside a message.
    #[error("connection closed mid-message")]
    UnexpectedEof,
    /// A line exceeded the configured limit.
    #[error("line exceeds {limit} bytes")]
    LineTooLong {
        /// Configured line limit.
        limit: usize,
    },
    /// A line was not valid UTF-8.
    #[error("invalid utf8 in message line")]
    InvalidUtf8,
    /// A field line could not be stored.
    #[error("malformed field line: {0}")]
    MalformedField(#[from] FieldSetError),
    /// A non-field line was not a recognised terminator.
    #[error("invalid end marker {0:?}")]
    InvalidEndMarker(String),
    /// `Data` terminator without a `DataLength` field.
    #[error("Data terminator without DataLength")]
    MissingDataLength,
    /// `DataLength` was negative or not a number.
    #[error("invalid DataLength {0:?}")]
    InvalidDataLength(String),
    /// `DataLength` exceeded the configured ceiling.
    #[error("DataLength {declared} exceeds limit {limit}")]
    DataTooLarge {
        /// Length declared by the peer.
        declared: u64,
        /// Configured ceiling.
        limit: u64,
    },
    /// A bulk source produced a different number of bytes than it declared.
    #[error("length mismatch: declared {declared} actual {actual}")]
    LengthMismatch {
        /// Length announced in `DataLength`.
        declared: u64,
        /// Bytes actually written.
        actual: u64,
    },
    /// The message name was empty or contained `=`.
    #[error("invalid message name {0:?}")]
    InvalidName(String),
}

/// One framed message: name, fields and optional bulk section.
///
/// `data == None` means no bulk section; `Some` with zero bytes is an empty
/// bulk section and is framed with `Data` and `DataLength=0`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Message name, the first line on the wire.
    pub name: String,
    /// Field set body.
    pub fields: FieldSet,
    /// Bulk payload following a `Data` terminator.
    pub data: Option<BulkData>,
}

impl RawMessage {
    /// Build a message without a bulk section.
    #[must_use]
    pub fn new(name: impl Into<String>, fields: FieldSet) -> Self {
        Self {
            name: name.into(),
            fields,
            data: None,
        }
    }

    /// Build a message carrying one bulk section.
    #[must_use]
    pub fn with_data(name: impl Into<String>, fields: FieldSet, data: BulkData) -> Self {
        Self {
            name: name.into(),
            fields,
            data: Some(data),
        }
    }

    /// Build a message carrying several named bulk sections.
    ///
    /// Each section's length is recorded as `<Section>Length`; the sections are
    /// written back to back and `DataLength` is their sum.
    pub fn with_sections(
        name: impl Into<String>,
        mut fields: FieldSet,
        sections: SectionChain,
    ) -> Result<Self, FieldSetError> {
        for (section, len) in sections.lengths() {
            fields.put_num(&format!("{section}Length"), len)?;
        }
        Ok(Self::with_data(
            name,
            fields,
            BulkData::Borrowed(Arc::new(sections)),
        ))
    }
}

/// Incremental decoder over a buffered byte stream.
#[derive(Debug)]
pub struct MessageReader<R> {
    inner: R,
    max_line_len: usize,
    max_data_len: u64,
}

impl<R: BufRead> MessageReader<R> {
    /// Wrap a reader using the default limits.
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, MAX_LINE_LEN, MAX_DATA_LEN)
    }

    /// Wrap a reader with explicit line and bulk limits.
    pub fn with_limits(inner: R, max_line_len: usize, max_data_len: u64) -> Self {
        Self {
            inner,
            max_line_len,
            max_data_len,
        }
    }

    /// Read the next message, or `None` on a clean end of stream.
    pub fn read_message(&mut self) -> Result<Option<RawMessage>, CodecError> {
        let name = loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };
        if name.contains('=') {
            return Err(CodecError::InvalidName(name));
        }

        let mut fields = FieldSet::new();
        loop {
            let line = self.read_line()?.ok_or(CodecError::UnexpectedEof)?;
            if line.is_empty() {
                continue;
            }
            if line.contains('=') {
                fields.put_line(&line)?;
                continue;
            }
            let data = match line.as_str() {
                END_MESSAGE_MARKER | END_MARKER => None,
                DATA_MARKER => Some(self.read_bulk(&fields)?),
                _ => return Err(CodecError::InvalidEndMarker(line)),
            };
            trace!("decoded {name} ({} bulk bytes)", data.as_ref().map_or(0, BulkData::len));
            return Ok(Some(RawMessage { name, fields, data }));
        }
    }

    /// Recover the wrapped reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_bulk(&mut self, fields: &FieldSet) -> Result<BulkData, CodecError> {
        let raw = fields.get(DATA_LENGTH).ok_or(CodecError::MissingDataLength)?;
        let declared: i64 = raw
            .trim()
            .parse()
            .map_err(|_| CodecError::InvalidDataLength(raw.to_owned()))?;
        let declared =
            u64::try_from(declared).map_err(|_| CodecError::InvalidDataLength(raw.to_owned()))?;
        if declared > self.max_data_len {
            return Err(CodecError::DataTooLarge {
                declared,
                limit: self.max_data_len,
            });
        }
        let expected = usize::try_from(declared).map_err(|_| CodecError::DataTooLarge {
            declared,
            limit: self.max_data_len,
        })?;
        // The buffer grows with the bytes that actually arrive.
        let mut buf = Vec::with_capacity(expected.min(BULK_CHUNK));
        (&mut self.inner).take(declared).read_to_end(&mut buf)?;
        if buf.len() < expected {
            return Err(CodecError::UnexpectedEof);
        }
        Ok(BulkData::Owned(buf))
    }

    fn read_line(&mut self) -> Result<Option<String>, CodecError> {
        let mut buf = Vec::new();
        let limit = self.max_line_len as u64 + 1;
        let read = (&mut self.inner).take(limit).read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else if buf.len() as u64 >= limit {
            return Err(CodecError::LineTooLong {
                limit: self.max_line_len,
            });
        } else {
            return Err(CodecError::UnexpectedEof);
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Encode `message` onto `out`.
///
/// Fields are written in the field set's own order. When a bulk section is
/// present `DataLength` is set from it, `Data` terminates the field lines and
/// exactly that many bytes follow; otherwise `EndMessage` is written.
pub fn write_message<W: Write>(out: &mut W, message: &RawMessage) -> Result<(), CodecError> {
    if message.name.is_empty() || message.name.contains('=') || message.name.contains('\n') {
        return Err(CodecError::InvalidName(message.name.clone()));
    }
    let mut fields = message.fields.clone();
    if let Some(data) = &message.data {
        fields.put_num(DATA_LENGTH, data.len())?;
    }

    let mut head = String::with_capacity(64);
    head.push_str(&message.name);
    head.push('\n');
    for line in fields.lines() {
        head.push_str(&line);
        head.push('\n');
    }
    match &message.data {
        None => {
            head.push_str(END_MESSAGE_MARKER);
            head.push('\n');
            out.write_all(head.as_bytes())?;
        }
        Some(data) => {
            head.push_str(DATA_MARKER);
            head.push('\n');
            out.write_all(head.as_bytes())?;
            let mut counter = CountingWriter {
                inner: &mut *out,
                written: 0,
            };
            data.write_to(&mut counter)?;
            if counter.written != data.len() {
                return Err(CodecError::LengthMismatch {
                    declared: data.len(),
                    actual: counter.written,
                });
            }
        }
    }
    trace!("encoded {}", message.name);
    Ok(())
}

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
