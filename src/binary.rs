// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Big-endian primitives shared by the persisted identifier and request records.
// Author: Lukas Bower

use std::str;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum BinaryError {
    #[error("record truncated")]
    Truncated,
    #[error("invalid utf8 in record")]
    InvalidUtf8,
    #[error("string too long for u16 prefix")]
    StringTooLong,
}

pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], BinaryError> {
        if self.remaining() < len {
            return Err(BinaryError::Truncated);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..self.pos])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BinaryError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn read_bool(&mut self) -> Result<bool, BinaryError> {
        Ok(self.array::<1>()?[0] != 0)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, BinaryError> {
        self.array().map(u16::from_be_bytes)
    }

    pub(crate) fn read_i16(&mut self) -> Result<i16, BinaryError> {
        self.array().map(i16::from_be_bytes)
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, BinaryError> {
        self.array().map(i32::from_be_bytes)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, BinaryError> {
        self.array().map(u32::from_be_bytes)
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, BinaryError> {
        self.array().map(i64::from_be_bytes)
    }

    pub(crate) fn read_utf(&mut self) -> Result<String, BinaryError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| BinaryError::InvalidUtf8)
    }
}

pub(crate) fn put_bool(out: &mut Vec<u8>, value: bool) {
    out.push(u8::from(value));
}

pub(crate) fn put_utf(out: &mut Vec<u8>, value: &str) -> Result<(), BinaryError> {
    let len = u16::try_from(value.len()).map_err(|_| BinaryError::StringTooLong)?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}
