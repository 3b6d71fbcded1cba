// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Model bulk payloads that follow a Data terminator on the wire.
// Author: Lukas Bower

//! Bulk payloads appended after a message's field set.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Read-only byte source whose owner outlives the message carrying it.
pub trait BulkSource: Send + Sync + fmt::Debug {
    /// Number of bytes [`BulkSource::write_to`] will produce.
    fn len(&self) -> u64;

    /// Whether the source is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the full payload into `out`.
    fn write_to(&self, out: &mut dyn Write) -> io::Result<()>;
}

impl BulkSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(self)
    }
}

/// Bulk section of a message.
///
/// `Owned` bytes belong to the message and are released once it is sent.
/// `Borrowed` sources stay with the caller; the codec only reads them.
#[derive(Clone)]
pub enum BulkData {
    /// Buffer owned by the message.
    Owned(Vec<u8>),
    /// Shared source retained by the caller.
    Borrowed(Arc<dyn BulkSource>),
}

impl BulkData {
    /// Declared payload length.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Owned(bytes) => bytes.len() as u64,
            Self::Borrowed(source) => source.len(),
        }
    }

    /// Whether the payload is zero bytes long.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the payload into `out`.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::Owned(bytes) => out.write_all(bytes),
            Self::Borrowed(source) => source.write_to(out),
        }
    }

    /// Materialise the payload as a byte vector.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        match self {
            Self::Owned(bytes) => Ok(bytes.clone()),
            Self::Borrowed(source) => {
                let mut buf = Vec::with_capacity(source.len() as usize);
                source.write_to(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

impl fmt::Debug for BulkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(bytes) => f.debug_tuple("Owned").field(&bytes.len()).finish(),
            Self::Borrowed(source) => f.debug_tuple("Borrowed").field(&source.len()).finish(),
        }
    }
}

impl PartialEq for BulkData {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        match (self.to_vec(), other.to_vec()) {
            (Ok(left), Ok(right)) => left == right,
            _ => false,
        }
    }
}

impl From<Vec<u8>> for BulkData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes)
    }
}

/// Named bulk sections written back to back in insertion order.
///
/// Used by node-originated messages that carry more than one payload; each
/// section's length is announced as `<Name>Length` in the field set.
#[derive(Debug, Clone, Default)]
pub struct SectionChain {
    sections: Vec<(String, BulkData)>,
}

impl SectionChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named section.
    pub fn push(&mut self, name: impl Into<String>, data: BulkData) {
        self.sections.push((name.into(), data));
    }

    /// Iterate over `(name, length)` pairs in wire order.
    pub fn lengths(&self) -> impl Iterator<Item = (&str, u64)> {
        self.sections
            .iter()
            .map(|(name, data)| (name.as_str(), data.len()))
    }
}

impl BulkSource for SectionChain {
    fn len(&self) -> u64 {
        self.sections.iter().map(|(_, data)| data.len()).sum()
    }

    fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for (_, data) in &self.sections {
            data.write_to(out)?;
        }
        Ok(())
    }
}
