// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Stable, versioned identity for requests on the global or a per-client queue.
// Author: Lukas Bower

//! Request identifiers.
//!
//! The persisted layout is big-endian:
//! `i32 magic | i16 version | bool global | [utf clientName if !global] |
//! utf identifier | i16 kind`, where `utf` is a `u16` byte length followed by
//! UTF-8. Equality and hashing ignore the request kind, because identifier
//! uniqueness is scoped to the queue, not to the kind of request.

use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

use crate::binary::{self, BinaryError, Cursor};

/// Leading constant of every encoded identifier.
pub const IDENTIFIER_MAGIC: i32 = 0x2ea7_6f3b;
/// Layout version written by this build.
pub const IDENTIFIER_VERSION: i16 = 1;

/// Kind of request an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Fetch.
    Get,
    /// Single-file insert.
    Put,
    /// Directory insert.
    PutDir,
}

impl RequestKind {
    fn ordinal(self) -> i16 {
        match self {
            Self::Get => 0,
            Self::Put => 1,
            Self::PutDir => 2,
        }
    }

    fn from_ordinal(ordinal: i16) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Get),
            1 => Some(Self::Put),
            2 => Some(Self::PutDir),
            _ => None,
        }
    }
}

/// Encode and decode failures for persisted identifiers. Decoding never
/// default-fills a field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierCodecError {
    /// Leading magic did not match.
    #[error("bad identifier magic {0:#x}")]
    BadMagic(i32),
    /// Layout version is not one this build reads.
    #[error("unsupported identifier version {0}")]
    BadVersion(i16),
    /// Input ended early.
    #[error("identifier truncated")]
    Truncated,
    /// A string was not UTF-8.
    #[error("identifier string is not utf8")]
    InvalidUtf8,
    /// Request kind ordinal is unknown.
    #[error("unknown request kind {0}")]
    UnknownKind(i16),
    /// A string is too long to encode.
    #[error("identifier field exceeds 65535 bytes")]
    TooLong,
}

impl From<BinaryError> for IdentifierCodecError {
    fn from(err: BinaryError) -> Self {
        match err {
            BinaryError::Truncated => Self::Truncated,
            BinaryError::InvalidUtf8 => Self::InvalidUtf8,
            BinaryError::StringTooLong => Self::TooLong,
        }
    }
}

/// Immutable `(queue, identifier, kind)` triple.
#[derive(Debug, Clone)]
pub struct RequestIdentifier {
    client_name: Option<String>,
    identifier: String,
    kind: RequestKind,
}

impl RequestIdentifier {
    /// Identifier on the shared global queue.
    pub fn global(identifier: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            client_name: None,
            identifier: identifier.into(),
            kind,
        }
    }

    /// Identifier on a named client's queue.
    pub fn for_client(
        client_name: impl Into<String>,
        identifier: impl Into<String>,
        kind: RequestKind,
    ) -> Self {
        Self {
            client_name: Some(client_name.into()),
            identifier: identifier.into(),
            kind,
        }
    }

    /// Build from a `Global` flag and the client name of the issuing connection.
    pub fn new(global: bool, client_name: &str, identifier: &str, kind: RequestKind) -> Self {
        if global {
            Self::global(identifier, kind)
        } else {
            Self::for_client(client_name, identifier, kind)
        }
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.client_name.is_none()
    }

    #[must_use]
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Whether both name the same queue slot, ignoring kind.
    #[must_use]
    pub fn same_identifier(&self, other: &Self) -> bool {
        self == other
    }

    /// Append the persisted form to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), IdentifierCodecError> {
        out.extend_from_slice(&IDENTIFIER_MAGIC.to_be_bytes());
        out.extend_from_slice(&IDENTIFIER_VERSION.to_be_bytes());
        binary::put_bool(out, self.is_global());
        if let Some(name) = &self.client_name {
            binary::put_utf(out, name)?;
        }
        binary::put_utf(out, &self.identifier)?;
        out.extend_from_slice(&self.kind.ordinal().to_be_bytes());
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, IdentifierCodecError> {
        let mut out = Vec::with_capacity(16 + self.identifier.len());
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Decode a complete buffer; trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, IdentifierCodecError> {
        let mut cursor = Cursor::new(bytes);
        let id = Self::read_from(&mut cursor)?;
        if cursor.remaining() != 0 {
            return Err(IdentifierCodecError::Truncated);
        }
        Ok(id)
    }

    pub(crate) fn read_from(cursor: &mut Cursor<'_>) -> Result<Self, IdentifierCodecError> {
        let magic = cursor.read_i32()?;
        if magic != IDENTIFIER_MAGIC {
            return Err(IdentifierCodecError::BadMagic(magic));
        }
        let version = cursor.read_i16()?;
        if version != IDENTIFIER_VERSION {
            return Err(IdentifierCodecError::BadVersion(version));
        }
        let global = cursor.read_bool()?;
        let client_name = if global {
            None
        } else {
            Some(cursor.read_utf()?)
        };
        let identifier = cursor.read_utf()?;
        let ordinal = cursor.read_i16()?;
        let kind =
            RequestKind::from_ordinal(ordinal).ok_or(IdentifierCodecError::UnknownKind(ordinal))?;
        Ok(Self {
            client_name,
            identifier,
            kind,
        })
    }
}

impl PartialEq for RequestIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.client_name == other.client_name && self.identifier == other.identifier
    }
}

impl Eq for RequestIdentifier {}

impl Hash for RequestIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.client_name.hash(state);
        self.identifier.hash(state);
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.client_name {
            None => write!(f, "global:{}", self.identifier),
            Some(name) => write!(f, "{name}:{}", self.identifier),
        }
    }
}
