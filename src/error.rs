// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Define message-scoped and connection-fatal error domains for the FCP node.
// Author: Lukas Bower

//! Error types shared by dispatch, the registry and the connection layer.
//!
//! [`FcpError`] is scoped to one message and always becomes exactly one reply.
//! [`ConnectionError`] ends the connection.

use std::fmt;
use std::io;

use fcp_wire::{CodecError, FieldSetError};
use thiserror::Error;

/// Integer codes carried by `ProtocolError` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolErrorCode {
    /// Something other than `ClientHello` arrived first.
    ClientHelloMustBeFirst,
    /// `ClientHello` arrived after the handshake.
    NoLateClientHello,
    /// The message could not be parsed.
    MessageParseError,
    /// A key URI could not be parsed.
    UriParseError,
    /// A required field was absent.
    MissingField,
    /// A numeric field was malformed.
    ErrorParsingNumber,
    /// Unknown message name or wrong direction.
    InvalidMessage,
    /// A field had an unacceptable value.
    InvalidField,
    /// No request or subscription with the given identifier.
    NoSuchIdentifier,
    /// Recognised but unsupported operation.
    NotSupported,
    /// Unexpected node-side failure.
    InternalError,
    /// The node is shutting down.
    ShuttingDown,
    /// The connection lacks full access.
    AccessDenied,
    /// Operation only valid on darknet peers.
    DarknetOnly,
    /// Named plugin is not loaded.
    NoSuchPlugin,
    /// Durable operations are unavailable.
    PersistenceDisabled,
    /// MIME type was rejected.
    BadMimeType,
}

impl ProtocolErrorCode {
    /// Numeric value sent as `Code`.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::ClientHelloMustBeFirst => 1,
            Self::NoLateClientHello => 2,
            Self::MessageParseError => 3,
            Self::UriParseError => 4,
            Self::MissingField => 5,
            Self::ErrorParsingNumber => 6,
            Self::InvalidMessage => 7,
            Self::InvalidField => 8,
            Self::NoSuchIdentifier => 15,
            Self::NotSupported => 16,
            Self::InternalError => 17,
            Self::ShuttingDown => 18,
            Self::AccessDenied => 24,
            Self::DarknetOnly => 31,
            Self::NoSuchPlugin => 32,
            Self::PersistenceDisabled => 33,
            Self::BadMimeType => 35,
        }
    }

    /// Text sent as `CodeDescription`.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::ClientHelloMustBeFirst => "ClientHello must be first message",
            Self::NoLateClientHello => "No late ClientHello",
            Self::MessageParseError => "Unknown message parsing error",
            Self::UriParseError => "Error parsing URI",
            Self::MissingField => "Missing field",
            Self::ErrorParsingNumber => "Error parsing a numeric field",
            Self::InvalidMessage => "Don't know what to do with message",
            Self::InvalidField => "Invalid field value",
            Self::NoSuchIdentifier => "No such identifier",
            Self::NotSupported => "Not supported",
            Self::InternalError => "Internal error",
            Self::ShuttingDown => "Shutting down",
            Self::AccessDenied => "Access denied",
            Self::DarknetOnly => "Only available on darknet peers",
            Self::NoSuchPlugin => "No such plugin",
            Self::PersistenceDisabled => "Persistence is disabled",
            Self::BadMimeType => "Bad MIME type",
        }
    }

    /// Reverse of [`ProtocolErrorCode::code`].
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        const ALL: [ProtocolErrorCode; 17] = [
            ProtocolErrorCode::ClientHelloMustBeFirst,
            ProtocolErrorCode::NoLateClientHello,
            ProtocolErrorCode::MessageParseError,
            ProtocolErrorCode::UriParseError,
            ProtocolErrorCode::MissingField,
            ProtocolErrorCode::ErrorParsingNumber,
            ProtocolErrorCode::InvalidMessage,
            ProtocolErrorCode::InvalidField,
            ProtocolErrorCode::NoSuchIdentifier,
            ProtocolErrorCode::NotSupported,
            ProtocolErrorCode::InternalError,
            ProtocolErrorCode::ShuttingDown,
            ProtocolErrorCode::AccessDenied,
            ProtocolErrorCode::DarknetOnly,
            ProtocolErrorCode::NoSuchPlugin,
            ProtocolErrorCode::PersistenceDisabled,
            ProtocolErrorCode::BadMimeType,
        ];
        ALL.into_iter().find(|candidate| candidate.code() == code)
    }
}

impl fmt::Display for ProtocolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Message-scoped failure; never closes the connection unless `fatal` is set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FcpError {
    /// Generic protocol error mapped to a `ProtocolError` reply.
    #[error("{code}: {message}")]
    Protocol {
        /// Classification sent to the client.
        code: ProtocolErrorCode,
        /// Human-readable detail.
        message: String,
        /// Offending request identifier, when parseable.
        identifier: Option<String>,
        /// Whether the identifier is on the global queue.
        global: bool,
        /// Whether the connection is closed after the reply.
        fatal: bool,
    },
    /// The identifier is already in use on the target queue.
    #[error("identifier collision on {identifier}")]
    IdentifierCollision {
        /// Colliding identifier.
        identifier: String,
        /// Whether the collision happened on the global queue.
        global: bool,
    },
    /// A durable operation was attempted while the job runner is disabled.
    #[error("persistence is disabled")]
    PersistenceDisabled {
        /// Identifier of the rejected request, when known.
        identifier: Option<String>,
        /// Whether the request targeted the global queue.
        global: bool,
    },
}

impl FcpError {
    /// Non-fatal protocol error without identifier context.
    pub fn protocol(code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            identifier: None,
            global: false,
            fatal: false,
        }
    }

    /// Fatal protocol error; the connection closes after the reply.
    pub fn fatal(code: ProtocolErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
            identifier: None,
            global: false,
            fatal: true,
        }
    }

    /// Wrong-direction or unknown message name.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::protocol(ProtocolErrorCode::InvalidMessage, message)
    }

    /// Attach identifier context unless the error already carries one.
    #[must_use]
    pub fn with_identifier(self, id: Option<&str>, on_global: bool) -> Self {
        match self {
            Self::Protocol {
                code,
                message,
                identifier: None,
                fatal,
                ..
            } => Self::Protocol {
                code,
                message,
                identifier: id.map(str::to_owned),
                global: on_global,
                fatal,
            },
            Self::PersistenceDisabled {
                identifier: None, ..
            } => Self::PersistenceDisabled {
                identifier: id.map(str::to_owned),
                global: on_global,
            },
            other => other,
        }
    }

    /// Protocol code reported for this error.
    #[must_use]
    pub fn code(&self) -> Option<ProtocolErrorCode> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            Self::PersistenceDisabled { .. } => Some(ProtocolErrorCode::PersistenceDisabled),
            Self::IdentifierCollision { .. } => None,
        }
    }

    /// Whether the connection must close after reporting this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol { fatal: true, .. })
    }
}

impl From<FieldSetError> for FcpError {
    fn from(err: FieldSetError) -> Self {
        let code = match &err {
            FieldSetError::Missing(_) => ProtocolErrorCode::MissingField,
            FieldSetError::Parse { expected, .. }
                if matches!(*expected, "boolean" | "hex bytes") =>
            {
                ProtocolErrorCode::InvalidField
            }
            FieldSetError::Parse { .. } => ProtocolErrorCode::ErrorParsingNumber,
            FieldSetError::Duplicate(_)
            | FieldSetError::IllegalKey(_)
            | FieldSetError::IllegalValue(_) => ProtocolErrorCode::InvalidField,
        };
        Self::protocol(code, err.to_string())
    }
}

/// Failures that terminate a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Framing failure; the stream cannot be resynchronised.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Socket failure outside the codec.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
