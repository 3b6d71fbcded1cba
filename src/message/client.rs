// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Client-to-node message variants and their field validation.
// Author: Lukas Bower

use fcp_wire::{BulkData, FieldSet, RawMessage};

use crate::error::{FcpError, ProtocolErrorCode};
use crate::request::{
    check_priority_class, Persistence, ReturnType, DEFAULT_PRIORITY_CLASS, DEFAULT_VERBOSITY,
};
use crate::usk::{PollPriorities, UskUri};

/// Longest name, identifier, URI or token a request may carry; the durable
/// record prefixes each with a `u16` length.
pub const MAX_FIELD_BYTES: usize = u16::MAX as usize;

fn bounded(key: &str, value: &str) -> Result<String, FcpError> {
    if value.len() > MAX_FIELD_BYTES {
        return Err(FcpError::protocol(
            ProtocolErrorCode::InvalidField,
            format!("{key} is longer than {MAX_FIELD_BYTES} bytes"),
        ));
    }
    Ok(value.to_owned())
}

/// `ClientHello{Name, ExpectedVersion}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub name: String,
    pub expected_version: String,
}

impl ClientHello {
    fn parse(fields: &FieldSet) -> Result<Self, FcpError> {
        let name = bounded("Name", fields.require("Name")?)?;
        if name.trim().is_empty() {
            return Err(FcpError::protocol(
                ProtocolErrorCode::InvalidField,
                "Name must not be empty",
            ));
        }
        Ok(Self {
            name,
            expected_version: fields.require("ExpectedVersion")?.to_owned(),
        })
    }
}

/// Fields shared by `ClientGet` and `ClientPut`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFields {
    pub identifier: String,
    pub uri: String,
    pub global: bool,
    pub persistence: Persistence,
    pub priority_class: i16,
    pub client_token: Option<String>,
    pub verbosity: i32,
}

impl RequestFields {
    fn parse(fields: &FieldSet) -> Result<Self, FcpError> {
        let identifier = bounded("Identifier", fields.require("Identifier")?)?;
        let uri = bounded("URI", fields.require("URI")?.trim())?;
        if uri.is_empty() {
            return Err(FcpError::protocol(
                ProtocolErrorCode::UriParseError,
                "URI must not be empty",
            ));
        }
        let persistence = match fields.get("Persistence") {
            Some(value) => value.parse()?,
            None => Persistence::Connection,
        };
        Ok(Self {
            identifier,
            uri,
            global: fields.get_bool("Global", false)?,
            persistence,
            priority_class: check_priority_class(
                fields.get_short("PriorityClass", DEFAULT_PRIORITY_CLASS)?,
            )?,
            client_token: fields
                .get("ClientToken")
                .map(|token| bounded("ClientToken", token))
                .transpose()?,
            verbosity: fields.get_int("Verbosity", DEFAULT_VERBOSITY)?,
        })
    }
}

/// `ClientGet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientGet {
    pub request: RequestFields,
    pub return_type: ReturnType,
}

impl ClientGet {
    fn parse(fields: &FieldSet) -> Result<Self, FcpError> {
        let request = RequestFields::parse(fields)?;
        let return_type = match fields.get("ReturnType").map(str::to_ascii_lowercase).as_deref() {
            None | Some("direct") => ReturnType::Direct,
            Some("none") => ReturnType::None,
            Some("disk") => {
                return Err(FcpError::protocol(
                    ProtocolErrorCode::NotSupported,
                    "ReturnType=disk is not supported",
                ))
            }
            Some(other) => {
                return Err(FcpError::protocol(
                    ProtocolErrorCode::InvalidField,
                    format!("Unknown ReturnType {other}"),
                ))
            }
        };
        if request.global && request.persistence == Persistence::Connection {
            return Err(FcpError::protocol(
                ProtocolErrorCode::InvalidField,
                "Global requests must be persistent",
            ));
        }
        Ok(Self {
            request,
            return_type,
        })
    }
}

/// Where an insert's payload comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadFrom {
    /// Bytes follow the message.
    Direct(BulkData),
    /// Insert a redirect to `TargetURI`.
    Redirect { target_uri: String },
}

/// `ClientPut`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientPut {
    pub request: RequestFields,
    pub content_type: Option<String>,
    pub upload_from: UploadFrom,
}

impl ClientPut {
    fn parse(fields: &FieldSet, data: Option<BulkData>) -> Result<Self, FcpError> {
        let request = RequestFields::parse(fields)?;
        let upload_from = match fields.get("UploadFrom").map(str::to_ascii_lowercase).as_deref() {
            None | Some("direct") => match data {
                Some(data) => UploadFrom::Direct(data),
                None => {
                    return Err(FcpError::protocol(
                        ProtocolErrorCode::MissingField,
                        "DataLength and Data required for UploadFrom=direct",
                    ))
                }
            },
            Some("redirect") => UploadFrom::Redirect {
                target_uri: bounded("TargetURI", fields.require("TargetURI")?.trim())?,
            },
            Some("disk") => {
                return Err(FcpError::protocol(
                    ProtocolErrorCode::NotSupported,
                    "UploadFrom=disk is not supported",
                ))
            }
            Some(other) => {
                return Err(FcpError::protocol(
                    ProtocolErrorCode::InvalidField,
                    format!("Unknown UploadFrom {other}"),
                ))
            }
        };
        let content_type = fields.get("Metadata.ContentType").map(str::to_owned);
        if let Some(mime) = &content_type {
            if !mime.contains('/') || mime.contains(char::is_whitespace) {
                return Err(FcpError::protocol(
                    ProtocolErrorCode::BadMimeType,
                    "Bad MIME type in Metadata.ContentType",
                ));
            }
        }
        if request.global && request.persistence == Persistence::Connection {
            return Err(FcpError::protocol(
                ProtocolErrorCode::InvalidField,
                "Global requests must be persistent",
            ));
        }
        Ok(Self {
            request,
            content_type,
            upload_from,
        })
    }
}

/// `SubscribeUSK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeUsk {
    pub identifier: String,
    pub uri: UskUri,
    pub dont_poll: bool,
    pub sparse_poll: bool,
    pub priorities: PollPriorities,
}

impl SubscribeUsk {
    fn parse(fields: &FieldSet) -> Result<Self, FcpError> {
        let defaults = PollPriorities::default();
        Ok(Self {
            identifier: fields.require("Identifier")?.to_owned(),
            uri: fields.require("URI")?.parse()?,
            dont_poll: fields.get_bool("DontPoll", false)?,
            sparse_poll: fields.get_bool("SparsePoll", false)?,
            priorities: PollPriorities {
                normal: check_priority_class(fields.get_short("PriorityClass", defaults.normal)?)?,
                progress: check_priority_class(
                    fields.get_short("PriorityClassProgress", defaults.progress)?,
                )?,
            },
        })
    }
}

/// `WatchGlobal{Enabled, VerbosityMask}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchGlobal {
    pub enabled: bool,
    pub verbosity_mask: i32,
}

/// `ModifyPersistentRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyPersistentRequest {
    pub identifier: String,
    pub global: bool,
    pub client_token: Option<String>,
    pub priority_class: Option<i16>,
}

impl ModifyPersistentRequest {
    fn parse(fields: &FieldSet) -> Result<Self, FcpError> {
        let priority_class = match fields.get("PriorityClass") {
            None => None,
            Some(_) => Some(check_priority_class(fields.get_short("PriorityClass", 0)?)?),
        };
        Ok(Self {
            identifier: fields.require("Identifier")?.to_owned(),
            global: fields.get_bool("Global", false)?,
            client_token: fields
                .get("ClientToken")
                .map(|token| bounded("ClientToken", token))
                .transpose()?,
            priority_class,
        })
    }
}

/// Every message a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    ClientHello(ClientHello),
    ClientGet(ClientGet),
    ClientPut(ClientPut),
    SubscribeUsk(SubscribeUsk),
    UnsubscribeUsk { identifier: String },
    WatchGlobal(WatchGlobal),
    ListPersistentRequests { identifier: Option<String> },
    RemoveRequest { identifier: String, global: bool },
    ModifyPersistentRequest(ModifyPersistentRequest),
    Disconnect,
    Shutdown,
    Void,
}

impl ClientMessage {
    /// Build the variant named by `raw.name`; the direction check has
    /// already happened.
    pub(crate) fn parse(raw: RawMessage) -> Result<Self, FcpError> {
        let fields = &raw.fields;
        let message = match raw.name.as_str() {
            "ClientHello" => Self::ClientHello(ClientHello::parse(fields)?),
            "ClientGet" => Self::ClientGet(ClientGet::parse(fields)?),
            "ClientPut" => Self::ClientPut(ClientPut::parse(fields, raw.data.clone())?),
            "SubscribeUSK" => Self::SubscribeUsk(SubscribeUsk::parse(fields)?),
            "UnsubscribeUSK" => Self::UnsubscribeUsk {
                identifier: fields.require("Identifier")?.to_owned(),
            },
            "WatchGlobal" => Self::WatchGlobal(WatchGlobal {
                enabled: fields.get_bool("Enabled", true)?,
                verbosity_mask: fields.get_int("VerbosityMask", i32::MAX)?,
            }),
            "ListPersistentRequests" => Self::ListPersistentRequests {
                identifier: fields.get("Identifier").map(str::to_owned),
            },
            "RemoveRequest" | "RemovePersistentRequest" => Self::RemoveRequest {
                identifier: fields.require("Identifier")?.to_owned(),
                global: fields.get_bool("Global", false)?,
            },
            "ModifyPersistentRequest" => {
                Self::ModifyPersistentRequest(ModifyPersistentRequest::parse(fields)?)
            }
            "Disconnect" => Self::Disconnect,
            "Shutdown" => Self::Shutdown,
            "Void" => Self::Void,
            other => {
                return Err(FcpError::invalid_message(format!(
                    "Unknown message name {other}"
                )))
            }
        };
        Ok(message)
    }

    /// Wire name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientHello(_) => "ClientHello",
            Self::ClientGet(_) => "ClientGet",
            Self::ClientPut(_) => "ClientPut",
            Self::SubscribeUsk(_) => "SubscribeUSK",
            Self::UnsubscribeUsk { .. } => "UnsubscribeUSK",
            Self::WatchGlobal(_) => "WatchGlobal",
            Self::ListPersistentRequests { .. } => "ListPersistentRequests",
            Self::RemoveRequest { .. } => "RemoveRequest",
            Self::ModifyPersistentRequest(_) => "ModifyPersistentRequest",
            Self::Disconnect => "Disconnect",
            Self::Shutdown => "Shutdown",
            Self::Void => "Void",
        }
    }

    /// Whether executing this message needs a full-access connection.
    #[must_use]
    pub fn requires_full_access(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, lines: &[&str]) -> RawMessage {
        RawMessage::new(name, FieldSet::from_lines(lines.iter().copied()).unwrap())
    }

    #[test]
    fn client_get_defaults() {
        let message = ClientMessage::parse(raw("ClientGet", &["Identifier=a", "URI=CHK@x"])).unwrap();
        let ClientMessage::ClientGet(get) = message else {
            panic!("wrong variant");
        };
        assert_eq!(get.request.persistence, Persistence::Connection);
        assert_eq!(get.request.priority_class, DEFAULT_PRIORITY_CLASS);
        assert_eq!(get.return_type, ReturnType::Direct);
        assert!(!get.request.global);
    }

    #[test]
    fn values_over_the_store_limit_are_invalid_fields() {
        let long = "x".repeat(MAX_FIELD_BYTES + 1);
        let identifier = format!("Identifier={long}");
        let err = ClientMessage::parse(raw("ClientGet", &[identifier.as_str(), "URI=CHK@x"]))
            .unwrap_err();
        assert_eq!(err.code(), Some(ProtocolErrorCode::InvalidField));

        let half = format!("ClientToken={}", "t".repeat(MAX_FIELD_BYTES / 2 + 1));
        let lines = ["Identifier=a", "URI=CHK@x", half.as_str(), half.as_str()];
        let err = ClientMessage::parse(raw("ClientGet", &lines)).unwrap_err();
        assert_eq!(err.code(), Some(ProtocolErrorCode::InvalidField));

        let fits = format!("ClientToken={}", "t".repeat(MAX_FIELD_BYTES));
        let lines = ["Identifier=a", "URI=CHK@x", fits.as_str()];
        assert!(ClientMessage::parse(raw("ClientGet", &lines)).is_ok());
    }

    #[test]
    fn missing_uri_is_missing_field() {
        let err = ClientMessage::parse(raw("ClientGet", &["Identifier=a"])).unwrap_err();
        assert_eq!(err.code(), Some(ProtocolErrorCode::MissingField));
    }

    #[test]
    fn bad_number_is_parse_error() {
        let err = ClientMessage::parse(raw(
            "ClientGet",
            &["Identifier=a", "URI=CHK@x", "Verbosity=loud"],
        ))
        .unwrap_err();
        assert_eq!(err.code(), Some(ProtocolErrorCode::ErrorParsingNumber));
    }

    #[test]
    fn direct_put_needs_data() {
        let err = ClientMessage::parse(raw("ClientPut", &["Identifier=p", "URI=CHK@"])).unwrap_err();
        assert_eq!(err.code(), Some(ProtocolErrorCode::MissingField));
        let mut with_data = raw("ClientPut", &["Identifier=p", "URI=CHK@"]);
        with_data.data = Some(BulkData::Owned(Vec::new()));
        assert!(ClientMessage::parse(with_data).is_ok());
    }

    #[test]
    fn bad_mime_type_is_reported() {
        let mut message = raw(
            "ClientPut",
            &["Identifier=p", "URI=CHK@", "Metadata.ContentType=garbage"],
        );
        message.data = Some(BulkData::Owned(b"x".to_vec()));
        let err = ClientMessage::parse(message).unwrap_err();
        assert_eq!(err.code(), Some(ProtocolErrorCode::BadMimeType));
    }

    #[test]
    fn remove_alias_is_accepted() {
        let message =
            ClientMessage::parse(raw("RemovePersistentRequest", &["Identifier=r", "Global=true"]))
                .unwrap();
        assert_eq!(
            message,
            ClientMessage::RemoveRequest {
                identifier: "r".into(),
                global: true
            }
        );
    }

    #[test]
    fn subscribe_usk_parses_modes() {
        let message = ClientMessage::parse(raw(
            "SubscribeUSK",
            &["Identifier=u", "URI=USK@a,b,c/site/3", "SparsePoll=true"],
        ))
        .unwrap();
        let ClientMessage::SubscribeUsk(subscribe) = message else {
            panic!("wrong variant");
        };
        assert!(subscribe.sparse_poll);
        assert!(!subscribe.dont_poll);
        assert_eq!(subscribe.uri.edition(), 3);
    }

    #[test]
    fn only_shutdown_needs_full_access() {
        assert!(ClientMessage::Shutdown.requires_full_access());
        assert!(!ClientMessage::Void.requires_full_access());
    }
}
