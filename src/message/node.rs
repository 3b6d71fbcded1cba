// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Node-to-client message variants and their wire encoding.
// Author: Lukas Bower

use std::sync::Arc;

use fcp_wire::{BulkData, FieldSet, FieldSetError, RawMessage, SectionChain};

use crate::error::{FcpError, ProtocolErrorCode};
use crate::identifier::RequestKind;
use crate::request::{ClientRequest, RequestState};

/// Messages the node constructs and sends.
#[derive(Debug, Clone)]
pub enum NodeMessage {
    /// Handshake reply.
    NodeHello {
        connection_identifier: String,
        fcp_version: String,
        node: String,
        version: String,
    },
    /// Sent to a connection displaced by a newer one with the same name.
    CloseConnectionDuplicateClientName,
    /// Message-scoped or fatal error report.
    ProtocolError {
        code: ProtocolErrorCode,
        extra_description: Option<String>,
        fatal: bool,
        identifier: Option<String>,
        global: bool,
    },
    /// The identifier is already in use on the target queue.
    IdentifierCollision { identifier: String, global: bool },
    /// A `SubscribeUSK` was accepted.
    SubscribedUsk {
        identifier: String,
        uri: String,
        dont_poll: bool,
        sparse_poll: bool,
    },
    /// A new edition was found.
    SubscribedUskUpdate {
        identifier: String,
        edition: i64,
        uri: String,
        new_known_good: bool,
        new_slot_too: bool,
    },
    /// A polling round started sending requests.
    SubscribedUskSendingToNetwork { identifier: String },
    /// A polling round finished.
    SubscribedUskRoundFinished { identifier: String },
    /// `PersistentGet`/`PersistentPut`/`PersistentPutDir` describing one request.
    PersistentRequest {
        request: Arc<ClientRequest>,
        list_request_identifier: Option<String>,
    },
    PersistentRequestRemoved { identifier: String, global: bool },
    PersistentRequestModified {
        identifier: String,
        global: bool,
        client_token: Option<String>,
        priority_class: Option<i16>,
    },
    /// Terminates a `ListPersistentRequests` reply stream.
    EndListPersistentRequests { identifier: Option<String> },
    /// A fetch succeeded; `AllData` follows when data is returned directly.
    DataFound {
        identifier: String,
        global: bool,
        content_type: Option<String>,
        data_length: u64,
    },
    GetFailed { identifier: String, global: bool },
    PutSuccessful {
        identifier: String,
        global: bool,
        uri: String,
    },
    PutFailed { identifier: String, global: bool },
    /// Fetched data returned directly.
    AllData {
        identifier: String,
        global: bool,
        content_type: Option<String>,
        data: BulkData,
    },
    /// Feed notification with up to three bulk sections.
    TextFeed {
        identifier: Option<String>,
        updated_time: i64,
        header: Option<BulkData>,
        short_text: Option<BulkData>,
        text: Option<BulkData>,
    },
}

impl NodeMessage {
    /// Wire name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeHello { .. } => "NodeHello",
            Self::CloseConnectionDuplicateClientName => "CloseConnectionDuplicateClientName",
            Self::ProtocolError { .. } => "ProtocolError",
            Self::IdentifierCollision { .. } => "IdentifierCollision",
            Self::SubscribedUsk { .. } => "SubscribedUSK",
            Self::SubscribedUskUpdate { .. } => "SubscribedUSKUpdate",
            Self::SubscribedUskSendingToNetwork { .. } => "SubscribedUSKSendingToNetwork",
            Self::SubscribedUskRoundFinished { .. } => "SubscribedUSKRoundFinished",
            Self::PersistentRequest { request, .. } => match request.kind() {
                RequestKind::Get => "PersistentGet",
                RequestKind::Put => "PersistentPut",
                RequestKind::PutDir => "PersistentPutDir",
            },
            Self::PersistentRequestRemoved { .. } => "PersistentRequestRemoved",
            Self::PersistentRequestModified { .. } => "PersistentRequestModified",
            Self::EndListPersistentRequests { .. } => "EndListPersistentRequests",
            Self::DataFound { .. } => "DataFound",
            Self::GetFailed { .. } => "GetFailed",
            Self::PutSuccessful { .. } => "PutSuccessful",
            Self::PutFailed { .. } => "PutFailed",
            Self::AllData { .. } => "AllData",
            Self::TextFeed { .. } => "TextFeed",
        }
    }

    /// Encode into a framed message.
    pub fn to_raw(&self) -> Result<RawMessage, FieldSetError> {
        let mut fields = FieldSet::new();
        let mut data = None;
        match self {
            Self::NodeHello {
                connection_identifier,
                fcp_version,
                node,
                version,
            } => {
                fields.put_single("ConnectionIdentifier", connection_identifier.as_str())?;
                fields.put_single("FCPVersion", fcp_version.as_str())?;
                fields.put_single("Node", node.as_str())?;
                fields.put_single("Version", version.as_str())?;
            }
            Self::CloseConnectionDuplicateClientName => {}
            Self::ProtocolError {
                code,
                extra_description,
                fatal,
                identifier,
                global,
            } => {
                fields.put_num("Code", code.code())?;
                fields.put_single("CodeDescription", code.description())?;
                if let Some(extra) = extra_description {
                    fields.put_single("ExtraDescription", single_line(extra))?;
                }
                fields.put_bool("Fatal", *fatal)?;
                if let Some(identifier) = identifier {
                    fields.put_single("Identifier", identifier.as_str())?;
                }
                fields.put_bool("Global", *global)?;
            }
            Self::IdentifierCollision { identifier, global } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_bool("Global", *global)?;
            }
            Self::SubscribedUsk {
                identifier,
                uri,
                dont_poll,
                sparse_poll,
            } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_single("URI", uri.as_str())?;
                fields.put_bool("DontPoll", *dont_poll)?;
                fields.put_bool("SparsePoll", *sparse_poll)?;
            }
            Self::SubscribedUskUpdate {
                identifier,
                edition,
                uri,
                new_known_good,
                new_slot_too,
            } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_num("Edition", edition)?;
                fields.put_single("URI", uri.as_str())?;
                fields.put_bool("NewKnownGood", *new_known_good)?;
                fields.put_bool("NewSlotToo", *new_slot_too)?;
            }
            Self::SubscribedUskSendingToNetwork { identifier }
            | Self::SubscribedUskRoundFinished { identifier } => {
                fields.put_single("Identifier", identifier.as_str())?;
            }
            Self::PersistentRequest {
                request,
                list_request_identifier,
            } => {
                let id = request.identifier();
                fields.put_single("Identifier", id.identifier())?;
                fields.put_single("URI", request.uri())?;
                fields.put_num("Verbosity", request.verbosity())?;
                fields.put_single("PersistenceType", request.persistence().as_str())?;
                fields.put_num("PriorityClass", request.priority_class())?;
                fields.put_bool("Global", id.is_global())?;
                if let Some(token) = request.client_token() {
                    fields.put_single("ClientToken", single_line(&token))?;
                }
                fields.put_num("StartupTime", request.started_at_millis())?;
                fields.put_bool("Started", request.state() != RequestState::Queued)?;
                if request.is_finished() {
                    fields.put_bool("Succeeded", request.has_succeeded())?;
                }
                if let Some(list_id) = list_request_identifier {
                    fields.put_single("ListRequestIdentifier", list_id.as_str())?;
                }
            }
            Self::PersistentRequestRemoved { identifier, global } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_bool("Global", *global)?;
            }
            Self::PersistentRequestModified {
                identifier,
                global,
                client_token,
                priority_class,
            } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_bool("Global", *global)?;
                if let Some(token) = client_token {
                    fields.put_single("ClientToken", single_line(token))?;
                }
                if let Some(priority) = priority_class {
                    fields.put_num("PriorityClass", priority)?;
                }
            }
            Self::EndListPersistentRequests { identifier } => {
                if let Some(identifier) = identifier {
                    fields.put_single("Identifier", identifier.as_str())?;
                }
            }
            Self::DataFound {
                identifier,
                global,
                content_type,
                data_length,
            } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_bool("Global", *global)?;
                if let Some(content_type) = content_type {
                    fields.put_single("Metadata.ContentType", content_type.as_str())?;
                }
                fields.put_num("DataLength", data_length)?;
            }
            Self::GetFailed { identifier, global } | Self::PutFailed { identifier, global } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_bool("Global", *global)?;
            }
            Self::PutSuccessful {
                identifier,
                global,
                uri,
            } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_bool("Global", *global)?;
                fields.put_single("URI", uri.as_str())?;
            }
            Self::AllData {
                identifier,
                global,
                content_type,
                data: payload,
            } => {
                fields.put_single("Identifier", identifier.as_str())?;
                fields.put_bool("Global", *global)?;
                if let Some(content_type) = content_type {
                    fields.put_single("Metadata.ContentType", content_type.as_str())?;
                }
                data = Some(payload.clone());
            }
            Self::TextFeed {
                identifier,
                updated_time,
                header,
                short_text,
                text,
            } => {
                if let Some(identifier) = identifier {
                    fields.put_single("Identifier", identifier.as_str())?;
                }
                fields.put_num("UpdatedTime", updated_time)?;
                let mut sections = SectionChain::new();
                for (name, section) in [("Header", header), ("ShortText", short_text), ("Text", text)] {
                    if let Some(section) = section {
                        sections.push(name, section.clone());
                    }
                }
                return RawMessage::with_sections(self.name(), fields, sections);
            }
        }
        Ok(match data {
            Some(data) => RawMessage::with_data(self.name(), fields, data),
            None => RawMessage::new(self.name(), fields),
        })
    }
}

impl From<&FcpError> for NodeMessage {
    fn from(err: &FcpError) -> Self {
        match err {
            FcpError::Protocol {
                code,
                message,
                identifier,
                global,
                fatal,
            } => Self::ProtocolError {
                code: *code,
                extra_description: Some(message.clone()),
                fatal: *fatal,
                identifier: identifier.clone(),
                global: *global,
            },
            FcpError::IdentifierCollision { identifier, global } => Self::IdentifierCollision {
                identifier: identifier.clone(),
                global: *global,
            },
            FcpError::PersistenceDisabled { identifier, global } => Self::ProtocolError {
                code: ProtocolErrorCode::PersistenceDisabled,
                extra_description: Some("Persistence is disabled".to_owned()),
                fatal: false,
                identifier: identifier.clone(),
                global: *global,
            },
        }
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
