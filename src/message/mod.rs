// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve wire names to message variants and their direction.
// Author: Lukas Bower

//! Message variants.
//!
//! Every wire name is listed once in [`MESSAGE_TABLE`] with its direction.
//! Client-bound names received from a client are rejected before any field is
//! looked at.

mod client;
mod node;

pub use client::{
    ClientGet, ClientHello, ClientMessage, ClientPut, ModifyPersistentRequest, RequestFields,
    SubscribeUsk, UploadFrom, WatchGlobal, MAX_FIELD_BYTES,
};
pub use node::NodeMessage;

pub use crate::request::ReturnType;

use fcp_wire::RawMessage;

use crate::error::FcpError;

/// Which side originates a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    ClientToNode,
    NodeToClient,
}

/// Wire name to direction, for every message the node understands.
pub const MESSAGE_TABLE: &[(&str, MessageDirection)] = &[
    ("ClientHello", MessageDirection::ClientToNode),
    ("ClientGet", MessageDirection::ClientToNode),
    ("ClientPut", MessageDirection::ClientToNode),
    ("SubscribeUSK", MessageDirection::ClientToNode),
    ("UnsubscribeUSK", MessageDirection::ClientToNode),
    ("WatchGlobal", MessageDirection::ClientToNode),
    ("ListPersistentRequests", MessageDirection::ClientToNode),
    ("RemoveRequest", MessageDirection::ClientToNode),
    ("RemovePersistentRequest", MessageDirection::ClientToNode),
    ("ModifyPersistentRequest", MessageDirection::ClientToNode),
    ("Disconnect", MessageDirection::ClientToNode),
    ("Shutdown", MessageDirection::ClientToNode),
    ("Void", MessageDirection::ClientToNode),
    ("NodeHello", MessageDirection::NodeToClient),
    ("CloseConnectionDuplicateClientName", MessageDirection::NodeToClient),
    ("ProtocolError", MessageDirection::NodeToClient),
    ("IdentifierCollision", MessageDirection::NodeToClient),
    ("SubscribedUSK", MessageDirection::NodeToClient),
    ("SubscribedUSKUpdate", MessageDirection::NodeToClient),
    ("SubscribedUSKSendingToNetwork", MessageDirection::NodeToClient),
    ("SubscribedUSKRoundFinished", MessageDirection::NodeToClient),
    ("PersistentGet", MessageDirection::NodeToClient),
    ("PersistentPut", MessageDirection::NodeToClient),
    ("PersistentPutDir", MessageDirection::NodeToClient),
    ("PersistentRequestRemoved", MessageDirection::NodeToClient),
    ("PersistentRequestModified", MessageDirection::NodeToClient),
    ("EndListPersistentRequests", MessageDirection::NodeToClient),
    ("DataFound", MessageDirection::NodeToClient),
    ("GetFailed", MessageDirection::NodeToClient),
    ("PutSuccessful", MessageDirection::NodeToClient),
    ("PutFailed", MessageDirection::NodeToClient),
    ("AllData", MessageDirection::NodeToClient),
    ("TextFeed", MessageDirection::NodeToClient),
];

/// Direction of a wire name, or `None` for unknown names.
#[must_use]
pub fn direction_of(name: &str) -> Option<MessageDirection> {
    MESSAGE_TABLE
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, direction)| *direction)
}

/// Resolve a decoded message received from a client.
///
/// Unknown names and node-to-client names fail with `InvalidMessage` without
/// reading any field.
pub fn decode_client_message(raw: RawMessage) -> Result<ClientMessage, FcpError> {
    match direction_of(&raw.name) {
        None => Err(FcpError::invalid_message(format!(
            "Unknown message name {}",
            raw.name
        ))),
        Some(MessageDirection::NodeToClient) => Err(FcpError::invalid_message(format!(
            "{} goes from node to client not the other way around",
            raw.name
        ))),
        Some(MessageDirection::ClientToNode) => ClientMessage::parse(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolErrorCode;
    use fcp_wire::FieldSet;

    #[test]
    fn every_name_is_listed_once() {
        for (index, (name, _)) in MESSAGE_TABLE.iter().enumerate() {
            assert!(
                MESSAGE_TABLE[index + 1..].iter().all(|(other, _)| other != name),
                "{name} listed twice"
            );
        }
    }

    #[test]
    fn node_bound_names_are_rejected_regardless_of_fields() {
        let mut fields = FieldSet::new();
        fields.put_single("Identifier", "x").unwrap();
        fields.put_single("URI", "not even a key").unwrap();
        for (name, direction) in MESSAGE_TABLE {
            if *direction != MessageDirection::NodeToClient {
                continue;
            }
            let err = decode_client_message(RawMessage::new(*name, fields.clone())).unwrap_err();
            assert_eq!(err.code(), Some(ProtocolErrorCode::InvalidMessage), "{name}");
        }
    }

    #[test]
    fn unknown_names_are_invalid_messages() {
        let err = decode_client_message(RawMessage::new("AddPeer", FieldSet::new())).unwrap_err();
        assert_eq!(err.code(), Some(ProtocolErrorCode::InvalidMessage));
    }
}
