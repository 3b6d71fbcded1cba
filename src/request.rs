// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Client request records and the boundary to the fetch/insert engine.
// Author: Lukas Bower

//! Client requests as seen by the protocol core.
//!
//! Execution belongs to a [`RequestEngine`]; the core only tracks identity,
//! persistence class and the few mutable attributes clients may change.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use fcp_wire::BulkData;

use crate::connection::Connection;
use crate::error::{FcpError, ProtocolErrorCode};
use crate::identifier::{RequestIdentifier, RequestKind};
use crate::lock;

/// Priority class used when a client does not send `PriorityClass`.
pub const DEFAULT_PRIORITY_CLASS: i16 = 4;
/// Lowest (least urgent) priority class accepted.
pub const MIN_PRIORITY_CLASS: i16 = 6;
/// Verbosity used when a client does not send `Verbosity`.
pub const DEFAULT_VERBOSITY: i32 = 0;

/// Lifetime class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Persistence {
    /// Dies with the submitting connection.
    Connection,
    /// Survives reconnects until the node restarts.
    Reboot,
    /// Survives node restarts.
    Forever,
}

impl Persistence {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Reboot => "reboot",
            Self::Forever => "forever",
        }
    }
}

impl FromStr for Persistence {
    type Err = FcpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "connection" => Ok(Self::Connection),
            "reboot" => Ok(Self::Reboot),
            "forever" => Ok(Self::Forever),
            other => Err(FcpError::protocol(
                ProtocolErrorCode::InvalidField,
                format!("Persistence must be connection, reboot or forever, not {other}"),
            )),
        }
    }
}

impl fmt::Display for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a finished fetch hands its data back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnType {
    /// As an `AllData` message after `DataFound`.
    #[default]
    Direct,
    /// Not at all; only completion is reported.
    None,
}

/// Progress of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Registered, not yet started by the engine.
    Queued,
    /// Handed to the engine.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
}

#[derive(Debug)]
struct RequestStatus {
    state: RequestState,
    priority_class: i16,
    client_token: Option<String>,
}

/// A submitted fetch or insert.
#[derive(Debug)]
pub struct ClientRequest {
    id: RequestIdentifier,
    persistence: Persistence,
    uri: String,
    verbosity: i32,
    started_at_millis: i64,
    return_type: ReturnType,
    content_type: Option<String>,
    target_uri: Option<String>,
    connection: Weak<Connection>,
    status: Mutex<RequestStatus>,
}

impl ClientRequest {
    /// Create a queued request.
    pub fn new(id: RequestIdentifier, persistence: Persistence, uri: impl Into<String>) -> Self {
        Self {
            id,
            persistence,
            uri: uri.into(),
            verbosity: DEFAULT_VERBOSITY,
            started_at_millis: now_millis(),
            return_type: ReturnType::Direct,
            content_type: None,
            target_uri: None,
            connection: Weak::new(),
            status: Mutex::new(RequestStatus {
                state: RequestState::Queued,
                priority_class: DEFAULT_PRIORITY_CLASS,
                client_token: None,
            }),
        }
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: i32) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_priority_class(self, priority_class: i16) -> Self {
        lock(&self.status).priority_class = priority_class;
        self
    }

    #[must_use]
    pub fn with_client_token(self, token: Option<String>) -> Self {
        lock(&self.status).client_token = token;
        self
    }

    #[must_use]
    pub fn with_return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }

    /// MIME type of an insert, or the type to report for a fetch.
    #[must_use]
    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    /// Target of a redirect insert.
    #[must_use]
    pub fn with_target_uri(mut self, target_uri: Option<String>) -> Self {
        self.target_uri = target_uri;
        self
    }

    /// Bind a connection-persistence request to the connection that owns it.
    #[must_use]
    pub(crate) fn with_connection(mut self, connection: &Arc<Connection>) -> Self {
        self.connection = Arc::downgrade(connection);
        self
    }

    /// Restore a request loaded from the durable store.
    ///
    /// Return type, content type and redirect target are not stored and come
    /// back as their defaults.
    pub(crate) fn restored(
        id: RequestIdentifier,
        uri: String,
        verbosity: i32,
        started_at_millis: i64,
        priority_class: i16,
        client_token: Option<String>,
        state: RequestState,
    ) -> Self {
        Self {
            id,
            persistence: Persistence::Forever,
            uri,
            verbosity,
            started_at_millis,
            return_type: ReturnType::Direct,
            content_type: None,
            target_uri: None,
            connection: Weak::new(),
            status: Mutex::new(RequestStatus {
                state,
                priority_class,
                client_token,
            }),
        }
    }

    pub fn identifier(&self) -> &RequestIdentifier {
        &self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.id.kind()
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn verbosity(&self) -> i32 {
        self.verbosity
    }

    pub fn started_at_millis(&self) -> i64 {
        self.started_at_millis
    }

    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn target_uri(&self) -> Option<&str> {
        self.target_uri.as_deref()
    }

    /// Owning connection of a connection-persistence request, while it lives.
    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn priority_class(&self) -> i16 {
        lock(&self.status).priority_class
    }

    pub fn client_token(&self) -> Option<String> {
        lock(&self.status).client_token.clone()
    }

    pub fn state(&self) -> RequestState {
        lock(&self.status).state
    }

    /// Whether the request reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            RequestState::Succeeded | RequestState::Failed
        )
    }

    pub fn has_succeeded(&self) -> bool {
        self.state() == RequestState::Succeeded
    }

    pub(crate) fn mark_running(&self) {
        let mut status = lock(&self.status);
        if status.state == RequestState::Queued {
            status.state = RequestState::Running;
        }
    }

    /// Record the terminal state; returns false if it was already finished.
    pub(crate) fn mark_finished(&self, succeeded: bool) -> bool {
        let mut status = lock(&self.status);
        if matches!(status.state, RequestState::Succeeded | RequestState::Failed) {
            return false;
        }
        status.state = if succeeded {
            RequestState::Succeeded
        } else {
            RequestState::Failed
        };
        true
    }

    /// Apply a `ModifyPersistentRequest`; absent values are left untouched.
    pub fn modify(&self, client_token: Option<String>, priority_class: Option<i16>) {
        let mut status = lock(&self.status);
        if let Some(token) = client_token {
            status.client_token = Some(token);
        }
        if let Some(priority) = priority_class {
            status.priority_class = priority;
        }
        debug!(
            "modified {} priority={} token={:?}",
            self.id, status.priority_class, status.client_token
        );
    }
}

/// Validate a `PriorityClass` value.
pub fn check_priority_class(priority_class: i16) -> Result<i16, FcpError> {
    if (0..=MIN_PRIORITY_CLASS).contains(&priority_class) {
        Ok(priority_class)
    } else {
        Err(FcpError::protocol(
            ProtocolErrorCode::InvalidField,
            format!("Invalid priority class {priority_class} - range is 0 to {MIN_PRIORITY_CLASS}"),
        ))
    }
}

/// Fetch/insert engine the protocol core hands requests to.
///
/// Results come back through [`crate::Node::on_finished`], from any thread.
pub trait RequestEngine: Send + Sync {
    /// Begin executing a registered request. Must not block on the work.
    ///
    /// `payload` carries the bytes of a direct insert.
    fn start(&self, request: &Arc<ClientRequest>, payload: Option<BulkData>);

    /// Stop a request that was removed or whose connection closed.
    fn cancel(&self, request: &ClientRequest);
}

/// Engine that keeps requests running and records every lifecycle call.
///
/// `fcpd` uses it until a real engine is attached; tests inspect it.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    started: Mutex<Vec<RequestIdentifier>>,
    payload_bytes: Mutex<u64>,
    cancelled: Mutex<Vec<RequestIdentifier>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<RequestIdentifier> {
        lock(&self.started).clone()
    }

    pub fn cancelled(&self) -> Vec<RequestIdentifier> {
        lock(&self.cancelled).clone()
    }

    /// Total insert payload bytes handed over so far.
    pub fn payload_bytes(&self) -> u64 {
        *lock(&self.payload_bytes)
    }
}

impl RequestEngine for RecordingEngine {
    fn start(&self, request: &Arc<ClientRequest>, payload: Option<BulkData>) {
        request.mark_running();
        if let Some(payload) = payload {
            *lock(&self.payload_bytes) += payload.len();
        }
        lock(&self.started).push(request.identifier().clone());
    }

    fn cancel(&self, request: &ClientRequest) {
        lock(&self.cancelled).push(request.identifier().clone());
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
