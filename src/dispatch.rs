// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate, authorise and execute one decoded client message.
// Author: Lukas Bower

//! Message dispatch.
//!
//! [`handle`] is called once per decoded message, strictly in arrival order
//! for a connection. Checks run in a fixed order: shutdown, direction,
//! handshake, field validation, access level, execution. Every message-scoped
//! failure becomes exactly one reply; only fatal ones end the connection.

use std::sync::Arc;

use fcp_wire::{BulkData, RawMessage};
use log::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{FcpError, ProtocolErrorCode};
use crate::identifier::{RequestIdentifier, RequestKind};
use crate::message::{
    decode_client_message, direction_of, ClientGet, ClientHello, ClientMessage, ClientPut,
    MessageDirection, ModifyPersistentRequest, NodeMessage, RequestFields, ReturnType,
    SubscribeUsk, UploadFrom, WatchGlobal,
};
use crate::node::Node;
use crate::registry::PersistentClient;
use crate::request::{ClientRequest, Persistence};
use crate::usk::{PollMode, UskSubscription};

/// What the reader loop does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Process one message from `connection`.
pub fn handle(connection: &Arc<Connection>, node: &Node, raw: RawMessage) -> Flow {
    if connection.is_closed() {
        return Flow::Close;
    }
    let identifier = raw.fields.get("Identifier").map(str::to_owned);
    let global = raw.fields.get_bool("Global", false).unwrap_or(false);
    match dispatch(connection, node, raw) {
        Ok(flow) => flow,
        Err(err) => {
            let err = err.with_identifier(identifier.as_deref(), global);
            report(connection, &err)
        }
    }
}

fn report(connection: &Connection, err: &FcpError) -> Flow {
    if err.is_fatal() {
        warn!("connection {}: fatal protocol error: {err}", connection.id());
    } else {
        debug!("connection {}: {err}", connection.id());
    }
    connection.send(NodeMessage::from(err));
    if err.is_fatal() {
        Flow::Close
    } else {
        Flow::Continue
    }
}

fn dispatch(connection: &Arc<Connection>, node: &Node, raw: RawMessage) -> Result<Flow, FcpError> {
    if node.is_shutting_down() {
        return Err(FcpError::protocol(
            ProtocolErrorCode::ShuttingDown,
            "Node is shutting down",
        ));
    }
    if direction_of(&raw.name) == Some(MessageDirection::ClientToNode) {
        let is_hello = raw.name == "ClientHello";
        if !connection.hello_seen() && !is_hello {
            return Err(FcpError::fatal(
                ProtocolErrorCode::ClientHelloMustBeFirst,
                "First message must be ClientHello",
            ));
        }
        if connection.hello_seen() && is_hello {
            return Err(FcpError::protocol(
                ProtocolErrorCode::NoLateClientHello,
                "Only one ClientHello per connection",
            ));
        }
    }
    let message = decode_client_message(raw)?;
    if message.requires_full_access() && !connection.has_full_access() {
        return Err(FcpError::protocol(
            ProtocolErrorCode::AccessDenied,
            format!("{} requires full access", message.name()),
        ));
    }
    execute(connection, node, message)
}

fn execute(
    connection: &Arc<Connection>,
    node: &Node,
    message: ClientMessage,
) -> Result<Flow, FcpError> {
    match message {
        ClientMessage::ClientHello(hello) => client_hello(connection, node, &hello),
        ClientMessage::ClientGet(get) => client_get(connection, node, get),
        ClientMessage::ClientPut(put) => client_put(connection, node, put),
        ClientMessage::SubscribeUsk(subscribe) => subscribe_usk(connection, node, subscribe),
        ClientMessage::UnsubscribeUsk { identifier } => {
            unsubscribe_usk(connection, node, &identifier)
        }
        ClientMessage::WatchGlobal(watch) => watch_global(connection, node, watch),
        ClientMessage::ListPersistentRequests { identifier } => {
            list_persistent_requests(connection, node, identifier)
        }
        ClientMessage::RemoveRequest { identifier, global } => {
            remove_request(connection, node, &identifier, global)
        }
        ClientMessage::ModifyPersistentRequest(modify) => {
            modify_persistent_request(connection, node, modify)
        }
        ClientMessage::Disconnect => {
            info!("connection {} disconnecting", connection.id());
            Ok(Flow::Close)
        }
        ClientMessage::Shutdown => {
            node.begin_shutdown();
            Ok(Flow::Continue)
        }
        ClientMessage::Void => Ok(Flow::Continue),
    }
}

fn client_hello(
    connection: &Arc<Connection>,
    node: &Node,
    hello: &ClientHello,
) -> Result<Flow, FcpError> {
    connection.set_hello_seen();
    let client = node.registry.register_or_get_client(&hello.name, connection);
    connection.attach_client(&hello.name, Arc::clone(&client));
    info!(
        "connection {} is client {} (expects FCP {})",
        connection.id(),
        hello.name,
        hello.expected_version
    );
    connection.send(NodeMessage::NodeHello {
        connection_identifier: connection.id().to_owned(),
        fcp_version: node.info.fcp_version.clone(),
        node: node.info.name.clone(),
        version: node.info.version.clone(),
    });
    for request in client.completed_unacked() {
        connection.send(NodeMessage::PersistentRequest {
            request,
            list_request_identifier: None,
        });
    }
    Ok(Flow::Continue)
}

fn own_client(connection: &Connection) -> Result<Arc<PersistentClient>, FcpError> {
    connection.client().ok_or_else(|| {
        FcpError::protocol(ProtocolErrorCode::InternalError, "Connection has no client")
    })
}

fn target_client(
    connection: &Connection,
    node: &Node,
    global: bool,
) -> Result<Arc<PersistentClient>, FcpError> {
    if global {
        Ok(Arc::clone(node.registry.global()))
    } else {
        own_client(connection)
    }
}

fn client_get(connection: &Arc<Connection>, node: &Node, get: ClientGet) -> Result<Flow, FcpError> {
    if get.return_type == ReturnType::None {
        debug!("{}: completion only, no data returned", get.request.identifier);
    }
    let submission = Submission {
        return_type: get.return_type,
        ..Submission::default()
    };
    submit(connection, node, get.request, RequestKind::Get, submission)
}

fn client_put(connection: &Arc<Connection>, node: &Node, put: ClientPut) -> Result<Flow, FcpError> {
    let mut submission = Submission {
        content_type: put.content_type,
        ..Submission::default()
    };
    match put.upload_from {
        UploadFrom::Direct(data) => submission.payload = Some(data),
        UploadFrom::Redirect { target_uri } => {
            debug!("{}: redirect to {target_uri}", put.request.identifier);
            submission.target_uri = Some(target_uri);
        }
    }
    submit(connection, node, put.request, RequestKind::Put, submission)
}

/// Message-specific settings for a new request.
#[derive(Default)]
struct Submission {
    return_type: ReturnType,
    content_type: Option<String>,
    target_uri: Option<String>,
    payload: Option<BulkData>,
}

/// Register a new request on the queue its persistence selects, then start it.
fn submit(
    connection: &Arc<Connection>,
    node: &Node,
    fields: RequestFields,
    kind: RequestKind,
    submission: Submission,
) -> Result<Flow, FcpError> {
    let id = if fields.global {
        RequestIdentifier::global(fields.identifier.clone(), kind)
    } else {
        let name = connection.client_name().ok_or_else(|| {
            FcpError::protocol(ProtocolErrorCode::InternalError, "Connection has no client")
        })?;
        RequestIdentifier::for_client(name, fields.identifier.clone(), kind)
    };
    let mut request = ClientRequest::new(id, fields.persistence, fields.uri)
        .with_verbosity(fields.verbosity)
        .with_priority_class(fields.priority_class)
        .with_client_token(fields.client_token)
        .with_return_type(submission.return_type)
        .with_content_type(submission.content_type)
        .with_target_uri(submission.target_uri);
    if fields.persistence == Persistence::Connection {
        request = request.with_connection(connection);
    }
    let request = Arc::new(request);
    let payload = submission.payload;
    match fields.persistence {
        Persistence::Connection => {
            connection.add_request(Arc::clone(&request))?;
            node.engine.start(&request, payload);
        }
        Persistence::Reboot => {
            let client = target_client(connection, node, fields.global)?;
            client.register(Arc::clone(&request))?;
            announce(&client, &request);
            node.engine.start(&request, payload);
        }
        Persistence::Forever => {
            let client = target_client(connection, node, fields.global)?;
            let engine = Arc::clone(&node.engine);
            let reply_to = Arc::clone(connection);
            let queued = Arc::clone(&request);
            let job = Box::new(move || match client.register(Arc::clone(&queued)) {
                Ok(()) => {
                    announce(&client, &queued);
                    engine.start(&queued, payload);
                    true
                }
                Err(err) => {
                    info!("{}: {err}", queued.identifier());
                    reply_to.send(NodeMessage::from(&err));
                    false
                }
            });
            node.jobs.queue(job).map_err(|_| FcpError::PersistenceDisabled {
                identifier: Some(fields.identifier.clone()),
                global: fields.global,
            })?;
        }
    }
    debug!("{} submitted ({})", request.identifier(), request.persistence());
    Ok(Flow::Continue)
}

fn announce(client: &PersistentClient, request: &Arc<ClientRequest>) {
    client.queue_message(
        &NodeMessage::PersistentRequest {
            request: Arc::clone(request),
            list_request_identifier: None,
        },
        0,
    );
}

fn subscribe_usk(
    connection: &Arc<Connection>,
    node: &Node,
    subscribe: SubscribeUsk,
) -> Result<Flow, FcpError> {
    let mode = if subscribe.dont_poll {
        PollMode::Passive
    } else if subscribe.sparse_poll {
        PollMode::Sparse
    } else {
        PollMode::Dense
    };
    let reply = NodeMessage::SubscribedUsk {
        identifier: subscribe.identifier.clone(),
        uri: subscribe.uri.to_string(),
        dont_poll: subscribe.dont_poll,
        sparse_poll: subscribe.sparse_poll,
    };
    let service = Arc::clone(&node.usk);
    connection.add_subscription(&subscribe.identifier, |events| {
        connection.send(reply);
        UskSubscription::start(
            service.as_ref(),
            &subscribe.identifier,
            subscribe.uri.clone(),
            mode,
            subscribe.priorities,
            events,
        )
    })?;
    Ok(Flow::Continue)
}

fn unsubscribe_usk(connection: &Connection, node: &Node, identifier: &str) -> Result<Flow, FcpError> {
    let subscription = connection.remove_subscription(identifier).ok_or_else(|| {
        FcpError::protocol(
            ProtocolErrorCode::NoSuchIdentifier,
            format!("No USK subscription {identifier}"),
        )
    })?;
    subscription.unsubscribe(node.usk.as_ref());
    Ok(Flow::Continue)
}

fn watch_global(connection: &Connection, node: &Node, watch: WatchGlobal) -> Result<Flow, FcpError> {
    let client = own_client(connection)?;
    client.set_watch_global(watch.enabled, watch.verbosity_mask, node.registry.global());
    debug!(
        "{} watch global: {} mask {}",
        client.name(),
        watch.enabled,
        watch.verbosity_mask
    );
    Ok(Flow::Continue)
}

fn list_persistent_requests(
    connection: &Arc<Connection>,
    node: &Node,
    identifier: Option<String>,
) -> Result<Flow, FcpError> {
    let client = own_client(connection)?;
    let mut clients = vec![client];
    if clients[0].is_watching_global() {
        clients.push(Arc::clone(node.registry.global()));
    }
    send_listed(connection, &clients, Persistence::Reboot, identifier.as_deref());
    let reply_to = Arc::clone(connection);
    let end = NodeMessage::EndListPersistentRequests {
        identifier: identifier.clone(),
    };
    let job_end = end.clone();
    let job = Box::new(move || {
        send_listed(&reply_to, &clients, Persistence::Forever, identifier.as_deref());
        reply_to.send(job_end);
        false
    });
    if node.jobs.queue(job).is_err() {
        connection.send(end);
    }
    Ok(Flow::Continue)
}

fn send_listed(
    connection: &Connection,
    clients: &[Arc<PersistentClient>],
    persistence: Persistence,
    list_identifier: Option<&str>,
) {
    for client in clients {
        for request in client.requests() {
            if request.persistence() == persistence {
                connection.send(NodeMessage::PersistentRequest {
                    request,
                    list_request_identifier: list_identifier.map(str::to_owned),
                });
            }
        }
    }
}

fn no_such_identifier(identifier: &str) -> FcpError {
    FcpError::protocol(
        ProtocolErrorCode::NoSuchIdentifier,
        format!("No such identifier {identifier}"),
    )
}

fn remove_request(
    connection: &Arc<Connection>,
    node: &Node,
    identifier: &str,
    global: bool,
) -> Result<Flow, FcpError> {
    let removed = NodeMessage::PersistentRequestRemoved {
        identifier: identifier.to_owned(),
        global,
    };
    if !global {
        if let Some(request) = connection.remove_request(identifier) {
            node.engine.cancel(&request);
            connection.send(removed);
            return Ok(Flow::Continue);
        }
    }
    let client = target_client(connection, node, global)?;
    let request = client
        .get_request(identifier)
        .ok_or_else(|| no_such_identifier(identifier))?;
    let registry = Arc::clone(&node.registry);
    let engine = Arc::clone(&node.engine);
    let identifier = identifier.to_owned();
    let remove = move || {
        if client
            .remove_by_identifier(&identifier, true, engine.as_ref())
            .is_none()
        {
            return false;
        }
        client.queue_message(&removed, 0);
        registry.unregister_if_empty(&client);
        true
    };
    run_durable(node, request.persistence(), remove, &request)
}

fn modify_persistent_request(
    connection: &Arc<Connection>,
    node: &Node,
    modify: ModifyPersistentRequest,
) -> Result<Flow, FcpError> {
    let client = target_client(connection, node, modify.global)?;
    let request = client
        .get_request(&modify.identifier)
        .ok_or_else(|| no_such_identifier(&modify.identifier))?;
    let target = Arc::clone(&request);
    let apply = move || {
        target.modify(modify.client_token.clone(), modify.priority_class);
        client.queue_message(
            &NodeMessage::PersistentRequestModified {
                identifier: modify.identifier,
                global: modify.global,
                client_token: modify.client_token,
                priority_class: modify.priority_class,
            },
            0,
        );
        true
    };
    run_durable(node, request.persistence(), apply, &request)
}

/// Apply a mutation inline, or as a persistent job for forever requests.
fn run_durable<F>(
    node: &Node,
    persistence: Persistence,
    work: F,
    request: &ClientRequest,
) -> Result<Flow, FcpError>
where
    F: FnOnce() -> bool + Send + 'static,
{
    if persistence == Persistence::Forever {
        node.jobs
            .queue(Box::new(work))
            .map_err(|_| FcpError::PersistenceDisabled {
                identifier: Some(request.identifier().identifier().to_owned()),
                global: request.identifier().is_global(),
            })?;
    } else {
        work();
    }
    Ok(Flow::Continue)
}
