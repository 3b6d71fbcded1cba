// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-connection state shared by the reader, writer and USK consumer.
// Author: Lukas Bower

//! Client connections.
//!
//! A [`Connection`] owns its outbound queue, its connection-persistence
//! requests and its USK subscriptions. The registry only keeps a weak
//! reference to it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::error::FcpError;
use crate::lock;
use crate::message::NodeMessage;
use crate::node::Node;
use crate::registry::PersistentClient;
use crate::request::ClientRequest;
use crate::usk::{UskEvent, UskSubscription};

/// Default outbound queue bound for detached connections.
pub const DEFAULT_QUEUE_LEN: usize = 1024;

static NEXT_DETACHED: AtomicU64 = AtomicU64::new(1);

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Receiving ends created alongside a connection.
pub struct ConnectionChannels {
    /// Messages to write to the client, in order.
    pub outbound: Receiver<NodeMessage>,
    /// Events for the USK consumer loop.
    pub usk_events: Receiver<UskEvent>,
}

#[derive(Default)]
struct ConnectionState {
    released: bool,
    hello_seen: bool,
    killed_dupe: bool,
    client_name: Option<String>,
    client: Option<Arc<PersistentClient>>,
    requests: HashMap<String, Arc<ClientRequest>>,
    subscriptions: HashMap<String, UskSubscription>,
    usk_events: Option<Sender<UskEvent>>,
}

/// One client connection.
pub struct Connection {
    id: String,
    peer: Option<SocketAddr>,
    full_access: bool,
    closed: AtomicBool,
    outbound: Mutex<Option<SyncSender<NodeMessage>>>,
    state: Mutex<ConnectionState>,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
}

impl Connection {
    /// Create a connection with a bounded outbound queue.
    pub fn new(
        id: impl Into<String>,
        peer: Option<SocketAddr>,
        full_access: bool,
        queue_len: usize,
    ) -> (Arc<Self>, ConnectionChannels) {
        let (out_tx, out_rx) = mpsc::sync_channel(queue_len.max(1));
        let (usk_tx, usk_rx) = mpsc::channel();
        let connection = Arc::new(Self {
            id: id.into(),
            peer,
            full_access,
            closed: AtomicBool::new(false),
            outbound: Mutex::new(Some(out_tx)),
            state: Mutex::new(ConnectionState {
                usk_events: Some(usk_tx),
                ..ConnectionState::default()
            }),
            shutdown_hook: Mutex::new(None),
        });
        (
            connection,
            ConnectionChannels {
                outbound: out_rx,
                usk_events: usk_rx,
            },
        )
    }

    /// Connection without a socket; the caller reads the channels directly.
    pub fn detached(full_access: bool) -> (Arc<Self>, ConnectionChannels) {
        let id = format!("detached-{}", NEXT_DETACHED.fetch_add(1, Ordering::Relaxed));
        Self::new(id, None, full_access, DEFAULT_QUEUE_LEN)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn has_full_access(&self) -> bool {
        self.full_access
    }

    /// Whether dispatch and event delivery have stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a message for the client.
    ///
    /// Returns false when the connection is closed; a final `ProtocolError` or
    /// duplicate-name notice is still queued until the writer is released. A
    /// full queue means the client stopped reading and closes the connection.
    pub fn send(&self, message: NodeMessage) -> bool {
        let final_reply = matches!(
            message,
            NodeMessage::ProtocolError { .. } | NodeMessage::CloseConnectionDuplicateClientName
        );
        if self.is_closed() && !final_reply {
            return false;
        }
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(
                    "connection {} outbound queue full, dropping {} and closing",
                    self.id,
                    message.name()
                );
                drop(outbound);
                self.abort();
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Install the callback that tears down the transport.
    pub fn set_shutdown_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.shutdown_hook) = Some(Box::new(hook));
    }

    /// Stop dispatch and event delivery. Returns true on the first call.
    ///
    /// Resources are released by [`Connection::close`].
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Mark closed and tear down the transport so the reader wakes up.
    pub fn abort(&self) {
        self.mark_closed();
        let hook = lock(&self.shutdown_hook).take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn kill_duplicate(&self) {
        lock(&self.state).killed_dupe = true;
        info!("connection {} replaced by a newer connection for the same client", self.id);
        self.send(NodeMessage::CloseConnectionDuplicateClientName);
        self.abort();
    }

    pub fn is_killed_duplicate(&self) -> bool {
        lock(&self.state).killed_dupe
    }

    pub(crate) fn hello_seen(&self) -> bool {
        lock(&self.state).hello_seen
    }

    pub(crate) fn set_hello_seen(&self) {
        lock(&self.state).hello_seen = true;
    }

    /// Name from `ClientHello`, once received.
    pub fn client_name(&self) -> Option<String> {
        lock(&self.state).client_name.clone()
    }

    /// Registry entry this connection is attached to.
    pub fn client(&self) -> Option<Arc<PersistentClient>> {
        lock(&self.state).client.clone()
    }

    pub(crate) fn attach_client(&self, name: &str, client: Arc<PersistentClient>) {
        let mut state = lock(&self.state);
        state.client_name = Some(name.to_owned());
        state.client = Some(client);
    }

    /// Track a connection-persistence request; identifiers are unique per connection.
    pub(crate) fn add_request(&self, request: Arc<ClientRequest>) -> Result<(), FcpError> {
        let mut state = lock(&self.state);
        let identifier = request.identifier().identifier().to_owned();
        if state.requests.contains_key(&identifier) {
            return Err(FcpError::IdentifierCollision {
                identifier,
                global: false,
            });
        }
        state.requests.insert(identifier, request);
        Ok(())
    }

    pub fn request(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        lock(&self.state).requests.get(identifier).cloned()
    }

    pub fn requests(&self) -> Vec<Arc<ClientRequest>> {
        lock(&self.state).requests.values().cloned().collect()
    }

    pub(crate) fn remove_request(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        lock(&self.state).requests.remove(identifier)
    }

    /// Drop `request` if it is still the one stored under its identifier.
    pub(crate) fn take_finished(&self, request: &Arc<ClientRequest>) -> bool {
        let mut state = lock(&self.state);
        let identifier = request.identifier().identifier();
        match state.requests.get(identifier) {
            Some(stored) if Arc::ptr_eq(stored, request) => {
                state.requests.remove(identifier);
                true
            }
            _ => false,
        }
    }

    /// Register a USK subscription while holding the connection lock.
    ///
    /// `start` runs under the lock, so no event for the new subscription is
    /// delivered before it is recorded.
    pub(crate) fn add_subscription<F>(&self, identifier: &str, start: F) -> Result<(), FcpError>
    where
        F: FnOnce(Sender<UskEvent>) -> UskSubscription,
    {
        let mut state = lock(&self.state);
        if state.subscriptions.contains_key(identifier) {
            return Err(FcpError::IdentifierCollision {
                identifier: identifier.to_owned(),
                global: false,
            });
        }
        let Some(tx) = state.usk_events.clone() else {
            debug!("connection {} released, ignoring subscription {identifier}", self.id);
            return Ok(());
        };
        let subscription = start(tx);
        state
            .subscriptions
            .insert(identifier.to_owned(), subscription);
        Ok(())
    }

    pub(crate) fn remove_subscription(&self, identifier: &str) -> Option<UskSubscription> {
        lock(&self.state).subscriptions.remove(identifier)
    }

    pub(crate) fn take_subscription_if(
        &self,
        identifier: &str,
        sink_id: u64,
    ) -> Option<UskSubscription> {
        let mut state = lock(&self.state);
        match state.subscriptions.get(identifier) {
            Some(subscription) if subscription.sink_id() == sink_id => {
                state.subscriptions.remove(identifier)
            }
            _ => None,
        }
    }

    pub(crate) fn has_subscription(&self, identifier: &str, sink_id: u64) -> bool {
        lock(&self.state)
            .subscriptions
            .get(identifier)
            .is_some_and(|subscription| subscription.sink_id() == sink_id)
    }

    /// Number of live USK subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    /// Close the connection and release everything it owns.
    ///
    /// USK subscriptions are unsubscribed, connection-persistence requests are
    /// cancelled and the registry client is detached. Durable requests are left
    /// alone. Safe to call more than once.
    pub fn close(&self, node: &Node) {
        self.mark_closed();
        let (requests, subscriptions, client, dupe) = {
            let mut state = lock(&self.state);
            if state.released {
                return;
            }
            state.released = true;
            state.usk_events = None;
            let requests: Vec<_> = state.requests.drain().map(|(_, request)| request).collect();
            let subscriptions: Vec<_> = state
                .subscriptions
                .drain()
                .map(|(_, subscription)| subscription)
                .collect();
            (requests, subscriptions, state.client.take(), state.killed_dupe)
        };
        for request in &requests {
            node.engine.cancel(request);
        }
        for subscription in &subscriptions {
            subscription.unsubscribe(node.usk.as_ref());
        }
        if let Some(client) = client {
            client.on_lost_connection(self);
            if !dupe && !client.is_global() {
                let registry = Arc::clone(&node.registry);
                let queued = Arc::clone(&client);
                let job = Box::new(move || {
                    registry.unregister_if_empty(&queued);
                    false
                });
                if node.jobs.queue(job).is_err() {
                    node.registry.unregister_if_empty(&client);
                }
            }
        }
        lock(&self.outbound).take();
        info!(
            "connection {} closed ({} requests cancelled, {} subscriptions dropped)",
            self.id,
            requests.len(),
            subscriptions.len()
        );
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("full_access", &self.full_access)
            .field("closed", &self.is_closed())
            .finish()
    }
}
