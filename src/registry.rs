// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Track per-client request queues across reconnects and restarts.
// Author: Lukas Bower

//! Persistent client registry.
//!
//! One [`PersistentClient`] exists per client name, plus the global queue
//! created with the registry. The name map is guarded by one lock held only
//! for map mutation; each client's request collections have their own lock.
//! Connections are referenced weakly and never kept alive by the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::FcpError;
use crate::identifier::RequestIdentifier;
use crate::lock;
use crate::message::NodeMessage;
use crate::request::{ClientRequest, Persistence, RequestEngine};

/// Name of the shared global queue.
pub const GLOBAL_QUEUE_NAME: &str = "Global Queue";

/// Verbosity bit for `SimpleProgress`-class messages.
pub const VERBOSITY_SIMPLE_PROGRESS: i32 = 1;

/// Observer of request completion and removal.
pub trait CompletionCallback: Send + Sync {
    fn on_success(&self, _request: &ClientRequest) {}
    fn on_failure(&self, _request: &ClientRequest) {}
    fn on_remove(&self, _request: &ClientRequest) {}
}

#[derive(Default)]
struct ClientState {
    connection: Weak<Connection>,
    running: Vec<Arc<ClientRequest>>,
    completed_unacked: Vec<Arc<ClientRequest>>,
    by_identifier: HashMap<String, Arc<ClientRequest>>,
    watch_global: bool,
    watch_global_mask: i32,
    callbacks: Vec<Arc<dyn CompletionCallback>>,
}

/// A request queue owned by one client name, or the global queue.
pub struct PersistentClient {
    name: String,
    global: bool,
    state: Mutex<ClientState>,
    watchers: Mutex<Vec<Weak<PersistentClient>>>,
}

impl PersistentClient {
    fn new(name: &str, global: bool) -> Self {
        Self {
            name: name.to_owned(),
            global,
            state: Mutex::new(ClientState::default()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    /// Live connection currently attached, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        lock(&self.state).connection.upgrade()
    }

    pub(crate) fn set_connection(&self, connection: &Arc<Connection>) {
        lock(&self.state).connection = Arc::downgrade(connection);
    }

    /// Detach `connection` if it is still the current one.
    pub fn on_lost_connection(&self, connection: &Connection) {
        let mut state = lock(&self.state);
        if std::ptr::eq(state.connection.as_ptr(), connection) {
            state.connection = Weak::new();
        }
    }

    /// Add a new request; an existing identifier is a collision.
    pub fn register(&self, request: Arc<ClientRequest>) -> Result<(), FcpError> {
        let identifier = request.identifier().identifier().to_owned();
        let mut state = lock(&self.state);
        if let Some(existing) = state.by_identifier.get(&identifier) {
            if !Arc::ptr_eq(existing, &request) {
                return Err(FcpError::IdentifierCollision {
                    identifier,
                    global: self.global,
                });
            }
            return Ok(());
        }
        if request.is_finished() {
            state.completed_unacked.push(Arc::clone(&request));
        } else {
            state.running.push(Arc::clone(&request));
        }
        state.by_identifier.insert(identifier, request);
        debug!("{}: registered {}", self.name, state.by_identifier.len());
        Ok(())
    }

    /// Re-add a request loaded at startup. A duplicate identifier is an error
    /// and the existing request is kept.
    pub fn resume(&self, request: Arc<ClientRequest>) -> Result<(), FcpError> {
        let identifier = request.identifier().identifier().to_owned();
        let mut state = lock(&self.state);
        if state.by_identifier.contains_key(&identifier) {
            error!("{}: resumed identifier {identifier} twice", self.name);
            return Err(FcpError::IdentifierCollision {
                identifier,
                global: self.global,
            });
        }
        if request.is_finished() {
            state.completed_unacked.push(Arc::clone(&request));
        } else {
            state.running.push(Arc::clone(&request));
        }
        state.by_identifier.insert(identifier, request);
        Ok(())
    }

    pub fn get_request(&self, identifier: &str) -> Option<Arc<ClientRequest>> {
        lock(&self.state).by_identifier.get(identifier).cloned()
    }

    pub fn has_request(&self, identifier: &str) -> bool {
        lock(&self.state).by_identifier.contains_key(identifier)
    }

    /// Remove a request, cancelling it when `kill` is set.
    pub fn remove_by_identifier(
        &self,
        identifier: &str,
        kill: bool,
        engine: &dyn RequestEngine,
    ) -> Option<Arc<ClientRequest>> {
        let (request, callbacks) = {
            let mut state = lock(&self.state);
            let request = state.by_identifier.remove(identifier)?;
            state.running.retain(|other| !Arc::ptr_eq(other, &request));
            state
                .completed_unacked
                .retain(|other| !Arc::ptr_eq(other, &request));
            (request, state.callbacks.clone())
        };
        if kill {
            engine.cancel(&request);
        }
        for callback in &callbacks {
            callback.on_remove(&request);
        }
        debug!("{}: removed {identifier}", self.name);
        Some(request)
    }

    /// Move a finished request to the completed-unacknowledged list.
    ///
    /// Returns false when `request` is not running on this client, which
    /// covers removed requests and repeated completions.
    pub fn finished(&self, request: &Arc<ClientRequest>, succeeded: bool) -> bool {
        let callbacks = {
            let mut state = lock(&self.state);
            let Some(index) = state
                .running
                .iter()
                .position(|other| Arc::ptr_eq(other, request))
            else {
                return false;
            };
            if !request.mark_finished(succeeded) {
                return false;
            }
            let done = state.running.remove(index);
            state.completed_unacked.push(done);
            state.callbacks.clone()
        };
        for callback in &callbacks {
            if succeeded {
                callback.on_success(request);
            } else {
                callback.on_failure(request);
            }
        }
        true
    }

    /// Whether any reboot or forever request is still owned.
    pub fn has_persistent_requests(&self) -> bool {
        let state = lock(&self.state);
        !(state.running.is_empty() && state.completed_unacked.is_empty())
    }

    /// Running requests followed by completed ones, each in insertion order.
    pub fn requests(&self) -> Vec<Arc<ClientRequest>> {
        let state = lock(&self.state);
        state
            .running
            .iter()
            .chain(state.completed_unacked.iter())
            .cloned()
            .collect()
    }

    pub fn completed_unacked(&self) -> Vec<Arc<ClientRequest>> {
        lock(&self.state).completed_unacked.clone()
    }

    pub fn add_completion_callback(&self, callback: Arc<dyn CompletionCallback>) {
        lock(&self.state).callbacks.push(callback);
    }

    pub fn is_watching_global(&self) -> bool {
        lock(&self.state).watch_global
    }

    /// Start or stop receiving the global queue's messages.
    ///
    /// Returns false on the global queue itself.
    pub fn set_watch_global(
        self: &Arc<Self>,
        enabled: bool,
        verbosity_mask: i32,
        global: &PersistentClient,
    ) -> bool {
        if self.global {
            warn!("watch global requested on the global queue");
            return false;
        }
        let changed = {
            let mut state = lock(&self.state);
            let was = state.watch_global;
            state.watch_global = enabled;
            state.watch_global_mask = verbosity_mask;
            was != enabled
        };
        if changed {
            if enabled {
                global.watch(self);
            } else {
                global.unwatch(self);
            }
        }
        true
    }

    fn watch(&self, client: &Arc<PersistentClient>) {
        let mut watchers = lock(&self.watchers);
        watchers.retain(|watcher| watcher.strong_count() > 0);
        watchers.push(Arc::downgrade(client));
    }

    fn unwatch(&self, client: &PersistentClient) {
        lock(&self.watchers)
            .retain(|watcher| watcher.strong_count() > 0 && !std::ptr::eq(watcher.as_ptr(), client));
    }

    /// Send a request message to this client's connection, and on the global
    /// queue also to every watching client whose mask admits `verbosity`.
    pub fn queue_message(&self, message: &NodeMessage, verbosity: i32) {
        if let Some(connection) = self.connection() {
            connection.send(message.clone());
        }
        if !self.global {
            return;
        }
        let watchers: Vec<_> = lock(&self.watchers)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for watcher in watchers {
            let mask = lock(&watcher.state).watch_global_mask;
            if verbosity & mask != verbosity {
                continue;
            }
            if let Some(connection) = watcher.connection() {
                connection.send(message.clone());
            }
        }
    }
}

impl fmt::Debug for PersistentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentClient")
            .field("name", &self.name)
            .field("global", &self.global)
            .finish()
    }
}

/// Registry of every named client plus the global queue.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<PersistentClient>>>,
    global: Arc<PersistentClient>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            global: Arc::new(PersistentClient::new(GLOBAL_QUEUE_NAME, true)),
        }
    }

    /// Open connections of every named client.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.clients)
            .values()
            .filter_map(|client| client.connection())
            .filter(|connection| !connection.is_closed())
            .collect()
    }

    /// The global queue.
    pub fn global(&self) -> &Arc<PersistentClient> {
        &self.global
    }

    /// Find or create the client named `name` and attach `connection` to it.
    ///
    /// A different live connection already attached to the client is told
    /// `CloseConnectionDuplicateClientName` and closed. Attaching happens
    /// after the map lock is released.
    pub fn register_or_get_client(
        &self,
        name: &str,
        connection: &Arc<Connection>,
    ) -> Arc<PersistentClient> {
        let (client, created) = {
            let mut clients = lock(&self.clients);
            match clients.get(name) {
                Some(client) => (Arc::clone(client), false),
                None => {
                    let client = Arc::new(PersistentClient::new(name, false));
                    clients.insert(name.to_owned(), Arc::clone(&client));
                    (client, true)
                }
            }
        };
        if created {
            info!("registered client {name}");
        } else if let Some(previous) = client.connection() {
            if !Arc::ptr_eq(&previous, connection) && !previous.is_closed() {
                previous.kill_duplicate();
            }
        }
        client.set_connection(connection);
        client
    }

    /// Client by name, without creating it.
    pub fn get_client(&self, name: &str) -> Option<Arc<PersistentClient>> {
        lock(&self.clients).get(name).cloned()
    }

    /// Client owning `id`'s queue, without creating it.
    pub fn client_for(&self, id: &RequestIdentifier) -> Option<Arc<PersistentClient>> {
        match id.client_name() {
            None => Some(Arc::clone(&self.global)),
            Some(name) => self.get_client(name),
        }
    }

    /// Re-add a request loaded at startup, creating its client lazily.
    pub fn resume(&self, request: Arc<ClientRequest>) -> Result<Arc<PersistentClient>, FcpError> {
        let client = match request.identifier().client_name() {
            None => Arc::clone(&self.global),
            Some(name) => {
                let mut clients = lock(&self.clients);
                Arc::clone(
                    clients
                        .entry(name.to_owned())
                        .or_insert_with(|| Arc::new(PersistentClient::new(name, false))),
                )
            }
        };
        client.resume(request)?;
        Ok(client)
    }

    /// Drop a named client that owns no requests and has no live connection.
    pub fn unregister_if_empty(&self, client: &Arc<PersistentClient>) -> bool {
        if client.is_global() {
            return false;
        }
        let mut clients = lock(&self.clients);
        let Some(current) = clients.get(client.name()) else {
            return false;
        };
        if !Arc::ptr_eq(current, client)
            || client.has_persistent_requests()
            || client.connection().is_some_and(|connection| !connection.is_closed())
        {
            return false;
        }
        clients.remove(client.name());
        info!("unregistered client {}", client.name());
        true
    }

    /// Whether `id` names an existing request on its queue.
    pub fn has_request(&self, id: &RequestIdentifier) -> bool {
        self.client_for(id)
            .is_some_and(|client| client.has_request(id.identifier()))
    }

    /// Names of every registered client, sorted.
    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.clients).keys().cloned().collect();
        names.sort();
        names
    }

    /// Every forever-persisted request on every queue, global first.
    pub fn forever_requests(&self) -> Vec<Arc<ClientRequest>> {
        let clients: Vec<_> = {
            let mut clients: Vec<_> = lock(&self.clients).values().cloned().collect();
            clients.sort_by(|a, b| a.name().cmp(b.name()));
            clients
        };
        std::iter::once(&self.global)
            .chain(clients.iter())
            .flat_map(|client| client.requests())
            .filter(|request| request.persistence() == Persistence::Forever)
            .collect()
    }
}
