// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bridge USK edition watches from the update service to connection events.
// Author: Lukas Bower

//! USK subscription engine.
//!
//! The update service never calls into a connection. It pushes [`UskEvent`]s
//! onto the connection's event channel through a [`UskSink`], and one consumer
//! per connection turns them into `SubscribedUSK*` replies in arrival order.
//! Events for subscriptions that are gone are dropped; the first event seen
//! after the connection closed unsubscribes its subscription.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, trace};

use crate::connection::Connection;
use crate::error::{FcpError, ProtocolErrorCode};
use crate::lock;
use crate::message::NodeMessage;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// A parsed `USK@…/<docname>/<edition>` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UskUri {
    base: String,
    edition: i64,
}

impl UskUri {
    /// Key without its edition suffix; subscriptions match on it.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    #[must_use]
    pub fn edition(&self) -> i64 {
        self.edition
    }

    /// Same key at another edition.
    #[must_use]
    pub fn at_edition(&self, edition: i64) -> Self {
        Self {
            base: self.base.clone(),
            edition,
        }
    }
}

impl FromStr for UskUri {
    type Err = FcpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| {
            FcpError::protocol(
                ProtocolErrorCode::UriParseError,
                format!("{why}: {value}"),
            )
        };
        let trimmed = value.trim().trim_start_matches("freenet:");
        let Some(rest) = trimmed
            .get(..4)
            .filter(|scheme| scheme.eq_ignore_ascii_case("USK@"))
            .map(|_| &trimmed[4..])
        else {
            return Err(invalid("not a USK"));
        };
        let (path, edition) = rest
            .rsplit_once('/')
            .ok_or_else(|| invalid("USK without edition"))?;
        let (keys, docname) = path
            .split_once('/')
            .ok_or_else(|| invalid("USK without document name"))?;
        if keys.is_empty() || docname.is_empty() {
            return Err(invalid("USK with empty component"));
        }
        let edition = edition
            .parse::<i64>()
            .map_err(|_| invalid("USK edition is not a number"))?;
        Ok(Self {
            base: format!("USK@{path}"),
            edition,
        })
    }
}

impl fmt::Display for UskUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.edition)
    }
}

/// How the update service should look for new editions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Continuous probing.
    Dense,
    /// Background probing at the subscription's priorities.
    Sparse,
    /// No probing; only editions discovered elsewhere are reported.
    Passive,
}

/// `(normal, progress)` priority pair used while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPriorities {
    pub normal: i16,
    pub progress: i16,
}

impl Default for PollPriorities {
    fn default() -> Self {
        Self {
            normal: 4,
            progress: 2,
        }
    }
}

/// A newly found edition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundEdition {
    pub edition: i64,
    pub key: UskUri,
    pub is_metadata: bool,
    pub codec: i16,
    pub data: Option<Vec<u8>>,
    pub known_good: bool,
    pub slot_too: bool,
}

/// Event classes pushed by the update service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UskEventKind {
    FoundEdition(FoundEdition),
    SendingToNetwork,
    RoundFinished,
}

/// An event tagged with the subscription it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UskEvent {
    pub identifier: String,
    pub sink_id: u64,
    pub kind: UskEventKind,
}

/// Write end handed to the update service for one subscription.
#[derive(Debug, Clone)]
pub struct UskSink {
    id: u64,
    identifier: String,
    tx: Sender<UskEvent>,
}

impl UskSink {
    /// New sink with a process-unique id.
    pub fn new(identifier: impl Into<String>, tx: Sender<UskEvent>) -> Self {
        Self {
            id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            identifier: identifier.into(),
            tx,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Push one event; false once the connection's consumer is gone.
    pub fn push(&self, kind: UskEventKind) -> bool {
        self.tx
            .send(UskEvent {
                identifier: self.identifier.clone(),
                sink_id: self.id,
                kind,
            })
            .is_ok()
    }

    pub fn found_edition(&self, found: FoundEdition) -> bool {
        self.push(UskEventKind::FoundEdition(found))
    }

    pub fn sending_to_network(&self) -> bool {
        self.push(UskEventKind::SendingToNetwork)
    }

    pub fn round_finished(&self) -> bool {
        self.push(UskEventKind::RoundFinished)
    }
}

/// Token returned by [`UskUpdateService::subscribe_sparse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceToken(pub u64);

/// What to pass back to [`UskUpdateService::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeHandle {
    /// Handle issued by the service for a sparse subscription.
    Sparse(ServiceToken),
    /// The subscription itself, identified by its sink.
    Direct(u64),
}

/// Update-detection service the engine registers with.
pub trait UskUpdateService: Send + Sync {
    /// Register a sparse poller; the returned token unsubscribes it.
    fn subscribe_sparse(
        &self,
        key: &UskUri,
        priorities: PollPriorities,
        sink: UskSink,
    ) -> ServiceToken;

    /// Register a dense or passive subscriber, later removed by sink id.
    fn subscribe(&self, key: &UskUri, mode: PollMode, priorities: PollPriorities, sink: UskSink);

    /// Remove a subscriber.
    fn unsubscribe(&self, key: &UskUri, handle: &UnsubscribeHandle);
}

/// One active `SubscribeUSK` on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UskSubscription {
    identifier: String,
    key: UskUri,
    mode: PollMode,
    priorities: PollPriorities,
    sink_id: u64,
    handle: UnsubscribeHandle,
}

impl UskSubscription {
    /// Register with `service` and return the local record.
    pub fn start(
        service: &dyn UskUpdateService,
        identifier: &str,
        key: UskUri,
        mode: PollMode,
        priorities: PollPriorities,
        tx: Sender<UskEvent>,
    ) -> Self {
        let sink = UskSink::new(identifier, tx);
        let sink_id = sink.id();
        let handle = match mode {
            PollMode::Sparse => {
                UnsubscribeHandle::Sparse(service.subscribe_sparse(&key, priorities, sink))
            }
            PollMode::Dense | PollMode::Passive => {
                service.subscribe(&key, mode, priorities, sink);
                UnsubscribeHandle::Direct(sink_id)
            }
        };
        debug!("usk subscribe {identifier} {key} {mode:?}");
        Self {
            identifier: identifier.to_owned(),
            key,
            mode,
            priorities,
            sink_id,
            handle,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn key(&self) -> &UskUri {
        &self.key
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn priorities(&self) -> PollPriorities {
        self.priorities
    }

    pub fn sink_id(&self) -> u64 {
        self.sink_id
    }

    pub fn handle(&self) -> UnsubscribeHandle {
        self.handle
    }

    /// Release the service-side registration.
    pub fn unsubscribe(&self, service: &dyn UskUpdateService) {
        debug!("usk unsubscribe {} {}", self.identifier, self.key);
        service.unsubscribe(&self.key, &self.handle);
    }
}

/// Turn one event into at most one reply on `connection`.
///
/// Returns whether a message was queued.
pub fn deliver(connection: &Connection, service: &dyn UskUpdateService, event: UskEvent) -> bool {
    if connection.is_closed() {
        if let Some(subscription) =
            connection.take_subscription_if(&event.identifier, event.sink_id)
        {
            info!(
                "connection {} closed, dropping usk subscription {}",
                connection.id(),
                event.identifier
            );
            subscription.unsubscribe(service);
        }
        return false;
    }
    if !connection.has_subscription(&event.identifier, event.sink_id) {
        trace!("dropping stale usk event for {}", event.identifier);
        return false;
    }
    let identifier = event.identifier;
    let message = match event.kind {
        UskEventKind::FoundEdition(found) => NodeMessage::SubscribedUskUpdate {
            identifier,
            edition: found.edition,
            uri: found.key.at_edition(found.edition).to_string(),
            new_known_good: found.known_good,
            new_slot_too: found.slot_too,
        },
        UskEventKind::SendingToNetwork => NodeMessage::SubscribedUskSendingToNetwork { identifier },
        UskEventKind::RoundFinished => NodeMessage::SubscribedUskRoundFinished { identifier },
    };
    connection.send(message)
}

/// Deliver every event already queued, without blocking.
pub fn pump(
    connection: &Connection,
    service: &dyn UskUpdateService,
    events: &Receiver<UskEvent>,
) -> usize {
    let mut delivered = 0;
    while let Ok(event) = events.try_recv() {
        if deliver(connection, service, event) {
            delivered += 1;
        }
    }
    delivered
}

/// Consumer loop for one connection; returns when every sink is gone.
///
/// Holds only a weak reference so the loop never keeps a connection alive.
pub fn run_consumer(
    connection: Weak<Connection>,
    service: Arc<dyn UskUpdateService>,
    events: Receiver<UskEvent>,
) {
    loop {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => match connection.upgrade() {
                Some(connection) => {
                    deliver(&connection, service.as_ref(), event);
                }
                None => break,
            },
            Err(RecvTimeoutError::Timeout) => {
                if connection.strong_count() == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("usk consumer exiting");
}

#[derive(Debug)]
struct LocalSubscriber {
    base: String,
    mode: PollMode,
    token: Option<ServiceToken>,
    sink: UskSink,
}

#[derive(Debug, Default)]
struct LocalState {
    next_token: u64,
    subscribers: Vec<LocalSubscriber>,
    latest: HashMap<String, i64>,
    unsubscribes: usize,
}

/// In-process update service.
///
/// `publish` fans a newly found edition out to every subscriber of the key,
/// passive ones included; editions not newer than the last published one are
/// ignored. `run_round` reports one polling round to polling subscribers only.
#[derive(Debug, Default)]
pub struct LocalUskService {
    state: Mutex<LocalState>,
}

impl LocalUskService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `key.edition()` as found; returns how many sinks accepted it.
    pub fn publish(&self, key: &UskUri, known_good: bool, slot_too: bool) -> usize {
        let sinks = {
            let mut state = lock(&self.state);
            let latest = state.latest.entry(key.base().to_owned()).or_insert(i64::MIN);
            if key.edition() <= *latest {
                trace!("ignoring old edition {key}");
                return 0;
            }
            *latest = key.edition();
            state
                .subscribers
                .iter()
                .filter(|subscriber| subscriber.base == key.base())
                .map(|subscriber| subscriber.sink.clone())
                .collect::<Vec<_>>()
        };
        let found = FoundEdition {
            edition: key.edition(),
            key: key.clone(),
            is_metadata: false,
            codec: -1,
            data: None,
            known_good,
            slot_too,
        };
        sinks
            .iter()
            .filter(|sink| sink.found_edition(found.clone()))
            .count()
    }

    /// Emit `SendingToNetwork` then `RoundFinished` to polling subscribers.
    pub fn run_round(&self, key: &UskUri) -> usize {
        let sinks: Vec<UskSink> = lock(&self.state)
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.base == key.base() && subscriber.mode != PollMode::Passive)
            .map(|subscriber| subscriber.sink.clone())
            .collect();
        sinks
            .iter()
            .filter(|sink| sink.sending_to_network() && sink.round_finished())
            .count()
    }

    pub fn subscriber_count(&self, key: &UskUri) -> usize {
        lock(&self.state)
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.base == key.base())
            .count()
    }

    /// Number of successful unsubscribe calls so far.
    pub fn unsubscribe_count(&self) -> usize {
        lock(&self.state).unsubscribes
    }

    pub fn latest_edition(&self, key: &UskUri) -> Option<i64> {
        lock(&self.state).latest.get(key.base()).copied()
    }

    fn add(&self, key: &UskUri, mode: PollMode, token: Option<ServiceToken>, sink: UskSink) {
        let known = {
            let mut state = lock(&self.state);
            state.subscribers.push(LocalSubscriber {
                base: key.base().to_owned(),
                mode,
                token,
                sink: sink.clone(),
            });
            state.latest.get(key.base()).copied()
        };
        if let Some(latest) = known.filter(|latest| *latest >= key.edition()) {
            sink.found_edition(FoundEdition {
                edition: latest,
                key: key.at_edition(latest),
                is_metadata: false,
                codec: -1,
                data: None,
                known_good: true,
                slot_too: true,
            });
        }
    }
}

impl UskUpdateService for LocalUskService {
    fn subscribe_sparse(
        &self,
        key: &UskUri,
        _priorities: PollPriorities,
        sink: UskSink,
    ) -> ServiceToken {
        let token = {
            let mut state = lock(&self.state);
            state.next_token += 1;
            ServiceToken(state.next_token)
        };
        self.add(key, PollMode::Sparse, Some(token), sink);
        token
    }

    fn subscribe(&self, key: &UskUri, mode: PollMode, _priorities: PollPriorities, sink: UskSink) {
        self.add(key, mode, None, sink);
    }

    fn unsubscribe(&self, key: &UskUri, handle: &UnsubscribeHandle) {
        let mut state = lock(&self.state);
        let before = state.subscribers.len();
        state.subscribers.retain(|subscriber| {
            let matches = match handle {
                UnsubscribeHandle::Sparse(token) => subscriber.token == Some(*token),
                UnsubscribeHandle::Direct(sink_id) => {
                    subscriber.token.is_none() && subscriber.sink.id() == *sink_id
                }
            };
            !(matches && subscriber.base == key.base())
        });
        if state.subscribers.len() < before {
            state.unsubscribes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn key(edition: i64) -> UskUri {
        format!("USK@abc,def,AQACAAE/site/{edition}").parse().unwrap()
    }

    #[test]
    fn parses_and_formats_usk_keys() {
        let uri: UskUri = "USK@abc,def,AQACAAE/site/-3".parse().unwrap();
        assert_eq!(uri.base(), "USK@abc,def,AQACAAE/site");
        assert_eq!(uri.edition(), -3);
        assert_eq!(uri.to_string(), "USK@abc,def,AQACAAE/site/-3");
        assert!("CHK@abc/site".parse::<UskUri>().is_err());
        assert!("USK@abc,def/site".parse::<UskUri>().is_err());
        assert!("USK@abc/site/x".parse::<UskUri>().is_err());
    }

    #[test]
    fn sparse_and_direct_handles_differ() {
        let service = LocalUskService::new();
        let (tx, _rx) = mpsc::channel();
        let sparse = UskSubscription::start(
            &service,
            "a",
            key(0),
            PollMode::Sparse,
            PollPriorities::default(),
            tx.clone(),
        );
        let dense = UskSubscription::start(
            &service,
            "b",
            key(0),
            PollMode::Dense,
            PollPriorities::default(),
            tx,
        );
        assert!(matches!(sparse.handle(), UnsubscribeHandle::Sparse(_)));
        assert_eq!(dense.handle(), UnsubscribeHandle::Direct(dense.sink_id()));
        assert_eq!(service.subscriber_count(&key(0)), 2);
        sparse.unsubscribe(&service);
        dense.unsubscribe(&service);
        assert_eq!(service.subscriber_count(&key(0)), 0);
        assert_eq!(service.unsubscribe_count(), 2);
    }

    #[test]
    fn rounds_skip_passive_subscribers() {
        let service = LocalUskService::new();
        let (tx, rx) = mpsc::channel();
        UskSubscription::start(&service, "p", key(0), PollMode::Passive, PollPriorities::default(), tx.clone());
        UskSubscription::start(&service, "d", key(0), PollMode::Dense, PollPriorities::default(), tx);
        assert_eq!(service.run_round(&key(0)), 1);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.identifier == "d"));
        assert_eq!(events[0].kind, UskEventKind::SendingToNetwork);
        assert_eq!(events[1].kind, UskEventKind::RoundFinished);
    }

    #[test]
    fn old_editions_are_not_republished() {
        let service = LocalUskService::new();
        let (tx, rx) = mpsc::channel();
        UskSubscription::start(&service, "p", key(0), PollMode::Passive, PollPriorities::default(), tx);
        assert_eq!(service.publish(&key(4), true, false), 1);
        assert_eq!(service.publish(&key(4), true, false), 0);
        assert_eq!(service.publish(&key(3), true, false), 0);
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(service.latest_edition(&key(0)), Some(4));
    }

    #[test]
    fn late_subscriber_learns_known_edition() {
        let service = LocalUskService::new();
        service.publish(&key(9), true, true);
        let (tx, rx) = mpsc::channel();
        UskSubscription::start(&service, "late", key(2), PollMode::Dense, PollPriorities::default(), tx);
        let event = rx.try_recv().expect("known edition");
        match event.kind {
            UskEventKind::FoundEdition(found) => assert_eq!(found.edition, 9),
            other => panic!("unexpected {other:?}"),
        }
    }
}
