// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Node-wide handles shared by every connection.
// Author: Lukas Bower

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fcp_wire::BulkData;
use log::{debug, warn};

use crate::identifier::RequestKind;
use crate::jobs::JobRunner;
use crate::lock;
use crate::message::NodeMessage;
use crate::registry::ClientRegistry;
use crate::request::{now_millis, ClientRequest, Persistence, RequestEngine, ReturnType};
use crate::usk::UskUpdateService;

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// FCP protocol version announced in `NodeHello`.
pub const FCP_VERSION: &str = "2.0";

/// Identity reported to clients in `NodeHello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub version: String,
    pub fcp_version: String,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            name: "Fred".to_owned(),
            version: concat!("fcp-node,", env!("CARGO_PKG_VERSION")).to_owned(),
            fcp_version: FCP_VERSION.to_owned(),
        }
    }
}

/// Everything message execution may touch.
pub struct Node {
    pub registry: Arc<ClientRegistry>,
    pub jobs: Arc<dyn JobRunner>,
    pub engine: Arc<dyn RequestEngine>,
    pub usk: Arc<dyn UskUpdateService>,
    pub info: NodeInfo,
    shutting_down: AtomicBool,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    next_connection: AtomicU64,
}

impl Node {
    pub fn new(
        registry: Arc<ClientRegistry>,
        jobs: Arc<dyn JobRunner>,
        engine: Arc<dyn RequestEngine>,
        usk: Arc<dyn UskUpdateService>,
        info: NodeInfo,
    ) -> Self {
        Self {
            registry,
            jobs,
            engine,
            usk,
            info,
            shutting_down: AtomicBool::new(false),
            shutdown_hook: Mutex::new(None),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Run `hook` once when shutdown begins; the server uses it to wake its
    /// accept loop.
    pub fn set_shutdown_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.shutdown_hook) = Some(Box::new(hook));
    }

    /// Refuse further client work. Returns true on the first call.
    pub fn begin_shutdown(&self) -> bool {
        let first = !self.shutting_down.swap(true, Ordering::AcqRel);
        if first {
            warn!("node shutting down on client request");
            let hook = lock(&self.shutdown_hook).take();
            if let Some(hook) = hook {
                hook();
            }
        }
        first
    }

    /// Report the outcome of a request the engine was running.
    ///
    /// Sends the completion messages to whoever owns the request and, for
    /// persistent requests, moves it to the completed list. `data` is the
    /// fetched content; it is returned as `AllData` unless the client asked
    /// for `ReturnType=none`. Completions for removed requests are dropped.
    pub fn on_finished(
        &self,
        request: &Arc<ClientRequest>,
        succeeded: bool,
        data: Option<BulkData>,
    ) {
        match request.persistence() {
            Persistence::Connection => {
                let Some(connection) = request.connection() else {
                    debug!("{}: connection gone before completion", request.identifier());
                    return;
                };
                if !connection.take_finished(request) || !request.mark_finished(succeeded) {
                    return;
                }
                for message in completion_messages(request, succeeded, data) {
                    connection.send(message);
                }
            }
            Persistence::Reboot => {
                finish_persistent(&self.registry, request, succeeded, data);
            }
            Persistence::Forever => {
                let registry = Arc::clone(&self.registry);
                let finished = Arc::clone(request);
                let job =
                    Box::new(move || finish_persistent(&registry, &finished, succeeded, data));
                if self.jobs.queue(job).is_err() {
                    warn!(
                        "{}: completion not recorded, persistence unavailable",
                        request.identifier()
                    );
                }
            }
        }
    }

    /// Push a `TextFeed` to every connected client. Returns how many
    /// connections accepted it.
    pub fn send_text_feed(&self, header: &str, short_text: &str, text: Option<&str>) -> usize {
        let section = |value: &str| Some(BulkData::from(value.as_bytes().to_vec()));
        let feed = NodeMessage::TextFeed {
            identifier: None,
            updated_time: now_millis(),
            header: section(header),
            short_text: section(short_text),
            text: text.and_then(section),
        };
        self.registry
            .connections()
            .iter()
            .filter(|connection| connection.send(feed.clone()))
            .count()
    }

    /// Fresh `ConnectionIdentifier` for `NodeHello`.
    pub fn next_connection_id(&self) -> String {
        let serial = self.next_connection.fetch_add(1, Ordering::Relaxed);
        hex::encode(serial.to_be_bytes())
    }
}

fn finish_persistent(
    registry: &ClientRegistry,
    request: &Arc<ClientRequest>,
    succeeded: bool,
    data: Option<BulkData>,
) -> bool {
    let Some(client) = registry.client_for(request.identifier()) else {
        debug!("{}: owner gone before completion", request.identifier());
        return false;
    };
    if !client.finished(request, succeeded) {
        return false;
    }
    for message in completion_messages(request, succeeded, data) {
        client.queue_message(&message, 0);
    }
    true
}

fn completion_messages(
    request: &ClientRequest,
    succeeded: bool,
    data: Option<BulkData>,
) -> Vec<NodeMessage> {
    let identifier = request.identifier().identifier().to_owned();
    let global = request.identifier().is_global();
    match (request.kind(), succeeded) {
        (RequestKind::Get, true) => {
            let content_type = request.content_type().map(str::to_owned);
            let found = NodeMessage::DataFound {
                identifier: identifier.clone(),
                global,
                content_type: content_type.clone(),
                data_length: data.as_ref().map_or(0, BulkData::len),
            };
            match data {
                Some(data) if request.return_type() == ReturnType::Direct => vec![
                    found,
                    NodeMessage::AllData {
                        identifier,
                        global,
                        content_type,
                        data,
                    },
                ],
                _ => vec![found],
            }
        }
        (RequestKind::Get, false) => vec![NodeMessage::GetFailed { identifier, global }],
        (RequestKind::Put | RequestKind::PutDir, true) => vec![NodeMessage::PutSuccessful {
            identifier,
            global,
            uri: request.uri().to_owned(),
        }],
        (RequestKind::Put | RequestKind::PutDir, false) => {
            vec![NodeMessage::PutFailed { identifier, global }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::DisabledJobRunner;
    use crate::request::RecordingEngine;
    use crate::usk::LocalUskService;

    #[test]
    fn connection_ids_are_unique_hex() {
        let node = Node::new(
            Arc::new(ClientRegistry::new()),
            Arc::new(DisabledJobRunner),
            Arc::new(RecordingEngine::new()),
            Arc::new(LocalUskService::new()),
            NodeInfo::default(),
        );
        let first = node.next_connection_id();
        let second = node.next_connection_id();
        assert_ne!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(node.begin_shutdown());
        assert!(!node.begin_shutdown());
        assert!(node.is_shutting_down());
    }

    #[test]
    fn shutdown_hook_runs_once() {
        let node = Node::new(
            Arc::new(ClientRegistry::new()),
            Arc::new(DisabledJobRunner),
            Arc::new(RecordingEngine::new()),
            Arc::new(LocalUskService::new()),
            NodeInfo::default(),
        );
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        node.set_shutdown_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        node.begin_shutdown();
        node.begin_shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
