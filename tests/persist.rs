// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Checkpoint forever requests to disk and restore them into a fresh registry.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::sync::Arc;

use fcp_node::jobs::{run_blocking, JobRunner, SerialJobRunner};
use fcp_node::message::NodeMessage;
use fcp_node::persist::{self, FileRequestStore, StoreError};
use fcp_node::request::{ClientRequest, Persistence, RecordingEngine, RequestState};
use fcp_node::usk::LocalUskService;
use fcp_node::wire::{FieldSet, RawMessage};
use fcp_node::{
    handle, ClientRegistry, Connection, Node, NodeInfo, ProtocolErrorCode, RequestIdentifier,
    RequestKind,
};
use tempfile::TempDir;

fn forever(id: RequestIdentifier, uri: &str) -> Arc<ClientRequest> {
    Arc::new(ClientRequest::new(id, Persistence::Forever, uri))
}

#[test]
fn missing_store_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = FileRequestStore::new(dir.path().join("absent.dat"));
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn checkpoint_and_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = FileRequestStore::new(dir.path().join("requests.dat"));

    let registry = ClientRegistry::new();
    let running = forever(
        RequestIdentifier::for_client("alice", "a1", RequestKind::Get),
        "CHK@one",
    );
    let finished = forever(RequestIdentifier::global("g1", RequestKind::Put), "CHK@two");
    registry.resume(Arc::clone(&running)).unwrap();
    let global = registry.resume(Arc::clone(&finished)).unwrap();
    global.finished(&finished, true);
    registry
        .resume(Arc::new(ClientRequest::new(
            RequestIdentifier::for_client("alice", "r1", RequestKind::Get),
            Persistence::Reboot,
            "CHK@three",
        )))
        .unwrap();
    store.checkpoint(&registry).unwrap();

    let fresh = ClientRegistry::new();
    let engine = RecordingEngine::new();
    assert_eq!(persist::restore(&store, &fresh, &engine).unwrap(), 2);
    assert_eq!(fresh.client_names(), vec!["alice".to_owned()]);
    let alice = fresh.get_client("alice").unwrap();
    assert!(alice.has_request("a1"));
    assert!(!alice.has_request("r1"));
    let restored = fresh.global().get_request("g1").unwrap();
    assert_eq!(restored.state(), RequestState::Succeeded);
    assert_eq!(restored.kind(), RequestKind::Put);
    assert_eq!(fresh.global().completed_unacked().len(), 1);
    assert_eq!(
        engine.started(),
        vec![RequestIdentifier::for_client("alice", "a1", RequestKind::Get)]
    );
}

#[test]
fn corrupt_header_fails_and_bad_records_are_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("requests.dat");
    fs::write(&path, b"not a store at all").unwrap();
    let store = FileRequestStore::new(&path);
    assert!(matches!(store.load(), Err(StoreError::BadStoreMagic(_))));

    store
        .save(&[
            forever(RequestIdentifier::global("ok", RequestKind::Get), "CHK@"),
            forever(RequestIdentifier::global("bad", RequestKind::Get), "CHK@"),
        ])
        .unwrap();
    let mut bytes = fs::read(&path).unwrap();
    let first_len = u32::from_be_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let second_record = 16 + first_len + 4;
    bytes[second_record] ^= 0xff;
    fs::write(&path, &bytes).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].identifier().identifier(), "ok");
}

#[test]
fn duplicate_records_are_dropped_on_restore() {
    let dir = TempDir::new().unwrap();
    let store = FileRequestStore::new(dir.path().join("requests.dat"));
    let id = RequestIdentifier::for_client("bob", "same", RequestKind::Get);
    store
        .save(&[forever(id.clone(), "CHK@a"), forever(id, "CHK@b")])
        .unwrap();
    let registry = ClientRegistry::new();
    let engine = RecordingEngine::new();
    assert_eq!(persist::restore(&store, &registry, &engine).unwrap(), 1);
    let request = registry.get_client("bob").unwrap().get_request("same").unwrap();
    assert_eq!(request.uri(), "CHK@a");
}

#[test]
fn job_runner_checkpoints_after_forever_submissions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("requests.dat");
    let registry = Arc::new(ClientRegistry::new());
    let store = FileRequestStore::new(&path);
    let checkpoint_registry = Arc::clone(&registry);
    let runner: Arc<dyn JobRunner> = Arc::new(
        SerialJobRunner::start(Some(Box::new(move || {
            store.checkpoint(&checkpoint_registry).unwrap();
        })))
        .unwrap(),
    );
    let node = Node::new(
        Arc::clone(&registry),
        Arc::clone(&runner),
        Arc::new(RecordingEngine::new()),
        Arc::new(LocalUskService::new()),
        NodeInfo::default(),
    );
    let (connection, _channels) = Connection::detached(false);
    let mut hello = FieldSet::new();
    hello.put_single("Name", "dave").unwrap();
    hello.put_single("ExpectedVersion", "2.0").unwrap();
    handle(&connection, &node, RawMessage::new("ClientHello", hello));
    let mut get = FieldSet::new();
    get.put_single("Identifier", "keep").unwrap();
    get.put_single("URI", "CHK@keep").unwrap();
    get.put_single("Persistence", "forever").unwrap();
    handle(&connection, &node, RawMessage::new("ClientGet", get));
    run_blocking(runner.as_ref(), || ((), false)).unwrap();

    let loaded = FileRequestStore::new(&path).load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].uri(), "CHK@keep");
    assert_eq!(loaded[0].identifier().client_name(), Some("dave"));
}

#[test]
fn unencodable_requests_are_left_out_of_the_checkpoint() {
    let dir = TempDir::new().unwrap();
    let store = FileRequestStore::new(dir.path().join("requests.dat"));
    let oversized = Arc::new(
        ClientRequest::new(
            RequestIdentifier::global("huge", RequestKind::Get),
            Persistence::Forever,
            "CHK@huge",
        )
        .with_client_token(Some("t".repeat(70_000))),
    );
    store
        .save(&[
            forever(RequestIdentifier::global("before", RequestKind::Get), "CHK@b"),
            oversized,
            forever(RequestIdentifier::global("after", RequestKind::Get), "CHK@a"),
        ])
        .unwrap();
    let names: Vec<_> = store
        .load()
        .unwrap()
        .iter()
        .map(|request| request.identifier().identifier().to_owned())
        .collect();
    assert_eq!(names, vec!["before".to_owned(), "after".to_owned()]);
}

#[test]
fn oversized_client_tokens_are_refused_and_later_requests_still_persist() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("requests.dat");
    let registry = Arc::new(ClientRegistry::new());
    let store = FileRequestStore::new(&path);
    let checkpoint_registry = Arc::clone(&registry);
    let runner: Arc<dyn JobRunner> = Arc::new(
        SerialJobRunner::start(Some(Box::new(move || {
            store.checkpoint(&checkpoint_registry).unwrap();
        })))
        .unwrap(),
    );
    let node = Node::new(
        Arc::clone(&registry),
        Arc::clone(&runner),
        Arc::new(RecordingEngine::new()),
        Arc::new(LocalUskService::new()),
        NodeInfo::default(),
    );
    let (connection, channels) = Connection::detached(false);
    let hello = FieldSet::from_lines(["Name=erin", "ExpectedVersion=2.0"]).unwrap();
    handle(&connection, &node, RawMessage::new("ClientHello", hello));

    let token = format!("ClientToken={}", "x".repeat(40_000));
    for (identifier, tokens) in [("good", 0), ("huge", 2), ("later", 0)] {
        let id_line = format!("Identifier={identifier}");
        let mut lines = vec![id_line.as_str(), "URI=CHK@k", "Persistence=forever"];
        lines.extend(std::iter::repeat(token.as_str()).take(tokens));
        let get = FieldSet::from_lines(lines).unwrap();
        handle(&connection, &node, RawMessage::new("ClientGet", get));
    }
    run_blocking(runner.as_ref(), || ((), false)).unwrap();

    let refused = channels.outbound.try_iter().find_map(|message| match message {
        NodeMessage::ProtocolError {
            code, identifier, ..
        } => Some((code, identifier)),
        _ => None,
    });
    assert_eq!(
        refused,
        Some((ProtocolErrorCode::InvalidField, Some("huge".to_owned())))
    );
    let mut stored: Vec<_> = FileRequestStore::new(&path)
        .load()
        .unwrap()
        .iter()
        .map(|request| request.identifier().identifier().to_owned())
        .collect();
    stored.sort();
    assert_eq!(stored, vec!["good".to_owned(), "later".to_owned()]);
}
