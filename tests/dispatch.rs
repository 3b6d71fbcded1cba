// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Exercise message dispatch against in-memory collaborators.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::sync::Arc;

use fcp_node::connection::ConnectionChannels;
use fcp_node::jobs::{run_blocking, DisabledJobRunner, JobRunner, SerialJobRunner};
use fcp_node::message::{MessageDirection, NodeMessage, ReturnType, MESSAGE_TABLE};
use fcp_node::request::{Persistence, RecordingEngine, RequestState};
use fcp_node::usk::LocalUskService;
use fcp_node::wire::{BulkData, FieldSet, RawMessage};
use fcp_node::{handle, ClientRegistry, Connection, Flow, Node, NodeInfo, ProtocolErrorCode};

struct Harness {
    node: Node,
    engine: Arc<RecordingEngine>,
}

fn harness(jobs: Arc<dyn JobRunner>) -> Harness {
    let engine = Arc::new(RecordingEngine::new());
    let node = Node::new(
        Arc::new(ClientRegistry::new()),
        jobs,
        engine.clone(),
        Arc::new(LocalUskService::new()),
        NodeInfo::default(),
    );
    Harness { node, engine }
}

fn msg(name: &str, lines: &[&str]) -> RawMessage {
    RawMessage::new(name, FieldSet::from_lines(lines.iter().copied()).unwrap())
}

fn drain(channels: &ConnectionChannels) -> Vec<NodeMessage> {
    channels.outbound.try_iter().collect()
}

fn connect(h: &Harness, name: &str, full_access: bool) -> (Arc<Connection>, ConnectionChannels) {
    let (connection, channels) = Connection::detached(full_access);
    let hello = format!("Name={name}");
    let flow = handle(
        &connection,
        &h.node,
        msg("ClientHello", &[hello.as_str(), "ExpectedVersion=2.0"]),
    );
    assert_eq!(flow, Flow::Continue);
    let replies = drain(&channels);
    assert_eq!(replies[0].name(), "NodeHello");
    (connection, channels)
}

fn barrier(h: &Harness) {
    run_blocking(h.node.jobs.as_ref(), || ((), false)).unwrap();
}

fn error_code(message: &NodeMessage) -> Option<ProtocolErrorCode> {
    match message {
        NodeMessage::ProtocolError { code, .. } => Some(*code),
        _ => None,
    }
}

#[test]
fn node_bound_messages_are_rejected_without_side_effects() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "alice", true);
    for (name, direction) in MESSAGE_TABLE {
        if *direction != MessageDirection::NodeToClient {
            continue;
        }
        assert_eq!(handle(&connection, &h.node, msg(name, &[])), Flow::Continue);
        let replies = drain(&channels);
        assert_eq!(replies.len(), 1, "{name}");
        assert_eq!(error_code(&replies[0]), Some(ProtocolErrorCode::InvalidMessage));
    }
    assert!(h.engine.started().is_empty());
    assert!(!h.node.is_shutting_down());
    assert_eq!(h.node.registry.client_names(), vec!["alice".to_owned()]);
}

#[test]
fn direction_is_checked_before_the_handshake() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = Connection::detached(false);
    let flow = handle(&connection, &h.node, msg("SubscribedUSK", &["Identifier=x"]));
    assert_eq!(flow, Flow::Continue);
    let replies = drain(&channels);
    assert_eq!(error_code(&replies[0]), Some(ProtocolErrorCode::InvalidMessage));
}

#[test]
fn colliding_identifiers_succeed_once_regardless_of_kind() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "alice", false);
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=dup", "URI=CHK@a", "Persistence=reboot"]),
    );
    let mut put = msg("ClientPut", &["Identifier=dup", "URI=CHK@", "Persistence=reboot"]);
    put.data = Some(b"hello".to_vec().into());
    handle(&connection, &h.node, put);
    let replies = drain(&channels);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].name(), "PersistentGet");
    match &replies[1] {
        NodeMessage::IdentifierCollision { identifier, global } => {
            assert_eq!(identifier, "dup");
            assert!(!global);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.engine.started().len(), 1);
    assert_eq!(h.engine.payload_bytes(), 0);
}

#[test]
fn connection_requests_collide_per_connection_and_die_with_it() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "alice", false);
    let get = ["Identifier=c1", "URI=CHK@a"];
    handle(&connection, &h.node, msg("ClientGet", &get));
    handle(&connection, &h.node, msg("ClientGet", &get));
    let replies = drain(&channels);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].name(), "IdentifierCollision");
    assert_eq!(connection.requests().len(), 1);

    connection.close(&h.node);
    assert_eq!(h.engine.cancelled().len(), 1);
    assert!(h.node.registry.client_names().is_empty());
}

#[test]
fn forever_requests_need_persistence() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "alice", false);
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=f1", "URI=CHK@a", "Persistence=forever"]),
    );
    match drain(&channels).as_slice() {
        [NodeMessage::ProtocolError {
            code, identifier, ..
        }] => {
            assert_eq!(*code, ProtocolErrorCode::PersistenceDisabled);
            assert_eq!(identifier.as_deref(), Some("f1"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.engine.started().is_empty());
    assert!(!h.node.registry.get_client("alice").unwrap().has_request("f1"));
}

#[test]
fn forever_requests_register_on_the_job_thread_and_list() {
    let runner: Arc<dyn JobRunner> = Arc::new(SerialJobRunner::start(None).unwrap());
    let h = harness(runner);
    let (connection, channels) = connect(&h, "alice", false);
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=f1", "URI=CHK@a", "Persistence=forever"]),
    );
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=r1", "URI=CHK@b", "Persistence=reboot"]),
    );
    barrier(&h);
    drain(&channels);

    handle(
        &connection,
        &h.node,
        msg("ListPersistentRequests", &["Identifier=list-1"]),
    );
    barrier(&h);
    let replies = drain(&channels);
    let names: Vec<_> = replies.iter().map(NodeMessage::name).collect();
    assert_eq!(
        names,
        vec!["PersistentGet", "PersistentGet", "EndListPersistentRequests"]
    );
    match &replies[0] {
        NodeMessage::PersistentRequest {
            request,
            list_request_identifier,
        } => {
            assert_eq!(request.persistence(), Persistence::Reboot);
            assert_eq!(list_request_identifier.as_deref(), Some("list-1"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.node.registry.forever_requests().len(), 1);
}

#[test]
fn remove_and_modify_reply_and_report_unknown_identifiers() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "alice", false);
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=r1", "URI=CHK@a", "Persistence=reboot"]),
    );
    handle(
        &connection,
        &h.node,
        msg(
            "ModifyPersistentRequest",
            &["Identifier=r1", "PriorityClass=1", "ClientToken=note"],
        ),
    );
    let client = h.node.registry.get_client("alice").unwrap();
    let request = client.get_request("r1").unwrap();
    assert_eq!(request.priority_class(), 1);
    assert_eq!(request.client_token().as_deref(), Some("note"));

    handle(&connection, &h.node, msg("RemoveRequest", &["Identifier=r1"]));
    handle(&connection, &h.node, msg("RemovePersistentRequest", &["Identifier=r1"]));
    let names: Vec<_> = drain(&channels).iter().map(NodeMessage::name).collect();
    assert_eq!(
        names,
        vec![
            "PersistentGet",
            "PersistentRequestModified",
            "PersistentRequestRemoved",
            "ProtocolError"
        ]
    );
    assert_eq!(h.engine.cancelled().len(), 1);
}

#[test]
fn duplicate_client_name_kicks_the_older_connection() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (first, first_channels) = connect(&h, "bob", false);
    let (second, _second_channels) = connect(&h, "bob", false);
    assert!(first.is_closed());
    assert!(first.is_killed_duplicate());
    assert!(!second.is_closed());
    let replies = drain(&first_channels);
    assert!(matches!(
        replies.as_slice(),
        [NodeMessage::CloseConnectionDuplicateClientName]
    ));

    first.close(&h.node);
    let client = h.node.registry.get_client("bob").unwrap();
    assert!(Arc::ptr_eq(&client.connection().unwrap(), &second));
}

#[test]
fn completed_requests_are_announced_on_reconnect() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (first, _channels) = connect(&h, "carol", false);
    handle(
        &first,
        &h.node,
        msg("ClientGet", &["Identifier=done", "URI=CHK@a", "Persistence=reboot"]),
    );
    let client = h.node.registry.get_client("carol").unwrap();
    let request = client.get_request("done").unwrap();
    client.finished(&request, true);
    first.close(&h.node);
    assert_eq!(h.node.registry.client_names(), vec!["carol".to_owned()]);

    let (second, channels) = Connection::detached(false);
    handle(
        &second,
        &h.node,
        msg("ClientHello", &["Name=carol", "ExpectedVersion=2.0"]),
    );
    let names: Vec<_> = drain(&channels).iter().map(NodeMessage::name).collect();
    assert_eq!(names, vec!["NodeHello", "PersistentGet"]);
}

#[test]
fn watchers_see_global_queue_messages() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (alice, alice_channels) = connect(&h, "alice", false);
    let (bob, _bob_channels) = connect(&h, "bob", false);
    handle(&alice, &h.node, msg("WatchGlobal", &["Enabled=true", "VerbosityMask=0"]));
    handle(
        &bob,
        &h.node,
        msg(
            "ClientGet",
            &["Identifier=g", "URI=CHK@a", "Global=true", "Persistence=reboot"],
        ),
    );
    let replies = drain(&alice_channels);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].name(), "PersistentGet");
    assert!(h.node.registry.global().has_request("g"));
}

#[test]
fn shutdown_refuses_later_messages_and_disconnect_closes() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (admin, _admin_channels) = connect(&h, "admin", true);
    let (other, other_channels) = connect(&h, "other", false);
    assert_eq!(handle(&other, &h.node, msg("Void", &[])), Flow::Continue);
    assert_eq!(handle(&other, &h.node, msg("Disconnect", &[])), Flow::Close);
    assert!(drain(&other_channels).is_empty());

    assert_eq!(handle(&admin, &h.node, msg("Shutdown", &[])), Flow::Continue);
    assert!(h.node.is_shutting_down());
    let (late, late_channels) = Connection::detached(false);
    handle(&late, &h.node, msg("ClientHello", &["Name=late", "ExpectedVersion=2.0"]));
    let replies = drain(&late_channels);
    assert_eq!(error_code(&replies[0]), Some(ProtocolErrorCode::ShuttingDown));
}

#[test]
fn finished_connection_gets_return_their_data_and_leave_the_connection() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "fay", false);
    handle(&connection, &h.node, msg("ClientGet", &["Identifier=c", "URI=CHK@c"]));
    let request = connection.request("c").unwrap();
    assert_eq!(request.return_type(), ReturnType::Direct);

    h.node
        .on_finished(&request, true, Some(BulkData::from(b"hello".to_vec())));
    match drain(&channels).as_slice() {
        [NodeMessage::DataFound {
            identifier,
            data_length,
            ..
        }, NodeMessage::AllData { data, .. }] => {
            assert_eq!(identifier, "c");
            assert_eq!(*data_length, 5);
            assert_eq!(data.to_vec().unwrap(), b"hello");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(connection.request("c").is_none());
    assert_eq!(request.state(), RequestState::Succeeded);

    h.node.on_finished(&request, false, None);
    assert!(drain(&channels).is_empty());
}

#[test]
fn return_type_none_reports_completion_without_data() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "gus", false);
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=n", "URI=CHK@n", "ReturnType=none"]),
    );
    let request = connection.request("n").unwrap();
    h.node
        .on_finished(&request, true, Some(BulkData::from(b"unused".to_vec())));
    let names: Vec<_> = drain(&channels).iter().map(NodeMessage::name).collect();
    assert_eq!(names, vec!["DataFound"]);
}

#[test]
fn removed_requests_finish_silently() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "hal", false);
    handle(&connection, &h.node, msg("ClientGet", &["Identifier=r", "URI=CHK@r"]));
    let request = connection.request("r").unwrap();
    handle(&connection, &h.node, msg("RemoveRequest", &["Identifier=r"]));
    drain(&channels);
    h.node.on_finished(&request, true, None);
    assert!(drain(&channels).is_empty());
    assert_eq!(h.engine.cancelled().len(), 1);
}

#[test]
fn reboot_completion_moves_the_request_and_notifies_the_owner() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "ida", false);
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=b", "URI=CHK@b", "Persistence=reboot"]),
    );
    drain(&channels);
    let client = h.node.registry.get_client("ida").unwrap();
    let request = client.get_request("b").unwrap();

    h.node.on_finished(&request, false, None);
    match drain(&channels).as_slice() {
        [NodeMessage::GetFailed { identifier, global }] => {
            assert_eq!(identifier, "b");
            assert!(!global);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.completed_unacked().len(), 1);
    assert_eq!(request.state(), RequestState::Failed);
}

#[test]
fn put_options_reach_the_request_and_its_completion() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (connection, channels) = connect(&h, "jon", false);
    handle(
        &connection,
        &h.node,
        msg(
            "ClientPut",
            &[
                "Identifier=p",
                "URI=CHK@",
                "Metadata.ContentType=text/plain",
                "UploadFrom=redirect",
                "TargetURI=CHK@target",
            ],
        ),
    );
    let request = connection.request("p").unwrap();
    assert_eq!(request.content_type(), Some("text/plain"));
    assert_eq!(request.target_uri(), Some("CHK@target"));

    h.node.on_finished(&request, true, None);
    match drain(&channels).as_slice() {
        [NodeMessage::PutSuccessful { identifier, uri, .. }] => {
            assert_eq!(identifier, "p");
            assert_eq!(uri, "CHK@");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn forever_completion_is_recorded_on_the_job_thread() {
    let runner: Arc<dyn JobRunner> = Arc::new(SerialJobRunner::start(None).unwrap());
    let h = harness(runner);
    let (connection, channels) = connect(&h, "kim", false);
    handle(
        &connection,
        &h.node,
        msg("ClientGet", &["Identifier=f", "URI=CHK@f", "Persistence=forever"]),
    );
    barrier(&h);
    drain(&channels);
    let client = h.node.registry.get_client("kim").unwrap();
    let request = client.get_request("f").unwrap();

    h.node
        .on_finished(&request, true, Some(BulkData::from(b"abc".to_vec())));
    barrier(&h);
    let names: Vec<_> = drain(&channels).iter().map(NodeMessage::name).collect();
    assert_eq!(names, vec!["DataFound", "AllData"]);
    assert_eq!(client.completed_unacked().len(), 1);
}

#[test]
fn text_feeds_reach_every_connected_client() {
    let h = harness(Arc::new(DisabledJobRunner));
    let (_first, first_channels) = connect(&h, "lee", false);
    let (_second, second_channels) = connect(&h, "max", false);
    assert_eq!(h.node.send_text_feed("Hi", "short", Some("long text")), 2);
    for channels in [&first_channels, &second_channels] {
        match drain(channels).as_slice() {
            [NodeMessage::TextFeed {
                header, text, ..
            }] => {
                assert_eq!(header.as_ref().unwrap().to_vec().unwrap(), b"Hi");
                assert_eq!(text.as_ref().unwrap().to_vec().unwrap(), b"long text");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
