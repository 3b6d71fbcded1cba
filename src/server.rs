// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Threaded TCP front end for the FCP node.
// Author: Lukas Bower

//! TCP server.
//!
//! Each accepted socket gets three threads: a reader that decodes and
//! dispatches messages in order, a writer draining the bounded outbound queue,
//! and the USK event consumer. The reader owns the connection lifecycle and
//! calls [`Connection::close`] when it stops.

use std::io::{BufReader, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;

use anyhow::{Context, Result};
use fcp_wire::{write_message, MessageReader, RawMessage, MAX_LINE_LEN};
use log::{debug, error, info, warn};

use crate::config::FcpConfig;
use crate::connection::{Connection, ConnectionChannels};
use crate::dispatch::{self, Flow};
use crate::error::{ConnectionError, ProtocolErrorCode};
use crate::message::NodeMessage;
use crate::node::Node;
use crate::usk;

/// Listening FCP server.
pub struct FcpServer {
    listener: TcpListener,
    node: Arc<Node>,
    config: FcpConfig,
}

impl FcpServer {
    /// Bind the configured address.
    pub fn bind(config: FcpConfig, node: Arc<Node>) -> Result<Self> {
        let addr = config.listen_addr();
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("failed to bind FCP on {addr}"))?;
        let local = listener.local_addr()?;
        info!("FCP server listening on {local}");
        let wake = wake_addr(local);
        node.set_shutdown_hook(move || {
            // Unblock the accept loop so it sees the shutdown flag.
            if let Err(err) = TcpStream::connect(wake) {
                warn!("failed to wake FCP listener on {wake}: {err}");
            }
        });
        Ok(Self {
            listener,
            node,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("FCP listener has no local address")
    }

    /// Accept connections until the node begins shutting down, then return.
    pub fn serve(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            if self.node.is_shutting_down() {
                info!("FCP server stopping");
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(err) = self.accept(stream) {
                        warn!("failed to start FCP connection: {err:#}");
                    }
                }
                Err(err) => warn!("FCP accept failed: {err}"),
            }
        }
        Ok(())
    }

    fn accept(&self, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr().context("peer address")?;
        if !self.config.is_allowed(peer.ip()) {
            info!("refusing FCP connection from {peer}");
            // Nothing was sent; dropping the stream closes it.
            return Ok(());
        }
        let full_access = self.config.has_full_access(peer.ip());
        let (connection, channels) = Connection::new(
            self.node.next_connection_id(),
            Some(peer),
            full_access,
            self.config.max_message_queue_length,
        );
        info!(
            "FCP connection {} from {peer} (full access: {full_access})",
            connection.id()
        );
        let wake = stream.try_clone().context("clone socket for shutdown")?;
        connection.set_shutdown_hook(move || {
            let _ = wake.shutdown(Shutdown::Read);
        });
        let writer = stream.try_clone().context("clone socket for writer")?;
        let ConnectionChannels {
            outbound,
            usk_events,
        } = channels;

        let writer_connection = Arc::clone(&connection);
        thread::Builder::new()
            .name(format!("fcp-writer-{}", connection.id()))
            .spawn(move || run_writer(&writer_connection, writer, &outbound))
            .context("spawn writer")?;

        let consumer_connection = Arc::downgrade(&connection);
        let service = Arc::clone(&self.node.usk);
        thread::Builder::new()
            .name(format!("fcp-usk-{}", connection.id()))
            .spawn(move || usk::run_consumer(consumer_connection, service, usk_events))
            .context("spawn usk consumer")?;

        let node = Arc::clone(&self.node);
        let max_data_len = self.config.max_data_length;
        thread::Builder::new()
            .name(format!("fcp-reader-{}", connection.id()))
            .spawn(move || {
                run_reader(&connection, &node, stream, max_data_len);
                connection.close(&node);
            })
            .context("spawn reader")?;
        Ok(())
    }
}

fn run_reader(connection: &Arc<Connection>, node: &Node, stream: TcpStream, max_data_len: u64) {
    let mut reader = MessageReader::with_limits(BufReader::new(stream), MAX_LINE_LEN, max_data_len);
    loop {
        match reader.read_message() {
            Ok(Some(raw)) => {
                if dispatch::handle(connection, node, raw) == Flow::Close {
                    break;
                }
            }
            Ok(None) => {
                debug!("connection {} reached end of stream", connection.id());
                break;
            }
            Err(err) => {
                if connection.is_closed() {
                    break;
                }
                warn!("connection {} framing error: {err}", connection.id());
                connection.send(NodeMessage::ProtocolError {
                    code: ProtocolErrorCode::MessageParseError,
                    extra_description: Some(err.to_string()),
                    fatal: true,
                    identifier: None,
                    global: false,
                });
                break;
            }
        }
    }
}

/// Address a local connect reaches the listener on.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

fn run_writer(
    connection: &Connection,
    stream: TcpStream,
    outbound: &Receiver<NodeMessage>,
) {
    let mut out = BufWriter::new(&stream);
    for message in outbound {
        let raw = match message.to_raw() {
            Ok(raw) => raw,
            Err(err) => {
                error!("cannot encode {}: {err}", message.name());
                continue;
            }
        };
        if let Err(err) = write_one(&mut out, &raw) {
            debug!("connection {} write failed: {err}", connection.id());
            connection.abort();
            break;
        }
    }
    drop(out);
    let _ = stream.shutdown(Shutdown::Write);
    debug!("connection {} writer finished", connection.id());
}

fn write_one<W: Write>(out: &mut W, raw: &RawMessage) -> Result<(), ConnectionError> {
    write_message(out, raw)?;
    out.flush()?;
    Ok(())
}
