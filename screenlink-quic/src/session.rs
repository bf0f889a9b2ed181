// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! QUIC sessions and the event interface to the connection endpoint.
//!
//! A [`QuicSession`] is one QUIC connection, from the dial (or accept)
//! through handshake completion to close. The endpoint consumes sessions
//! through the object-safe trait so tests can drive it with fakes; the
//! Quinn implementation lives here as [`QuinnSession`].

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use screenlink_common::{Error, StreamId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::spawn_local;
use tracing::{debug, info, trace, warn};

use crate::stream::{QuicStreamHandle, StreamCmd};

/// Factory-unique identifier for one QUIC connection.
pub type ConnectionId = u64;

/// One QUIC connection, as the endpoint sees it.
pub trait QuicSession {
    fn connection_id(&self) -> ConnectionId;

    fn remote_address(&self) -> Option<SocketAddr>;

    /// Opens a new outgoing bidirectional stream and returns its write
    /// handle. The stream id is assigned synchronously using the QUIC
    /// numbering for this side.
    fn make_outgoing_stream(&self) -> QuicStreamHandle;

    /// Closes the session. Safe to call in any state; a still-pending
    /// handshake is aborted.
    fn close(&self);
}

/// Callbacks from the transport into the connection endpoint.
///
/// All methods are invoked on the single task runner, in arrival order
/// per stream.
pub trait SessionEventSink {
    /// Server only: a new inbound connection was admitted and is awaiting
    /// its handshake.
    fn on_incoming_connection(&self, remote: SocketAddr, session: Rc<dyn QuicSession>);

    /// The crypto handshake finished; the connection can be promoted.
    fn on_crypto_handshake_complete(&self, connection_id: ConnectionId);

    /// A pending connection failed before promotion.
    fn on_connection_failed(&self, connection_id: ConnectionId, error: Error);

    /// The peer opened a bidirectional stream.
    fn on_incoming_stream(&self, connection_id: ConnectionId, stream: QuicStreamHandle);

    /// Ordered bytes arrived on a stream.
    fn on_stream_data(&self, connection_id: ConnectionId, stream_id: StreamId, data: Bytes);

    /// The read side of a stream finished (or was reset).
    fn on_stream_closed(&self, connection_id: ConnectionId, stream_id: StreamId);

    /// The connection closed after promotion.
    fn on_connection_closed(&self, connection_id: ConnectionId);
}

/// Weak reference to the endpoint's event sink, as held by transport
/// tasks.
pub type WeakSink = Weak<dyn SessionEventSink>;

enum SessionState {
    Connecting {
        cancel: Option<oneshot::Sender<()>>,
    },
    Established(quinn::Connection),
    Closed,
}

/// [`QuicSession`] implementation over a Quinn connection.
pub struct QuinnSession {
    connection_id: ConnectionId,
    is_server: bool,
    state: RefCell<SessionState>,
    next_stream_ordinal: Cell<u64>,
    remote: Cell<Option<SocketAddr>>,
    sink: WeakSink,
}

impl QuinnSession {
    /// Dials `remote` through `endpoint` and drives the attempt in a local
    /// task. The endpoint (and with it the UDP socket) is owned by that
    /// task and released when the connection ends.
    pub(crate) fn connect(
        connection_id: ConnectionId,
        endpoint: quinn::Endpoint,
        config: quinn::ClientConfig,
        remote: SocketAddr,
        sink: WeakSink,
    ) -> Result<Rc<Self>, Error> {
        let server_name = remote.ip().to_string();
        let connecting = endpoint
            .connect_with(config, remote, &server_name)
            .map_err(|e| Error::Transport(format!("connect to {remote}: {e}")))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let session = Rc::new(Self {
            connection_id,
            is_server: false,
            state: RefCell::new(SessionState::Connecting {
                cancel: Some(cancel_tx),
            }),
            next_stream_ordinal: Cell::new(0),
            remote: Cell::new(Some(remote)),
            sink,
        });

        let driver = Rc::clone(&session);
        spawn_local(async move {
            tokio::select! {
                _ = cancel_rx => {
                    debug!(connection_id, "connection attempt cancelled");
                }
                result = connecting => {
                    driver.handle_connect_result(result).await;
                }
            }
            // Dropping the endpoint here closes the per-connection socket
            // once nothing references it any more.
            drop(endpoint);
        });

        Ok(session)
    }

    /// Wraps a server-side accepted connection and drives its handshake.
    pub(crate) fn accept(
        connection_id: ConnectionId,
        connecting: quinn::Connecting,
        remote: SocketAddr,
        sink: WeakSink,
    ) -> Rc<Self> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let session = Rc::new(Self {
            connection_id,
            is_server: true,
            state: RefCell::new(SessionState::Connecting {
                cancel: Some(cancel_tx),
            }),
            next_stream_ordinal: Cell::new(0),
            remote: Cell::new(Some(remote)),
            sink,
        });

        let driver = Rc::clone(&session);
        spawn_local(async move {
            tokio::select! {
                _ = cancel_rx => {
                    debug!(connection_id, "inbound handshake abandoned");
                }
                result = connecting => {
                    driver.handle_connect_result(result).await;
                }
            }
        });

        session
    }

    async fn handle_connect_result(
        &self,
        result: Result<quinn::Connection, quinn::ConnectionError>,
    ) {
        let connection_id = self.connection_id;
        match result {
            Ok(connection) => {
                info!(
                    connection_id,
                    remote = %connection.remote_address(),
                    "QUIC handshake complete"
                );
                self.remote.set(Some(connection.remote_address()));
                *self.state.borrow_mut() = SessionState::Established(connection.clone());
                if let Some(sink) = self.sink.upgrade() {
                    sink.on_crypto_handshake_complete(connection_id);
                }
                drive_incoming_streams(connection, connection_id, self.sink.clone()).await;
                *self.state.borrow_mut() = SessionState::Closed;
                if let Some(sink) = self.sink.upgrade() {
                    sink.on_connection_closed(connection_id);
                }
            }
            Err(error) => {
                debug!(connection_id, %error, "QUIC handshake failed");
                *self.state.borrow_mut() = SessionState::Closed;
                if let Some(sink) = self.sink.upgrade() {
                    sink.on_connection_failed(connection_id, Error::Transport(error.to_string()));
                }
            }
        }
    }
}

impl QuicSession for QuinnSession {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote.get()
    }

    fn make_outgoing_stream(&self) -> QuicStreamHandle {
        let ordinal = self.next_stream_ordinal.get();
        self.next_stream_ordinal.set(ordinal + 1);
        let wire_id = (ordinal << 2) | u64::from(self.is_server);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = QuicStreamHandle::new(wire_id, tx);

        match &*self.state.borrow() {
            SessionState::Established(connection) => {
                spawn_local(run_outgoing_stream(
                    connection.clone(),
                    self.connection_id,
                    wire_id,
                    rx,
                    self.sink.clone(),
                ));
            }
            _ => {
                // No transport yet (or any more): the receiver drops here
                // and every write through the handle is discarded.
                warn!(
                    connection_id = self.connection_id,
                    "outgoing stream requested without an established connection"
                );
            }
        }
        handle
    }

    fn close(&self) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            SessionState::Connecting { cancel } => {
                if let Some(cancel) = cancel.take() {
                    let _ = cancel.send(());
                }
                *state = SessionState::Closed;
            }
            SessionState::Established(connection) => {
                connection.close(0u32.into(), b"endpoint closed");
                *state = SessionState::Closed;
            }
            SessionState::Closed => {}
        }
    }
}

/// Maps a Quinn stream id to the wire numbering used as protocol
/// connection id.
fn wire_stream_id(id: quinn::StreamId) -> u64 {
    let initiator_bit = match id.initiator() {
        quinn::Side::Client => 0,
        quinn::Side::Server => 1,
    };
    (id.index() << 2) | initiator_bit
}

async fn run_outgoing_stream(
    connection: quinn::Connection,
    connection_id: ConnectionId,
    wire_id: u64,
    rx: mpsc::UnboundedReceiver<StreamCmd>,
    sink: WeakSink,
) {
    match connection.open_bi().await {
        Ok((send, recv)) => {
            let actual = wire_stream_id(recv.id());
            if actual != wire_id {
                warn!(connection_id, expected = wire_id, actual, "stream id drift");
            }
            spawn_local(run_stream_reader(recv, connection_id, wire_id, sink));
            pump_writes(send, rx, connection_id, wire_id).await;
        }
        Err(error) => {
            debug!(connection_id, wire_id, %error, "failed to open outgoing stream");
        }
    }
}

async fn pump_writes(
    mut send: quinn::SendStream,
    mut rx: mpsc::UnboundedReceiver<StreamCmd>,
    connection_id: ConnectionId,
    stream_id: u64,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StreamCmd::Write(bytes) => {
                trace!(
                    connection_id,
                    stream_id,
                    len = bytes.len(),
                    "TX stream bytes"
                );
                if let Err(error) = send.write_all(&bytes).await {
                    debug!(connection_id, stream_id, %error, "stream write failed");
                    return;
                }
            }
            StreamCmd::Finish => break,
        }
    }
    // Reached on Finish or when every handle was dropped; both are clean
    // write-half closes.
    let _ = send.finish();
}

async fn run_stream_reader(
    mut recv: quinn::RecvStream,
    connection_id: ConnectionId,
    stream_id: u64,
    sink: WeakSink,
) {
    loop {
        match recv.read_chunk(64 * 1024, true).await {
            Ok(Some(chunk)) => {
                trace!(
                    connection_id,
                    stream_id,
                    len = chunk.bytes.len(),
                    "RX stream bytes"
                );
                let Some(sink) = sink.upgrade() else { return };
                sink.on_stream_data(connection_id, stream_id, chunk.bytes);
            }
            Ok(None) => break,
            Err(error) => {
                debug!(connection_id, stream_id, %error, "stream read ended");
                break;
            }
        }
    }
    if let Some(sink) = sink.upgrade() {
        sink.on_stream_closed(connection_id, stream_id);
    }
}

/// Accepts peer-initiated bidirectional streams until the connection
/// closes.
async fn drive_incoming_streams(
    connection: quinn::Connection,
    connection_id: ConnectionId,
    sink: WeakSink,
) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let stream_id = wire_stream_id(recv.id());
                debug!(connection_id, stream_id, "incoming stream");

                let (tx, rx) = mpsc::unbounded_channel();
                spawn_local(pump_writes(send, rx, connection_id, stream_id));
                let handle = QuicStreamHandle::new(stream_id, tx);

                let Some(strong) = sink.upgrade() else { return };
                strong.on_incoming_stream(connection_id, handle);
                spawn_local(run_stream_reader(
                    recv,
                    connection_id,
                    stream_id,
                    sink.clone(),
                ));
            }
            Err(error) => {
                debug!(connection_id, %error, "connection ended");
                return;
            }
        }
    }
}
