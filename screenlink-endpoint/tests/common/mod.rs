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

//! Fakes and recorders shared by the endpoint test suites.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use screenlink_common::{Error, InstanceId, ProtocolConnectionId, RequestId, StreamId};
use screenlink_endpoint::{
    ClientConnectionFactory, ConnectionRequestCallback, ServerConnectionFactory, ServiceObserver,
};
use screenlink_quic::{
    ConnectionId, QuicProtocolConnection, QuicSession, QuicStreamHandle, StreamCmd, WeakSink,
};
use tokio::sync::mpsc;

/// One stream vended by a [`FakeSession`]; the receiver side lets tests
/// observe what was written.
pub struct FakeStream {
    pub id: StreamId,
    pub rx: mpsc::UnboundedReceiver<StreamCmd>,
}

/// In-memory [`QuicSession`] with inspectable streams and close state.
pub struct FakeSession {
    connection_id: ConnectionId,
    remote: SocketAddr,
    server_initiated: bool,
    next_ordinal: Cell<u64>,
    pub closed: Cell<bool>,
    pub streams: RefCell<Vec<FakeStream>>,
}

impl FakeSession {
    pub fn new(connection_id: ConnectionId, remote: SocketAddr, server_initiated: bool) -> Rc<Self> {
        Rc::new(Self {
            connection_id,
            remote,
            server_initiated,
            next_ordinal: Cell::new(0),
            closed: Cell::new(false),
            streams: RefCell::new(Vec::new()),
        })
    }

    /// Drains everything written to stream `index` into a byte vector;
    /// returns `None` once the write end finished.
    pub fn written(&self, index: usize) -> (Vec<u8>, bool) {
        let mut streams = self.streams.borrow_mut();
        let stream = &mut streams[index];
        let mut bytes = Vec::new();
        let mut finished = false;
        while let Ok(cmd) = stream.rx.try_recv() {
            match cmd {
                StreamCmd::Write(data) => bytes.extend_from_slice(&data),
                StreamCmd::Finish => finished = true,
            }
        }
        (bytes, finished)
    }
}

impl QuicSession for FakeSession {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn make_outgoing_stream(&self) -> QuicStreamHandle {
        let ordinal = self.next_ordinal.get();
        self.next_ordinal.set(ordinal + 1);
        let id = (ordinal << 2) | u64::from(self.server_initiated);
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.borrow_mut().push(FakeStream { id, rx });
        QuicStreamHandle::new(id, tx)
    }

    fn close(&self) {
        self.closed.set(true);
    }
}

/// Client factory producing [`FakeSession`]s.
pub struct FakeClientFactory {
    pub sink: RefCell<Option<WeakSink>>,
    pub sessions: RefCell<Vec<Rc<FakeSession>>>,
    pub connect_calls: RefCell<Vec<(SocketAddr, String)>>,
    pub fail_next_connect: Cell<bool>,
    next_connection_id: Cell<ConnectionId>,
}

impl FakeClientFactory {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            sink: RefCell::new(None),
            sessions: RefCell::new(Vec::new()),
            connect_calls: RefCell::new(Vec::new()),
            fail_next_connect: Cell::new(false),
            next_connection_id: Cell::new(1),
        })
    }

    pub fn session(&self, index: usize) -> Rc<FakeSession> {
        Rc::clone(&self.sessions.borrow()[index])
    }
}

impl ClientConnectionFactory for FakeClientFactory {
    fn set_event_sink(&self, sink: WeakSink) {
        *self.sink.borrow_mut() = Some(sink);
    }

    fn connect(
        &self,
        remote: SocketAddr,
        expected_fingerprint: &str,
    ) -> Result<Rc<dyn QuicSession>, Error> {
        if self.fail_next_connect.replace(false) {
            return Err(Error::Transport("synthetic connect failure".into()));
        }
        self.connect_calls
            .borrow_mut()
            .push((remote, expected_fingerprint.to_string()));
        let connection_id = self.next_connection_id.get();
        self.next_connection_id.set(connection_id + 1);
        let session = FakeSession::new(connection_id, remote, false);
        self.sessions.borrow_mut().push(Rc::clone(&session));
        Ok(session as Rc<dyn QuicSession>)
    }
}

/// Server factory recording delegate installs.
pub struct FakeServerFactory {
    pub installed: Cell<bool>,
    pub endpoints_seen: RefCell<Vec<SocketAddr>>,
}

impl FakeServerFactory {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            installed: Cell::new(false),
            endpoints_seen: RefCell::new(Vec::new()),
        })
    }
}

impl ServerConnectionFactory for FakeServerFactory {
    fn set_server_delegate(
        &self,
        sink: Option<WeakSink>,
        endpoints: &[SocketAddr],
    ) -> Result<(), Error> {
        match sink {
            Some(_) => {
                self.installed.set(true);
                self.endpoints_seen.borrow_mut().extend_from_slice(endpoints);
            }
            None => self.installed.set(false),
        }
        Ok(())
    }
}

/// Records lifecycle notifications and adopted inbound connections.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Vec<String>,
    pub incoming: Vec<QuicProtocolConnection>,
    pub errors: Vec<String>,
}

impl ServiceObserver for RecordingObserver {
    fn on_running(&mut self) {
        self.events.push("running".into());
    }

    fn on_stopped(&mut self) {
        self.events.push("stopped".into());
    }

    fn on_suspended(&mut self) {
        self.events.push("suspended".into());
    }

    fn on_incoming_connection(&mut self, connection: QuicProtocolConnection) {
        self.events.push("incoming".into());
        self.incoming.push(connection);
    }

    fn on_error(&mut self, error: &Error) {
        self.errors.push(error.to_string());
    }
}

/// Records connect-request outcomes; opened connections stay alive here.
#[derive(Default)]
pub struct RecordingCallback {
    pub opened: Vec<(RequestId, InstanceId, ProtocolConnectionId)>,
    pub connections: Vec<QuicProtocolConnection>,
    pub failed: Vec<RequestId>,
}

impl ConnectionRequestCallback for RecordingCallback {
    fn on_connection_opened(&mut self, request_id: RequestId, connection: QuicProtocolConnection) {
        self.opened
            .push((request_id, connection.instance_id(), connection.id()));
        self.connections.push(connection);
    }

    fn on_connection_failed(&mut self, request_id: RequestId) {
        self.failed.push(request_id);
    }
}
