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

//! The server endpoint: admits inbound connections.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use screenlink_common::{Error, InstanceId, InstanceRequestIds, RequestId, Role, StreamId};
use screenlink_demux::MessageDemuxer;
use screenlink_quic::{
    ConnectionId, QuicProtocolConnection, QuicSession, QuicStreamHandle, SessionEventSink,
};
use tokio::task::{spawn_local, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::shared::{ConnectionTable, PendingConnectionData, ServiceConnectionData};
use crate::{
    EndpointConfig, ProtocolConnectionEndpoint, ServerConnectionFactory, ServiceObserver, State,
};

struct ServerInner {
    table: ConnectionTable,
    request_ids: InstanceRequestIds,
}

/// Server endpoint over a QUIC connection factory.
///
/// Inbound connections are keyed by a string derived from the remote
/// address until promotion assigns an instance id. Suspension keeps
/// connections alive but rejects (drops) all protocol-connection writes
/// until resume.
pub struct QuicServer {
    config: EndpointConfig,
    demuxer: MessageDemuxer,
    factory: Rc<dyn ServerConnectionFactory>,
    observer: Rc<RefCell<dyn ServiceObserver>>,
    state: Cell<State>,
    writes_enabled: Rc<Cell<bool>>,
    inner: RefCell<ServerInner>,
    cleanup_task: RefCell<Option<JoinHandle<()>>>,
    weak_self: RefCell<Weak<QuicServer>>,
}

impl QuicServer {
    pub fn new(
        config: EndpointConfig,
        demuxer: MessageDemuxer,
        factory: Rc<dyn ServerConnectionFactory>,
        observer: Rc<RefCell<dyn ServiceObserver>>,
    ) -> Rc<Self> {
        let server = Rc::new(Self {
            config,
            demuxer,
            factory,
            observer,
            state: Cell::new(State::Stopped),
            writes_enabled: Rc::new(Cell::new(true)),
            inner: RefCell::new(ServerInner {
                table: ConnectionTable::new(),
                request_ids: InstanceRequestIds::new(Role::Server),
            }),
            cleanup_task: RefCell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *server.weak_self.borrow_mut() = Rc::downgrade(&server);
        server
    }

    pub fn demuxer(&self) -> &MessageDemuxer {
        &self.demuxer
    }

    /// Allocates the next protocol request id to use with `instance_id`.
    pub fn next_instance_request_id(&self, instance_id: InstanceId) -> RequestId {
        self.inner
            .borrow_mut()
            .request_ids
            .next_request_id(instance_id)
    }

    /// The instance id the next promotion will use; test hook for the
    /// monotonicity invariant.
    pub fn next_instance_id(&self) -> InstanceId {
        self.inner.borrow().table.next_instance_id()
    }

    fn cleanup(&self) {
        let actions = self.inner.borrow_mut().table.run_cleanup(false);
        for (instance_id, pc_id) in actions.eofs {
            let _ = self.demuxer.on_stream_data(instance_id, pc_id, &[]);
        }
    }

    fn schedule_cleanup(&self) {
        let weak = self.weak_self.borrow().clone();
        let period = self.config.cleanup_period;
        let handle = spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = weak.upgrade() else { break };
                if server.state() == State::Stopped {
                    break;
                }
                server.cleanup();
            }
        });
        *self.cleanup_task.borrow_mut() = Some(handle);
    }
}

impl ProtocolConnectionEndpoint for QuicServer {
    fn start(&self) -> bool {
        if self.state.get() != State::Stopped {
            return false;
        }
        let sink: Weak<dyn SessionEventSink> = self.weak_self.borrow().clone();
        if let Err(err) = self
            .factory
            .set_server_delegate(Some(sink), &self.config.connection_endpoints)
        {
            error!(error = %err, "failed to start server endpoint");
            self.observer.borrow_mut().on_error(&err);
            return false;
        }
        self.state.set(State::Running);
        self.writes_enabled.set(true);
        self.cleanup();
        self.schedule_cleanup();
        self.observer.borrow_mut().on_running();
        true
    }

    fn stop(&self) -> bool {
        if !matches!(self.state.get(), State::Running | State::Suspended) {
            return false;
        }
        if let Err(err) = self.factory.set_server_delegate(None, &[]) {
            warn!(error = %err, "failed to detach server delegate");
        }
        self.inner.borrow_mut().table.close_all();
        self.inner.borrow_mut().request_ids.reset();
        self.state.set(State::Stopped);
        if let Some(task) = self.cleanup_task.borrow_mut().take() {
            task.abort();
        }
        self.cleanup();
        self.observer.borrow_mut().on_stopped();
        true
    }

    fn suspend(&self) -> bool {
        if self.state.get() != State::Running {
            return false;
        }
        self.state.set(State::Suspended);
        // Connections stay up; writes are rejected until resume.
        self.writes_enabled.set(false);
        info!("server endpoint suspended");
        self.observer.borrow_mut().on_suspended();
        true
    }

    fn resume(&self) -> bool {
        if self.state.get() != State::Suspended {
            return false;
        }
        self.state.set(State::Running);
        self.writes_enabled.set(true);
        info!("server endpoint resumed");
        self.observer.borrow_mut().on_running();
        true
    }

    fn state(&self) -> State {
        self.state.get()
    }

    fn create_protocol_connection(
        &self,
        instance_id: InstanceId,
    ) -> Option<QuicProtocolConnection> {
        if self.state.get() != State::Running {
            return None;
        }
        let (session, manager) = self.inner.borrow().table.connection(instance_id)?;
        Some(QuicProtocolConnection::from_existing(
            &manager,
            session.as_ref(),
            instance_id,
            Rc::clone(&self.writes_enabled),
        ))
    }
}

impl SessionEventSink for QuicServer {
    fn on_incoming_connection(&self, remote: SocketAddr, session: Rc<dyn QuicSession>) {
        if !matches!(self.state.get(), State::Running | State::Suspended) {
            warn!(%remote, "rejecting connection while stopped");
            session.close();
            return;
        }
        // No instance name exists for an inbound peer yet; the remote
        // address stands in until promotion.
        let instance_name = remote.to_string();
        debug!(instance_name = %instance_name, "inbound connection admitted as pending");
        let connection_id = session.connection_id();
        self.inner.borrow_mut().table.insert_pending(
            &instance_name,
            connection_id,
            PendingConnectionData {
                data: ServiceConnectionData::new(session, instance_name.clone()),
                callbacks: Vec::new(),
            },
        );
    }

    fn on_crypto_handshake_complete(&self, connection_id: ConnectionId) {
        debug_assert!(matches!(
            self.state.get(),
            State::Running | State::Suspended
        ));
        let promoted = self.inner.borrow_mut().table.promote(connection_id);
        if let Some(promoted) = promoted {
            info!(
                instance_name = %promoted.instance_name,
                instance_id = promoted.instance_id,
                "inbound connection established"
            );
        }
    }

    fn on_connection_failed(&self, connection_id: ConnectionId, error: Error) {
        debug!(connection_id, %error, "inbound handshake failed");
        self.inner.borrow_mut().table.fail_pending(connection_id);
    }

    fn on_incoming_stream(&self, connection_id: ConnectionId, stream: QuicStreamHandle) {
        let resolved = self.inner.borrow().table.established(connection_id);
        let Some((instance_id, manager)) = resolved else {
            warn!(connection_id, "stream for unknown connection");
            stream.close_write_end();
            return;
        };
        // The protocol connection exists before the first byte arrives;
        // the observer owns it from here.
        let connection = QuicProtocolConnection::with_stream(
            &manager,
            stream,
            instance_id,
            Rc::clone(&self.writes_enabled),
        );
        self.observer.borrow_mut().on_incoming_connection(connection);
    }

    fn on_stream_data(&self, connection_id: ConnectionId, stream_id: StreamId, data: Bytes) {
        let resolved = self.inner.borrow().table.established(connection_id);
        let Some((instance_id, manager)) = resolved else { return };
        let pc_id = manager.borrow().protocol_connection_id(stream_id);
        let Some(pc_id) = pc_id else {
            debug!(connection_id, stream_id, "bytes for unknown stream");
            return;
        };
        if let Err(error) = self.demuxer.on_stream_data(instance_id, pc_id, &data) {
            debug!(instance_id, pc_id, %error, "stream parse error");
        }
    }

    fn on_stream_closed(&self, connection_id: ConnectionId, stream_id: StreamId) {
        let resolved = self.inner.borrow().table.established(connection_id);
        let Some((instance_id, manager)) = resolved else { return };
        let notice = manager.borrow_mut().on_stream_closed(stream_id);
        if let Some(notice) = notice {
            if let Some(observer) = notice.observer {
                observer
                    .borrow_mut()
                    .on_connection_closed(instance_id, notice.protocol_connection_id);
            }
        }
    }

    fn on_connection_closed(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(instance_id) = inner.table.mark_connection_closed(connection_id) {
            inner.request_ids.reset_request_id(instance_id);
            debug!(instance_id, "connection closed, queued for deletion");
        }
    }
}
