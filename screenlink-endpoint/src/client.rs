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

//! The client endpoint: dials instances learned from discovery.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use screenlink_common::{
    Error, InstanceId, InstanceRequestIds, RequestId, Role, ServiceInfo, StreamId,
};
use screenlink_demux::MessageDemuxer;
use screenlink_quic::{
    ConnectionId, QuicProtocolConnection, QuicSession, QuicStreamHandle, SessionEventSink,
};
use tokio::task::{spawn_local, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::shared::{ConnectionTable, PendingConnectionData, ServiceConnectionData};
use crate::{
    ClientConnectionFactory, ConnectRequest, EndpointConfig, ProtocolConnectionEndpoint,
    RequestCallback, ServiceObserver, State,
};

struct ClientInner {
    /// Discovery-fed records, keyed by instance name.
    instance_infos: HashMap<String, ServiceInfo>,
    table: ConnectionTable,
    next_request_id: RequestId,
    request_ids: InstanceRequestIds,
}

/// Client endpoint over a QUIC connection factory.
///
/// Connect requests against the same not-yet-established instance
/// coalesce onto one pending connection; every waiter is resolved in
/// registration order at promotion.
pub struct QuicClient {
    config: EndpointConfig,
    demuxer: MessageDemuxer,
    factory: Rc<dyn ClientConnectionFactory>,
    observer: Rc<RefCell<dyn ServiceObserver>>,
    state: Cell<State>,
    writes_enabled: Rc<Cell<bool>>,
    inner: RefCell<ClientInner>,
    cleanup_task: RefCell<Option<JoinHandle<()>>>,
    weak_self: RefCell<Weak<QuicClient>>,
}

impl QuicClient {
    pub fn new(
        config: EndpointConfig,
        demuxer: MessageDemuxer,
        factory: Rc<dyn ClientConnectionFactory>,
        observer: Rc<RefCell<dyn ServiceObserver>>,
    ) -> Rc<Self> {
        let client = Rc::new(Self {
            config,
            demuxer,
            factory,
            observer,
            state: Cell::new(State::Stopped),
            writes_enabled: Rc::new(Cell::new(true)),
            inner: RefCell::new(ClientInner {
                instance_infos: HashMap::new(),
                table: ConnectionTable::new(),
                next_request_id: 1,
                request_ids: InstanceRequestIds::new(Role::Client),
            }),
            cleanup_task: RefCell::new(None),
            weak_self: RefCell::new(Weak::new()),
        });
        *client.weak_self.borrow_mut() = Rc::downgrade(&client);
        let client_dyn: Rc<dyn SessionEventSink> = client.clone();
        let sink: Weak<dyn SessionEventSink> = Rc::downgrade(&client_dyn);
        client.factory.set_event_sink(sink);
        client
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

    /// Opens a connection to the named instance.
    ///
    /// Already-established instances are answered synchronously through
    /// `callback`; otherwise a pending connection is created (or joined)
    /// and the callback fires at promotion. Returns `None` when the
    /// request could not even be queued.
    pub fn connect(
        &self,
        instance_name: &str,
        callback: RequestCallback,
    ) -> Option<ConnectRequest> {
        if self.state.get() != State::Running {
            error!("connect failed: client endpoint is not running");
            callback.borrow_mut().on_connection_failed(0);
            return None;
        }

        let established = self
            .inner
            .borrow()
            .table
            .instance_map
            .get(instance_name)
            .copied();
        if let Some(instance_id) = established {
            let Some(connection) = self.create_protocol_connection(instance_id) else {
                error!(instance_name, "established instance lost its connection");
                callback.borrow_mut().on_connection_failed(0);
                return None;
            };
            let request_id = self.bump_request_id();
            callback
                .borrow_mut()
                .on_connection_opened(request_id, connection);
            return Some(ConnectRequest { request_id });
        }

        self.create_pending_connection(instance_name, callback)
    }

    /// Withdraws an in-flight connect request. When it was the last
    /// waiter the pending connection itself is closed, synchronously.
    /// Other waiters are unaffected.
    pub fn cancel_connect(&self, request_id: RequestId) -> bool {
        self.inner.borrow_mut().table.cancel_request(request_id)
    }

    // Discovery input; records are pushed, never polled.

    pub fn on_instance_added(&self, info: ServiceInfo) {
        debug!(instance_name = %info.instance_name, "instance discovered");
        self.inner
            .borrow_mut()
            .instance_infos
            .insert(info.instance_name.clone(), info);
    }

    pub fn on_instance_changed(&self, info: ServiceInfo) {
        self.inner
            .borrow_mut()
            .instance_infos
            .insert(info.instance_name.clone(), info);
    }

    pub fn on_instance_removed(&self, instance_name: &str) {
        self.inner
            .borrow_mut()
            .instance_infos
            .remove(instance_name);
    }

    pub fn on_all_instances_removed(&self) {
        self.inner.borrow_mut().instance_infos.clear();
    }

    /// The instance id the next promotion will use; test hook for the
    /// monotonicity invariant.
    pub fn next_instance_id(&self) -> InstanceId {
        self.inner.borrow().table.next_instance_id()
    }

    fn bump_request_id(&self) -> RequestId {
        let mut inner = self.inner.borrow_mut();
        let request_id = inner.next_request_id;
        inner.next_request_id += 1;
        request_id
    }

    fn create_pending_connection(
        &self,
        instance_name: &str,
        callback: RequestCallback,
    ) -> Option<ConnectRequest> {
        // Coalesce onto an existing pending connection if there is one.
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let next = inner.next_request_id;
            if let Some(entry) = inner.table.pending_mut(instance_name) {
                entry.callbacks.push((next, callback.clone()));
                inner.next_request_id = next + 1;
                debug!(instance_name, request_id = next, "coalesced connect request");
                return Some(ConnectRequest { request_id: next });
            }
        }
        self.start_connection_request(instance_name, callback)
    }

    fn start_connection_request(
        &self,
        instance_name: &str,
        callback: RequestCallback,
    ) -> Option<ConnectRequest> {
        let info = self
            .inner
            .borrow()
            .instance_infos
            .get(instance_name)
            .cloned();
        let Some(info) = info else {
            error!(instance_name, "connect failed: no discovery record");
            callback.borrow_mut().on_connection_failed(0);
            return None;
        };
        let Some(remote) = info.preferred_endpoint() else {
            error!(instance_name, "connect failed: record has no endpoint");
            callback.borrow_mut().on_connection_failed(0);
            return None;
        };

        let session = match self.factory.connect(remote, &info.fingerprint) {
            Ok(session) => session,
            Err(err) => {
                error!(instance_name, error = %err, "factory connect failed");
                self.observer.borrow_mut().on_error(&err);
                callback.borrow_mut().on_connection_failed(0);
                return None;
            }
        };

        let mut inner = self.inner.borrow_mut();
        let request_id = inner.next_request_id;
        inner.next_request_id += 1;
        let connection_id = session.connection_id();
        inner.table.insert_pending(
            instance_name,
            connection_id,
            PendingConnectionData {
                data: ServiceConnectionData::new(session, instance_name),
                callbacks: vec![(request_id, callback)],
            },
        );
        info!(instance_name, request_id, "connection request started");
        Some(ConnectRequest { request_id })
    }

    fn cleanup(&self) {
        let actions = self.inner.borrow_mut().table.run_cleanup(true);
        for (instance_id, pc_id) in actions.eofs {
            let _ = self.demuxer.on_stream_data(instance_id, pc_id, &[]);
        }
    }

    fn schedule_cleanup(&self) {
        let weak = self.weak_self.borrow().clone();
        let period = self.config.cleanup_period;
        let handle = spawn_local(async move {
            let mut interval = tokio::time::interval(period);
            // The pass for "now" already ran synchronously in start().
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(client) = weak.upgrade() else { break };
                if client.state() == State::Stopped {
                    break;
                }
                client.cleanup();
            }
        });
        *self.cleanup_task.borrow_mut() = Some(handle);
    }
}

impl ProtocolConnectionEndpoint for QuicClient {
    fn start(&self) -> bool {
        if self.state.get() != State::Stopped {
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
        if self.state.get() == State::Stopped {
            return false;
        }
        let closed = {
            let mut inner = self.inner.borrow_mut();
            let closed = inner.table.close_all();
            inner.request_ids.reset();
            closed
        };
        self.state.set(State::Stopped);
        if let Some(task) = self.cleanup_task.borrow_mut().take() {
            task.abort();
        }
        self.cleanup();
        for (request_id, callback) in closed.failed_waiters {
            callback.borrow_mut().on_connection_failed(request_id);
        }
        self.observer.borrow_mut().on_stopped();
        true
    }

    fn suspend(&self) -> bool {
        // Clients have no suspended state.
        false
    }

    fn resume(&self) -> bool {
        false
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

impl SessionEventSink for QuicClient {
    fn on_incoming_connection(&self, remote: std::net::SocketAddr, session: Rc<dyn QuicSession>) {
        warn!(%remote, "client endpoint rejects inbound connections");
        session.close();
    }

    fn on_crypto_handshake_complete(&self, connection_id: ConnectionId) {
        let promoted = self.inner.borrow_mut().table.promote(connection_id);
        // Every waiter may have cancelled in the meantime.
        let Some(promoted) = promoted else { return };
        for (request_id, callback) in promoted.callbacks {
            let connection = QuicProtocolConnection::from_existing(
                &promoted.manager,
                promoted.session.as_ref(),
                promoted.instance_id,
                Rc::clone(&self.writes_enabled),
            );
            callback
                .borrow_mut()
                .on_connection_opened(request_id, connection);
        }
    }

    fn on_connection_failed(&self, connection_id: ConnectionId, error: Error) {
        warn!(connection_id, %error, "pending connection failed");
        let failed = self.inner.borrow_mut().table.fail_pending(connection_id);
        self.observer.borrow_mut().on_error(&error);
        if let Some((instance_name, callbacks)) = failed {
            debug!(instance_name = %instance_name, "failing {} waiter(s)", callbacks.len());
            for (request_id, callback) in callbacks {
                callback.borrow_mut().on_connection_failed(request_id);
            }
        }
    }

    fn on_incoming_stream(&self, connection_id: ConnectionId, stream: QuicStreamHandle) {
        let resolved = self.inner.borrow().table.established(connection_id);
        let Some((instance_id, manager)) = resolved else {
            warn!(connection_id, "stream for unknown connection");
            stream.close_write_end();
            return;
        };
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
            // The offending frame was skipped; whether to reset the
            // stream is the subscriber's call.
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
