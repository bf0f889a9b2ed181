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

//! Connection factories.
//!
//! The client factory creates one UDP socket per outgoing connection and
//! releases it when the connection ends. The server factory binds one
//! listening socket per configured local endpoint while a server delegate
//! is installed. Quinn provides the packet dispatch that routes datagrams
//! to connections.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use screenlink_common::Error;
use tokio::task::{spawn_local, JoinHandle};
use tracing::{debug, error, info};

use crate::certificate::AgentCertificate;
use crate::session::{ConnectionId, QuicSession, QuinnSession, SessionEventSink, WeakSink};

fn wildcard_bind_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        "0.0.0.0:0".parse().expect("static addr")
    } else {
        "[::]:0".parse().expect("static addr")
    }
}

/// Creates outgoing QUIC connections, one socket each.
pub struct QuinnClientFactory {
    certificate: Rc<AgentCertificate>,
    sink: RefCell<Option<WeakSink>>,
    next_connection_id: Cell<ConnectionId>,
}

impl QuinnClientFactory {
    pub fn new(certificate: Rc<AgentCertificate>) -> Self {
        Self {
            certificate,
            sink: RefCell::new(None),
            next_connection_id: Cell::new(1),
        }
    }

    /// Installs the event sink all connection tasks report into. Must be
    /// called before the first `connect`.
    pub fn set_event_sink(&self, sink: WeakSink) {
        *self.sink.borrow_mut() = Some(sink);
    }

    /// Dials `remote`, pinning `expected_fingerprint` for the TLS
    /// handshake. Returns the pending session; handshake completion and
    /// failure arrive through the sink.
    pub fn connect(
        &self,
        remote: SocketAddr,
        expected_fingerprint: &str,
    ) -> Result<Rc<dyn QuicSession>, Error> {
        let sink = self
            .sink
            .borrow()
            .clone()
            .ok_or_else(|| Error::Transport("client factory has no event sink".into()))?;

        let endpoint = quinn::Endpoint::client(wildcard_bind_for(remote)).map_err(|e| {
            error!(%remote, error = %e, "failed to create socket");
            Error::Io(e)
        })?;
        let config = self.certificate.client_config(expected_fingerprint)?;

        let connection_id = self.next_connection_id.get();
        self.next_connection_id.set(connection_id + 1);
        debug!(connection_id, %remote, "dialing");

        let session = QuinnSession::connect(connection_id, endpoint, config, remote, sink)?;
        Ok(session as Rc<dyn QuicSession>)
    }
}

struct Listener {
    endpoint: quinn::Endpoint,
    accept_task: JoinHandle<()>,
}

/// Accepts inbound QUIC connections on the configured local endpoints.
pub struct QuinnServerFactory {
    certificate: Rc<AgentCertificate>,
    next_connection_id: Rc<Cell<ConnectionId>>,
    listeners: RefCell<Vec<Listener>>,
}

impl QuinnServerFactory {
    pub fn new(certificate: Rc<AgentCertificate>) -> Self {
        Self {
            certificate,
            next_connection_id: Rc::new(Cell::new(1)),
            listeners: RefCell::new(Vec::new()),
        }
    }

    /// Installs (`Some`) or removes (`None`) the server delegate.
    ///
    /// Installing binds one listening socket per address in `endpoints`
    /// and starts accepting; a bind failure on one address is logged and
    /// skipped. Removing aborts the accept loops and closes the sockets.
    pub fn set_server_delegate(
        &self,
        sink: Option<WeakSink>,
        endpoints: &[SocketAddr],
    ) -> Result<(), Error> {
        match sink {
            Some(sink) => {
                if !self.listeners.borrow().is_empty() {
                    return Err(Error::Transport("server delegate already installed".into()));
                }
                let server_config = self.certificate.server_config()?;
                let mut listeners = Vec::new();
                for &addr in endpoints {
                    match quinn::Endpoint::server(server_config.clone(), addr) {
                        Ok(endpoint) => {
                            info!(%addr, "listening for QUIC connections");
                            let accept_task = spawn_local(run_accept_loop(
                                endpoint.clone(),
                                sink.clone(),
                                Rc::clone(&self.next_connection_id),
                            ));
                            listeners.push(Listener {
                                endpoint,
                                accept_task,
                            });
                        }
                        Err(e) => {
                            error!(%addr, error = %e, "failed to create socket");
                        }
                    }
                }
                if listeners.is_empty() && !endpoints.is_empty() {
                    return Err(Error::Transport(
                        "failed to bind any server endpoint".into(),
                    ));
                }
                *self.listeners.borrow_mut() = listeners;
                Ok(())
            }
            None => {
                for listener in self.listeners.borrow_mut().drain(..) {
                    listener.accept_task.abort();
                    listener.endpoint.close(0u32.into(), b"server stopped");
                }
                Ok(())
            }
        }
    }

    /// Local addresses actually bound, for tests and discovery
    /// advertisement.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .borrow()
            .iter()
            .filter_map(|listener| listener.endpoint.local_addr().ok())
            .collect()
    }
}

async fn run_accept_loop(
    endpoint: quinn::Endpoint,
    sink: WeakSink,
    next_connection_id: Rc<Cell<ConnectionId>>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let remote = incoming.remote_address();
        let connecting = match incoming.accept() {
            Ok(connecting) => connecting,
            Err(error) => {
                debug!(%remote, %error, "rejected incoming connection");
                continue;
            }
        };

        let connection_id = next_connection_id.get();
        next_connection_id.set(connection_id + 1);
        debug!(connection_id, %remote, "admitting incoming connection");

        let session = QuinnSession::accept(connection_id, connecting, remote, sink.clone());
        let Some(strong) = sink.upgrade() else { return };
        strong.on_incoming_connection(remote, session as Rc<dyn QuicSession>);
    }
}
