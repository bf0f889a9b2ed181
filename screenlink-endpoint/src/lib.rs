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

//! Protocol connection endpoints.
//!
//! An endpoint owns every QUIC connection to peer agents: it admits
//! inbound connections (server) or dials out from discovery records
//! (client), promotes connections into its table when the crypto
//! handshake completes, vends per-stream protocol connections, feeds
//! inbound bytes to the message demuxer, and finalizes closed streams on
//! a periodic cleanup pass.
//!
//! Endpoints run single-threaded inside a tokio `LocalSet`; every
//! callback (observer, connect request, demuxer watcher) fires on that
//! task runner.

pub mod client;
pub mod server;
mod shared;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use screenlink_common::{Error, InstanceId, RequestId};
use screenlink_quic::{QuicProtocolConnection, QuicSession, QuinnClientFactory, QuinnServerFactory, WeakSink};

pub use client::QuicClient;
pub use server::QuicServer;

/// Lifecycle of an endpoint. `Starting` and `Stopping` are transitional;
/// clients never enter `Suspended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
    Suspended,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Stopped => "STOPPED",
            State::Starting => "STARTING",
            State::Running => "RUNNING",
            State::Stopping => "STOPPING",
            State::Suspended => "SUSPENDED",
        };
        f.write_str(name)
    }
}

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Local addresses a server listens on. Unused by clients, which bind
    /// one wildcard socket per outgoing connection.
    pub connection_endpoints: Vec<SocketAddr>,
    /// Cadence of the closed-stream / dead-connection cleanup pass.
    pub cleanup_period: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connection_endpoints: Vec::new(),
            cleanup_period: Duration::from_millis(500),
        }
    }
}

/// Observes endpoint lifecycle and inbound connections.
pub trait ServiceObserver {
    fn on_running(&mut self);
    fn on_stopped(&mut self);
    fn on_suspended(&mut self);
    /// A peer opened a stream; `connection` is the protocol connection
    /// wrapping it.
    fn on_incoming_connection(&mut self, connection: QuicProtocolConnection);
    fn on_error(&mut self, error: &Error);
}

/// Per-request callback for client connect attempts.
pub trait ConnectionRequestCallback {
    fn on_connection_opened(&mut self, request_id: RequestId, connection: QuicProtocolConnection);
    fn on_connection_failed(&mut self, request_id: RequestId);
}

/// Shared handle type for connect-request callbacks.
pub type RequestCallback = Rc<RefCell<dyn ConnectionRequestCallback>>;

/// Identifies an in-flight connect request; pass to
/// [`QuicClient::cancel_connect`] to withdraw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub request_id: RequestId,
}

/// Operations common to client and server endpoints.
pub trait ProtocolConnectionEndpoint {
    /// Starts the endpoint. Returns false unless the state was `Stopped`.
    fn start(&self) -> bool;

    /// Stops the endpoint, closing every pending and established
    /// connection. Returns false when already stopped (or stopping).
    fn stop(&self) -> bool;

    /// Servers only: stop writing without tearing down connections.
    /// Returns false unless `Running`.
    fn suspend(&self) -> bool;

    /// Servers only: return from `Suspended` to `Running`.
    fn resume(&self) -> bool;

    fn state(&self) -> State;

    /// Synchronously opens a new protocol connection to an established
    /// instance. Returns `None` when the endpoint is not running or the
    /// instance is unknown.
    fn create_protocol_connection(
        &self,
        instance_id: InstanceId,
    ) -> Option<QuicProtocolConnection>;
}

/// Creates outgoing QUIC connections for a client endpoint. Implemented
/// by the Quinn factory; tests substitute fakes.
pub trait ClientConnectionFactory {
    fn set_event_sink(&self, sink: WeakSink);
    fn connect(
        &self,
        remote: SocketAddr,
        expected_fingerprint: &str,
    ) -> Result<Rc<dyn QuicSession>, Error>;
}

impl ClientConnectionFactory for QuinnClientFactory {
    fn set_event_sink(&self, sink: WeakSink) {
        QuinnClientFactory::set_event_sink(self, sink);
    }

    fn connect(
        &self,
        remote: SocketAddr,
        expected_fingerprint: &str,
    ) -> Result<Rc<dyn QuicSession>, Error> {
        QuinnClientFactory::connect(self, remote, expected_fingerprint)
    }
}

/// Accepts inbound QUIC connections for a server endpoint.
pub trait ServerConnectionFactory {
    fn set_server_delegate(
        &self,
        sink: Option<WeakSink>,
        endpoints: &[SocketAddr],
    ) -> Result<(), Error>;
}

impl ServerConnectionFactory for QuinnServerFactory {
    fn set_server_delegate(
        &self,
        sink: Option<WeakSink>,
        endpoints: &[SocketAddr],
    ) -> Result<(), Error> {
        QuinnServerFactory::set_server_delegate(self, sink, endpoints)
    }
}
