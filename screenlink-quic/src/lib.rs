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

//! QUIC transport layer built on Quinn.
//!
//! This crate owns everything between UDP datagrams and the connection
//! endpoint: agent certificates and the fingerprint-pinning TLS verifiers,
//! channel-backed stream write handles, per-connection stream managers,
//! protocol connections, and the client/server connection factories.
//!
//! # Concurrency
//!
//! The whole stack runs single-threaded on a tokio `LocalSet`. Factories
//! spawn local tasks for connecting, accepting and stream pumping; those
//! tasks report back through [`SessionEventSink`], which the connection
//! endpoint implements. No callback is invoked while internal state is
//! borrowed.

pub mod certificate;
pub mod factory;
pub mod protocol_connection;
pub mod session;
pub mod stream;
pub mod stream_manager;
mod verifier;

pub use certificate::{compute_fingerprint, AgentCertificate};
pub use factory::{QuinnClientFactory, QuinnServerFactory};
pub use protocol_connection::{ConnectionObserver, QuicProtocolConnection};
pub use session::{ConnectionId, QuicSession, QuinnSession, SessionEventSink, WeakSink};
pub use stream::{QuicStreamHandle, StreamCmd};
pub use stream_manager::{ClosedStreamNotice, StreamManager, StreamPair};
