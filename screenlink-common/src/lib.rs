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

//! Types shared across the screenlink protocol layers.
//!
//! Everything here is deliberately small: id aliases, the shared error
//! surface, the role-parity request-id generator and the discovery-fed
//! service records the connection layer consumes.

pub mod error;
pub mod request_ids;
pub mod service_info;

pub use error::Error;
pub use request_ids::{InstanceRequestIds, Role};
pub use service_info::ServiceInfo;

/// Process-local identifier assigned to a peer agent after the QUIC
/// handshake completes. `0` is reserved as "invalid"; real ids start at 1
/// and are never reused while the endpoint keeps running.
pub type InstanceId = u64;

/// A QUIC stream id, in the wire numbering.
pub type StreamId = u64;

/// Identifies a protocol connection within its owning instance. Equal to
/// the id of the QUIC stream that backs it.
pub type ProtocolConnectionId = u64;

/// Identifier handed out for an in-flight connect request.
pub type RequestId = u64;

/// Base64 of the SHA-256 digest of an agent's leaf certificate DER. The
/// sole identity an agent presents during TLS and the scalar source for
/// the SPAKE2 exchange.
pub type AgentFingerprint = String;

/// TXT record key carrying the agent fingerprint.
pub const FINGERPRINT_TXT_KEY: &str = "fp";

/// TXT record key carrying the authentication initiation token.
pub const AUTH_TOKEN_TXT_KEY: &str = "at";

/// DNS-SD service type agents advertise under.
pub const SERVICE_TYPE: &str = "_openscreen._udp.local";

/// ALPN protocol id used on every QUIC connection.
pub const ALPN_OSP: &[u8] = b"osp";
