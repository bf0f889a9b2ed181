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

//! Discovery records pushed into the connection layer.

use std::net::{SocketAddrV4, SocketAddrV6};

use crate::AgentFingerprint;

/// One discovered agent, as reported by the discovery layer.
///
/// The connection layer never polls discovery; it receives these records
/// through `added`/`changed`/`removed` notifications and keys them by
/// `instance_name` until the QUIC handshake promotes the peer to an
/// instance id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Opaque name chosen at discovery time.
    pub instance_name: String,
    /// The agent's advertised certificate fingerprint (`fp` TXT record).
    pub fingerprint: AgentFingerprint,
    /// Authentication initiation token (`at` TXT record), if advertised.
    pub auth_token: Option<String>,
    pub v4_endpoint: Option<SocketAddrV4>,
    pub v6_endpoint: Option<SocketAddrV6>,
}

impl ServiceInfo {
    /// The endpoint to dial, preferring IPv4 when both are advertised.
    pub fn preferred_endpoint(&self) -> Option<std::net::SocketAddr> {
        self.v4_endpoint
            .map(std::net::SocketAddr::V4)
            .or(self.v6_endpoint.map(std::net::SocketAddr::V6))
    }
}
