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

//! The error surface shared by every screenlink layer.

use thiserror::Error;

/// Errors reported across the protocol stack.
///
/// Remote protocol errors (`CborParsing`, `InvalidAnswer`, ...) are scoped
/// to the stream or authentication session that produced them and never
/// tear down the endpoint. Credential errors at startup are loud and fatal
/// to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The endpoint is not in the `Running` state required for this call.
    #[error("endpoint is not running")]
    NotRunning,

    /// An authentication session has no protocol connection to speak over.
    #[error("no active protocol connection")]
    NoActiveConnection,

    /// A CBOR item ended before the message was complete. The bytes stay
    /// buffered and decoding is retried when more data arrives.
    #[error("incomplete CBOR message")]
    CborIncompleteMessage,

    /// A frame could not be decoded as the tagged message type.
    #[error("CBOR parse error: {0}")]
    CborParsing(String),

    /// A message could not be encoded to CBOR.
    #[error("CBOR encode error: {0}")]
    CborEncoding(String),

    /// The peer answered with something the protocol forbids at this point
    /// (token mismatch, wrong PSK status, invalid proof, ...).
    #[error("invalid answer: {0}")]
    InvalidAnswer(String),

    /// No discovery record exists for the requested instance name.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// An outgoing connection attempt failed before promotion.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Certificate or private key material could not be loaded or parsed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// A transport-level (QUIC/TLS) failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Reserved functionality that is intentionally not implemented yet.
    #[error("operation not implemented")]
    NotImplemented,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the errors the demuxer treats as "wait for more bytes"
    /// rather than a failed frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::CborIncompleteMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_is_distinguished_from_parse_errors() {
        assert!(Error::CborIncompleteMessage.is_incomplete());
        assert!(!Error::CborParsing("truncated map".into()).is_incomplete());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::UnknownInstance("living-room-tv".into());
        assert_eq!(err.to_string(), "unknown instance: living-room-tv");
    }
}
