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

//! Typed protocol messages and their CBOR wire form.
//!
//! Every message travels on a stream as a one-byte type tag immediately
//! followed by a single CBOR item (an integer-keyed map). There is no
//! length prefix; the boundary of a frame is wherever the CBOR item ends.
//!
//! Decoders distinguish "the item is not all here yet" (reported as
//! [`Error::CborIncompleteMessage`], retry with more bytes) from genuine
//! parse failures. Encoders and decoders are written by hand against the
//! message schemas so the wire layout is explicit in the code.

pub mod agent;
pub mod auth;

use minicbor::{Decoder, Encoder};
use screenlink_common::Error;

pub use agent::{AgentInfo, AgentInfoRequest, AgentInfoResponse};
pub use auth::{
    AuthInitiationToken, AuthSpake2Confirmation, AuthSpake2Handshake, AuthSpake2PskStatus,
    AuthStatus, AuthStatusResult,
};

/// Closed enumeration of message type tags.
///
/// The tag is the first byte of every frame. Values outside this set are a
/// protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    AuthSpake2Handshake = 1,
    AuthSpake2Confirmation = 2,
    AuthStatus = 3,
    AgentInfoRequest = 10,
    AgentInfoResponse = 11,
}

impl TypeTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::AuthSpake2Handshake),
            2 => Some(Self::AuthSpake2Confirmation),
            3 => Some(Self::AuthStatus),
            10 => Some(Self::AgentInfoRequest),
            11 => Some(Self::AgentInfoResponse),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A message that knows its tag and wire layout.
pub trait Message: Sized {
    const TAG: TypeTag;

    /// Appends the CBOR body (without the tag byte) to `buf`.
    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<(), Error>;

    /// Decodes one CBOR body from the front of `buf`, returning the message
    /// and the number of body bytes consumed.
    ///
    /// Returns [`Error::CborIncompleteMessage`] when `buf` ends inside the
    /// item; callers keep the bytes buffered and retry later.
    fn decode_body(buf: &[u8]) -> Result<(Self, usize), Error>;
}

/// Encodes a complete frame: tag byte followed by the CBOR body.
pub fn encode_frame<M: Message>(message: &M) -> Result<Vec<u8>, Error> {
    let mut buf = vec![M::TAG.as_u8()];
    message.encode_body(&mut buf)?;
    Ok(buf)
}

pub(crate) fn encode_err<E: std::fmt::Display>(e: E) -> Error {
    Error::CborEncoding(e.to_string())
}

pub(crate) fn decode_err(e: minicbor::decode::Error) -> Error {
    if e.is_end_of_input() {
        Error::CborIncompleteMessage
    } else {
        Error::CborParsing(e.to_string())
    }
}

/// Attempts to skip exactly one CBOR item at the front of `buf`.
///
/// Used by the demuxer to resynchronize a stream after a frame the watcher
/// could not decode. Returns the number of bytes the item occupies, or
/// [`Error::CborIncompleteMessage`] if the item extends past the buffer.
pub fn skip_item(buf: &[u8]) -> Result<usize, Error> {
    let mut decoder = Decoder::new(buf);
    decoder.skip().map_err(decode_err)?;
    Ok(decoder.position())
}

pub(crate) fn encoder(buf: &mut Vec<u8>) -> Encoder<&mut Vec<u8>> {
    Encoder::new(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_values_round_trip() {
        for tag in [
            TypeTag::AuthSpake2Handshake,
            TypeTag::AuthSpake2Confirmation,
            TypeTag::AuthStatus,
            TypeTag::AgentInfoRequest,
            TypeTag::AgentInfoResponse,
        ] {
            assert_eq!(TypeTag::from_u8(tag.as_u8()), Some(tag));
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert_eq!(TypeTag::from_u8(0), None);
        assert_eq!(TypeTag::from_u8(250), None);
    }

    #[test]
    fn skip_item_reports_extent() {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(1).unwrap().u8(0).unwrap().str("hello").unwrap();
        let len = buf.len();
        buf.extend_from_slice(b"trailing");
        assert_eq!(skip_item(&buf).unwrap(), len);
    }

    #[test]
    fn skip_item_detects_truncation() {
        let mut buf = Vec::new();
        let mut enc = encoder(&mut buf);
        enc.map(1).unwrap().u8(0).unwrap().str("hello").unwrap();
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            skip_item(&buf),
            Err(Error::CborIncompleteMessage)
        ));
    }
}
