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

//! Authentication messages.
//!
//! Schemas (integer-keyed CBOR maps):
//!
//! ```text
//! auth-spake2-handshake = {
//!   0: auth-initiation-token   ; { ? 0: text }
//!   1: spake2-psk-status       ; needs-presentation: 0, shown: 1, input: 2
//!   2: bytes                   ; public-value
//! }
//! auth-spake2-confirmation = { 0: bytes .size 64 }
//! auth-status = { 0: &(authenticated: 0, proof-invalid: 1, unknown-error: 2) }
//! ```

use minicbor::Decoder;
use screenlink_common::Error;

use crate::{decode_err, encode_err, encoder, Message, TypeTag};

/// Length of a SPAKE2 confirmation value (SHA-512 output).
pub const CONFIRMATION_VALUE_LEN: usize = 64;

/// The optional token carried by a handshake message.
///
/// `has_token == false` encodes as an empty map; the flag is preserved
/// through a round trip even though no token text is on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthInitiationToken {
    pub has_token: bool,
    pub token: String,
}

impl AuthInitiationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            has_token: true,
            token: token.into(),
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }
}

/// Where the PSK stands in the presentation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthSpake2PskStatus {
    /// The PSK has not been displayed to a user yet.
    NeedsPresentation = 0,
    /// The presenter has displayed the PSK.
    Shown = 1,
    /// The consumer has collected the PSK from its user.
    Input = 2,
}

impl AuthSpake2PskStatus {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::NeedsPresentation),
            1 => Ok(Self::Shown),
            2 => Ok(Self::Input),
            other => Err(Error::CborParsing(format!(
                "invalid psk-status value {other}"
            ))),
        }
    }
}

/// SPAKE2 handshake message carrying one side's public value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSpake2Handshake {
    pub initiation_token: AuthInitiationToken,
    pub psk_status: AuthSpake2PskStatus,
    pub public_value: Vec<u8>,
}

impl Message for AuthSpake2Handshake {
    const TAG: TypeTag = TypeTag::AuthSpake2Handshake;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut e = encoder(buf);
        e.map(3).map_err(encode_err)?;

        e.u8(0).map_err(encode_err)?;
        if self.initiation_token.has_token {
            e.map(1).map_err(encode_err)?;
            e.u8(0).map_err(encode_err)?;
            e.str(&self.initiation_token.token).map_err(encode_err)?;
        } else {
            e.map(0).map_err(encode_err)?;
        }

        e.u8(1).map_err(encode_err)?;
        e.u8(self.psk_status as u8).map_err(encode_err)?;

        e.u8(2).map_err(encode_err)?;
        e.bytes(&self.public_value).map_err(encode_err)?;
        Ok(())
    }

    fn decode_body(buf: &[u8]) -> Result<(Self, usize), Error> {
        let mut d = Decoder::new(buf);
        let len = d.map().map_err(decode_err)?;
        if len != Some(3) {
            return Err(Error::CborParsing(format!(
                "auth-spake2-handshake expects 3 fields, got {len:?}"
            )));
        }

        let mut initiation_token = None;
        let mut psk_status = None;
        let mut public_value = None;
        for _ in 0..3 {
            match d.u8().map_err(decode_err)? {
                0 => {
                    let token_len = d.map().map_err(decode_err)?;
                    initiation_token = Some(match token_len {
                        Some(0) => AuthInitiationToken::absent(),
                        Some(1) => {
                            let key = d.u8().map_err(decode_err)?;
                            if key != 0 {
                                return Err(Error::CborParsing(format!(
                                    "unexpected initiation-token key {key}"
                                )));
                            }
                            AuthInitiationToken::new(d.str().map_err(decode_err)?)
                        }
                        other => {
                            return Err(Error::CborParsing(format!(
                                "invalid initiation-token map length {other:?}"
                            )))
                        }
                    });
                }
                1 => {
                    psk_status = Some(AuthSpake2PskStatus::from_u8(d.u8().map_err(decode_err)?)?);
                }
                2 => {
                    public_value = Some(d.bytes().map_err(decode_err)?.to_vec());
                }
                other => {
                    return Err(Error::CborParsing(format!(
                        "unexpected auth-spake2-handshake key {other}"
                    )))
                }
            }
        }

        let message = Self {
            initiation_token: initiation_token
                .ok_or_else(|| Error::CborParsing("missing initiation-token".into()))?,
            psk_status: psk_status.ok_or_else(|| Error::CborParsing("missing psk-status".into()))?,
            public_value: public_value
                .ok_or_else(|| Error::CborParsing("missing public-value".into()))?,
        };
        Ok((message, d.position()))
    }
}

/// Confirmation message carrying the 64-byte shared-key proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSpake2Confirmation {
    pub confirmation_value: [u8; CONFIRMATION_VALUE_LEN],
}

impl Message for AuthSpake2Confirmation {
    const TAG: TypeTag = TypeTag::AuthSpake2Confirmation;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut e = encoder(buf);
        e.map(1).map_err(encode_err)?;
        e.u8(0).map_err(encode_err)?;
        e.bytes(&self.confirmation_value).map_err(encode_err)?;
        Ok(())
    }

    fn decode_body(buf: &[u8]) -> Result<(Self, usize), Error> {
        let mut d = Decoder::new(buf);
        let len = d.map().map_err(decode_err)?;
        if len != Some(1) {
            return Err(Error::CborParsing(format!(
                "auth-spake2-confirmation expects 1 field, got {len:?}"
            )));
        }
        let key = d.u8().map_err(decode_err)?;
        if key != 0 {
            return Err(Error::CborParsing(format!(
                "unexpected auth-spake2-confirmation key {key}"
            )));
        }
        let bytes = d.bytes().map_err(decode_err)?;
        let confirmation_value: [u8; CONFIRMATION_VALUE_LEN] = bytes.try_into().map_err(|_| {
            Error::CborParsing(format!(
                "confirmation-value must be {CONFIRMATION_VALUE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok((Self { confirmation_value }, d.position()))
    }
}

/// Outcome the consumer reports after checking the confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthStatusResult {
    Authenticated = 0,
    ProofInvalid = 1,
    UnknownError = 2,
}

impl AuthStatusResult {
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::Authenticated),
            1 => Ok(Self::ProofInvalid),
            2 => Ok(Self::UnknownError),
            other => Err(Error::CborParsing(format!(
                "invalid auth-status value {other}"
            ))),
        }
    }
}

impl std::fmt::Display for AuthStatusResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Authenticated => "authenticated",
            Self::ProofInvalid => "proof-invalid",
            Self::UnknownError => "unknown-error",
        };
        f.write_str(name)
    }
}

/// Final status message closing the authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthStatus {
    pub result: AuthStatusResult,
}

impl Message for AuthStatus {
    const TAG: TypeTag = TypeTag::AuthStatus;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut e = encoder(buf);
        e.map(1).map_err(encode_err)?;
        e.u8(0).map_err(encode_err)?;
        e.u8(self.result as u8).map_err(encode_err)?;
        Ok(())
    }

    fn decode_body(buf: &[u8]) -> Result<(Self, usize), Error> {
        let mut d = Decoder::new(buf);
        let len = d.map().map_err(decode_err)?;
        if len != Some(1) {
            return Err(Error::CborParsing(format!(
                "auth-status expects 1 field, got {len:?}"
            )));
        }
        let key = d.u8().map_err(decode_err)?;
        if key != 0 {
            return Err(Error::CborParsing(format!(
                "unexpected auth-status key {key}"
            )));
        }
        let result = AuthStatusResult::from_u8(d.u8().map_err(decode_err)?)?;
        Ok((Self { result }, d.position()))
    }
}
