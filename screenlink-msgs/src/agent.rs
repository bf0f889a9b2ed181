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

//! Agent information exchange messages.
//!
//! ```text
//! agent-info-request  = { 0: request-id }
//! agent-info-response = { 0: request-id, 1: agent-info }
//! agent-info = { 0: text, 1: text, 2: [* uint] }
//! ```

use minicbor::Decoder;
use screenlink_common::Error;

use crate::{decode_err, encode_err, encoder, Message, TypeTag};

/// Description an agent shares about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentInfo {
    pub display_name: String,
    pub model_name: String,
    pub capabilities: Vec<u64>,
}

/// Asks the peer for its [`AgentInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentInfoRequest {
    pub request_id: u64,
}

impl Message for AgentInfoRequest {
    const TAG: TypeTag = TypeTag::AgentInfoRequest;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut e = encoder(buf);
        e.map(1).map_err(encode_err)?;
        e.u8(0).map_err(encode_err)?;
        e.u64(self.request_id).map_err(encode_err)?;
        Ok(())
    }

    fn decode_body(buf: &[u8]) -> Result<(Self, usize), Error> {
        let mut d = Decoder::new(buf);
        let len = d.map().map_err(decode_err)?;
        if len != Some(1) {
            return Err(Error::CborParsing(format!(
                "agent-info-request expects 1 field, got {len:?}"
            )));
        }
        let key = d.u8().map_err(decode_err)?;
        if key != 0 {
            return Err(Error::CborParsing(format!(
                "unexpected agent-info-request key {key}"
            )));
        }
        let request_id = d.u64().map_err(decode_err)?;
        Ok((Self { request_id }, d.position()))
    }
}

/// Answers an [`AgentInfoRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfoResponse {
    pub request_id: u64,
    pub agent_info: AgentInfo,
}

impl Message for AgentInfoResponse {
    const TAG: TypeTag = TypeTag::AgentInfoResponse;

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        let mut e = encoder(buf);
        e.map(2).map_err(encode_err)?;

        e.u8(0).map_err(encode_err)?;
        e.u64(self.request_id).map_err(encode_err)?;

        e.u8(1).map_err(encode_err)?;
        e.map(3).map_err(encode_err)?;
        e.u8(0).map_err(encode_err)?;
        e.str(&self.agent_info.display_name).map_err(encode_err)?;
        e.u8(1).map_err(encode_err)?;
        e.str(&self.agent_info.model_name).map_err(encode_err)?;
        e.u8(2).map_err(encode_err)?;
        e.array(self.agent_info.capabilities.len() as u64)
            .map_err(encode_err)?;
        for capability in &self.agent_info.capabilities {
            e.u64(*capability).map_err(encode_err)?;
        }
        Ok(())
    }

    fn decode_body(buf: &[u8]) -> Result<(Self, usize), Error> {
        let mut d = Decoder::new(buf);
        let len = d.map().map_err(decode_err)?;
        if len != Some(2) {
            return Err(Error::CborParsing(format!(
                "agent-info-response expects 2 fields, got {len:?}"
            )));
        }

        let mut request_id = None;
        let mut agent_info = None;
        for _ in 0..2 {
            match d.u8().map_err(decode_err)? {
                0 => request_id = Some(d.u64().map_err(decode_err)?),
                1 => agent_info = Some(decode_agent_info(&mut d)?),
                other => {
                    return Err(Error::CborParsing(format!(
                        "unexpected agent-info-response key {other}"
                    )))
                }
            }
        }

        let message = Self {
            request_id: request_id
                .ok_or_else(|| Error::CborParsing("missing request-id".into()))?,
            agent_info: agent_info
                .ok_or_else(|| Error::CborParsing("missing agent-info".into()))?,
        };
        Ok((message, d.position()))
    }
}

fn decode_agent_info(d: &mut Decoder<'_>) -> Result<AgentInfo, Error> {
    let len = d.map().map_err(decode_err)?;
    if len != Some(3) {
        return Err(Error::CborParsing(format!(
            "agent-info expects 3 fields, got {len:?}"
        )));
    }

    let mut display_name = None;
    let mut model_name = None;
    let mut capabilities = None;
    for _ in 0..3 {
        match d.u8().map_err(decode_err)? {
            0 => display_name = Some(d.str().map_err(decode_err)?.to_owned()),
            1 => model_name = Some(d.str().map_err(decode_err)?.to_owned()),
            2 => {
                let count = d
                    .array()
                    .map_err(decode_err)?
                    .ok_or_else(|| Error::CborParsing("indefinite capability list".into()))?;
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    values.push(d.u64().map_err(decode_err)?);
                }
                capabilities = Some(values);
            }
            other => {
                return Err(Error::CborParsing(format!(
                    "unexpected agent-info key {other}"
                )))
            }
        }
    }

    Ok(AgentInfo {
        display_name: display_name
            .ok_or_else(|| Error::CborParsing("missing display-name".into()))?,
        model_name: model_name.ok_or_else(|| Error::CborParsing("missing model-name".into()))?,
        capabilities: capabilities
            .ok_or_else(|| Error::CborParsing("missing capabilities".into()))?,
    })
}
