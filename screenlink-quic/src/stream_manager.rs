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

//! Per-connection stream bookkeeping.
//!
//! The stream manager owns every stream pair of one QUIC connection and
//! is the only place that knows the stream-id → protocol-connection-id
//! mapping. Streams closed by the peer are retained on a closed list so
//! bytes that arrive in the same tick can still be routed; the endpoint's
//! cleanup pass finalizes them.
//!
//! Methods mutate and *return* what to notify; the caller invokes
//! observers after all borrows are released.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use screenlink_common::{InstanceId, ProtocolConnectionId, StreamId};
use tracing::{debug, trace};

use crate::protocol_connection::{ConnectionObserver, PcInner};
use crate::stream::QuicStreamHandle;

/// One stream of a connection: the write handle, its protocol connection
/// id, and a non-owning reference to the protocol connection wrapping it
/// (if one is still alive).
pub struct StreamPair {
    pub stream: QuicStreamHandle,
    pub protocol_connection_id: ProtocolConnectionId,
    pub(crate) protocol_connection: Option<Weak<RefCell<PcInner>>>,
}

/// What to deliver after a stream close was recorded.
pub struct ClosedStreamNotice {
    pub protocol_connection_id: ProtocolConnectionId,
    pub observer: Option<Rc<RefCell<dyn ConnectionObserver>>>,
}

/// Stream table for one QUIC connection.
pub struct StreamManager {
    instance_name: String,
    instance_id: InstanceId,
    streams: BTreeMap<StreamId, StreamPair>,
    closed_streams: Vec<StreamPair>,
}

impl StreamManager {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            instance_id: 0,
            streams: BTreeMap::new(),
            closed_streams: Vec::new(),
        }
    }

    /// The pre-promotion identity of the peer (discovery name, or a
    /// string derived from the remote address for inbound connections).
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Zero until the connection is promoted.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Records the id allocated at promotion.
    pub fn set_instance_id(&mut self, instance_id: InstanceId) {
        debug_assert_ne!(instance_id, 0);
        self.instance_id = instance_id;
    }

    pub fn add_stream_pair(&mut self, pair: StreamPair) {
        trace!(
            instance_id = self.instance_id,
            stream_id = pair.stream.id(),
            "stream pair added"
        );
        self.streams.insert(pair.stream.id(), pair);
    }

    /// Severs the back-reference when a protocol connection is destroyed
    /// while its stream is still open.
    pub fn drop_protocol_connection(&mut self, stream_id: StreamId) {
        if let Some(pair) = self.streams.get_mut(&stream_id) {
            pair.protocol_connection = None;
        } else if let Some(pair) = self
            .closed_streams
            .iter_mut()
            .find(|pair| pair.stream.id() == stream_id)
        {
            pair.protocol_connection = None;
        }
    }

    pub fn has_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Resolves a stream id to its protocol connection id for demuxer
    /// routing. Closed-but-retained streams still resolve so late bytes
    /// are not lost.
    pub fn protocol_connection_id(&self, stream_id: StreamId) -> Option<ProtocolConnectionId> {
        self.streams
            .get(&stream_id)
            .map(|pair| pair.protocol_connection_id)
            .or_else(|| {
                self.closed_streams
                    .iter()
                    .find(|pair| pair.stream.id() == stream_id)
                    .map(|pair| pair.protocol_connection_id)
            })
    }

    /// Records a stream close: the protocol connection (if any) goes
    /// inert first, then the pair moves to the closed list until the next
    /// cleanup pass.
    ///
    /// Returns the observer to notify, or `None` when the stream is
    /// unknown or already closed.
    pub fn on_stream_closed(&mut self, stream_id: StreamId) -> Option<ClosedStreamNotice> {
        let mut pair = self.streams.remove(&stream_id)?;
        debug!(
            instance_id = self.instance_id,
            stream_id, "stream closed, retaining until cleanup"
        );

        let mut observer = None;
        if let Some(pc) = pair.protocol_connection.as_ref().and_then(Weak::upgrade) {
            let mut pc = pc.borrow_mut();
            // Inert before anyone observes the close: a drop from inside
            // the observer callback must not call back into this manager.
            pc.stream = None;
            observer = pc.observer.clone();
        }
        pair.stream.close_write_end();

        let notice = ClosedStreamNotice {
            protocol_connection_id: pair.protocol_connection_id,
            observer,
        };
        self.closed_streams.push(pair);
        Some(notice)
    }

    /// Destroys streams that closed during previous ticks, returning
    /// their protocol connection ids so the caller can emit the final
    /// empty-view EOF for each.
    pub fn finalize_closed_streams(&mut self) -> Vec<ProtocolConnectionId> {
        self.closed_streams
            .drain(..)
            .map(|pair| pair.protocol_connection_id)
            .collect()
    }
}
