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

//! Protocol connections: the write side of one stream, as handed to
//! protocol code.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use bytes::Bytes;
use screenlink_common::{Error, InstanceId, ProtocolConnectionId};
use screenlink_msgs::{encode_frame, Message};
use tracing::trace;

use crate::stream::QuicStreamHandle;
use crate::stream_manager::{StreamManager, StreamPair};

/// Observer for close events on one protocol connection. At most one
/// observer is attached at a time.
pub trait ConnectionObserver {
    fn on_connection_closed(
        &mut self,
        instance_id: InstanceId,
        protocol_connection_id: ProtocolConnectionId,
    );
}

pub(crate) struct PcInner {
    pub(crate) instance_id: InstanceId,
    pub(crate) id: ProtocolConnectionId,
    pub(crate) stream: Option<QuicStreamHandle>,
    pub(crate) observer: Option<Rc<RefCell<dyn ConnectionObserver>>>,
}

/// A typed bidirectional stream within a QUIC session.
///
/// Owns the write half; the owning [`StreamManager`] keeps a non-owning
/// back-reference. When the underlying stream closes, the back-reference
/// is severed before any observer runs, so the handle goes inert (writes
/// dropped) and may be dropped from inside callbacks without re-entering
/// the manager.
pub struct QuicProtocolConnection {
    inner: Rc<RefCell<PcInner>>,
    owner: Weak<RefCell<StreamManager>>,
    writes_enabled: Rc<Cell<bool>>,
}

impl QuicProtocolConnection {
    /// Opens a fresh outgoing stream on `session` and registers it with
    /// `owner`, mirroring how established connections vend new protocol
    /// connections.
    pub fn from_existing(
        owner: &Rc<RefCell<StreamManager>>,
        session: &dyn crate::session::QuicSession,
        instance_id: InstanceId,
        writes_enabled: Rc<Cell<bool>>,
    ) -> Self {
        let stream = session.make_outgoing_stream();
        trace!(
            instance_id,
            stream_id = stream.id(),
            "protocol connection over new outgoing stream"
        );
        Self::with_stream(owner, stream, instance_id, writes_enabled)
    }

    /// Wraps an already-open stream (used for peer-initiated streams) and
    /// registers the pair with `owner`.
    pub fn with_stream(
        owner: &Rc<RefCell<StreamManager>>,
        stream: QuicStreamHandle,
        instance_id: InstanceId,
        writes_enabled: Rc<Cell<bool>>,
    ) -> Self {
        let id = stream.id();
        let inner = Rc::new(RefCell::new(PcInner {
            instance_id,
            id,
            stream: Some(stream.clone()),
            observer: None,
        }));
        owner.borrow_mut().add_stream_pair(StreamPair {
            stream,
            protocol_connection_id: id,
            protocol_connection: Some(Rc::downgrade(&inner)),
        });
        Self {
            inner,
            owner: Rc::downgrade(owner),
            writes_enabled,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.borrow().instance_id
    }

    pub fn id(&self) -> ProtocolConnectionId {
        self.inner.borrow().id
    }

    /// Writes raw bytes. Returns `false` when the bytes were dropped
    /// (stream closed, connection gone, or the endpoint is suspended).
    pub fn write(&self, bytes: &[u8]) -> bool {
        if !self.writes_enabled.get() {
            trace!(id = self.id(), "write rejected while endpoint is suspended");
            return false;
        }
        match &self.inner.borrow().stream {
            Some(stream) => stream.write(Bytes::copy_from_slice(bytes)),
            None => false,
        }
    }

    /// Encodes `message` as a tagged frame and writes it.
    ///
    /// Encoding errors are reported; a dropped write (closed stream,
    /// suspension) is silent, matching the raw write contract.
    pub fn write_message<M: Message>(&self, message: &M) -> Result<(), Error> {
        let frame = encode_frame(message)?;
        self.write(&frame);
        Ok(())
    }

    /// Attaches or clears the close observer. Replacing one live observer
    /// with another is a caller bug.
    pub fn set_observer(&self, observer: Option<Rc<RefCell<dyn ConnectionObserver>>>) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.observer.is_none() || observer.is_none(),
            "protocol connection already has an observer"
        );
        inner.observer = observer;
    }

    pub fn close_write_end(&self) {
        if let Some(stream) = &self.inner.borrow().stream {
            stream.close_write_end();
        }
    }

    /// True once the underlying stream has gone away.
    pub fn is_inert(&self) -> bool {
        self.inner.borrow().stream.is_none()
    }
}

impl Drop for QuicProtocolConnection {
    fn drop(&mut self) {
        let (id, stream) = {
            let mut inner = self.inner.borrow_mut();
            (inner.id, inner.stream.take())
        };
        if let Some(stream) = stream {
            stream.close_write_end();
            if let Some(owner) = self.owner.upgrade() {
                owner.borrow_mut().drop_protocol_connection(id);
            }
        }
    }
}

impl std::fmt::Debug for QuicProtocolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("QuicProtocolConnection")
            .field("instance_id", &inner.instance_id)
            .field("id", &inner.id)
            .field("inert", &inner.stream.is_none())
            .finish()
    }
}
