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

//! Routes inbound typed CBOR frames to per-type watchers.
//!
//! The demuxer keeps one byte accumulator per (instance, protocol
//! connection). Each frame is a one-byte type tag followed by a single CBOR
//! item; a frame's boundary is wherever a watcher (or the resync skip)
//! says the item ends. Bytes for a tag nobody watches yet stay buffered and
//! are replayed when a watch for that tag is registered.
//!
//! The demuxer never tears a stream down itself. Parse failures are
//! reported to the caller of [`MessageDemuxer::on_stream_data`], which
//! decides whether the stream should be reset.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bytes::{Buf, BytesMut};
use screenlink_common::{Error, InstanceId, ProtocolConnectionId};
use screenlink_msgs::TypeTag;
use tracing::{debug, trace, warn};

/// What a watcher did with a dispatched frame.
#[derive(Debug)]
pub enum DispatchResult {
    /// The watcher decoded the message; carries the number of body bytes
    /// consumed (not counting the tag byte).
    Consumed(usize),
    /// The body is not complete yet; leave the bytes buffered.
    Incomplete,
    /// The body is malformed for this tag. The demuxer discards the frame
    /// by skipping one CBOR item.
    Error(Error),
}

/// Receives frames for the message types it was registered for.
pub trait MessageCallback {
    fn on_stream_message(
        &mut self,
        instance_id: InstanceId,
        connection_id: ProtocolConnectionId,
        tag: TypeTag,
        payload: &[u8],
    ) -> DispatchResult;
}

/// Strong handle to a watcher callback, owned by the subscriber.
pub type SharedCallback = Rc<RefCell<dyn MessageCallback>>;

/// What the demuxer retains: watchers are owned by their subscribers, the
/// demuxer only observes them.
pub type WeakCallback = Weak<RefCell<dyn MessageCallback>>;

struct WatchEntry {
    id: u64,
    callback: WeakCallback,
}

#[derive(Default)]
struct StreamBuffer {
    data: BytesMut,
}

#[derive(Default)]
struct Inner {
    next_watch_id: u64,
    watches: HashMap<TypeTag, Vec<WatchEntry>>,
    streams: HashMap<(InstanceId, ProtocolConnectionId), StreamBuffer>,
}

impl Inner {
    fn is_registered(&self, tag: TypeTag, id: u64) -> bool {
        self.watches
            .get(&tag)
            .is_some_and(|entries| entries.iter().any(|entry| entry.id == id))
    }
}

/// Scoped subscription to one message type. Dropping the handle revokes
/// the watch; a watcher revoked mid-dispatch receives no further frames
/// from the buffer being processed.
pub struct MessageWatch {
    inner: Weak<RefCell<Inner>>,
    tag: TypeTag,
    id: u64,
}

impl MessageWatch {
    pub fn tag(&self) -> TypeTag {
        self.tag
    }
}

impl Drop for MessageWatch {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.borrow_mut();
            if let Some(entries) = inner.watches.get_mut(&self.tag) {
                entries.retain(|entry| entry.id != self.id);
                if entries.is_empty() {
                    inner.watches.remove(&self.tag);
                }
            }
        }
    }
}

/// The demuxer. Cheap to clone; clones share the same watcher table and
/// stream accumulators.
#[derive(Clone, Default)]
pub struct MessageDemuxer {
    inner: Rc<RefCell<Inner>>,
}

impl MessageDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a process-wide watcher for `tag`. Watchers for the same
    /// tag are dispatched in registration order; the first one to consume
    /// a frame finalizes it.
    ///
    /// The demuxer holds the callback weakly: the subscriber owns it and
    /// its lifetime bounds the subscription together with the returned
    /// watch handle. Bytes already buffered for `tag` are replayed
    /// immediately.
    pub fn set_default_watch(&self, tag: TypeTag, callback: WeakCallback) -> MessageWatch {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_watch_id;
            inner.next_watch_id += 1;
            inner
                .watches
                .entry(tag)
                .or_default()
                .push(WatchEntry { id, callback });
            id
        };
        trace!(?tag, watch_id = id, "registered message watch");

        // Streams may hold frames that arrived before anyone watched this
        // tag; give the new watcher a chance at them.
        let keys: Vec<_> = self.inner.borrow().streams.keys().copied().collect();
        for (instance_id, connection_id) in keys {
            if let Err(error) = self.process_stream(instance_id, connection_id) {
                debug!(instance_id, connection_id, %error, "replay after watch registration failed");
            }
        }

        MessageWatch {
            inner: Rc::downgrade(&self.inner),
            tag,
            id,
        }
    }

    /// Appends `bytes` to the accumulator for (`instance_id`,
    /// `connection_id`) and dispatches as many complete frames as
    /// possible. An empty `bytes` is the EOF sentinel: the accumulator and
    /// any pending soft-failure state are discarded.
    ///
    /// Returns the first parse error encountered, after the buffer has
    /// been advanced past the offending frame where possible. The caller
    /// owns the close-the-stream decision.
    pub fn on_stream_data(
        &self,
        instance_id: InstanceId,
        connection_id: ProtocolConnectionId,
        bytes: &[u8],
    ) -> Result<(), Error> {
        if bytes.is_empty() {
            let removed = self
                .inner
                .borrow_mut()
                .streams
                .remove(&(instance_id, connection_id));
            if let Some(buffer) = removed {
                if !buffer.data.is_empty() {
                    warn!(
                        instance_id,
                        connection_id,
                        leftover = buffer.data.len(),
                        "stream ended with undecoded bytes"
                    );
                }
            }
            return Ok(());
        }

        self.inner
            .borrow_mut()
            .streams
            .entry((instance_id, connection_id))
            .or_default()
            .data
            .extend_from_slice(bytes);

        self.process_stream(instance_id, connection_id)
    }

    /// True if any watcher is registered for `tag`.
    pub fn has_watch(&self, tag: TypeTag) -> bool {
        self.inner.borrow().watches.contains_key(&tag)
    }

    fn process_stream(
        &self,
        instance_id: InstanceId,
        connection_id: ProtocolConnectionId,
    ) -> Result<(), Error> {
        let key = (instance_id, connection_id);
        let mut first_error: Option<Error> = None;

        'frames: loop {
            // Snapshot the front of the buffer without holding the borrow
            // across watcher callbacks.
            let (tag_byte, payload) = {
                let inner = self.inner.borrow();
                let Some(buffer) = inner.streams.get(&key) else {
                    break;
                };
                if buffer.data.is_empty() {
                    break;
                }
                (buffer.data[0], buffer.data.clone().freeze().slice(1..))
            };

            let Some(tag) = TypeTag::from_u8(tag_byte) else {
                warn!(
                    instance_id,
                    connection_id, tag_byte, "unknown message type tag"
                );
                first_error.get_or_insert(Error::CborParsing(format!(
                    "unknown message type tag {tag_byte}"
                )));
                match screenlink_msgs::skip_item(&payload) {
                    Ok(skipped) => {
                        self.advance(key, 1 + skipped);
                        continue;
                    }
                    // Cannot find the frame boundary yet; retry when more
                    // bytes arrive.
                    Err(_) => break,
                }
            };

            let entries: Vec<(u64, SharedCallback)> = {
                let inner = self.inner.borrow();
                match inner.watches.get(&tag) {
                    // Nobody watches this tag yet; keep the bytes until a
                    // watch is registered.
                    None => break,
                    Some(entries) => entries
                        .iter()
                        .filter_map(|entry| {
                            entry.callback.upgrade().map(|callback| (entry.id, callback))
                        })
                        .collect(),
                }
            };

            for (watch_id, callback) in entries {
                if !self.inner.borrow().is_registered(tag, watch_id) {
                    continue;
                }
                let result = callback.borrow_mut().on_stream_message(
                    instance_id,
                    connection_id,
                    tag,
                    &payload,
                );
                match result {
                    DispatchResult::Consumed(consumed) => {
                        trace!(instance_id, connection_id, ?tag, consumed, "frame dispatched");
                        self.advance(key, 1 + consumed);
                        continue 'frames;
                    }
                    DispatchResult::Incomplete => {
                        trace!(instance_id, connection_id, ?tag, "frame incomplete, buffering");
                        break 'frames;
                    }
                    DispatchResult::Error(error) => {
                        debug!(instance_id, connection_id, ?tag, %error, "watcher rejected frame");
                        first_error.get_or_insert(error);
                        match screenlink_msgs::skip_item(&payload) {
                            Ok(skipped) => {
                                self.advance(key, 1 + skipped);
                                continue 'frames;
                            }
                            Err(_) => break 'frames,
                        }
                    }
                }
            }

            // Watchers exist but none consumed the frame (all deregistered
            // mid-dispatch); leave the buffer for the next registration.
            break;
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn advance(&self, key: (InstanceId, ProtocolConnectionId), count: usize) {
        let mut inner = self.inner.borrow_mut();
        if let Some(buffer) = inner.streams.get_mut(&key) {
            buffer.data.advance(count.min(buffer.data.len()));
        }
    }
}
