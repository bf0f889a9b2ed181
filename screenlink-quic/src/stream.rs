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

//! Write-side stream handles.
//!
//! A [`QuicStreamHandle`] is the synchronous face of one QUIC stream's
//! send half. Writes are enqueued on an unbounded channel and drained by
//! a per-stream pump task, so no caller ever blocks the task runner on
//! transport back-pressure.

use std::cell::Cell;
use std::rc::Rc;

use bytes::Bytes;
use screenlink_common::StreamId;
use tokio::sync::mpsc;
use tracing::trace;

/// Commands consumed by a stream's write pump.
#[derive(Debug)]
pub enum StreamCmd {
    Write(Bytes),
    /// Close the write half cleanly (QUIC FIN).
    Finish,
}

/// Handle over the write half of a single QUIC stream.
///
/// Clones share the same underlying stream. Once the write end is closed
/// (explicitly or because the pump went away) further writes are dropped
/// silently.
#[derive(Clone)]
pub struct QuicStreamHandle {
    id: StreamId,
    tx: mpsc::UnboundedSender<StreamCmd>,
    write_closed: Rc<Cell<bool>>,
}

impl QuicStreamHandle {
    pub fn new(id: StreamId, tx: mpsc::UnboundedSender<StreamCmd>) -> Self {
        Self {
            id,
            tx,
            write_closed: Rc::new(Cell::new(false)),
        }
    }

    /// The QUIC stream id this handle writes to.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Enqueues `bytes` for transmission. Returns `false` when the bytes
    /// were dropped because the write end is closed.
    pub fn write(&self, bytes: Bytes) -> bool {
        if self.write_closed.get() {
            trace!(stream_id = self.id, "dropping write to closed stream");
            return false;
        }
        if self.tx.send(StreamCmd::Write(bytes)).is_err() {
            // The pump ended underneath us; treat the stream as closed.
            self.write_closed.set(true);
            return false;
        }
        true
    }

    /// Closes the write half. Idempotent; later writes are dropped.
    pub fn close_write_end(&self) {
        if self.write_closed.replace(true) {
            return;
        }
        let _ = self.tx.send(StreamCmd::Finish);
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed.get()
    }
}

impl std::fmt::Debug for QuicStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicStreamHandle")
            .field("id", &self.id)
            .field("write_closed", &self.write_closed.get())
            .finish()
    }
}
