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

//! Demuxer behavior: framing, buffering, watch lifecycle, error resync.

use std::cell::RefCell;
use std::rc::Rc;

use screenlink_common::{Error, InstanceId, ProtocolConnectionId};
use screenlink_demux::{DispatchResult, MessageCallback, MessageDemuxer, MessageWatch};
use screenlink_msgs::{
    encode_frame, AgentInfoRequest, AuthStatus, AuthStatusResult, Message, TypeTag,
};

/// Adapter so tests can express watchers as closures.
struct FnCallback<F>(F);

impl<F> MessageCallback for FnCallback<F>
where
    F: FnMut(InstanceId, ProtocolConnectionId, TypeTag, &[u8]) -> DispatchResult,
{
    fn on_stream_message(
        &mut self,
        instance_id: InstanceId,
        connection_id: ProtocolConnectionId,
        tag: TypeTag,
        payload: &[u8],
    ) -> DispatchResult {
        (self.0)(instance_id, connection_id, tag, payload)
    }
}

/// Keeps the callback (owned by the subscriber) and the watch handle
/// together; dropping it ends the subscription.
struct Watch {
    _callback: Rc<RefCell<dyn MessageCallback>>,
    _watch: MessageWatch,
}

fn watch<F>(demuxer: &MessageDemuxer, tag: TypeTag, f: F) -> Watch
where
    F: FnMut(InstanceId, ProtocolConnectionId, TypeTag, &[u8]) -> DispatchResult + 'static,
{
    let callback: Rc<RefCell<dyn MessageCallback>> = Rc::new(RefCell::new(FnCallback(f)));
    let handle = demuxer.set_default_watch(tag, Rc::downgrade(&callback));
    Watch {
        _callback: callback,
        _watch: handle,
    }
}

fn request_frame(request_id: u64) -> Vec<u8> {
    encode_frame(&AgentInfoRequest { request_id }).unwrap()
}

fn decode_request(payload: &[u8]) -> DispatchResult {
    match AgentInfoRequest::decode_body(payload) {
        Ok((_, consumed)) => DispatchResult::Consumed(consumed),
        Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
        Err(error) => DispatchResult::Error(error),
    }
}

#[test]
fn consecutive_frames_dispatch_in_order() {
    let demuxer = MessageDemuxer::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_watch = Rc::clone(&seen);
    let _watch = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        match AgentInfoRequest::decode_body(payload) {
            Ok((message, consumed)) => {
                seen_in_watch.borrow_mut().push(message.request_id);
                DispatchResult::Consumed(consumed)
            }
            Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
            Err(error) => DispatchResult::Error(error),
        }
    });

    let mut wire = request_frame(1);
    wire.extend_from_slice(&request_frame(2));
    wire.extend_from_slice(&request_frame(3));
    demuxer.on_stream_data(7, 4, &wire).unwrap();

    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}

#[test]
fn partial_frames_wait_for_more_bytes() {
    let demuxer = MessageDemuxer::new();
    let count = Rc::new(RefCell::new(0usize));
    let count_in_watch = Rc::clone(&count);
    let _watch = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        match decode_request(payload) {
            DispatchResult::Consumed(n) => {
                *count_in_watch.borrow_mut() += 1;
                DispatchResult::Consumed(n)
            }
            other => other,
        }
    });

    let wire = request_frame(9);
    let (head, tail) = wire.split_at(2);
    demuxer.on_stream_data(1, 0, head).unwrap();
    assert_eq!(*count.borrow(), 0);
    demuxer.on_stream_data(1, 0, tail).unwrap();
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn buffered_frames_replay_when_watch_registers() {
    let demuxer = MessageDemuxer::new();

    // Nobody watches yet: the frame stays buffered.
    demuxer.on_stream_data(1, 0, &request_frame(5)).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_watch = Rc::clone(&seen);
    let _watch = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        if let Ok((message, consumed)) = AgentInfoRequest::decode_body(payload) {
            seen_in_watch.borrow_mut().push(message.request_id);
            DispatchResult::Consumed(consumed)
        } else {
            DispatchResult::Incomplete
        }
    });

    assert_eq!(*seen.borrow(), vec![5]);
}

#[test]
fn unknown_tag_reports_error_and_resyncs() {
    let demuxer = MessageDemuxer::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_watch = Rc::clone(&seen);
    let _watch = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        if let Ok((message, consumed)) = AgentInfoRequest::decode_body(payload) {
            seen_in_watch.borrow_mut().push(message.request_id);
            DispatchResult::Consumed(consumed)
        } else {
            DispatchResult::Incomplete
        }
    });

    // Tag 0xEE is outside the closed enumeration. Give it a valid CBOR body
    // so the demuxer can skip past it.
    let mut wire = vec![0xEE];
    wire.extend_from_slice(&request_frame(1)[1..]);
    wire.extend_from_slice(&request_frame(2));

    let result = demuxer.on_stream_data(3, 3, &wire);
    assert!(matches!(result, Err(Error::CborParsing(_))));
    // The good frame after the junk was still delivered.
    assert_eq!(*seen.borrow(), vec![2]);
}

#[test]
fn watcher_error_discards_only_the_offending_frame() {
    let demuxer = MessageDemuxer::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_watch = Rc::clone(&seen);
    let _watch = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        match AgentInfoRequest::decode_body(payload) {
            Ok((message, _)) if message.request_id == 13 => {
                DispatchResult::Error(Error::CborParsing("unlucky".into()))
            }
            Ok((message, consumed)) => {
                seen_in_watch.borrow_mut().push(message.request_id);
                DispatchResult::Consumed(consumed)
            }
            Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
            Err(error) => DispatchResult::Error(error),
        }
    });

    let mut wire = request_frame(13);
    wire.extend_from_slice(&request_frame(14));
    let result = demuxer.on_stream_data(1, 1, &wire);
    assert!(matches!(result, Err(Error::CborParsing(_))));
    assert_eq!(*seen.borrow(), vec![14]);
}

#[test]
fn watch_dropped_during_dispatch_gets_no_further_frames() {
    let demuxer = MessageDemuxer::new();
    let first_calls = Rc::new(RefCell::new(0usize));
    let watch_slot: Rc<RefCell<Option<Watch>>> = Rc::new(RefCell::new(None));

    let calls_in_watch = Rc::clone(&first_calls);
    let slot_in_watch = Rc::clone(&watch_slot);
    let first = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        *calls_in_watch.borrow_mut() += 1;
        // Deregister ourselves from inside our own callback.
        slot_in_watch.borrow_mut().take();
        decode_request(payload)
    });
    *watch_slot.borrow_mut() = Some(first);

    let second_seen = Rc::new(RefCell::new(Vec::new()));
    let second_in_watch = Rc::clone(&second_seen);
    let _second = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        if let Ok((message, consumed)) = AgentInfoRequest::decode_body(payload) {
            second_in_watch.borrow_mut().push(message.request_id);
            DispatchResult::Consumed(consumed)
        } else {
            DispatchResult::Incomplete
        }
    });

    let mut wire = request_frame(1);
    wire.extend_from_slice(&request_frame(2));
    demuxer.on_stream_data(1, 1, &wire).unwrap();

    // The first watcher consumed frame 1 and removed itself; frame 2 went
    // to the second watcher only.
    assert_eq!(*first_calls.borrow(), 1);
    assert_eq!(*second_seen.borrow(), vec![2]);
}

#[test]
fn eof_clears_the_accumulator() {
    let demuxer = MessageDemuxer::new();
    let calls = Rc::new(RefCell::new(0usize));
    let calls_in_watch = Rc::clone(&calls);
    let _watch = watch(&demuxer, TypeTag::AgentInfoRequest, move |_, _, _, payload| {
        *calls_in_watch.borrow_mut() += 1;
        decode_request(payload)
    });

    // Half a frame, then EOF: the leftovers must not fire later.
    let wire = request_frame(5);
    demuxer.on_stream_data(1, 1, &wire[..2]).unwrap();
    demuxer.on_stream_data(1, 1, &[]).unwrap();

    // The tail arriving after EOF no longer lines up with a tag byte; it
    // reads as junk, not as the completion of the flushed prefix.
    assert!(demuxer.on_stream_data(1, 1, &wire[2..]).is_err());
    assert_eq!(*calls.borrow(), 0);
}

#[test]
fn streams_are_independent() {
    let demuxer = MessageDemuxer::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_watch = Rc::clone(&seen);
    let _watch = watch(&demuxer, TypeTag::AuthStatus, move |instance, conn, _, payload| {
        match AuthStatus::decode_body(payload) {
            Ok((message, consumed)) => {
                seen_in_watch.borrow_mut().push((instance, conn, message.result));
                DispatchResult::Consumed(consumed)
            }
            Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
            Err(error) => DispatchResult::Error(error),
        }
    });

    let frame = encode_frame(&AuthStatus {
        result: AuthStatusResult::Authenticated,
    })
    .unwrap();

    // Interleave a split frame on stream (1, 0) with a whole frame on
    // (2, 0); each accumulator advances on its own.
    demuxer.on_stream_data(1, 0, &frame[..1]).unwrap();
    demuxer.on_stream_data(2, 0, &frame).unwrap();
    demuxer.on_stream_data(1, 0, &frame[1..]).unwrap();

    assert_eq!(
        *seen.borrow(),
        vec![
            (2, 0, AuthStatusResult::Authenticated),
            (1, 0, AuthStatusResult::Authenticated),
        ]
    );
}
