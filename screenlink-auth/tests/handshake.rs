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

//! End-to-end presenter/consumer exchanges over in-memory streams.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use screenlink_auth::{AuthenticationAlice, AuthenticationBob, AuthenticationDelegate};
use screenlink_common::{Error, InstanceId};
use screenlink_demux::MessageDemuxer;
use screenlink_msgs::{
    encode_frame, AuthInitiationToken, AuthSpake2Handshake, AuthSpake2PskStatus, AuthStatus,
    AuthStatusResult,
};
use screenlink_quic::{QuicProtocolConnection, QuicStreamHandle, StreamCmd, StreamManager};
use tokio::sync::mpsc;

const PEER_INSTANCE_ID: InstanceId = 1;

fn fingerprint(byte: u8) -> String {
    BASE64_STANDARD.encode([byte; 32])
}

#[derive(Default)]
struct RecordingDelegate {
    succeeded: Vec<InstanceId>,
    failed: Vec<(InstanceId, String)>,
}

impl AuthenticationDelegate for RecordingDelegate {
    fn on_authentication_succeed(&mut self, instance_id: InstanceId) {
        self.succeeded.push(instance_id);
    }

    fn on_authentication_failed(&mut self, instance_id: InstanceId, error: &Error) {
        self.failed.push((instance_id, error.to_string()));
    }
}

/// One side's plumbing: a demuxer for inbound frames, the receive end of
/// the channel its auth session writes outbound frames into, and the
/// stream manager owning the session's stream pair.
struct Wire {
    demuxer: MessageDemuxer,
    outbound: mpsc::UnboundedReceiver<StreamCmd>,
    _manager: Rc<RefCell<StreamManager>>,
}

fn make_wire(stream_id: u64) -> (Wire, QuicProtocolConnection) {
    let demuxer = MessageDemuxer::new();
    let manager = Rc::new(RefCell::new(StreamManager::new("peer")));
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = QuicStreamHandle::new(stream_id, tx);
    let pc = QuicProtocolConnection::with_stream(
        &manager,
        handle,
        PEER_INSTANCE_ID,
        Rc::new(Cell::new(true)),
    );
    (
        Wire {
            demuxer,
            outbound: rx,
            _manager: manager,
        },
        pc,
    )
}

/// Moves every frame one side wrote into the other side's demuxer.
/// Returns true when any frame moved.
fn deliver(from: &mut Wire, to: &Wire) -> bool {
    let mut any = false;
    while let Ok(cmd) = from.outbound.try_recv() {
        if let StreamCmd::Write(bytes) = cmd {
            let _ = to.demuxer.on_stream_data(PEER_INSTANCE_ID, 0, &bytes);
            any = true;
        }
    }
    any
}

fn pump(alice_wire: &mut Wire, bob_wire: &mut Wire) {
    loop {
        let a = deliver(alice_wire, bob_wire);
        let b = deliver(bob_wire, alice_wire);
        if !a && !b {
            break;
        }
    }
}

struct Exchange {
    alice_wire: Wire,
    bob_wire: Wire,
    alice: Rc<RefCell<AuthenticationAlice>>,
    bob: Rc<RefCell<AuthenticationBob>>,
    alice_delegate: Rc<RefCell<RecordingDelegate>>,
    bob_delegate: Rc<RefCell<RecordingDelegate>>,
}

fn set_up(token: &str, alice_password: &str, bob_token: &str, bob_password: &str) -> Exchange {
    let (alice_wire, alice_pc) = make_wire(0);
    let (bob_wire, bob_pc) = make_wire(1);

    let alice_delegate = Rc::new(RefCell::new(RecordingDelegate::default()));
    let bob_delegate = Rc::new(RefCell::new(RecordingDelegate::default()));

    let alice = AuthenticationAlice::new(
        PEER_INSTANCE_ID,
        fingerprint(7),
        token,
        alice_password,
        &alice_wire.demuxer,
        alice_delegate.clone(),
    );
    alice.borrow_mut().set_sender(alice_pc);

    let bob = AuthenticationBob::new(
        PEER_INSTANCE_ID,
        fingerprint(9),
        &bob_wire.demuxer,
        bob_delegate.clone(),
    );
    {
        let mut bob_mut = bob.borrow_mut();
        bob_mut.set_authentication_token(bob_token);
        bob_mut.set_password(bob_password);
        bob_mut.set_sender(bob_pc);
    }

    Exchange {
        alice_wire,
        bob_wire,
        alice,
        bob,
        alice_delegate,
        bob_delegate,
    }
}

#[test]
fn successful_presenter_flow() {
    let mut exchange = set_up("T", "0000", "T", "0000");

    exchange.alice.borrow_mut().start_authentication();
    pump(&mut exchange.alice_wire, &mut exchange.bob_wire);

    assert_eq!(exchange.alice_delegate.borrow().succeeded, vec![PEER_INSTANCE_ID]);
    assert_eq!(exchange.bob_delegate.borrow().succeeded, vec![PEER_INSTANCE_ID]);
    assert!(exchange.alice_delegate.borrow().failed.is_empty());
    assert!(exchange.bob_delegate.borrow().failed.is_empty());
}

#[test]
fn wrong_psk_is_proof_invalid_on_both_sides() {
    let mut exchange = set_up("T", "0000", "T", "0001");

    exchange.alice.borrow_mut().start_authentication();
    pump(&mut exchange.alice_wire, &mut exchange.bob_wire);

    let bob_events = exchange.bob_delegate.borrow();
    assert!(bob_events.succeeded.is_empty());
    assert_eq!(bob_events.failed.len(), 1);
    assert!(bob_events.failed[0].1.contains("shared key mismatch"));

    let alice_events = exchange.alice_delegate.borrow();
    assert!(alice_events.succeeded.is_empty());
    assert_eq!(alice_events.failed.len(), 1);
    assert!(alice_events.failed[0].1.contains("proof-invalid"));
}

#[test]
fn initiation_token_mismatch_fails_the_consumer() {
    let mut exchange = set_up("T", "0000", "other-token", "0000");

    exchange.alice.borrow_mut().start_authentication();
    pump(&mut exchange.alice_wire, &mut exchange.bob_wire);

    let bob_events = exchange.bob_delegate.borrow();
    assert_eq!(bob_events.failed.len(), 1);
    assert!(bob_events.failed[0].1.contains("initiation token mismatch"));
    // Bob never answered, so Alice is still waiting.
    assert!(exchange.alice_delegate.borrow().succeeded.is_empty());
    assert!(exchange.alice_delegate.borrow().failed.is_empty());
}

#[test]
fn out_of_order_psk_status_is_rejected() {
    let exchange = set_up("T", "0000", "T", "0000");

    // A handshake that regresses to NeedsPresentation reaches Alice, who
    // only ever expects the consumer's Input answer.
    let out_of_order = AuthSpake2Handshake {
        initiation_token: AuthInitiationToken::new("T"),
        psk_status: AuthSpake2PskStatus::NeedsPresentation,
        public_value: vec![4u8; 65],
    };
    let frame = encode_frame(&out_of_order).unwrap();
    let _ = exchange
        .alice_wire
        .demuxer
        .on_stream_data(PEER_INSTANCE_ID, 0, &frame);

    let alice_events = exchange.alice_delegate.borrow();
    assert_eq!(alice_events.failed.len(), 1);
    assert!(alice_events.failed[0].1.contains("receive wrong PSK status"));
}

#[test]
fn missing_sender_fails_with_no_active_connection() {
    let wire = MessageDemuxer::new();
    let delegate = Rc::new(RefCell::new(RecordingDelegate::default()));
    let alice = AuthenticationAlice::new(
        PEER_INSTANCE_ID,
        fingerprint(7),
        "T",
        "0000",
        &wire,
        delegate.clone(),
    );

    alice.borrow_mut().start_authentication();

    let events = delegate.borrow();
    assert_eq!(events.failed.len(), 1);
    assert!(events.failed[0].1.contains("no active protocol connection"));
}

#[test]
fn completion_is_delivered_exactly_once() {
    let mut exchange = set_up("T", "0000", "T", "0000");

    exchange.alice.borrow_mut().start_authentication();
    pump(&mut exchange.alice_wire, &mut exchange.bob_wire);
    assert_eq!(exchange.alice_delegate.borrow().succeeded.len(), 1);

    // A stray status after completion is consumed and ignored.
    let frame = encode_frame(&AuthStatus {
        result: AuthStatusResult::ProofInvalid,
    })
    .unwrap();
    let _ = exchange
        .alice_wire
        .demuxer
        .on_stream_data(PEER_INSTANCE_ID, 0, &frame);

    assert_eq!(exchange.alice_delegate.borrow().succeeded.len(), 1);
    assert!(exchange.alice_delegate.borrow().failed.is_empty());

    // Keep the sessions alive through the whole scenario.
    drop(exchange.bob);
}
