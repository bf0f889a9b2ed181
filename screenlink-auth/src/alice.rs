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

//! The PSK presenter side of the exchange.

use std::cell::RefCell;
use std::rc::Rc;

use screenlink_common::{AgentFingerprint, Error, InstanceId, ProtocolConnectionId};
use screenlink_demux::{DispatchResult, MessageCallback, MessageDemuxer};
use screenlink_msgs::{
    AuthInitiationToken, AuthSpake2Confirmation, AuthSpake2Handshake, AuthSpake2PskStatus,
    AuthStatus, AuthStatusResult, Message, TypeTag,
};
use screenlink_quic::QuicProtocolConnection;
use tracing::{info, warn};

use crate::base::{consume_ignored, AuthState, AuthenticationBase, AuthenticationDelegate};
use crate::crypto::{compute_public_value, compute_shared_key, derive_private_key};

/// The presenter creates the PSK, shows it to the local user and
/// initiates the exchange.
pub struct AuthenticationAlice {
    base: AuthenticationBase,
}

impl AuthenticationAlice {
    /// Creates the presenter session and subscribes it to the three
    /// authentication message types.
    pub fn new(
        instance_id: InstanceId,
        fingerprint: AgentFingerprint,
        auth_token: &str,
        password: &str,
        demuxer: &MessageDemuxer,
        delegate: Rc<RefCell<dyn AuthenticationDelegate>>,
    ) -> Rc<RefCell<Self>> {
        let alice = Rc::new(RefCell::new(Self {
            base: AuthenticationBase::new(instance_id, fingerprint, delegate),
        }));
        {
            let mut this = alice.borrow_mut();
            this.base.set_auth_token(auth_token);
            this.base.set_password(password);
        }
        // Registration may replay buffered frames into the callback, so
        // `alice` must not be borrowed while the watches are created.
        let callback: Rc<RefCell<dyn MessageCallback>> = alice.clone();
        let watches = crate::base::watch_auth_messages(demuxer, &callback);
        alice.borrow_mut().base.watches = watches;
        alice
    }

    pub fn set_sender(&mut self, sender: QuicProtocolConnection) {
        self.base.set_sender(sender);
    }

    pub fn set_receiver(&mut self, receiver: QuicProtocolConnection) {
        self.base.set_receiver(receiver);
    }

    /// Starts the exchange. The PSK has been displayed to the local user
    /// by the time this runs, so the handshake is sent with status
    /// `Shown`.
    pub fn start_authentication(&mut self) {
        if self.base.auth_data.sender.is_none() {
            self.base.fail(Error::NoActiveConnection);
            return;
        }
        let private_key = match derive_private_key(&self.base.fingerprint) {
            Ok(key) => key,
            Err(err) => {
                self.base.fail(err);
                return;
            }
        };

        info!(
            instance_id = self.base.instance_id,
            "presenting PSK and initiating authentication"
        );
        let message = AuthSpake2Handshake {
            initiation_token: AuthInitiationToken::new(self.base.auth_data.auth_token.clone()),
            psk_status: AuthSpake2PskStatus::Shown,
            public_value: compute_public_value(&private_key),
        };
        self.base.send_message(&message);
        if !self.base.is_completed() {
            self.base.state = AuthState::HandshakeSent;
        }
    }

    fn on_handshake(&mut self, handshake: AuthSpake2Handshake) {
        match handshake.psk_status {
            AuthSpake2PskStatus::Input => {
                let private_key = match derive_private_key(&self.base.fingerprint) {
                    Ok(key) => key,
                    Err(err) => return self.base.fail(err),
                };
                let shared_key = match compute_shared_key(
                    &private_key,
                    &handshake.public_value,
                    &self.base.auth_data.password,
                ) {
                    Ok(key) => key,
                    Err(err) => return self.base.fail(err),
                };
                self.base.auth_data.shared_key = shared_key;
                self.base.send_message(&AuthSpake2Confirmation {
                    confirmation_value: shared_key,
                });
                if !self.base.is_completed() {
                    self.base.state = AuthState::ConfirmationSent;
                }
            }
            _ => {
                self.base.fail(Error::InvalidAnswer(
                    "receive wrong PSK status".into(),
                ));
            }
        }
    }

    fn on_status(&mut self, status: AuthStatus) {
        if status.result == AuthStatusResult::Authenticated {
            self.base.succeed();
        } else {
            self.base.fail(Error::InvalidAnswer(format!(
                "authentication failed: {}",
                status.result
            )));
        }
    }
}

impl MessageCallback for AuthenticationAlice {
    fn on_stream_message(
        &mut self,
        instance_id: InstanceId,
        _connection_id: ProtocolConnectionId,
        tag: TypeTag,
        payload: &[u8],
    ) -> DispatchResult {
        if self.base.is_completed() {
            return consume_ignored(payload);
        }
        if instance_id != self.base.instance_id {
            warn!(
                instance_id,
                expected = self.base.instance_id,
                "auth message for a different instance"
            );
            return consume_ignored(payload);
        }
        if self.base.auth_data.sender.is_none() {
            self.base.fail(Error::NoActiveConnection);
            return DispatchResult::Error(Error::NoActiveConnection);
        }

        match tag {
            TypeTag::AuthSpake2Handshake => match AuthSpake2Handshake::decode_body(payload) {
                Ok((handshake, consumed)) => {
                    self.on_handshake(handshake);
                    DispatchResult::Consumed(consumed)
                }
                Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
                Err(err) => {
                    self.base.fail(Error::CborParsing(
                        "failed to parse auth-spake2-handshake message".into(),
                    ));
                    DispatchResult::Error(err)
                }
            },
            TypeTag::AuthSpake2Confirmation => {
                match AuthSpake2Confirmation::decode_body(payload) {
                    Ok((_, consumed)) => {
                        // The presenter sends the confirmation; receiving
                        // one back is a protocol violation.
                        self.base
                            .fail(Error::InvalidAnswer("unexpected confirmation message".into()));
                        DispatchResult::Consumed(consumed)
                    }
                    Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
                    Err(err) => {
                        self.base.fail(Error::CborParsing(
                            "failed to parse auth-spake2-confirmation message".into(),
                        ));
                        DispatchResult::Error(err)
                    }
                }
            }
            TypeTag::AuthStatus => match AuthStatus::decode_body(payload) {
                Ok((status, consumed)) => {
                    self.on_status(status);
                    DispatchResult::Consumed(consumed)
                }
                Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
                Err(err) => {
                    self.base
                        .fail(Error::CborParsing("failed to parse auth-status message".into()));
                    DispatchResult::Error(err)
                }
            },
            _ => {
                self.base.fail(Error::CborParsing(
                    "receives authentication message with unprocessable type".into(),
                ));
                DispatchResult::Error(Error::CborParsing(
                    "receives authentication message with unprocessable type".into(),
                ))
            }
        }
    }
}
