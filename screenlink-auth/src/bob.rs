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

//! The PSK consumer side of the exchange.

use std::cell::RefCell;
use std::rc::Rc;

use screenlink_common::{AgentFingerprint, Error, InstanceId, ProtocolConnectionId};
use screenlink_demux::{DispatchResult, MessageCallback, MessageDemuxer};
use screenlink_msgs::{
    AuthInitiationToken, AuthSpake2Confirmation, AuthSpake2Handshake, AuthSpake2PskStatus,
    AuthStatus, AuthStatusResult, Message, TypeTag,
};
use screenlink_quic::QuicProtocolConnection;
use tracing::warn;

use crate::base::{consume_ignored, AuthState, AuthenticationBase, AuthenticationDelegate};
use crate::crypto::{
    compute_public_value, compute_shared_key, derive_private_key, shared_keys_equal,
};

/// The consumer prompts its user to enter the PSK the presenter shows,
/// then proves knowledge of it.
pub struct AuthenticationBob {
    base: AuthenticationBase,
}

impl AuthenticationBob {
    /// Creates the consumer session and subscribes it to the three
    /// authentication message types. The token and password arrive later,
    /// once discovery and the user have provided them.
    pub fn new(
        instance_id: InstanceId,
        fingerprint: AgentFingerprint,
        demuxer: &MessageDemuxer,
        delegate: Rc<RefCell<dyn AuthenticationDelegate>>,
    ) -> Rc<RefCell<Self>> {
        let bob = Rc::new(RefCell::new(Self {
            base: AuthenticationBase::new(instance_id, fingerprint, delegate),
        }));
        // Registration may replay buffered frames into the callback, so
        // `bob` must not be borrowed while the watches are created.
        let callback: Rc<RefCell<dyn MessageCallback>> = bob.clone();
        let watches = crate::base::watch_auth_messages(demuxer, &callback);
        bob.borrow_mut().base.watches = watches;
        bob
    }

    pub fn set_sender(&mut self, sender: QuicProtocolConnection) {
        self.base.set_sender(sender);
    }

    pub fn set_receiver(&mut self, receiver: QuicProtocolConnection) {
        self.base.set_receiver(receiver);
    }

    pub fn set_authentication_token(&mut self, auth_token: &str) {
        self.base.set_auth_token(auth_token);
    }

    pub fn set_password(&mut self, password: &str) {
        self.base.set_password(password);
    }

    /// Starts the exchange from the consumer side by asking the presenter
    /// to show the PSK.
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

        let message = AuthSpake2Handshake {
            initiation_token: AuthInitiationToken::new(self.base.auth_data.auth_token.clone()),
            psk_status: AuthSpake2PskStatus::NeedsPresentation,
            public_value: compute_public_value(&private_key),
        };
        self.base.send_message(&message);
        if !self.base.is_completed() {
            self.base.state = AuthState::HandshakeSent;
        }
    }

    fn on_handshake(&mut self, handshake: AuthSpake2Handshake) {
        let token = &handshake.initiation_token;
        if !token.has_token || token.token != self.base.auth_data.auth_token {
            self.base.fail(Error::InvalidAnswer(
                "initiation token mismatch".into(),
            ));
            return;
        }

        match handshake.psk_status {
            AuthSpake2PskStatus::Shown => {
                let private_key = match derive_private_key(&self.base.fingerprint) {
                    Ok(key) => key,
                    Err(err) => return self.base.fail(err),
                };
                // The shared key is kept for verifying the presenter's
                // confirmation later.
                let shared_key = match compute_shared_key(
                    &private_key,
                    &handshake.public_value,
                    &self.base.auth_data.password,
                ) {
                    Ok(key) => key,
                    Err(err) => return self.base.fail(err),
                };
                self.base.auth_data.shared_key = shared_key;

                let reply = AuthSpake2Handshake {
                    initiation_token: AuthInitiationToken::new(handshake.initiation_token.token),
                    psk_status: AuthSpake2PskStatus::Input,
                    public_value: compute_public_value(&private_key),
                };
                self.base.send_message(&reply);
                if !self.base.is_completed() {
                    self.base.state = AuthState::HandshakeReceived;
                }
            }
            AuthSpake2PskStatus::Input => {
                let private_key = match derive_private_key(&self.base.fingerprint) {
                    Ok(key) => key,
                    Err(err) => return self.base.fail(err),
                };
                let confirmation_value = match compute_shared_key(
                    &private_key,
                    &handshake.public_value,
                    &self.base.auth_data.password,
                ) {
                    Ok(key) => key,
                    Err(err) => return self.base.fail(err),
                };
                self.base
                    .send_message(&AuthSpake2Confirmation { confirmation_value });
                if !self.base.is_completed() {
                    self.base.state = AuthState::ConfirmationSent;
                }
            }
            AuthSpake2PskStatus::NeedsPresentation => {
                self.base.fail(Error::InvalidAnswer(
                    "receive wrong PSK status".into(),
                ));
            }
        }
    }

    fn on_confirmation(&mut self, confirmation: AuthSpake2Confirmation) {
        self.base.state = AuthState::ConfirmationReceived;
        if shared_keys_equal(
            &self.base.auth_data.shared_key,
            &confirmation.confirmation_value,
        ) {
            self.base.send_message(&AuthStatus {
                result: AuthStatusResult::Authenticated,
            });
            self.base.succeed();
        } else {
            self.base.send_message(&AuthStatus {
                result: AuthStatusResult::ProofInvalid,
            });
            self.base
                .fail(Error::InvalidAnswer("shared key mismatch".into()));
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

impl MessageCallback for AuthenticationBob {
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
                    Ok((confirmation, consumed)) => {
                        self.on_confirmation(confirmation);
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
