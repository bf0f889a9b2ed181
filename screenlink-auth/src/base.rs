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

//! State shared by both authentication roles.

use std::cell::RefCell;
use std::rc::Rc;

use screenlink_common::{AgentFingerprint, Error, InstanceId};
use screenlink_demux::{MessageCallback, MessageDemuxer, MessageWatch};
use screenlink_msgs::{Message, TypeTag};
use screenlink_quic::QuicProtocolConnection;
use tracing::{debug, error, info};

use crate::crypto::SHARED_KEY_LEN;

/// Receives the authentication outcome. Exactly one of the two methods
/// fires per session, exactly once.
pub trait AuthenticationDelegate {
    fn on_authentication_succeed(&mut self, instance_id: InstanceId);
    fn on_authentication_failed(&mut self, instance_id: InstanceId, error: &Error);
}

/// Progress of one authentication session. `Completed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthState {
    Idle,
    HandshakeSent,
    HandshakeReceived,
    ConfirmationSent,
    ConfirmationReceived,
    Completed { success: bool },
}

/// Connections, credentials and the derived key for one session.
/// Destroyed with the session on success, failure or endpoint shutdown.
pub(crate) struct AuthenticationData {
    pub(crate) sender: Option<QuicProtocolConnection>,
    pub(crate) receiver: Option<QuicProtocolConnection>,
    pub(crate) auth_token: String,
    pub(crate) password: String,
    pub(crate) shared_key: [u8; SHARED_KEY_LEN],
}

/// Common machinery for the presenter and consumer roles: the demuxer
/// watches for the three auth message types, the session data, and the
/// exactly-once completion bookkeeping.
pub(crate) struct AuthenticationBase {
    pub(crate) instance_id: InstanceId,
    pub(crate) fingerprint: AgentFingerprint,
    pub(crate) auth_data: AuthenticationData,
    pub(crate) state: AuthState,
    delegate: Rc<RefCell<dyn AuthenticationDelegate>>,
    pub(crate) watches: Vec<MessageWatch>,
}

/// Subscribes `callback` to the three authentication message types.
///
/// Stand-alone so callers can register while the role object is *not*
/// borrowed: registration replays buffered frames, which may dispatch
/// straight back into the callback.
pub(crate) fn watch_auth_messages(
    demuxer: &MessageDemuxer,
    callback: &Rc<RefCell<dyn MessageCallback>>,
) -> Vec<MessageWatch> {
    [
        TypeTag::AuthSpake2Handshake,
        TypeTag::AuthSpake2Confirmation,
        TypeTag::AuthStatus,
    ]
    .into_iter()
    .map(|tag| demuxer.set_default_watch(tag, Rc::downgrade(callback)))
    .collect()
}

impl AuthenticationBase {
    pub(crate) fn new(
        instance_id: InstanceId,
        fingerprint: AgentFingerprint,
        delegate: Rc<RefCell<dyn AuthenticationDelegate>>,
    ) -> Self {
        Self {
            instance_id,
            fingerprint,
            auth_data: AuthenticationData {
                sender: None,
                receiver: None,
                auth_token: String::new(),
                password: String::new(),
                shared_key: [0; SHARED_KEY_LEN],
            },
            state: AuthState::Idle,
            delegate,
            watches: Vec::new(),
        }
    }

    pub(crate) fn set_sender(&mut self, sender: QuicProtocolConnection) {
        self.auth_data.sender = Some(sender);
    }

    pub(crate) fn set_receiver(&mut self, receiver: QuicProtocolConnection) {
        self.auth_data.receiver = Some(receiver);
    }

    pub(crate) fn set_auth_token(&mut self, auth_token: impl Into<String>) {
        self.auth_data.auth_token = auth_token.into();
    }

    pub(crate) fn set_password(&mut self, password: impl Into<String>) {
        self.auth_data.password = password.into();
    }

    pub(crate) fn is_completed(&self) -> bool {
        matches!(self.state, AuthState::Completed { .. })
    }

    /// Sends `message` over the sender connection. A missing sender is a
    /// session failure.
    pub(crate) fn send_message<M: Message>(&mut self, message: &M) {
        let result = match &self.auth_data.sender {
            Some(sender) => sender.write_message(message),
            None => {
                self.fail(Error::NoActiveConnection);
                return;
            }
        };
        if let Err(err) = result {
            error!(instance_id = self.instance_id, error = %err, "failed to encode auth message");
            self.fail(err);
        }
    }

    pub(crate) fn succeed(&mut self) {
        if self.is_completed() {
            return;
        }
        self.state = AuthState::Completed { success: true };
        self.release_connections();
        info!(instance_id = self.instance_id, "authentication succeeded");
        self.delegate
            .borrow_mut()
            .on_authentication_succeed(self.instance_id);
    }

    pub(crate) fn fail(&mut self, error: Error) {
        if self.is_completed() {
            return;
        }
        self.state = AuthState::Completed { success: false };
        self.release_connections();
        debug!(instance_id = self.instance_id, %error, "authentication failed");
        self.delegate
            .borrow_mut()
            .on_authentication_failed(self.instance_id, &error);
    }

    /// The session's connections do not outlive the session; any message
    /// queued before completion still flushes ahead of the write-end
    /// close.
    fn release_connections(&mut self) {
        self.auth_data.sender = None;
        self.auth_data.receiver = None;
    }
}

/// Consumes a frame without acting on it (wrong instance, or the session
/// already completed).
pub(crate) fn consume_ignored(payload: &[u8]) -> screenlink_demux::DispatchResult {
    use screenlink_demux::DispatchResult;
    match screenlink_msgs::skip_item(payload) {
        Ok(consumed) => DispatchResult::Consumed(consumed),
        Err(Error::CborIncompleteMessage) => DispatchResult::Incomplete,
        Err(err) => DispatchResult::Error(err),
    }
}
