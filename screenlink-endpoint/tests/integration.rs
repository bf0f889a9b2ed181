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

//! Whole-stack exercise: client and server endpoints over loopback QUIC,
//! SPAKE2 authentication running on top of the demuxers.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use common::{RecordingCallback, RecordingObserver};
use screenlink_auth::{AuthenticationAlice, AuthenticationBob, AuthenticationDelegate};
use screenlink_common::{Error, InstanceId, ServiceInfo};
use screenlink_demux::MessageDemuxer;
use screenlink_endpoint::{
    EndpointConfig, ProtocolConnectionEndpoint, QuicClient, QuicServer, RequestCallback,
};
use screenlink_quic::{AgentCertificate, QuinnClientFactory, QuinnServerFactory};
use tokio::task::LocalSet;

#[derive(Default)]
struct AuthRecorder {
    succeeded: Vec<InstanceId>,
    failed: Vec<(InstanceId, String)>,
}

impl AuthenticationDelegate for AuthRecorder {
    fn on_authentication_succeed(&mut self, instance_id: InstanceId) {
        self.succeeded.push(instance_id);
    }

    fn on_authentication_failed(&mut self, instance_id: InstanceId, error: &Error) {
        self.failed.push((instance_id, error.to_string()));
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    tokio::time::timeout(Duration::from_secs(15), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn agents_connect_and_authenticate_over_loopback() {
    LocalSet::new()
        .run_until(async {
            // Server side.
            let server_cert = Rc::new(AgentCertificate::generate("receiver.local").unwrap());
            let server_factory = Rc::new(QuinnServerFactory::new(Rc::clone(&server_cert)));
            let server_observer = Rc::new(RefCell::new(RecordingObserver::default()));
            let server = QuicServer::new(
                EndpointConfig {
                    connection_endpoints: vec!["127.0.0.1:0".parse().unwrap()],
                    ..EndpointConfig::default()
                },
                MessageDemuxer::new(),
                server_factory.clone(),
                server_observer.clone(),
            );
            assert!(server.start());
            let server_addr = server_factory.local_addrs()[0];

            // Client side.
            let client_cert = Rc::new(AgentCertificate::generate("controller.local").unwrap());
            let client_factory = Rc::new(QuinnClientFactory::new(Rc::clone(&client_cert)));
            let client_observer = Rc::new(RefCell::new(RecordingObserver::default()));
            let client = QuicClient::new(
                EndpointConfig::default(),
                MessageDemuxer::new(),
                client_factory,
                client_observer.clone(),
            );
            assert!(client.start());

            client.on_instance_added(ServiceInfo {
                instance_name: "receiver".into(),
                fingerprint: server_cert.fingerprint().clone(),
                auth_token: Some("T".into()),
                v4_endpoint: Some(match server_addr {
                    std::net::SocketAddr::V4(addr) => addr,
                    other => panic!("expected v4 loopback, got {other}"),
                }),
                v6_endpoint: None,
            });

            // Dial and wait for promotion on both sides.
            let connect_recorder = Rc::new(RefCell::new(RecordingCallback::default()));
            client
                .connect("receiver", connect_recorder.clone() as RequestCallback)
                .unwrap();

            wait_until("client promotion", || {
                !connect_recorder.borrow().opened.is_empty()
            })
            .await;
            let instance_id = connect_recorder.borrow().opened[0].1;
            assert_eq!(instance_id, 1);

            wait_until("server promotion", || {
                let connection = server.create_protocol_connection(1);
                connection.is_some()
            })
            .await;

            // Authentication: the client presents, the server consumes.
            let alice_events = Rc::new(RefCell::new(AuthRecorder::default()));
            let alice = AuthenticationAlice::new(
                instance_id,
                client_cert.fingerprint().clone(),
                "T",
                "0000",
                client.demuxer(),
                alice_events.clone(),
            );
            let sender = connect_recorder.borrow_mut().connections.remove(0);
            alice.borrow_mut().set_sender(sender);

            let bob_events = Rc::new(RefCell::new(AuthRecorder::default()));
            let bob = AuthenticationBob::new(
                1,
                server_cert.fingerprint().clone(),
                server.demuxer(),
                bob_events.clone(),
            );
            {
                let mut bob_mut = bob.borrow_mut();
                bob_mut.set_authentication_token("T");
                bob_mut.set_password("0000");
                let server_pc = server.create_protocol_connection(1).unwrap();
                bob_mut.set_sender(server_pc);
            }

            alice.borrow_mut().start_authentication();

            wait_until("presenter success", || {
                !alice_events.borrow().succeeded.is_empty()
            })
            .await;
            wait_until("consumer success", || {
                !bob_events.borrow().succeeded.is_empty()
            })
            .await;

            assert_eq!(alice_events.borrow().succeeded, vec![instance_id]);
            assert_eq!(bob_events.borrow().succeeded, vec![1]);
            assert!(alice_events.borrow().failed.is_empty());
            assert!(bob_events.borrow().failed.is_empty());

            // Both sides saw the peer's auth streams arrive as incoming
            // protocol connections.
            assert!(!server_observer.borrow().incoming.is_empty());
            assert!(!client_observer.borrow().incoming.is_empty());

            assert!(client.stop());
            assert!(server.stop());
        })
        .await;
}

#[tokio::test]
async fn wrong_password_fails_both_sides_over_loopback() {
    LocalSet::new()
        .run_until(async {
            let server_cert = Rc::new(AgentCertificate::generate("receiver.local").unwrap());
            let server_factory = Rc::new(QuinnServerFactory::new(Rc::clone(&server_cert)));
            let server = QuicServer::new(
                EndpointConfig {
                    connection_endpoints: vec!["127.0.0.1:0".parse().unwrap()],
                    ..EndpointConfig::default()
                },
                MessageDemuxer::new(),
                server_factory.clone(),
                Rc::new(RefCell::new(RecordingObserver::default())),
            );
            assert!(server.start());
            let server_addr = server_factory.local_addrs()[0];

            let client_cert = Rc::new(AgentCertificate::generate("controller.local").unwrap());
            let client = QuicClient::new(
                EndpointConfig::default(),
                MessageDemuxer::new(),
                Rc::new(QuinnClientFactory::new(Rc::clone(&client_cert))),
                Rc::new(RefCell::new(RecordingObserver::default())),
            );
            assert!(client.start());
            client.on_instance_added(ServiceInfo {
                instance_name: "receiver".into(),
                fingerprint: server_cert.fingerprint().clone(),
                auth_token: Some("T".into()),
                v4_endpoint: Some(match server_addr {
                    std::net::SocketAddr::V4(addr) => addr,
                    other => panic!("expected v4 loopback, got {other}"),
                }),
                v6_endpoint: None,
            });

            let connect_recorder = Rc::new(RefCell::new(RecordingCallback::default()));
            client
                .connect("receiver", connect_recorder.clone() as RequestCallback)
                .unwrap();
            wait_until("client promotion", || {
                !connect_recorder.borrow().opened.is_empty()
            })
            .await;
            wait_until("server promotion", || {
                server.create_protocol_connection(1).is_some()
            })
            .await;

            let alice_events = Rc::new(RefCell::new(AuthRecorder::default()));
            let alice = AuthenticationAlice::new(
                1,
                client_cert.fingerprint().clone(),
                "T",
                "0000",
                client.demuxer(),
                alice_events.clone(),
            );
            alice
                .borrow_mut()
                .set_sender(connect_recorder.borrow_mut().connections.remove(0));

            let bob_events = Rc::new(RefCell::new(AuthRecorder::default()));
            let bob = AuthenticationBob::new(
                1,
                server_cert.fingerprint().clone(),
                server.demuxer(),
                bob_events.clone(),
            );
            {
                let mut bob_mut = bob.borrow_mut();
                bob_mut.set_authentication_token("T");
                // The user typed the wrong digits.
                bob_mut.set_password("0001");
                let server_pc = server.create_protocol_connection(1).unwrap();
                bob_mut.set_sender(server_pc);
            }

            alice.borrow_mut().start_authentication();

            wait_until("consumer failure", || !bob_events.borrow().failed.is_empty()).await;
            wait_until("presenter failure", || {
                !alice_events.borrow().failed.is_empty()
            })
            .await;

            assert!(bob_events.borrow().failed[0].1.contains("shared key mismatch"));
            assert!(alice_events.borrow().failed[0].1.contains("proof-invalid"));
            assert!(alice_events.borrow().succeeded.is_empty());
            assert!(bob_events.borrow().succeeded.is_empty());

            assert!(client.stop());
            assert!(server.stop());
        })
        .await;
}
