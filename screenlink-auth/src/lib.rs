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

//! SPAKE2-style mutual authentication between agents.
//!
//! Two roles share one protocol: the **presenter** ([`AuthenticationAlice`])
//! creates a PSK and shows it to its user; the **consumer**
//! ([`AuthenticationBob`]) prompts its user to type that PSK in and
//! verifies the proof. Both subscribe to the three authentication message
//! types on the demuxer and speak through protocol connections handed to
//! them by the endpoint.
//!
//! The exchange binds each side's certificate fingerprint (as the ECDH
//! scalar source) to the human-verified password: the shared key is
//! `SHA-512(ECDH(x, g^y) ‖ password)` and the consumer checks the
//! presenter's confirmation against its own derivation in constant time.
//!
//! Exactly one of `on_authentication_succeed` / `on_authentication_failed`
//! fires per session.

pub mod crypto;

mod alice;
mod base;
mod bob;

pub use alice::AuthenticationAlice;
pub use base::AuthenticationDelegate;
pub use bob::AuthenticationBob;
