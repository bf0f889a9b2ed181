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

//! Key agreement primitives for the authentication exchange.
//!
//! Each side's private scalar is derived deterministically from its own
//! certificate fingerprint; public values travel as uncompressed P-256
//! points; the shared key is `SHA-512(ECDH x-coordinate ‖ password)`.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use screenlink_common::Error;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// Length of the derived shared key (SHA-512 output).
pub const SHARED_KEY_LEN: usize = 64;

/// Derives the local private scalar from an agent fingerprint.
///
/// The fingerprint is base64 of a SHA-256 digest, so it always decodes to
/// 32 bytes; those bytes are interpreted as a big-endian P-256 scalar.
pub fn derive_private_key(fingerprint: &str) -> Result<SecretKey, Error> {
    let bytes = BASE64_STANDARD
        .decode(fingerprint)
        .map_err(|_| Error::Certificate("fingerprint is not valid base64".into()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Certificate("fingerprint must decode to 32 bytes".into()))?;
    SecretKey::from_bytes(&bytes.into())
        .map_err(|_| Error::Certificate("fingerprint does not form a P-256 scalar".into()))
}

/// Serializes `scalar * G` as an uncompressed SEC1 point.
pub fn compute_public_value(private_key: &SecretKey) -> Vec<u8> {
    private_key
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec()
}

/// Computes the 64-byte shared key from our scalar, the peer's public
/// value and the pre-shared password.
pub fn compute_shared_key(
    private_key: &SecretKey,
    peer_public_value: &[u8],
    password: &str,
) -> Result<[u8; SHARED_KEY_LEN], Error> {
    let peer = PublicKey::from_sec1_bytes(peer_public_value)
        .map_err(|_| Error::InvalidAnswer("peer public value is not a valid P-256 point".into()))?;
    let shared = p256::ecdh::diffie_hellman(private_key.to_nonzero_scalar(), peer.as_affine());

    let mut hasher = Sha512::new();
    hasher.update(shared.raw_secret_bytes());
    hasher.update(password.as_bytes());
    Ok(hasher.finalize().into())
}

/// Constant-time comparison for confirmation values.
pub fn shared_keys_equal(a: &[u8; SHARED_KEY_LEN], b: &[u8; SHARED_KEY_LEN]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(byte: u8) -> String {
        BASE64_STANDARD.encode([byte; 32])
    }

    #[test]
    fn key_agreement_is_symmetric() {
        let a = derive_private_key(&fingerprint(7)).unwrap();
        let b = derive_private_key(&fingerprint(9)).unwrap();

        let key_ab = compute_shared_key(&a, &compute_public_value(&b), "0000").unwrap();
        let key_ba = compute_shared_key(&b, &compute_public_value(&a), "0000").unwrap();
        assert!(shared_keys_equal(&key_ab, &key_ba));
    }

    #[test]
    fn different_passwords_give_different_keys() {
        let a = derive_private_key(&fingerprint(7)).unwrap();
        let b = derive_private_key(&fingerprint(9)).unwrap();

        let key_ab = compute_shared_key(&a, &compute_public_value(&b), "0000").unwrap();
        let key_ba = compute_shared_key(&b, &compute_public_value(&a), "0001").unwrap();
        assert!(!shared_keys_equal(&key_ab, &key_ba));
    }

    #[test]
    fn public_value_is_uncompressed_sec1() {
        let key = derive_private_key(&fingerprint(3)).unwrap();
        let public_value = compute_public_value(&key);
        assert_eq!(public_value.len(), 65);
        assert_eq!(public_value[0], 0x04);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(derive_private_key("!!not-base64!!").is_err());
        assert!(derive_private_key(&BASE64_STANDARD.encode([1u8; 16])).is_err());

        let key = derive_private_key(&fingerprint(3)).unwrap();
        assert!(matches!(
            compute_shared_key(&key, &[0x04, 0xff, 0xee], "pw"),
            Err(Error::InvalidAnswer(_))
        ));
    }
}
