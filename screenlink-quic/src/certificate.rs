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

//! Agent certificate handling.
//!
//! An agent identifies itself with a certificate chain whose leaf
//! fingerprint, `base64(SHA-256(leaf DER))` in the standard alphabet, is
//! advertised over discovery and pinned by connecting peers. Certificate
//! loading happens once, before the endpoint starts; it is the only
//! blocking I/O in the stack.

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use screenlink_common::{AgentFingerprint, Error, ALPN_OSP};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::verifier::{AcceptAnyClientCert, FingerprintVerifier};

/// Computes the agent fingerprint for a DER-encoded leaf certificate.
///
/// The digest covers the full certificate DER, not just the public key, so
/// the fingerprint is stable exactly as long as the certificate itself.
pub fn compute_fingerprint(leaf_der: &[u8]) -> AgentFingerprint {
    let digest = Sha256::digest(leaf_der);
    BASE64_STANDARD.encode(digest)
}

/// The local agent's certificate chain, private key and cached
/// fingerprint.
///
/// Supplies the TLS material for both directions: the server config used
/// when listening and the per-peer client config that pins the remote
/// agent's advertised fingerprint.
pub struct AgentCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    fingerprint: AgentFingerprint,
}

impl AgentCertificate {
    /// Loads a concatenated-PEM certificate chain and a DER (PKCS#8)
    /// private key from disk.
    ///
    /// Fails loudly: an agent without credentials cannot start.
    pub fn load(cert_pem_path: &Path, key_der_path: &Path) -> Result<Self, Error> {
        let pem_data = std::fs::read(cert_pem_path)?;
        let mut chain = Vec::new();
        for pem in x509_parser::pem::Pem::iter_from_buffer(&pem_data) {
            let pem = pem.map_err(|e| {
                Error::Certificate(format!("failed to parse PEM block: {e}"))
            })?;
            if pem.label == "CERTIFICATE" {
                chain.push(CertificateDer::from(pem.contents));
            }
        }
        if chain.is_empty() {
            return Err(Error::Certificate(format!(
                "no certificates found in {}",
                cert_pem_path.display()
            )));
        }

        let key_der = std::fs::read(key_der_path)?;
        if key_der.is_empty() {
            return Err(Error::Certificate(format!(
                "empty private key file {}",
                key_der_path.display()
            )));
        }

        Self::from_der(chain, key_der)
    }

    /// Builds an agent certificate from DER-encoded parts.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key_der: Vec<u8>,
    ) -> Result<Self, Error> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate("empty certificate chain".into()))?;
        // Validate the leaf parses as X.509 before trusting it as identity.
        x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| Error::Certificate(format!("invalid leaf certificate: {e}")))?;

        let fingerprint = compute_fingerprint(leaf.as_ref());
        info!(fingerprint = %fingerprint, "loaded agent certificate");

        Ok(Self {
            chain,
            key: PrivateKeyDer::Pkcs8(key_der.into()),
            fingerprint,
        })
    }

    /// Generates a fresh self-signed certificate, mainly for tests and
    /// demos.
    pub fn generate(common_name: &str) -> Result<Self, Error> {
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("key generation failed: {e}")))?;
        let mut params = rcgen::CertificateParams::new(vec![common_name.to_string()])
            .map_err(|e| Error::Certificate(format!("invalid certificate params: {e}")))?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(format!("self-signing failed: {e}")))?;

        Self::from_der(
            vec![CertificateDer::from(cert.der().to_vec())],
            key_pair.serialize_der(),
        )
    }

    /// The cached fingerprint of the leaf certificate.
    pub fn fingerprint(&self) -> &AgentFingerprint {
        &self.fingerprint
    }

    /// Certificate rotation is reserved but not implemented; a fixed
    /// certificate identifies the agent for its whole lifetime.
    pub fn rotate(&mut self) -> Result<(), Error> {
        Err(Error::NotImplemented)
    }

    /// Builds the Quinn server config for listening sockets.
    ///
    /// Client certificates are accepted unconditionally at the TLS layer;
    /// they only serve as identity input, actual authentication is the
    /// SPAKE2 exchange.
    pub fn server_config(&self) -> Result<quinn::ServerConfig, Error> {
        let mut crypto = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| Error::Certificate(format!("TLS server config: {e}")))?;
        crypto.alpn_protocols = vec![ALPN_OSP.to_vec()];

        let config = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| Error::Certificate(format!("QUIC server config: {e}")))?;
        Ok(quinn::ServerConfig::with_crypto(Arc::new(config)))
    }

    /// Builds the Quinn client config for dialing the peer whose
    /// advertised fingerprint is `expected_fingerprint`.
    ///
    /// The handshake fails if the certificate the peer presents does not
    /// hash to that fingerprint.
    pub fn client_config(
        &self,
        expected_fingerprint: &str,
    ) -> Result<quinn::ClientConfig, Error> {
        debug!(expected_fingerprint, "building pinned client config");
        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(
                expected_fingerprint.to_string(),
            )))
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| Error::Certificate(format!("TLS client config: {e}")))?;
        crypto.alpn_protocols = vec![ALPN_OSP.to_vec()];

        let config = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| Error::Certificate(format!("QUIC client config: {e}")))?;
        Ok(quinn::ClientConfig::new(Arc::new(config)))
    }
}
