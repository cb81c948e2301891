//! Self-certifying node identity.
//!
//! A node is identified by the public key of its TLS leaf certificate, not
//! by anything a CA asserts. The id is the hex encoding of the certificate's
//! SubjectPublicKeyInfo with the algorithm-identifier prefix stripped, i.e.
//! the raw public-key bytes. Two nodes presenting the same key are the same
//! node, whatever address they connect from.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::P2pError;

/// Identity of a node on the overlay.
///
/// Equality and hashing consider only `id`; host and port are informational
/// and may change across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(id: String, addr: SocketAddr) -> Self {
        Self {
            id,
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Shortened id for log lines.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(16)]
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentity {}

impl std::hash::Hash for NodeIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.short_id(), self.host, self.port)
    }
}

/// Derive a node id from a DER-encoded X.509 certificate.
///
/// Extracts the SubjectPublicKeyInfo's BIT STRING contents structurally, so
/// the result is well-defined for every key algorithm rather than assuming a
/// fixed-length DER prefix.
pub fn node_id_from_cert(der: &[u8]) -> Result<String, P2pError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| P2pError::Handshake(format!("unparseable peer certificate: {}", e)))?;
    let key_bytes: &[u8] = cert.public_key().subject_public_key.data.as_ref();
    if key_bytes.is_empty() {
        return Err(P2pError::Handshake("empty public key in certificate".into()));
    }
    Ok(hex::encode(key_bytes))
}
