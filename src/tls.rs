//! TLS assembly for the p2p transport.
//!
//! Both directions are mutually authenticated, but there is no CA: a peer is
//! whoever its certificate's public key says it is (see `identity`). The
//! verifiers therefore accept any well-formed, correctly-signed certificate
//! and leave trust decisions to the layers keyed on the derived node id.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::error::P2pError;
use crate::identity::node_id_from_cert;

/// Certificate chain plus private key for this node.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, P2pError> {
        let mut cert_reader = BufReader::new(File::open(cert_path).map_err(|e| {
            P2pError::Config(format!("open cert {}: {}", cert_path.display(), e))
        })?);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<_, _>>()
            .map_err(|e| P2pError::Config(format!("parse cert {}: {}", cert_path.display(), e)))?;

        let mut key_reader = BufReader::new(File::open(key_path).map_err(|e| {
            P2pError::Config(format!("open key {}: {}", key_path.display(), e))
        })?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| P2pError::Config(format!("parse key {}: {}", key_path.display(), e)))?
            .ok_or_else(|| {
                P2pError::Config(format!("no private key in {}", key_path.display()))
            })?;

        if certs.is_empty() {
            return Err(P2pError::Config(format!(
                "no certificate in {}",
                cert_path.display()
            )));
        }
        Ok(Self { certs, key })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, P2pError> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<Result<_, _>>()
                .map_err(|e| P2pError::Config(format!("parse cert pem: {}", e)))?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| P2pError::Config(format!("parse key pem: {}", e)))?
            .ok_or_else(|| P2pError::Config("no private key in pem".into()))?;
        if certs.is_empty() {
            return Err(P2pError::Config("no certificate in pem".into()));
        }
        Ok(Self { certs, key })
    }

    /// The node id this identity certifies.
    pub fn node_id(&self) -> Result<String, P2pError> {
        node_id_from_cert(self.certs[0].as_ref())
    }

    /// Server side: present our chain, require and accept any client cert.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, P2pError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(NodeCertVerifier::new(
            provider.signature_verification_algorithms,
        ));
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    /// Client side: present our chain, accept any server cert.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, P2pError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(NodeCertVerifier::new(
            provider.signature_verification_algorithms,
        ));
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }
}

/// Generate a fresh self-signed identity, returning (cert PEM, key PEM).
pub fn generate_identity_pem() -> Result<(String, String), P2pError> {
    let generated = rcgen::generate_simple_self_signed(vec!["crossmesh-node".to_string()])
        .map_err(|e| P2pError::Config(format!("generate identity: {}", e)))?;
    Ok((generated.cert.pem(), generated.key_pair.serialize_pem()))
}

/// Accepts any syntactically valid, correctly self-signed peer certificate.
/// Signature checks on the handshake transcript still run; only chain
/// building against a CA store is skipped.
#[derive(Debug)]
struct NodeCertVerifier {
    supported: WebPkiSupportedAlgorithms,
    no_subjects: Vec<DistinguishedName>,
}

impl NodeCertVerifier {
    fn new(supported: WebPkiSupportedAlgorithms) -> Self {
        Self {
            supported,
            no_subjects: Vec::new(),
        }
    }
}

impl ServerCertVerifier for NodeCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // the cert must at least parse into a derivable identity
        node_id_from_cert(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

impl ClientCertVerifier for NodeCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.no_subjects
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        node_id_from_cert(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}
