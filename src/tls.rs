//! Transport security policy
//!
//! A connection either verifies the server against trust anchors loaded from a PEM
//! file, or accepts every server certificate (opportunistic encryption). The two modes
//! are mutually exclusive. The policy only matters for `wss://` endpoints.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Unable to read CA file {path}: {source}")]
    ReadCaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("Rejected trust anchor: {0}")]
    InvalidCertificate(String),
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

/// How the server certificate is checked on `wss://` connections
#[derive(Clone)]
pub enum TlsPolicy {
    /// Verify against these trust anchors only
    TrustAnchors(Arc<Vec<CertificateDer<'static>>>),
    /// Accept any server certificate
    AcceptAll,
}

impl TlsPolicy {
    /// Load trust anchors from a PEM-encoded certificate bundle
    pub fn from_ca_file(path: &Path) -> Result<Self, TlsError> {
        let pem = std::fs::read(path).map_err(|source| TlsError::ReadCaFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_pem(&pem, path)
    }

    fn from_pem(pem: &[u8], origin: &Path) -> Result<Self, TlsError> {
        let mut reader = BufReader::new(pem);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

        if certs.is_empty() {
            return Err(TlsError::NoCertificates(origin.to_path_buf()));
        }
        Ok(TlsPolicy::TrustAnchors(Arc::new(certs)))
    }

    /// Build the rustls client configuration for this policy
    pub fn client_config(&self) -> Result<ClientConfig, TlsError> {
        let provider = Arc::new(ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let config = match self {
            TlsPolicy::TrustAnchors(certs) => {
                let mut roots = RootCertStore::empty();
                for cert in certs.iter() {
                    roots
                        .add(cert.clone())
                        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            TlsPolicy::AcceptAll => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth(),
        };
        Ok(config)
    }
}

impl fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsPolicy::TrustAnchors(certs) => write!(f, "TrustAnchors({} certs)", certs.len()),
            TlsPolicy::AcceptAll => write!(f, "AcceptAll"),
        }
    }
}

/// Verifier that skips certificate validation but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
