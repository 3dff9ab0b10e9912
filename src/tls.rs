//! Transport security settings for consumer connections
//!
//! Node connections may run over TLS, optionally presenting a client
//! certificate. Server identity is never verified: any certificate the node
//! presents is accepted, so the channel is encrypted but not authenticated
//! from the client side.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Key pair and transport security errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificate found in {}", .0.display())]
    MissingCertificate(PathBuf),
    #[error("no private key found in {}", .0.display())]
    MissingPrivateKey(PathBuf),
    #[error("invalid key pair: {0}")]
    InvalidKeyPair(#[from] rustls::Error),
}

/// A certificate chain loaded from disk together with its private key
pub struct KeyPair {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl KeyPair {
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Load a PEM certificate chain and private key
pub fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<KeyPair, TlsError> {
    let mut cert_reader = open(cert_path)?;
    let chain = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(TlsError::MissingCertificate(cert_path.to_path_buf()));
    }

    let mut key_reader = open(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|source| TlsError::Read {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::MissingPrivateKey(key_path.to_path_buf()))?;

    debug!(
        cert = %cert_path.display(),
        chain_len = chain.len(),
        "Loaded client key pair"
    );
    Ok(KeyPair { chain, key })
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Transport security configuration handed to node connections
#[derive(Clone)]
pub struct TlsSettings {
    certificates: Vec<Vec<CertificateDer<'static>>>,
    insecure_skip_verify: bool,
    client_config: Arc<ClientConfig>,
}

impl TlsSettings {
    /// Build settings from a certificate/key path pair.
    ///
    /// When both paths are non-empty the key pair is loaded and presented as a
    /// client certificate. When either is empty no certificate is used. In both
    /// cases the server certificate is NOT verified.
    pub fn new(cert_path: &str, key_path: &str) -> Result<Self, TlsError> {
        if cert_path.is_empty() || key_path.is_empty() {
            info!("Transport security enabled without client certificate");
            return Ok(Self::anonymous());
        }

        let key_pair = load_key_pair(Path::new(cert_path), Path::new(key_path))?;
        let settings = Self::with_key_pair(key_pair)?;
        info!(cert = cert_path, "Transport security enabled with client certificate");
        Ok(settings)
    }

    /// Settings with no client certificate
    pub fn anonymous() -> Self {
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();

        Self {
            certificates: Vec::new(),
            insecure_skip_verify: true,
            client_config: Arc::new(client_config),
        }
    }

    /// Settings presenting the given key pair as client certificate
    pub fn with_key_pair(key_pair: KeyPair) -> Result<Self, TlsError> {
        let KeyPair { chain, key } = key_pair;
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_client_auth_cert(chain.clone(), key)?;

        Ok(Self {
            certificates: vec![chain],
            insecure_skip_verify: true,
            client_config: Arc::new(client_config),
        })
    }

    /// Loaded client certificate chains (zero or one)
    pub fn certificates(&self) -> &[Vec<CertificateDer<'static>>] {
        &self.certificates
    }

    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("certificates", &self.certificates.len())
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish_non_exhaustive()
    }
}

/// Accepts whatever certificate the node presents
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
