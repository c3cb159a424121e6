//! Mutual TLS configuration for the control channel

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use super::RpcError;
use crate::config::TlsConfig;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server side: present our certificate and require a client certificate
/// chaining to the configured CA.
pub fn server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, RpcError> {
    let roots = load_roots(&tls.ca_file)?;
    let certs = load_certificates(&tls.cert_file)?;
    let key = load_private_key(&tls.key_file)?;

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| RpcError::Tls(format!("client verifier error: {e}")))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RpcError::Tls(format!("protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| RpcError::Tls(format!("server config error: {e}")))?;

    Ok(Arc::new(config))
}

/// Client side: verify the server against the CA and authenticate with our
/// own certificate.
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>, RpcError> {
    let roots = load_roots(&tls.ca_file)?;
    let certs = load_certificates(&tls.cert_file)?;
    let key = load_private_key(&tls.key_file)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RpcError::Tls(format!("protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| RpcError::Tls(format!("client config error: {e}")))?;

    Ok(Arc::new(config))
}

pub fn server_name(tls: &TlsConfig) -> Result<ServerName<'static>, RpcError> {
    ServerName::try_from(tls.server_name.clone())
        .map_err(|e| RpcError::Tls(format!("invalid server name {:?}: {e}", tls.server_name)))
}

fn load_roots(path: &Path) -> Result<RootCertStore, RpcError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots
            .add(cert)
            .map_err(|e| RpcError::Tls(format!("invalid CA certificate: {e}")))?;
    }
    Ok(roots)
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, RpcError> {
    let pem = std::fs::read(path)
        .map_err(|e| RpcError::Tls(format!("failed to read {}: {e}", path.display())))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RpcError::Tls(format!("failed to parse certificates in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(RpcError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, RpcError> {
    let pem = std::fs::read(path)
        .map_err(|e| RpcError::Tls(format!("failed to read {}: {e}", path.display())))?;
    PrivateKeyDer::from_pem_slice(&pem)
        .map_err(|e| RpcError::Tls(format!("failed to parse private key in {}: {e}", path.display())))
}
