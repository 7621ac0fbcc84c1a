//! TLS credentials shared by every connection on a bus.
//!
//! Verification is mandatory in both directions: the dialer checks the
//! listener's certificate against the CA set, and the listener requires a
//! client certificate signed by the same set. An optional CRL is applied to
//! client verification.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct Credentials {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl Credentials {
    /// Build credentials from PEM files: a CA bundle, a certificate chain,
    /// a private key, and an optional CRL. `require_tls13` restricts the
    /// session to TLS 1.3 (the high/ultra security levels).
    pub fn from_pem(
        ca_path: &Path,
        cert_path: &Path,
        key_path: &Path,
        crl_path: Option<&Path>,
        require_tls13: bool,
    ) -> Result<Self> {
        let roots = load_roots(ca_path)?;
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        let crls = match crl_path {
            Some(path) => load_crls(path)?,
            None => Vec::new(),
        };
        let versions: &[&'static rustls::SupportedProtocolVersion] = if require_tls13 {
            &[&rustls::version::TLS13]
        } else {
            rustls::ALL_VERSIONS
        };

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone()))
            .with_crls(crls)
            .build()
            .map_err(|e| Error::generic(format!("client certificate verifier: {e}")))?;

        let server = ServerConfig::builder_with_protocol_versions(versions)
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())?;

        let client = ClientConfig::builder_with_protocol_versions(versions)
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    pub fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(Arc::clone(&self.client))
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(Arc::clone(&self.server))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials")
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Error::generic(format!("cannot open {}: {e}", path.display())))?;
    Ok(BufReader::new(file))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut reader = open(path)?;
    let mut roots = RootCertStore::empty();
    let mut count = 0usize;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(Error::System)?;
        roots
            .add(cert)
            .map_err(|e| Error::generic(format!("bad CA certificate in {}: {e}", path.display())))?;
        count += 1;
    }
    if count == 0 {
        return Err(Error::generic(format!(
            "no certificates found in CA bundle {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(Error::System)?;
    if certs.is_empty() {
        return Err(Error::generic(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(Error::System)?
        .ok_or_else(|| Error::generic(format!("no private key found in {}", path.display())))
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let mut reader = open(path)?;
    rustls_pemfile::crls(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(Error::System)
}
