//! Backend certificate chain verification
//!
//! The proxy never terminates TLS, but it can check the Certificate message a
//! backend sends before relaying it to the client. The first certificate is
//! the leaf, the rest are offered as intermediates, and the chain must lead to
//! a trusted root and be valid for the requested server name.

use l7proxify_shared::{Error, Result};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;
use std::sync::Arc;
use tracing::debug;

/// Verifies certificate chains against a root store.
#[derive(Clone)]
pub struct ChainVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ChainVerifier {
    /// Verifier trusting the Mozilla root program bundled by webpki-roots.
    pub fn with_webpki_roots() -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        debug!("Loaded {} root certificates", roots.len());
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::CertificateRejected(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Verify a leaf-first chain of DER certificates for `server_name`.
    pub fn verify(&self, server_name: &str, chain: &[Vec<u8>]) -> Result<()> {
        let (leaf, intermediates) = chain
            .split_first()
            .ok_or_else(|| Error::CertificateRejected("empty certificate chain".into()))?;

        let name = ServerName::try_from(server_name)
            .map_err(|_| Error::CertificateRejected(format!("invalid server name: {}", server_name)))?;

        let end_entity = CertificateDer::from(leaf.as_slice());
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|der| CertificateDer::from(der.as_slice()))
            .collect();

        self.inner
            .verify_server_cert(&end_entity, &intermediates, &name, &[], UnixTime::now())
            .map_err(|e| Error::CertificateRejected(e.to_string()))?;

        debug!(certs = chain.len(), "cert chain verified");
        Ok(())
    }
}
