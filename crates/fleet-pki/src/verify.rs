use crate::error::{PkiError, Result};
use crate::inspect::subject_common_name;
use crate::issue::LeafRole;
use crate::root::RootAuthority;
use rustls::RootCertStore;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use std::sync::Arc;

impl RootAuthority {
    /// Trust store holding only this root.
    pub fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots
            .add(self.cert_der().clone())
            .map_err(|err| PkiError::Untrusted(err.to_string()))?;
        Ok(roots)
    }

    /// Check a leaf the way a TLS peer would: chain to this root, be within its
    /// validity window, and carry the usage for `role`.
    ///
    /// Server leaves are also checked against `server_name`, falling back to their CN.
    pub fn verify_leaf(
        &self,
        leaf: &CertificateDer<'_>,
        role: LeafRole,
        server_name: Option<&str>,
    ) -> Result<()> {
        let roots = Arc::new(self.root_store()?);
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let untrusted = |err: rustls::Error| PkiError::Untrusted(err.to_string());
        match role {
            LeafRole::Server => {
                let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider)
                    .build()
                    .map_err(|err| PkiError::Untrusted(err.to_string()))?;
                let name = match server_name {
                    Some(name) => name.to_string(),
                    None => subject_common_name(leaf).unwrap_or_default(),
                };
                let name = ServerName::try_from(name)
                    .map_err(|err| PkiError::InvalidRequest(err.to_string()))?;
                verifier
                    .verify_server_cert(leaf, &[], &name, &[], UnixTime::now())
                    .map_err(untrusted)?;
            }
            LeafRole::Client => {
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                    .build()
                    .map_err(|err| PkiError::Untrusted(err.to_string()))?;
                verifier
                    .verify_client_cert(leaf, &[], UnixTime::now())
                    .map_err(untrusted)?;
            }
        }
        Ok(())
    }
}
