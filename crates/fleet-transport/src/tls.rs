// rustls/quinn configuration for mutually authenticated endpoints.
use anyhow::{Context, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::WantsClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ConfigBuilder, RootCertStore};
use std::sync::Arc;

/// ALPN token both sides must offer.
pub const ALPN_PROTOCOL: &[u8] = b"nfd/1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server side: TLS 1.3 only, a client certificate chaining to `client_roots` is
/// mandatory.
pub fn mtls_server_config(
    client_roots: RootCertStore,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let provider = provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), Arc::clone(&provider))
            .build()
            .context("build client certificate verifier")?;
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("select TLS versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .context("load server certificate")?;
    tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    let crypto = QuicServerConfig::try_from(tls).context("build QUIC server crypto")?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}

/// Client side presenting `cert_chain` and trusting servers under `server_roots`.
pub fn mtls_client_config(
    server_roots: RootCertStore,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ClientConfig> {
    let tls = client_builder(server_roots)?
        .with_client_auth_cert(cert_chain, key)
        .context("load client certificate")?;
    finish_client(tls)
}

/// Client side without a certificate. Servers built by [`mtls_server_config`] refuse it.
pub fn anonymous_client_config(server_roots: RootCertStore) -> Result<quinn::ClientConfig> {
    finish_client(client_builder(server_roots)?.with_no_client_auth())
}

fn client_builder(
    server_roots: RootCertStore,
) -> Result<ConfigBuilder<rustls::ClientConfig, WantsClientCert>> {
    Ok(rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("select TLS versions")?
        .with_root_certificates(server_roots))
}

fn finish_client(mut tls: rustls::ClientConfig) -> Result<quinn::ClientConfig> {
    tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    let crypto = QuicClientConfig::try_from(tls).context("build QUIC client crypto")?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QuicClient, QuicServer, TransportConfig};
    use fleet_pki::RootAuthority;
    use std::time::Duration;

    #[tokio::test]
    async fn anonymous_client_never_completes_server_handshake() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = RootAuthority::bootstrap(dir.path())?;
        let leaf = root.issue_server_certificate("localhost")?;
        let server_config = mtls_server_config(
            root.root_store()?,
            vec![leaf.cert_der.clone()],
            leaf.private_key(),
        )?;
        let server =
            QuicServer::bind("127.0.0.1:0".parse()?, server_config, TransportConfig::default())?;
        let addr = server.local_addr()?;
        let server_task = tokio::spawn(async move {
            let handshake = server.accept().await.context("incoming")?;
            Result::<bool>::Ok(handshake.complete().await.is_err())
        });

        let client = QuicClient::bind(
            "0.0.0.0:0".parse()?,
            anonymous_client_config(root.root_store()?)?,
            TransportConfig::default(),
        )?;
        if let Ok(connection) = client.connect(addr, "localhost").await {
            let _ = tokio::time::timeout(Duration::from_secs(5), connection.closed()).await;
        }
        assert!(server_task.await??);
        Ok(())
    }
}
