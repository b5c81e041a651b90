//! Startup sequence and QUIC serving loop of the label service.
//!
//! # Lifecycle
//! 1. [`connect_persistence`] builds the configured store and probes it on a fixed interval
//!    until it answers. Cancellation ends the wait; a malformed connection string ends it
//!    with an error.
//! 2. [`build_identity`] loads the root authority, issues a fresh server certificate and
//!    assembles a TLS context that requires client certificates issued by that root.
//! 3. [`LabelServer::serve`] accepts connections until cancelled. Each handshake, connection
//!    and call runs in its own task.
//! 4. On cancellation the endpoint stops accepting, in-flight calls finish, and the endpoint
//!    closes.
use crate::config::{NfdMasterConfig, StorageBackend};
use crate::error::SetLabelsError;
use crate::identity::peer_node_name;
use crate::labels::{LabelUpserter, NODE_FEATURE_KEY, NodeFeature};
use anyhow::{Context, Result};
use fleet_pki::{CertificateDer, LeafRole, RootAuthority};
use fleet_store::{DocumentStore, Entity, InMemoryStore, PostgresStore, StoreError};
use fleet_transport::stream::{read_message, write_message};
use fleet_transport::{QuicConnection, QuicServer, TransportConfig, mtls_server_config};
use fleet_wire::{ErrorCode, LabelStatus, Message};
use quinn::{RecvStream, SendStream};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Build the configured store and wait until it answers a liveness probe.
///
/// Returns `Ok(None)` when `cancel` fires first.
pub async fn connect_persistence(
    config: &NfdMasterConfig,
    cancel: &CancellationToken,
) -> Result<Option<Arc<dyn DocumentStore>>> {
    let store = open_store(config)?;
    if !wait_for_store(store.as_ref(), config.store_retry_interval(), cancel).await? {
        return Ok(None);
    }
    store.prepare().await.context("prepare store schema")?;
    tracing::info!(
        backend = store.backend_name(),
        durable = store.is_durable(),
        "store connection established"
    );
    warn_if_volatile(store.as_ref());
    Ok(Some(store))
}

/// Log a warning when labels will not survive a restart. Returns whether it warned.
fn warn_if_volatile(store: &dyn DocumentStore) -> bool {
    if store.is_durable() {
        return false;
    }
    tracing::warn!(
        backend = store.backend_name(),
        "store is not durable; labels are lost on restart (set NFD_MASTER_STORE=postgres)"
    );
    true
}

fn open_store(config: &NfdMasterConfig) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.storage {
        StorageBackend::Memory => Arc::new(
            InMemoryStore::new().with_unique_key(NodeFeature::TABLE, NODE_FEATURE_KEY),
        ),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(PostgresStore::connect(pg)?)
        }
    };
    Ok(store)
}

/// `Ok(true)` once the store answers; `Ok(false)` if cancelled while waiting.
async fn wait_for_store(
    store: &dyn DocumentStore,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<bool> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let probe = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            probe = store.health_check() => probe,
        };
        match probe {
            Ok(()) => return Ok(true),
            Err(err @ StoreError::InvalidConfig(_)) => return Err(err.into()),
            Err(err) => {
                metrics::counter!("nfd_store_probe_failures_total").increment(1);
                tracing::error!(
                    attempt,
                    backend = store.backend_name(),
                    error = %err,
                    retry_in_ms = interval.as_millis() as u64,
                    "store ping failed"
                );
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Server TLS context: a fresh leaf for `config.server_name`, client certificates required.
pub fn build_identity(config: &NfdMasterConfig) -> Result<quinn::ServerConfig> {
    let root = RootAuthority::load(&config.ca_cert_path, &config.ca_key_path)
        .context("load root authority")?;
    let leaf = root
        .issue(LeafRole::Server, &config.server_name, config.leaf_validity())
        .context("issue server certificate")?;
    tracing::info!(
        server_name = %config.server_name,
        not_after = %leaf.not_after,
        "server certificate issued"
    );
    mtls_server_config(
        root.root_store().context("build client trust store")?,
        vec![leaf.cert_der.clone()],
        leaf.private_key(),
    )
}

/// Run every startup step and serve until `cancel` fires.
pub async fn run(config: NfdMasterConfig, cancel: CancellationToken) -> Result<()> {
    let Some(store) = connect_persistence(&config, &cancel).await? else {
        tracing::info!("shutdown requested before the store became ready");
        return Ok(());
    };
    let server_config = build_identity(&config)?;
    let upserter = Arc::new(LabelUpserter::new(store));
    let server = LabelServer::bind(config.bind_addr, server_config, upserter, &config)?;
    server.serve(cancel).await
}

pub struct LabelServer {
    quic: QuicServer,
    upserter: Arc<LabelUpserter>,
    calls: TaskTracker,
}

impl LabelServer {
    pub fn bind(
        addr: SocketAddr,
        server_config: quinn::ServerConfig,
        upserter: Arc<LabelUpserter>,
        config: &NfdMasterConfig,
    ) -> Result<Self> {
        let transport = TransportConfig {
            max_frame_bytes: config.max_frame_bytes,
            ..TransportConfig::default()
        };
        let quic = QuicServer::bind(addr, server_config, transport).context("bind QUIC listener")?;
        Ok(Self {
            quic,
            upserter,
            calls: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.quic.local_addr()
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "nfd master listening");
        loop {
            let handshake = tokio::select! {
                _ = cancel.cancelled() => break,
                handshake = self.quic.accept() => handshake,
            };
            let Some(handshake) = handshake else {
                tracing::warn!("endpoint closed, stopping accept loop");
                break;
            };
            let remote = handshake.remote_address();
            let upserter = Arc::clone(&self.upserter);
            let calls = self.calls.clone();
            let cancel = cancel.clone();
            let max_frame_bytes = self.quic.transport().max_frame_bytes;
            tokio::spawn(async move {
                let connection = match handshake.complete().await {
                    Ok(connection) => connection,
                    Err(err) => {
                        tracing::info!(%remote, error = %format!("{err:#}"), "handshake rejected");
                        return;
                    }
                };
                handle_connection(connection, upserter, calls, cancel, max_frame_bytes).await;
            });
        }

        tracing::info!("executing graceful stop");
        self.quic.stop_accepting();
        self.calls.close();
        self.calls.wait().await;
        self.quic.shutdown().await;
        tracing::info!("nfd master stopped serving");
        Ok(())
    }
}

async fn handle_connection(
    connection: QuicConnection,
    upserter: Arc<LabelUpserter>,
    calls: TaskTracker,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    let conn_id = connection.info().id.0;
    tracing::debug!(conn_id, peer = %connection.info().peer_addr, "connection established");
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = connection.accept_bi() => accepted,
        };
        let (send, recv) = match accepted {
            Ok(streams) => streams,
            Err(err) => {
                tracing::debug!(conn_id, error = %err, "connection closed");
                return;
            }
        };
        let upserter = Arc::clone(&upserter);
        let connection = connection.clone();
        calls.spawn(async move {
            if let Err(err) =
                handle_stream(&connection, &upserter, send, recv, max_frame_bytes).await
            {
                tracing::warn!(conn_id, error = %err, "stream handler failed");
            }
        });
    }
}

async fn handle_stream(
    connection: &QuicConnection,
    upserter: &LabelUpserter,
    mut send: SendStream,
    mut recv: RecvStream,
    max_frame_bytes: usize,
) -> Result<()> {
    let reply = match read_message(&mut recv, max_frame_bytes).await {
        Ok(Some(Message::SetLabels {
            node_name,
            nfd_version,
            labels,
        })) => {
            let chain = connection.peer_certificates();
            let outcome = set_labels(
                upserter,
                chain.as_deref(),
                &node_name,
                nfd_version.as_deref(),
                &labels,
            )
            .await;
            match outcome {
                Ok(results) => Message::SetLabelsReply { results },
                Err(err) => err.into_message(),
            }
        }
        Ok(Some(other)) => Message::error(
            ErrorCode::InvalidRequest,
            format!("unexpected message type {}", other.kind()),
        ),
        Ok(None) => return Ok(()),
        Err(err) => Message::error(ErrorCode::InvalidRequest, format!("{err:#}")),
    };
    write_message(&mut send, &reply).await?;
    send.finish().context("finish reply stream")?;
    let _ = send.stopped().await;
    Ok(())
}

/// Apply a node's labels after binding the payload to the peer's certificate.
pub async fn set_labels(
    upserter: &LabelUpserter,
    peer_chain: Option<&[CertificateDer<'_>]>,
    node_name: &str,
    nfd_version: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, LabelStatus>, SetLabelsError> {
    let result = authorize_and_apply(upserter, peer_chain, node_name, nfd_version, labels).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(SetLabelsError::PartialFailure { .. }) => "partial",
        Err(_) => "rejected",
    };
    metrics::counter!("nfd_set_labels_total", "outcome" => outcome).increment(1);
    if let Err(err) = &result {
        tracing::warn!(node = node_name, error = %err, "set labels failed");
    }
    result
}

async fn authorize_and_apply(
    upserter: &LabelUpserter,
    peer_chain: Option<&[CertificateDer<'_>]>,
    node_name: &str,
    nfd_version: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, LabelStatus>, SetLabelsError> {
    let peer = peer_node_name(peer_chain)?;
    if peer != node_name {
        return Err(SetLabelsError::IdentityMismatch {
            claimed: node_name.to_string(),
            peer,
        });
    }
    tracing::info!(
        node = node_name,
        nfd_version = nfd_version.unwrap_or("unknown"),
        labels = labels.len(),
        "received labeling request"
    );

    let report = upserter.apply(node_name, labels).await;
    let failure = report
        .first_failure()
        .map(|(key, error)| format!("label {key}: {error}"));
    match failure {
        None => Ok(report.into_results()),
        Some(message) => Err(SetLabelsError::PartialFailure {
            message,
            results: report.into_results(),
        }),
    }
}
