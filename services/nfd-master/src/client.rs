// Node-side caller of the label service.
use anyhow::{Context, Result};
use fleet_transport::{QuicClient, QuicConnection, TransportConfig, stream};
use fleet_wire::Message;
use std::collections::BTreeMap;
use std::net::SocketAddr;

#[derive(Debug)]
pub struct LabelerClient {
    // Keeps the endpoint alive for the connection's lifetime.
    client: QuicClient,
    connection: QuicConnection,
}

impl LabelerClient {
    /// Connect to `addr`, expecting the server certificate to name `server_name`.
    ///
    /// `client_config` decides which certificate, if any, the node presents.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        client_config: quinn::ClientConfig,
    ) -> Result<Self> {
        let bind: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let client = QuicClient::bind(bind, client_config, TransportConfig::default())?;
        let connection = client
            .connect(addr, server_name)
            .await
            .with_context(|| format!("connect to {server_name} at {addr}"))?;
        Ok(Self { client, connection })
    }

    /// Report `labels` for `node_name`. Returns the server's reply as sent.
    pub async fn set_labels(
        &self,
        node_name: &str,
        nfd_version: Option<&str>,
        labels: BTreeMap<String, String>,
    ) -> Result<Message> {
        let request = Message::SetLabels {
            node_name: node_name.to_string(),
            nfd_version: nfd_version.map(str::to_string),
            labels,
        };
        self.call(&request).await
    }

    /// Send any message as one call.
    pub async fn call(&self, request: &Message) -> Result<Message> {
        let max_frame_bytes = self.client.transport().max_frame_bytes;
        stream::request(&self.connection, request, max_frame_bytes).await
    }

    pub fn close(&self) {
        self.connection.close("done");
    }
}
