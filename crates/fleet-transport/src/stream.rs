// Frame I/O on QUIC streams.
use crate::QuicConnection;
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use fleet_wire::{Frame, FrameHeader, Message};
use quinn::{ReadExactError, RecvStream, SendStream};

/// Read one message. `Ok(None)` when the peer finished the stream without sending one.
pub async fn read_message(
    recv: &mut RecvStream,
    max_frame_bytes: usize,
) -> Result<Option<Message>> {
    let frame = match read_frame(recv, max_frame_bytes).await? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    Message::decode(frame).map(Some).context("decode message")
}

pub async fn write_message(send: &mut SendStream, message: &Message) -> Result<()> {
    let frame = message.encode().context("encode message")?;
    send.write_all(&frame.encode()).await.context("write frame")
}

/// One call: open a stream, send `request`, finish, and wait for the single reply.
pub async fn request(
    connection: &QuicConnection,
    request: &Message,
    max_frame_bytes: usize,
) -> Result<Message> {
    let (mut send, mut recv) = connection.open_bi().await?;
    write_message(&mut send, request).await?;
    send.finish().context("finish request stream")?;
    read_message(&mut recv, max_frame_bytes)
        .await?
        .ok_or_else(|| anyhow!("stream closed before a reply arrived"))
}

async fn read_frame(recv: &mut RecvStream, max_frame_bytes: usize) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = header.check_length(max_frame_bytes)?;
    let mut payload = vec![0u8; length];
    recv.read_exact(&mut payload)
        .await
        .context("read frame payload")?;
    Ok(Some(Frame {
        header,
        payload: Bytes::from(payload),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QuicClient, QuicServer, TransportConfig, mtls_client_config, mtls_server_config};
    use fleet_pki::RootAuthority;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn oversized_frame_is_refused_before_reading_payload() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = RootAuthority::bootstrap(dir.path())?;
        let server_leaf = root.issue_server_certificate("localhost")?;
        let server = QuicServer::bind(
            "127.0.0.1:0".parse()?,
            mtls_server_config(
                root.root_store()?,
                vec![server_leaf.cert_der.clone()],
                server_leaf.private_key(),
            )?,
            TransportConfig::default(),
        )?;
        let addr = server.local_addr()?;
        let server_task = tokio::spawn(async move {
            let handshake = server.accept().await.context("incoming")?;
            let connection = handshake.complete().await?;
            let (_send, mut recv) = connection.accept_bi().await?;
            let outcome = read_message(&mut recv, 64).await;
            Result::<String>::Ok(format!("{:#}", outcome.expect_err("too large")))
        });

        let client_leaf = root.issue_client_certificate("node-1")?;
        let client = QuicClient::bind(
            "0.0.0.0:0".parse()?,
            mtls_client_config(
                root.root_store()?,
                vec![client_leaf.cert_der.clone()],
                client_leaf.private_key(),
            )?,
            TransportConfig::default(),
        )?;
        let connection = client.connect(addr, "localhost").await?;
        let (mut send, _recv) = connection.open_bi().await?;
        let big = Message::SetLabels {
            node_name: "node-1".to_string(),
            nfd_version: None,
            labels: BTreeMap::from([("blob".to_string(), "x".repeat(512))]),
        };
        write_message(&mut send, &big).await?;
        send.finish()?;

        let message = server_task.await??;
        assert!(message.contains("exceeds limit of 64"), "{message}");
        Ok(())
    }
}
