//! TCP transport for cast sessions.
//!
//! Thin helpers over the wire codec: a connect with deadline, and
//! read/write helpers generic over the stream so the probe and the
//! session (and tests, via in-memory readers) share one code path.
//! Malformed inbound messages are logged and dropped rather than
//! tearing down the transport; only an oversized length prefix is
//! fatal, since the stream cannot be resynchronized past it.

use bytes::BytesMut;
use cast_wire::{encode_message, CastMessage, FrameDecoder, WireError};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{trace, warn};

/// Failure to put a message on the wire
#[derive(Error, Debug)]
pub enum SendError {
    /// The message failed validation or encoding
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// The transport write failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Connect to a device address with a deadline
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", addr),
        )),
    }
}

/// Read the next message from the stream.
///
/// Returns `Ok(None)` on a clean EOF. Undecodable messages are logged
/// and skipped.
pub async fn recv_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> io::Result<Option<CastMessage>> {
    loop {
        loop {
            match decoder.decode(buffer) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => break,
                Err(WireError::FrameSize(size)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("inbound frame too large: {} bytes", size),
                    ));
                }
                Err(e) => {
                    warn!("Dropping undecodable inbound message: {}", e);
                }
            }
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Encode and write one message to the stream
pub async fn send_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &CastMessage,
) -> Result<(), SendError> {
    let frame = encode_message(message)?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cast_wire::{ENDPOINT_RECEIVER, ENDPOINT_SENDER, NS_HEARTBEAT};
    use std::io::Cursor;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let message = CastMessage::text(
            ENDPOINT_SENDER,
            ENDPOINT_RECEIVER,
            NS_HEARTBEAT,
            r#"{"type":"PING"}"#,
        );

        let mut buffer = Vec::new();
        send_message(&mut buffer, &message).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut read_buf = BytesMut::new();
        let mut cursor = Cursor::new(buffer);

        let received = recv_message(&mut cursor, &mut decoder, &mut read_buf)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, message);

        // The cursor is exhausted: a clean EOF.
        assert!(recv_message(&mut cursor, &mut decoder, &mut read_buf)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_connect_tcp() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(bound_addr, Duration::from_secs(5)).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }
}
