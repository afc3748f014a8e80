//! IPC transport implementations
//!
//! Messages travel as one JSON-encoded [`MessageEnvelope`] per line. A
//! transport is a reader half and a writer half, which can be split apart
//! so that sending and receiving run on independent tasks.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Reading half: decodes newline-delimited envelopes
pub struct EnvelopeReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin + Send> EnvelopeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Read the next envelope. Returns [`IpcError::ConnectionClosed`] at EOF.
    pub async fn receive<T: for<'de> Deserialize<'de>>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;

            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }

            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(trimmed)?;

            if envelope.protocol_version != IPC_PROTOCOL_VERSION {
                debug!(actual = envelope.protocol_version, "Rejecting envelope from another protocol version");
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(envelope);
        }
    }
}

/// Writing half: encodes envelopes, one per line, flushing after each
pub struct EnvelopeWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> EnvelopeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { writer: inner }
    }

    pub async fn send<T: Serialize>(&mut self, message: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        Ok(self.writer.shutdown().await?)
    }
}

/// A reader/writer pair speaking the envelope line protocol
pub struct LineTransport<R, W> {
    reader: EnvelopeReader<R>,
    writer: EnvelopeWriter<W>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: EnvelopeReader::new(reader),
            writer: EnvelopeWriter::new(writer),
        }
    }

    /// Split into independently owned halves, so sending and receiving can
    /// run on separate tasks
    pub fn into_split(self) -> (EnvelopeReader<R>, EnvelopeWriter<W>) {
        (self.reader, self.writer)
    }
}

/// Stdin/Stdout transport, used on the worker side of a process pipe
pub type StdioTransport = LineTransport<tokio::io::Stdin, tokio::io::Stdout>;

impl StdioTransport {
    /// Create a new stdio transport
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

/// Child process transport, used on the coordinator side of a process pipe
pub type ChildProcessTransport =
    LineTransport<tokio::process::ChildStdout, tokio::process::ChildStdin>;

impl ChildProcessTransport {
    /// Create a transport talking to a spawned child's piped stdio
    pub fn from_child(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InputMessage, OutputMessage};
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (left, right) = tokio::io::duplex(4096);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);

        let (mut coordinator_in, mut coordinator_out) =
            LineTransport::new(left_read, left_write).into_split();
        let (mut worker_in, mut worker_out) = LineTransport::new(right_read, right_write).into_split();

        coordinator_out
            .send(&MessageEnvelope::new(InputMessage::item(1, json!("a"))))
            .await
            .unwrap();
        coordinator_out
            .send(&MessageEnvelope::new(InputMessage::Sentinel))
            .await
            .unwrap();

        let first: MessageEnvelope<InputMessage> = worker_in.receive().await.unwrap();
        let second: MessageEnvelope<InputMessage> = worker_in.receive().await.unwrap();
        assert_eq!(first.message, InputMessage::item(1, json!("a")));
        assert_eq!(second.message, InputMessage::Sentinel);

        worker_out
            .send(&MessageEnvelope::new(OutputMessage::output(1, json!("A"))))
            .await
            .unwrap();
        let reply: MessageEnvelope<OutputMessage> = coordinator_in.receive().await.unwrap();
        assert_eq!(reply.message, OutputMessage::output(1, json!("A")));
    }

    #[tokio::test]
    async fn test_eof_reports_connection_closed() {
        let (left, right) = tokio::io::duplex(64);
        drop(right);
        let mut reader = EnvelopeReader::new(left);
        let result = reader.receive::<InputMessage>().await;
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_malformed_line_is_skippable() {
        let (mut left, right) = tokio::io::duplex(1024);
        left.write_all(b"hello from a stray println\n").await.unwrap();
        left.write_all(
            b"{\"protocol_version\":1,\"timestamp\":\"2024-01-01T00:00:00Z\",\"message\":{\"type\":\"sentinel\"}}\n",
        )
        .await
        .unwrap();

        let mut reader = EnvelopeReader::new(right);
        let bad = reader.receive::<InputMessage>().await.unwrap_err();
        assert!(matches!(bad, IpcError::DeserializationError(_)));
        assert!(!bad.is_fatal());

        let next = reader.receive::<InputMessage>().await.unwrap();
        assert_eq!(next.message, InputMessage::Sentinel);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (mut left, right) = tokio::io::duplex(1024);
        left.write_all(
            b"{\"protocol_version\":99,\"timestamp\":\"2024-01-01T00:00:00Z\",\"message\":{\"type\":\"sentinel\"}}\n",
        )
        .await
        .unwrap();

        let mut reader = EnvelopeReader::new(right);
        let result = reader.receive::<InputMessage>().await;
        assert!(matches!(
            result,
            Err(IpcError::ProtocolVersionMismatch { expected: 1, actual: 99 })
        ));
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_is_disconnect() {
        let (left, right) = tokio::io::duplex(64);
        drop(right);
        let mut writer = EnvelopeWriter::new(left);

        let err = writer
            .send(&MessageEnvelope::new(InputMessage::Sentinel))
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }
}
