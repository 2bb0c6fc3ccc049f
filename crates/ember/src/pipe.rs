//! Message framing for the elevated and embedded companion-process pipes.
//!
//! Frames are `u32 message-type | u32 payload-length | payload` in
//! little-endian byte order, preceded once by a handshake in which the
//! parent proves knowledge of the launch secret and the child answers with
//! its process id. The named-pipe transport itself is platform plumbing and
//! stays outside this crate; everything here works over any byte stream.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Connection polls before giving up; together with the wait per poll this
/// gives a slow elevated child three minutes to come up.
pub const CONNECT_RETRIES: u32 = 1800;

/// Pause between connection polls.
pub const CONNECT_RETRY_WAIT: std::time::Duration = std::time::Duration::from_millis(100);

/// Frames larger than this indicate a de-synced pipe rather than a real
/// message.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// The full path of the control pipe for a connection name.
pub fn control_pipe_path(connection_name: &str) -> String {
    format!(r"\\.\pipe\{connection_name}")
}

/// The full path of the parallel cache pipe for a connection name.
pub fn cache_pipe_path(connection_name: &str) -> String {
    format!(r"\\.\pipe\{connection_name}.Cache")
}

/// A fresh connection name for spawning a companion process.
pub fn make_connection_name() -> String {
    format!("Burn.{}", uuid::Uuid::new_v4())
}

/// Well-known message types. Executor opcodes ride in the same channel as
/// the generic engine messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum PipeMessageType {
    /// A log record forwarded to the parent's log.
    Log = 0xF000_0001,
    /// The child finished the requested operation; payload is the result
    /// code.
    Complete = 0xF000_0002,
    /// The parent asks the child to exit.
    Terminate = 0xF000_0003,
    /// An error report; payload is the error code and message.
    Error = 0xF000_0004,
    /// A progress report; payload is the tick counts.
    Progress = 0xF000_0005,
    /// Execute an EXE package action.
    ExecuteExePackage = 0x1000_0001,
    /// Execute an MSI package action.
    ExecuteMsiPackage = 0x1000_0002,
    /// Execute an MSP target action.
    ExecuteMspTarget = 0x1000_0003,
    /// Execute an MSU package action.
    ExecuteMsuPackage = 0x1000_0004,
    /// Register or unregister a dependency provider.
    ExecuteProviderAction = 0x1000_0005,
    /// Write or remove the persisted registration.
    WriteRegistration = 0x1000_0006,
}

impl PipeMessageType {
    /// Decodes a raw message type, if known.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0xF000_0001 => Some(Self::Log),
            0xF000_0002 => Some(Self::Complete),
            0xF000_0003 => Some(Self::Terminate),
            0xF000_0004 => Some(Self::Error),
            0xF000_0005 => Some(Self::Progress),
            0x1000_0001 => Some(Self::ExecuteExePackage),
            0x1000_0002 => Some(Self::ExecuteMsiPackage),
            0x1000_0003 => Some(Self::ExecuteMspTarget),
            0x1000_0004 => Some(Self::ExecuteMsuPackage),
            0x1000_0005 => Some(Self::ExecuteProviderAction),
            0x1000_0006 => Some(Self::WriteRegistration),
            _ => None,
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeMessage {
    /// The raw message type.
    pub message_type: u32,
    /// The payload bytes.
    pub data: Vec<u8>,
}

impl PipeMessage {
    /// A message with a typed opcode.
    pub fn new(message_type: PipeMessageType, data: Vec<u8>) -> Self {
        Self {
            message_type: message_type as u32,
            data,
        }
    }

    /// The typed opcode, if known.
    pub fn typed(&self) -> Option<PipeMessageType> {
        PipeMessageType::from_raw(self.message_type)
    }
}

/// An error on the companion pipe. Handshake and framing violations are
/// fatal without rollback; they indicate state divergence between the
/// processes.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The stream failed.
    #[error("pipe i/o failed")]
    Io(#[from] std::io::Error),

    /// The stream ended mid-frame.
    #[error("pipe closed mid-message")]
    UnexpectedEof,

    /// A frame length exceeded the sanity bound.
    #[error("pipe message of {0} bytes exceeds the protocol limit")]
    MessageTooLarge(u32),

    /// The child was handed the wrong secret.
    #[error("pipe handshake secret mismatch")]
    SecretMismatch,
}

/// Writes one framed message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &PipeMessage,
) -> Result<(), PipeError> {
    let mut frame = BytesMut::with_capacity(8 + message.data.len());
    frame.put_u32_le(message.message_type);
    frame.put_u32_le(message.data.len() as u32);
    frame.put_slice(&message.data);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, PipeError> {
    let mut buffer = [0u8; 4];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => PipeError::UnexpectedEof,
            _ => PipeError::Io(err),
        })?;
    Ok(u32::from_le_bytes(buffer))
}

/// Reads one framed message, blocking until a full frame arrives.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PipeMessage, PipeError> {
    let message_type = read_u32(reader).await?;
    let length = read_u32(reader).await?;
    if length > MAX_MESSAGE_SIZE {
        return Err(PipeError::MessageTooLarge(length));
    }
    let mut data = vec![0u8; length as usize];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => PipeError::UnexpectedEof,
            _ => PipeError::Io(err),
        })?;
    Ok(PipeMessage { message_type, data })
}

/// Parent side of the handshake: proves the secret, names its process id,
/// and returns the child's process id from the acknowledgement.
pub async fn handshake_parent<RW: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut RW,
    secret: &str,
    parent_pid: u32,
) -> Result<u32, PipeError> {
    let secret_bytes = secret.as_bytes();
    let mut frame = BytesMut::with_capacity(8 + secret_bytes.len());
    frame.put_u32_le(secret_bytes.len() as u32);
    frame.put_slice(secret_bytes);
    frame.put_u32_le(parent_pid);
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let child_pid = read_u32(stream).await?;
    tracing::debug!(child_pid, "pipe handshake complete");
    Ok(child_pid)
}

/// Child side of the handshake: verifies the secret and acknowledges with
/// its own process id. Returns the parent's process id.
pub async fn handshake_child<RW: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut RW,
    expected_secret: &str,
    own_pid: u32,
) -> Result<u32, PipeError> {
    let secret_len = read_u32(stream).await?;
    if secret_len > MAX_MESSAGE_SIZE {
        return Err(PipeError::MessageTooLarge(secret_len));
    }
    let mut secret = vec![0u8; secret_len as usize];
    stream
        .read_exact(&mut secret)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => PipeError::UnexpectedEof,
            _ => PipeError::Io(err),
        })?;
    let parent_pid = read_u32(stream).await?;

    if secret != expected_secret.as_bytes() {
        return Err(PipeError::SecretMismatch);
    }

    let mut ack = BytesMut::with_capacity(4);
    ack.put_u32_le(own_pid);
    stream.write_all(&ack).await?;
    stream.flush().await?;
    Ok(parent_pid)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{
        cache_pipe_path, control_pipe_path, handshake_child, handshake_parent, read_message,
        write_message, PipeError, PipeMessage, PipeMessageType,
    };

    #[test]
    fn test_pipe_paths() {
        assert_eq!(control_pipe_path("Burn.abc"), r"\\.\pipe\Burn.abc");
        assert_eq!(cache_pipe_path("Burn.abc"), r"\\.\pipe\Burn.abc.Cache");
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = PipeMessage::new(PipeMessageType::Progress, vec![1, 2, 3]);
        write_message(&mut client, &message).await.unwrap();

        let received = read_message(&mut server).await.unwrap();
        assert_eq!(received, message);
        assert_eq!(received.typed(), Some(PipeMessageType::Progress));
    }

    #[tokio::test]
    async fn test_truncated_message_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0xF0, 0x00])
            .await
            .unwrap();
        drop(client);
        assert_matches!(
            read_message(&mut server).await,
            Err(PipeError::UnexpectedEof)
        );
    }

    #[tokio::test]
    async fn test_handshake() {
        let (mut parent, mut child) = tokio::io::duplex(1024);
        let parent_task = tokio::spawn(async move {
            handshake_parent(&mut parent, "s3cret", 100).await
        });
        let parent_pid = handshake_child(&mut child, "s3cret", 200).await.unwrap();
        assert_eq!(parent_pid, 100);
        assert_eq!(parent_task.await.unwrap().unwrap(), 200);
    }

    #[tokio::test]
    async fn test_handshake_secret_mismatch() {
        let (mut parent, mut child) = tokio::io::duplex(1024);
        let parent_task =
            tokio::spawn(async move { handshake_parent(&mut parent, "wrong", 100).await });
        assert_matches!(
            handshake_child(&mut child, "right", 200).await,
            Err(PipeError::SecretMismatch)
        );
        drop(parent_task);
    }
}
