//! The embedded-bundle message loop. A bundle launched with `-embedded`
//! connects back to its parent bundle over the pipe, verifies the handshake
//! secret, then serves messages until the parent terminates it. The
//! synchronous variant reports completion through a `Complete` message; the
//! async variant is fire-and-forget and the parent never waits.

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::pipe::{
    handshake_child, read_message, write_message, PipeError, PipeMessage, PipeMessageType,
};

/// Handles the parent's requests inside the embedded child.
#[async_trait]
pub trait EmbeddedHandler: Send + Sync {
    /// Handles one message and returns the result code reported back
    /// through `Complete`.
    async fn handle(&self, message: &PipeMessage) -> u32;
}

/// Runs the child side of the embedded protocol to completion: handshake,
/// message loop, terminate. Returns the final result code the parent sent
/// with `Terminate`, or zero when the stream just closed.
pub async fn run_embedded_child<RW, H>(
    stream: &mut RW,
    secret: &str,
    own_pid: u32,
    handler: &H,
) -> Result<u32, PipeError>
where
    RW: AsyncRead + AsyncWrite + Unpin + Send,
    H: EmbeddedHandler,
{
    let parent_pid = handshake_child(stream, secret, own_pid).await?;
    tracing::debug!(parent_pid, "embedded child connected");

    loop {
        let message = match read_message(stream).await {
            Ok(message) => message,
            Err(PipeError::UnexpectedEof) => return Ok(0),
            Err(err) => return Err(err),
        };

        match message.typed() {
            Some(PipeMessageType::Terminate) => {
                let code = if message.data.len() >= 4 {
                    let mut data = message.data.as_slice();
                    data.get_u32_le()
                } else {
                    0
                };
                tracing::debug!(code, "embedded child terminating");
                return Ok(code);
            }
            _ => {
                let result = handler.handle(&message).await;
                let mut data = BytesMut::with_capacity(4);
                data.put_u32_le(result);
                write_message(
                    stream,
                    &PipeMessage::new(PipeMessageType::Complete, data.to_vec()),
                )
                .await?;
            }
        }
    }
}

/// Parent-side helper: asks an embedded child to exit with a result code.
pub async fn terminate_embedded_child<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    code: u32,
) -> Result<(), PipeError> {
    let mut data = BytesMut::with_capacity(4);
    data.put_u32_le(code);
    write_message(
        writer,
        &PipeMessage::new(PipeMessageType::Terminate, data.to_vec()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::pipe::{
        handshake_parent, read_message, write_message, PipeMessage, PipeMessageType,
    };

    use super::{run_embedded_child, terminate_embedded_child, EmbeddedHandler};

    struct EchoHandler;

    #[async_trait]
    impl EmbeddedHandler for EchoHandler {
        async fn handle(&self, message: &PipeMessage) -> u32 {
            message.data.len() as u32
        }
    }

    #[tokio::test]
    async fn test_embedded_roundtrip() {
        let (mut parent, mut child) = tokio::io::duplex(4096);

        let child_task = tokio::spawn(async move {
            run_embedded_child(&mut child, "secret", 55, &EchoHandler).await
        });

        let child_pid = handshake_parent(&mut parent, "secret", 44).await.unwrap();
        assert_eq!(child_pid, 55);

        // A request is answered with Complete carrying the handler result.
        write_message(
            &mut parent,
            &PipeMessage::new(PipeMessageType::Progress, vec![1, 2, 3]),
        )
        .await
        .unwrap();
        let reply = read_message(&mut parent).await.unwrap();
        assert_eq!(reply.typed(), Some(PipeMessageType::Complete));
        assert_eq!(reply.data, 3u32.to_le_bytes().to_vec());

        terminate_embedded_child(&mut parent, 7).await.unwrap();
        assert_eq!(child_task.await.unwrap().unwrap(), 7);
    }
}
