//! Authenticated pipe channels and the message pump.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::PipeError;
use super::frame::{
    self, MESSAGE_TYPE_COMPLETE, MESSAGE_TYPE_DISCONNECT, MESSAGE_TYPE_LOG,
    MESSAGE_TYPE_TERMINATE, PayloadWriter, PipeMessage,
};
use crate::BoxFuture;
use crate::hresult::HResult;

/// Any bidirectional byte stream usable as a pipe.
pub trait PipeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PipeStream for T {}

pub type BoxedStream = Box<dyn PipeStream>;

/// Type-state: the secret handshake has not completed.
#[derive(Debug)]
pub struct Unauthenticated;

/// Type-state: the peer proved knowledge of the secret.
#[derive(Debug)]
pub struct Authenticated {
    peer_pid: u32,
}

/// One end of a pipe connection.
///
/// Only `PipeChannel<Authenticated>` can read or write application
/// messages; an unauthenticated channel can only run a handshake.
pub struct PipeChannel<S = Authenticated> {
    pub(super) stream: BoxedStream,
    label: String,
    state: S,
}

impl<S> std::fmt::Debug for PipeChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeChannel")
            .field("label", &self.label)
            .finish()
    }
}

impl<S> PipeChannel<S> {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PipeChannel<Unauthenticated> {
    /// Wrap a freshly connected stream.
    pub fn new(stream: BoxedStream, label: impl Into<String>) -> Self {
        Self {
            stream,
            label: label.into(),
            state: Unauthenticated,
        }
    }

    pub(super) fn into_authenticated(self, peer_pid: u32) -> PipeChannel<Authenticated> {
        debug!(pipe = %self.label, peer_pid, "Pipe authenticated");
        PipeChannel {
            stream: self.stream,
            label: self.label,
            state: Authenticated { peer_pid },
        }
    }
}

/// How a pump loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The peer completed the message in flight with this result.
    Complete(u32),
    /// The peer ended the session.
    Terminate { exit_code: u32, restart: bool },
    /// The stream closed between messages.
    Disconnected,
}

/// Handles application messages received while pumping.
///
/// The returned value is sent back to the peer in a `COMPLETE` message.
/// The handler gets the channel so it can send nested messages of its own.
pub trait MessageHandler: Send {
    fn handle<'a>(
        &'a mut self,
        channel: &'a mut PipeChannel,
        message: PipeMessage,
    ) -> BoxFuture<'a, Result<u32, PipeError>>;
}

/// Rejects every application message with `E_NOTIMPL`.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {
    fn handle<'a>(
        &'a mut self,
        channel: &'a mut PipeChannel,
        message: PipeMessage,
    ) -> BoxFuture<'a, Result<u32, PipeError>> {
        Box::pin(async move {
            warn!(
                pipe = %channel.label(),
                message_type = message.message_type,
                "Unexpected message"
            );
            Ok(HResult::E_NOTIMPL.as_u32())
        })
    }
}

impl PipeChannel<Authenticated> {
    /// Process id the peer reported during the handshake (0 when unknown).
    pub fn peer_pid(&self) -> u32 {
        self.state.peer_pid
    }

    pub async fn write_message(
        &mut self,
        message_type: u32,
        payload: &[u8],
    ) -> Result<(), PipeError> {
        frame::write_message(&mut self.stream, message_type, payload).await
    }

    /// Read the next message; `None` at end of stream.
    pub async fn read_message(&mut self) -> Result<Option<PipeMessage>, PipeError> {
        frame::read_message(&mut self.stream).await
    }

    pub async fn write_complete(&mut self, result: u32) -> Result<(), PipeError> {
        let payload = PayloadWriter::new().u32(result).finish();
        self.write_message(MESSAGE_TYPE_COMPLETE, &payload).await
    }

    pub async fn write_terminate(&mut self, exit_code: u32, restart: bool) -> Result<(), PipeError> {
        let payload = PayloadWriter::new()
            .u32(exit_code)
            .u32(u32::from(restart))
            .finish();
        self.write_message(MESSAGE_TYPE_TERMINATE, &payload).await
    }

    /// Forward a log line to the peer.
    pub async fn write_log(&mut self, line: &str) -> Result<(), PipeError> {
        self.write_message(MESSAGE_TYPE_LOG, line.as_bytes()).await
    }

    /// Announce an orderly disconnect.
    pub async fn disconnect(&mut self) -> Result<(), PipeError> {
        self.write_message(MESSAGE_TYPE_DISCONNECT, &[]).await
    }

    /// Read and dispatch messages until the peer completes, terminates or
    /// disconnects.
    ///
    /// `LOG` messages are written to the local log and acknowledged here;
    /// every other message goes to `handler` and its result is sent back.
    pub async fn pump_messages<H>(&mut self, handler: &mut H) -> Result<PumpOutcome, PipeError>
    where
        H: MessageHandler + ?Sized,
    {
        loop {
            let Some(message) = self.read_message().await? else {
                debug!(pipe = %self.label(), "Pipe disconnected");
                return Ok(PumpOutcome::Disconnected);
            };
            match message.message_type {
                MESSAGE_TYPE_COMPLETE => {
                    let result = message
                        .reader()
                        .u32()
                        .ok_or(PipeError::Malformed("complete without result"))?;
                    return Ok(PumpOutcome::Complete(result));
                }
                MESSAGE_TYPE_TERMINATE => {
                    let mut reader = message.reader();
                    let exit_code = reader
                        .u32()
                        .ok_or(PipeError::Malformed("terminate without exit code"))?;
                    let restart = reader.u32().is_some_and(|r| r != 0);
                    debug!(pipe = %self.label(), exit_code, restart, "Pipe terminated");
                    return Ok(PumpOutcome::Terminate { exit_code, restart });
                }
                MESSAGE_TYPE_LOG => {
                    let line = String::from_utf8_lossy(&message.payload);
                    info!(target: "burn::companion", "{}", line.trim_end());
                    self.write_complete(HResult::S_OK.as_u32()).await?;
                }
                _ => {
                    let result = handler.handle(self, message).await?;
                    self.write_complete(result).await?;
                }
            }
        }
    }

    /// Write a message and pump until the peer completes it.
    pub async fn send_message<H>(
        &mut self,
        message_type: u32,
        payload: &[u8],
        handler: &mut H,
    ) -> Result<u32, PipeError>
    where
        H: MessageHandler + ?Sized,
    {
        self.write_message(message_type, payload).await?;
        match self.pump_messages(handler).await? {
            PumpOutcome::Complete(result) => Ok(result),
            PumpOutcome::Terminate { exit_code, .. } => Err(PipeError::Terminated { exit_code }),
            PumpOutcome::Disconnected => Err(PipeError::Disconnected),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Two already-authenticated channels joined by an in-memory duplex.
    pub(crate) fn channel_pair() -> (PipeChannel, PipeChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            PipeChannel::new(Box::new(a), "a").into_authenticated(2),
            PipeChannel::new(Box::new(b), "b").into_authenticated(1),
        )
    }
}
