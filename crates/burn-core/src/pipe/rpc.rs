//! Synchronous request/response on top of a pipe channel.
//!
//! A request is an ordinary framed message. The reply is not framed: it is
//! `[i32 hresult][u32 size][size bytes]`, exactly one per request.

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::PipeError;
use super::channel::PipeChannel;
use super::frame::{MAX_PAYLOAD_BYTES, PipeMessage, read_full_or_eof};
use crate::BoxFuture;
use crate::hresult::HResult;

/// Reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    pub hresult: HResult,
    pub data: Vec<u8>,
}

impl PipeChannel {
    /// Read one RPC reply. End of stream before the header is `Disconnected`.
    pub async fn read_response(&mut self) -> Result<RpcReply, PipeError> {
        let mut header = [0u8; 8];
        if !read_full_or_eof(&mut self.stream, &mut header).await? {
            return Err(PipeError::Disconnected);
        }
        let hresult = HResult(i32::from_le_bytes([header[0], header[1], header[2], header[3]]));
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if size > MAX_PAYLOAD_BYTES {
            return Err(PipeError::PayloadTooLarge(size as usize));
        }
        let mut data = vec![0u8; size as usize];
        if !read_full_or_eof(&mut self.stream, &mut data).await? {
            return Err(PipeError::Truncated);
        }
        Ok(RpcReply { hresult, data })
    }

    pub async fn write_response(&mut self, hresult: HResult, data: &[u8]) -> Result<(), PipeError> {
        let size = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_BYTES)
            .ok_or(PipeError::PayloadTooLarge(data.len()))?;
        let mut reply = Vec::with_capacity(8 + data.len());
        reply.extend_from_slice(&hresult.0.to_le_bytes());
        reply.extend_from_slice(&size.to_le_bytes());
        reply.extend_from_slice(data);
        self.stream.write_all(&reply).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// A channel shared by callers that each need one request answered.
///
/// The lock is held from writing the request until the reply is read, so
/// at most one request is in flight.
#[derive(Debug)]
pub struct RpcHandle {
    channel: Mutex<PipeChannel>,
}

impl RpcHandle {
    pub fn new(channel: PipeChannel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// Send a request and wait for its reply. A failure code is returned in
    /// the reply, not as an error.
    pub async fn call(&self, message_type: u32, payload: &[u8]) -> Result<RpcReply, PipeError> {
        let mut channel = self.channel.lock().await;
        channel.write_message(message_type, payload).await?;
        let reply = channel.read_response().await?;
        trace!(
            pipe = %channel.label(),
            message_type,
            hresult = %reply.hresult,
            bytes = reply.data.len(),
            "RPC reply"
        );
        Ok(reply)
    }

    /// Like [`call`](Self::call) but turns a failure code into `Remote`.
    pub async fn call_checked(
        &self,
        message_type: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, PipeError> {
        let reply = self.call(message_type, payload).await?;
        if reply.hresult.is_failure() {
            return Err(PipeError::Remote(reply.hresult));
        }
        Ok(reply.data)
    }

    /// Send an orderly disconnect.
    pub async fn disconnect(&self) -> Result<(), PipeError> {
        self.channel.lock().await.disconnect().await
    }
}

/// Answers RPC requests.
pub trait RpcService: Send {
    fn call<'a>(&'a mut self, message: PipeMessage) -> BoxFuture<'a, (HResult, Vec<u8>)>;
}

/// Answer requests until the peer disconnects.
pub async fn serve_rpc<S>(channel: &mut PipeChannel, service: &mut S) -> Result<(), PipeError>
where
    S: RpcService + ?Sized,
{
    while let Some(message) = channel.read_message().await? {
        let message_type = message.message_type;
        let (hresult, data) = service.call(message).await;
        channel.write_response(hresult, &data).await?;
        trace!(pipe = %channel.label(), message_type, %hresult, "RPC answered");
    }
    debug!(pipe = %channel.label(), "RPC peer disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::channel::test_support::channel_pair;

    struct Upper;

    impl RpcService for Upper {
        fn call<'a>(&'a mut self, message: PipeMessage) -> BoxFuture<'a, (HResult, Vec<u8>)> {
            Box::pin(async move {
                if message.message_type == 0 {
                    return (HResult::E_INVALIDARG, Vec::new());
                }
                (HResult::S_OK, message.payload.to_ascii_uppercase())
            })
        }
    }

    #[tokio::test]
    async fn test_call_and_reply() {
        let (client, mut server) = channel_pair();
        let serve = tokio::spawn(async move { serve_rpc(&mut server, &mut Upper).await });

        let handle = RpcHandle::new(client);
        let reply = handle.call(1, b"abc").await.unwrap();
        assert_eq!(reply.hresult, HResult::S_OK);
        assert_eq!(reply.data, b"ABC");

        let err = handle.call_checked(0, b"").await.unwrap_err();
        assert!(matches!(err, PipeError::Remote(hr) if hr == HResult::E_INVALIDARG));

        handle.disconnect().await.unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let (client, mut server) = channel_pair();
        tokio::spawn(async move { serve_rpc(&mut server, &mut Upper).await });

        let handle = std::sync::Arc::new(RpcHandle::new(client));
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let handle = std::sync::Arc::clone(&handle);
            tasks.push(tokio::spawn(async move {
                let payload = vec![b'a' + i; 16];
                let reply = handle.call(1, &payload).await.unwrap();
                assert_eq!(reply.data, vec![b'A' + i; 16]);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_reply_is_disconnect() {
        let (client, server) = channel_pair();
        drop(server);
        let handle = RpcHandle::new(client);
        let err = handle.call(1, b"x").await.unwrap_err();
        assert!(matches!(err, PipeError::Disconnected | PipeError::Io(_)));
    }
}
