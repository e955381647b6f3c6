//! An application in another process, reached over the callback pipe.

use tracing::{trace, warn};

use super::events::{BaEvent, BaReply, BootstrapperApplication};
use super::protocol::MESSAGE_TYPE_BA_EVENT;
use crate::BoxFuture;
use crate::pipe::{PipeChannel, PipeError, RpcHandle};

/// Sends each callback as one RPC and parses the reply.
///
/// A callback that cannot be delivered or answered is treated as a cancel,
/// so a vanished application stops the engine instead of letting it run on
/// unattended.
#[derive(Debug)]
pub struct RemoteBa {
    rpc: RpcHandle,
}

impl RemoteBa {
    pub fn new(channel: PipeChannel) -> Self {
        Self {
            rpc: RpcHandle::new(channel),
        }
    }

    async fn send(&self, event: &BaEvent) -> Result<BaReply, PipeError> {
        let payload = serde_json::to_vec(event)?;
        let data = self.rpc.call_checked(MESSAGE_TYPE_BA_EVENT, &payload).await?;
        if data.is_empty() {
            return Ok(BaReply::default());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    /// Tell the application no more callbacks are coming.
    pub async fn disconnect(&self) -> Result<(), PipeError> {
        self.rpc.disconnect().await
    }
}

impl BootstrapperApplication for RemoteBa {
    fn on_event(&self, event: BaEvent) -> BoxFuture<'_, BaReply> {
        Box::pin(async move {
            match self.send(&event).await {
                Ok(reply) => {
                    trace!(event = event.name(), cancel = reply.wants_cancel(), "Callback answered");
                    reply
                }
                Err(e) => {
                    warn!(event = event.name(), error = %e, "Callback failed; treating as cancel");
                    BaReply::cancel()
                }
            }
        })
    }
}
