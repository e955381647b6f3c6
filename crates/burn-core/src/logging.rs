//! Log forwarding from the elevated companion.
//!
//! The companion installs a [`PipeLogLayer`] on its subscriber. The layer
//! renders each `tracing` event to one line and queues it on a bounded
//! channel; a [`LogDrain`] writes the queued lines to the log pipe, where
//! the engine re-emits them under the `burn::companion` target.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::pipe::{MESSAGE_TYPE_COMPLETE, PipeChannel, PipeError};

/// A `tracing` layer that queues rendered events for the log pipe.
///
/// Events that arrive while the queue is full are counted and reported in
/// the next line that fits.
#[derive(Debug, Clone)]
pub struct PipeLogLayer {
    lines: mpsc::Sender<String>,
    dropped: Arc<AtomicUsize>,
}

/// Receiving end of a [`PipeLogLayer`].
#[derive(Debug)]
pub struct LogDrain {
    lines: mpsc::Receiver<String>,
}

/// Create a layer and its drain with room for `capacity` queued lines.
pub fn pipe_log_layer(capacity: usize) -> (PipeLogLayer, LogDrain) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeLogLayer {
            lines: tx,
            dropped: Arc::new(AtomicUsize::new(0)),
        },
        LogDrain { lines: rx },
    )
}

impl<S: Subscriber> Layer<S> for PipeLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let mut line = format!("{} {}: {}", metadata.level(), metadata.target(), visitor.message);
        line.push_str(&visitor.fields);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            let _ = write!(line, " ({dropped} earlier lines dropped)");
        }
        if self.lines.try_send(line).is_err() {
            self.dropped.fetch_add(dropped + 1, Ordering::Relaxed);
        }
    }
}

/// Collects the message and the remaining fields as `key=value` pairs.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}

impl LogDrain {
    /// Write queued lines to `channel` until `stop` fires, then flush what
    /// is left. Each line waits for the engine's acknowledgement.
    ///
    /// Nothing here logs: a failure would feed back into the queue.
    pub async fn forward(
        mut self,
        channel: &mut PipeChannel,
        mut stop: oneshot::Receiver<()>,
    ) -> Result<(), PipeError> {
        loop {
            tokio::select! {
                line = self.lines.recv() => match line {
                    Some(line) => send_line(channel, &line).await?,
                    None => return Ok(()),
                },
                _ = &mut stop => break,
            }
        }
        while let Ok(line) = self.lines.try_recv() {
            send_line(channel, &line).await?;
        }
        Ok(())
    }
}

async fn send_line(channel: &mut PipeChannel, line: &str) -> Result<(), PipeError> {
    channel.write_log(line).await?;
    match channel.read_message().await? {
        Some(ack) if ack.message_type == MESSAGE_TYPE_COMPLETE => Ok(()),
        Some(_) => Err(PipeError::Malformed("expected log acknowledgement")),
        None => Err(PipeError::Disconnected),
    }
}
