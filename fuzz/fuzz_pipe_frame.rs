//! Fuzz target for the pipe frame reader and the handshake.
//!
//! Run with: cargo +nightly fuzz run fuzz_pipe_frame
//!
//! Feeds arbitrary bytes to `read_message` until the stream is exhausted or
//! rejected, then to the companion side of the secret handshake.

#![no_main]

use burn_core::pipe::PipeChannel;
use burn_core::pipe::frame::read_message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    rt.block_on(async {
        let mut reader = data;
        while let Ok(Some(message)) = read_message(&mut reader).await {
            let _ = message.reader().u32();
        }

        let (mut ours, theirs) = tokio::io::duplex(64 * 1024);
        let peer = PipeChannel::new(Box::new(theirs), "fuzz").accept_offered_secret("secret", 1);
        let feed = async {
            use tokio::io::AsyncWriteExt;
            let _ = ours.write_all(data).await;
            let _ = ours.shutdown().await;
        };
        let (_, _) = tokio::join!(peer, feed);
    });
});
