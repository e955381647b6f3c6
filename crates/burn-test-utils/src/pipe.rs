//! Authenticated in-memory pipes.
//!
//! Both helpers run the real handshake over a tokio `duplex`, so a test gets
//! channels in the same state the engine would after connecting.

use burn_core::pipe::PipeChannel;

/// Buffer size of each direction of the duplex.
const DUPLEX_CAPACITY: usize = 64 * 1024;

pub const ENGINE_PID: u32 = 100;
pub const PEER_PID: u32 = 200;

/// A companion-style pair: the engine offers `secret`, the peer accepts it.
/// Returns `(engine, peer)`.
pub async fn pipe_pair(secret: &str) -> (PipeChannel, PipeChannel) {
    let (a, b) = tokio::io::duplex(DUPLEX_CAPACITY);
    let engine = PipeChannel::new(Box::new(a), "test.engine").offer_secret(secret, ENGINE_PID);
    let peer = PipeChannel::new(Box::new(b), "test.peer").accept_offered_secret(secret, PEER_PID);
    let (engine, peer) = tokio::join!(engine, peer);
    (
        engine.expect("engine side of handshake failed"),
        peer.expect("peer side of handshake failed"),
    )
}

/// An application-style pair: the application presents `secret` and the
/// engine verifies it. Returns `(engine, application)`.
pub async fn ba_pipe_pair(secret: &str) -> (PipeChannel, PipeChannel) {
    let (a, b) = tokio::io::duplex(DUPLEX_CAPACITY);
    let engine =
        PipeChannel::new(Box::new(a), "test.engine").verify_presented_secret(secret, ENGINE_PID);
    let application =
        PipeChannel::new(Box::new(b), "test.application").present_secret(secret, PEER_PID);
    let (engine, application) = tokio::join!(engine, application);
    (
        engine.expect("engine side of handshake failed"),
        application.expect("application side of handshake failed"),
    )
}
