//! Pipe sessions between an engine and its peers.

use std::time::Duration;

use burn_core::BoxFuture;
use burn_core::elevation::companion::connect_to_parent;
use burn_core::elevation::{CompanionArgs, ElevationError};
use burn_core::hresult::HResult;
use burn_core::pipe::{
    MessageHandler, NoopHandler, PipeChannel, PipeError, PipeListener, PipeMessage, PumpOutcome,
    Unwatched, wait_for_client,
};
use burn_test_utils::{ba_pipe_pair, init_test_tracing, pipe_pair};
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

/// Answers every message with its payload length.
struct Length;

impl MessageHandler for Length {
    fn handle<'a>(
        &'a mut self,
        _channel: &'a mut PipeChannel,
        message: PipeMessage,
    ) -> BoxFuture<'a, Result<u32, PipeError>> {
        Box::pin(async move { Ok(message.payload.len() as u32) })
    }
}

#[tokio::test]
async fn test_terminate_ends_the_peer_pump() {
    init_test_tracing();
    let (mut engine, mut peer) = pipe_pair("s3cret").await;
    let pump = tokio::spawn(async move { peer.pump_messages(&mut NoopHandler).await });

    engine.write_terminate(1603, true).await.unwrap();

    assert_eq!(pump.await.unwrap().unwrap(), PumpOutcome::Terminate {
        exit_code: 1603,
        restart: true,
    });
}

#[tokio::test]
async fn test_messages_complete_with_the_handler_result() {
    init_test_tracing();
    let (mut engine, mut peer) = pipe_pair("s3cret").await;
    let pump = tokio::spawn(async move { peer.pump_messages(&mut Length).await });

    let result = engine
        .send_message(0x42, b"four", &mut NoopHandler)
        .await
        .unwrap();
    assert_eq!(result, 4);

    engine.write_terminate(0, false).await.unwrap();
    assert!(matches!(
        pump.await.unwrap().unwrap(),
        PumpOutcome::Terminate { exit_code: 0, .. }
    ));
}

#[tokio::test]
async fn test_dropped_engine_disconnects_the_peer() {
    init_test_tracing();
    let (engine, mut peer) = pipe_pair("s3cret").await;
    drop(engine);
    assert_eq!(
        peer.pump_messages(&mut NoopHandler).await.unwrap(),
        PumpOutcome::Disconnected
    );
}

#[tokio::test]
async fn test_application_with_wrong_secret_is_rejected() {
    init_test_tracing();
    let (a, b) = tokio::io::duplex(4096);
    let engine = PipeChannel::new(Box::new(a), "engine").verify_presented_secret("right", 1);
    let application = PipeChannel::new(Box::new(b), "ui").present_secret("wrong", 2);
    let (engine, application) = tokio::join!(engine, application);

    assert!(matches!(engine, Err(PipeError::SecretMismatch)));
    assert!(matches!(
        application,
        Err(PipeError::HandshakeRejected(hr)) if hr == HResult::INVALID_DATA
    ));

    let (engine, application) = ba_pipe_pair("right").await;
    assert_eq!(engine.peer_pid(), burn_test_utils::pipe::PEER_PID);
    assert_eq!(application.peer_pid(), burn_test_utils::pipe::ENGINE_PID);
}

#[cfg(unix)]
#[tokio::test]
async fn test_companion_with_wrong_secret_never_connects() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut listener = PipeListener::bind(dir.path(), "burn.wrong").unwrap();
    let args = CompanionArgs {
        pipe: "burn.wrong".into(),
        directory: dir.path().to_path_buf(),
        secret: Zeroizing::new("guess".into()),
        parent_pid: 1,
    };
    let companion = tokio::spawn(async move { connect_to_parent(&args).await });

    let stream = wait_for_client(&mut listener, &mut Unwatched, 100, Duration::from_millis(10))
        .await
        .unwrap();
    let engine = PipeChannel::new(stream, "burn.wrong")
        .offer_secret("actual", 1)
        .await;

    assert!(engine.is_err());
    assert!(matches!(
        companion.await.unwrap(),
        Err(ElevationError::Pipe(PipeError::SecretMismatch))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_oversized_secret_is_refused_before_reading_it() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut listener = PipeListener::bind(dir.path(), "burn.big").unwrap();
    let args = CompanionArgs {
        pipe: "burn.big".into(),
        directory: dir.path().to_path_buf(),
        secret: Zeroizing::new("s3cret".into()),
        parent_pid: 1,
    };
    let companion = tokio::spawn(async move { connect_to_parent(&args).await });

    let mut stream = wait_for_client(&mut listener, &mut Unwatched, 100, Duration::from_millis(10))
        .await
        .unwrap();
    stream.write_all(&100_000u32.to_le_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    assert!(matches!(
        companion.await.unwrap(),
        Err(ElevationError::Pipe(PipeError::SecretTooLong(100_000)))
    ));
}
