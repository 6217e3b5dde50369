//! Unit tests for the session handle and retry primitive.

use std::time::Duration;

use secrecy::SecretString;
use tokio::time::Instant;

use super::*;
use crate::{
    engine::StreamId,
    session::ChannelEvent,
    loopback::{AUTHENTICATION_FAILED, LoopbackControls, LoopbackEngine},
};

fn fast_config() -> SessionConfig {
    SessionConfig::default()
        .with_timeout(Some(Duration::from_secs(5)))
        .with_wait_slice(Duration::from_millis(20))
}

fn password() -> SecretString {
    SecretString::from("hunter2".to_string())
}

async fn connect(config: SessionConfig) -> anyhow::Result<(Arc<Session<LoopbackEngine>>, Arc<LoopbackControls>)> {
    let engine = LoopbackEngine::new("demo", "hunter2")?;
    let controls = engine.controls();
    let session = Session::establish(engine, config).await?;
    session.authenticate_password("demo", &password()).await?;
    Ok((session, controls))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_handshake_is_retried_until_ready() -> anyhow::Result<()> {
    let engine = LoopbackEngine::new("demo", "hunter2")?;
    let controls = engine.controls();
    controls.stall_handshake(3);
    let session = Session::establish(engine, fast_config()).await?;
    assert!(session.is_connected());
    assert!(!session.is_authenticated());
    assert_eq!(controls.handshake_attempts(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_handshake_times_out_near_deadline() -> anyhow::Result<()> {
    let engine = LoopbackEngine::new("demo", "hunter2")?;
    engine.controls().block_handshake(true);
    let config = fast_config().with_timeout(Some(Duration::from_millis(200)));
    let started = Instant::now();
    let err = Session::establish(engine, config).await.err().expect("handshake must time out");
    let elapsed = started.elapsed();
    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert!(elapsed >= Duration::from_millis(200), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "overshot deadline: {elapsed:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_password_reports_engine_error() -> anyhow::Result<()> {
    let engine = LoopbackEngine::new("demo", "hunter2")?;
    let session = Session::establish(engine, fast_config()).await?;
    let err = session
        .authenticate_password("demo", &SecretString::from("wrong".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Engine { code, .. } if code == AUTHENTICATION_FAILED));
    assert!(!session.is_authenticated());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retrying_honours_deadline() -> anyhow::Result<()> {
    let (session, _) = connect(fast_config()).await?;
    let started = Instant::now();
    let deadline = started + Duration::from_millis(150);
    let result = session
        .retrying(Some(deadline), None, |_| Attempt::<()>::WouldBlock, Attempt::is_would_block)
        .await;
    assert!(matches!(result, Err(SessionError::Timeout)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(600), "overshot deadline: {elapsed:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retrying_stops_on_cancel_within_a_slice() -> anyhow::Result<()> {
    let (session, _) = connect(fast_config()).await?;
    let flag = CancelFlag::new();
    let trigger = flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let result = session
        .retrying(None, Some(&flag), |_| Attempt::<()>::WouldBlock, Attempt::is_would_block)
        .await;
    assert!(matches!(result, Err(SessionError::Cancelled)));
    assert!(started.elapsed() < Duration::from_millis(500));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retrying_returns_first_non_retry_result() -> anyhow::Result<()> {
    let (session, _) = connect(fast_config()).await?;
    let mut calls = 0;
    let value = session
        .retrying(
            None,
            None,
            |_| {
                calls += 1;
                calls
            },
            |calls| *calls < 3,
        )
        .await?;
    assert_eq!(value, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_streams_output_and_exit_status() -> anyhow::Result<()> {
    let (session, _) = connect(fast_config()).await?;

    let mut started = false;
    let mut stdout = Vec::new();
    let status = session
        .execute("echo hello there", None, None, |event| match event {
            ChannelEvent::Started => started = true,
            ChannelEvent::Output(stream, chunk) => {
                assert!(started, "output before start");
                assert_eq!(stream, StreamId::Stdout);
                stdout.extend_from_slice(chunk);
            }
        })
        .await?;
    assert!(started);
    assert_eq!(status, 0);
    assert_eq!(stdout, b"hello there\n");

    let mut stderr = Vec::new();
    let status = session
        .execute("fail 2 no such file", None, None, |event| {
            if let ChannelEvent::Output(StreamId::Stderr, chunk) = event {
                stderr.extend_from_slice(chunk);
            }
        })
        .await?;
    assert_eq!(status, 2);
    assert_eq!(stderr, b"no such file\n");

    let status = session.execute("definitely-missing", None, None, |_| {}).await?;
    assert_eq!(status, 127);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_stops_within_a_slice_of_cancel() -> anyhow::Result<()> {
    let (session, _) = connect(fast_config()).await?;
    let cancel = CancelFlag::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let started = Instant::now();
    let err = session
        .execute("cat", Some(Duration::from_secs(5)), Some(&cancel), |_| {})
        .await
        .unwrap_err();
    trigger.await?;
    assert!(matches!(err, SessionError::Cancelled), "unexpected {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));

    let status = session.execute("echo again", None, None, |_| {}).await?;
    assert_eq!(status, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terse_engine_faults_fall_back_to_last_error() -> anyhow::Result<()> {
    let engine = LoopbackEngine::new("demo", "hunter2")?;
    let controls = engine.controls();
    controls.terse_faults(true);
    let session = Session::establish(engine, fast_config()).await?;
    let err = session
        .authenticate_password("demo", &SecretString::from("wrong".to_string()))
        .await
        .unwrap_err();
    match err {
        SessionError::Engine { code, message } => {
            assert_eq!(code, AUTHENTICATION_FAILED);
            assert_eq!(message, "password rejected for demo");
        }
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_is_idempotent_and_blocks_new_work() -> anyhow::Result<()> {
    let (session, _) = connect(fast_config()).await?;
    session.disconnect();
    session.disconnect();
    assert!(!session.is_connected());
    assert!(!session.is_authenticated());
    assert!(matches!(session.open_channel().await, Err(SessionError::Disconnected)));
    assert!(matches!(session.send_keepalive().await, Err(SessionError::Disconnected)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keepalives_are_sent_on_interval() -> anyhow::Result<()> {
    let config = fast_config().with_keepalive(Duration::from_millis(20), 3);
    let (session, controls) = connect(config).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(controls.keepalives_sent() >= 2);
    assert!(session.is_connected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_keepalives_disconnect_after_tolerance() -> anyhow::Result<()> {
    let config = fast_config().with_keepalive(Duration::from_millis(20), 2);
    let (session, controls) = connect(config).await?;
    controls.fail_keepalives(true);
    tokio::time::timeout(Duration::from_secs(3), async {
        while session.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert!(!session.is_connected());
    Ok(())
}
