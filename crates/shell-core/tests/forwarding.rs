//! Integration tests for local and remote forwarding over the loopback engine.
//!
//! Every test binds ephemeral localhost ports, so they can run in parallel.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use secrecy::SecretString;
use shell_core::{
    ForwardExit,
    ForwardKind,
    LocalForwardSpec,
    RemoteForwardSpec,
    Session,
    SessionConfig,
    SessionError,
    loopback::LoopbackEngine,
};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    time::{Instant, sleep, timeout},
};

const TRANSFER_LIMIT: Duration = Duration::from_secs(30);

async fn connect() -> Result<Arc<Session<LoopbackEngine>>> {
    let config = SessionConfig::default()
        .with_timeout(Some(Duration::from_secs(5)))
        .with_wait_slice(Duration::from_millis(25));
    let session = Session::establish(LoopbackEngine::new("demo", "hunter2")?, config).await?;
    session
        .authenticate_password("demo", &SecretString::from("hunter2".to_string()))
        .await?;
    Ok(session)
}

async fn spawn_echo_server() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(port)
}

/// Accepts connections and answers every `PING` with `PONG`.
async fn spawn_pong_server() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                while stream.read_exact(&mut buf).await.is_ok() {
                    if &buf == b"PING" && stream.write_all(b"PONG").await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(port)
}

/// Streams `total` bytes to each connection, `chunk` bytes at a time.
async fn spawn_source_server(total: usize, chunk: usize) -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let block = vec![0x5au8; chunk];
                let mut sent = 0;
                while sent < total {
                    let len = chunk.min(total - sent);
                    if stream.write_all(&block[..len]).await.is_err() {
                        break;
                    }
                    sent += len;
                }
            });
        }
    });
    Ok(port)
}

/// A listener that never accepts, with its backlog already full, so a
/// further connect stalls in the handshake. The queued streams must be kept
/// alive alongside the listener.
async fn saturated_listener() -> Result<(TcpListener, Vec<TcpStream>)> {
    let socket = TcpSocket::new_v4()?;
    socket.bind("127.0.0.1:0".parse()?)?;
    let listener = socket.listen(0)?;
    let port = listener.local_addr()?.port();
    let mut queued = Vec::new();
    for _ in 0..8 {
        match timeout(Duration::from_millis(200), TcpStream::connect(("127.0.0.1", port))).await {
            Ok(stream) => queued.push(stream?),
            Err(_) => break,
        }
    }
    Ok((listener, queued))
}

fn closed_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// Send `data` and read back the same number of bytes without half-closing.
async fn round_trip(port: u16, data: Vec<u8>) -> Result<Vec<u8>> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (mut reader, mut writer) = stream.into_split();
    let expected = data.len();
    let send = tokio::spawn(async move { writer.write_all(&data).await.map(|()| writer) });
    let mut received = Vec::with_capacity(expected);
    let mut buf = vec![0u8; 64 * 1024];
    while received.len() < expected {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Err(anyhow!("connection closed after {} of {expected} bytes", received.len()));
        }
        received.extend_from_slice(&buf[..read]);
    }
    let _writer = send.await??;
    Ok(received)
}

/// Listener teardown runs on the runtime, so allow it a moment to land.
async fn refuses_connections(port: u16) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn read_until_eof(stream: &mut TcpStream) -> Result<usize> {
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return Ok(total),
            Ok(read) => total += read,
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => return Ok(total),
            Err(err) => return Err(err.into()),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_forward_ping_pong() -> Result<()> {
    let session = connect().await?;
    let target = spawn_pong_server().await?;
    let handle = session
        .start_local_forward(LocalForwardSpec::new(0, "127.0.0.1", target))
        .await?;
    assert_eq!(handle.kind(), ForwardKind::Local);
    assert_ne!(handle.bound_port(), 0);
    assert_eq!(session.forwards().len(), 1);

    let mut client = TcpStream::connect(("127.0.0.1", handle.bound_port())).await?;
    for _ in 0..3 {
        client.write_all(b"PING").await?;
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf)).await??;
        assert_eq!(&buf, b"PONG");
    }

    handle.cancel();
    assert_eq!(timeout(Duration::from_secs(2), handle.wait()).await?, ForwardExit::Cancelled);
    assert!(session.forwards().is_empty());
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_to_remote_round_trip_preserves_bytes() -> Result<()> {
    let session = connect().await?;
    let echo = spawn_echo_server().await?;
    let remote = session
        .start_remote_forward(RemoteForwardSpec::new(0, "127.0.0.1", echo))
        .await?;
    assert_eq!(remote.kind(), ForwardKind::Remote);
    assert_ne!(remote.bound_port(), 0);
    let local = session
        .start_local_forward(LocalForwardSpec::new(0, "127.0.0.1", remote.bound_port()))
        .await?;

    for size in [0, 1, 65_543, 4 * 1024 * 1024, 24 * 1024 * 1024] {
        let data = payload(size);
        let received = timeout(TRANSFER_LIMIT, round_trip(local.bound_port(), data.clone())).await??;
        assert_eq!(received.len(), size);
        assert!(received == data, "payload of {size} bytes corrupted");
    }

    local.cancel();
    remote.cancel();
    assert_eq!(timeout(Duration::from_secs(2), local.wait()).await?, ForwardExit::Cancelled);
    assert_eq!(timeout(Duration::from_secs(2), remote.wait()).await?, ForwardExit::Cancelled);
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_directions_progress_concurrently() -> Result<()> {
    const TOTAL: usize = 8 * 1024 * 1024;
    // Largest lead one direction may build while the other moves nothing.
    const MAX_LEAD: usize = TOTAL / 2;
    let session = connect().await?;
    let uploaded = Arc::new(AtomicUsize::new(0));
    let downloaded = Arc::new(AtomicUsize::new(0));

    // Target sends TOTAL bytes while draining TOTAL bytes from the client.
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let target = listener.local_addr()?.port();
    let server = {
        let uploaded = uploaded.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let (mut reader, mut writer) = stream.into_split();
            let send = tokio::spawn(async move {
                writer.write_all(&payload(TOTAL)).await?;
                Ok::<_, std::io::Error>(writer)
            });
            let mut sink = vec![0u8; 64 * 1024];
            loop {
                let read = reader.read(&mut sink).await?;
                if read == 0 || uploaded.fetch_add(read, Ordering::SeqCst) + read >= TOTAL {
                    break;
                }
            }
            let _writer = send.await??;
            Ok::<_, anyhow::Error>(())
        })
    };

    let handle = session
        .start_local_forward(LocalForwardSpec::new(0, "127.0.0.1", target))
        .await?;
    let client = TcpStream::connect(("127.0.0.1", handle.bound_port())).await?;
    let (mut reader, mut writer) = client.into_split();
    let upload = tokio::spawn(async move {
        writer.write_all(&payload(TOTAL)).await?;
        Ok::<_, std::io::Error>(writer)
    });
    let download = {
        let downloaded = downloaded.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let read = reader.read(&mut buf).await?;
                if read == 0 || downloaded.fetch_add(read, Ordering::SeqCst) + read >= TOTAL {
                    break;
                }
            }
            Ok::<_, std::io::Error>(())
        })
    };

    // Sample both counters until both directions finish.
    let mut samples = Vec::new();
    let sampling = async {
        loop {
            let up = uploaded.load(Ordering::SeqCst);
            let down = downloaded.load(Ordering::SeqCst);
            samples.push((up, down));
            if up >= TOTAL && down >= TOTAL {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(TRANSFER_LIMIT, sampling).await?;
    timeout(TRANSFER_LIMIT, download).await???;
    timeout(TRANSFER_LIMIT, server).await???;
    let _writer = upload.await??;
    assert_eq!(uploaded.load(Ordering::SeqCst), TOTAL);
    assert_eq!(downloaded.load(Ordering::SeqCst), TOTAL);

    // While both directions are unfinished, neither may stall while the
    // other runs far ahead.
    let (mut up_mark, mut down_mark) = ((0, 0), (0, 0));
    for &(up, down) in &samples {
        if up != up_mark.0 {
            up_mark = (up, down);
        }
        if down != down_mark.0 {
            down_mark = (down, up);
        }
        if up < TOTAL && down < TOTAL {
            assert!(down - up_mark.1 <= MAX_LEAD, "upload stalled at {up} while download reached {down}");
            assert!(up - down_mark.1 <= MAX_LEAD, "download stalled at {down} while upload reached {up}");
        }
    }
    let first_done = samples
        .iter()
        .find(|(up, down)| *up >= TOTAL || *down >= TOTAL)
        .copied()
        .ok_or_else(|| anyhow!("no sample saw a finished direction"))?;
    assert!(
        first_done.0.min(first_done.1) >= TOTAL / 8,
        "one direction finished before the other moved: {first_done:?}"
    );

    handle.cancel();
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_local_forward_refuses_connections() -> Result<()> {
    let session = connect().await?;
    let echo = spawn_echo_server().await?;
    let handle = session
        .start_local_forward(LocalForwardSpec::new(0, "127.0.0.1", echo))
        .await?;
    let port = handle.bound_port();
    assert_eq!(timeout(TRANSFER_LIMIT, round_trip(port, b"hello".to_vec())).await??, b"hello");

    let started = Instant::now();
    handle.cancel();
    assert_eq!(timeout(Duration::from_secs(2), handle.wait()).await?, ForwardExit::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(refuses_connections(port).await);
    assert!(session.is_connected());
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_remote_forward_cuts_large_transfer_short() -> Result<()> {
    const TOTAL: usize = 32 * 1024 * 1024;
    let session = connect().await?;
    let source = spawn_source_server(TOTAL, 64 * 1024).await?;
    let handle = session
        .start_remote_forward(RemoteForwardSpec::new(0, "127.0.0.1", source))
        .await?;

    let mut client = TcpStream::connect(("127.0.0.1", handle.bound_port())).await?;
    let reader = tokio::spawn(async move {
        // Read slowly so the transfer cannot finish before the cancel lands.
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0usize;
        loop {
            match client.read(&mut buf).await {
                Ok(0) | Err(_) => return total,
                Ok(read) => total += read,
            }
            sleep(Duration::from_millis(10)).await;
        }
    });

    sleep(Duration::from_millis(500)).await;
    let cancelled_at = Instant::now();
    handle.cancel();
    assert_eq!(timeout(Duration::from_secs(2), handle.wait()).await?, ForwardExit::Cancelled);

    let received = timeout(Duration::from_secs(10), reader).await??;
    assert!(received > 0, "no data arrived before cancel");
    assert!(received < TOTAL, "transfer was not interrupted");
    assert!(cancelled_at.elapsed() < Duration::from_secs(10));
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_lands_while_remote_target_connect_stalls() -> Result<()> {
    let session = connect().await?;
    let (target, _queued) = saturated_listener().await?;
    let handle = session
        .start_remote_forward(RemoteForwardSpec::new(0, "127.0.0.1", target.local_addr()?.port()))
        .await?;

    let _client = TcpStream::connect(("127.0.0.1", handle.bound_port())).await?;
    // Let the accept loop take the channel and start connecting.
    sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());

    let started = Instant::now();
    handle.cancel();
    assert_eq!(timeout(Duration::from_secs(3), handle.wait()).await?, ForwardExit::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1), "cancel took {:?}", started.elapsed());
    assert!(session.forwards().is_empty());
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_lands_while_remote_target_connect_stalls() -> Result<()> {
    let session = connect().await?;
    let (target, _queued) = saturated_listener().await?;
    let handle = session
        .start_remote_forward(RemoteForwardSpec::new(0, "127.0.0.1", target.local_addr()?.port()))
        .await?;

    let _client = TcpStream::connect(("127.0.0.1", handle.bound_port())).await?;
    sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    session.disconnect();
    let exit = timeout(Duration::from_secs(3), handle.wait()).await?;
    assert!(matches!(exit, ForwardExit::Cancelled | ForwardExit::SessionClosed), "unexpected {exit:?}");
    assert!(started.elapsed() < Duration::from_secs(1), "disconnect took {:?}", started.elapsed());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_local_target_drops_client_only() -> Result<()> {
    let session = connect().await?;
    let handle = session
        .start_local_forward(LocalForwardSpec::new(0, "127.0.0.1", closed_port()?))
        .await?;

    let mut client = TcpStream::connect(("127.0.0.1", handle.bound_port())).await?;
    let read = timeout(Duration::from_secs(5), read_until_eof(&mut client)).await??;
    assert_eq!(read, 0);
    assert!(!handle.is_finished());

    handle.cancel();
    assert_eq!(timeout(Duration::from_secs(2), handle.wait()).await?, ForwardExit::Cancelled);
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_remote_target_closes_forwarded_channel() -> Result<()> {
    let session = connect().await?;
    let handle = session
        .start_remote_forward(RemoteForwardSpec::new(0, "127.0.0.1", closed_port()?))
        .await?;

    let mut client = TcpStream::connect(("127.0.0.1", handle.bound_port())).await?;
    let read = timeout(Duration::from_secs(5), read_until_eof(&mut client)).await??;
    assert_eq!(read, 0);
    assert!(!handle.is_finished());

    handle.cancel();
    assert_eq!(timeout(Duration::from_secs(2), handle.wait()).await?, ForwardExit::Cancelled);
    assert!(refuses_connections(handle.bound_port()).await);
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_shuts_down_every_forward() -> Result<()> {
    let session = connect().await?;
    let echo = spawn_echo_server().await?;
    let local = session
        .start_local_forward(LocalForwardSpec::new(0, "127.0.0.1", echo))
        .await?;
    let remote = session
        .start_remote_forward(RemoteForwardSpec::new(0, "127.0.0.1", echo))
        .await?;
    assert_eq!(session.forwards().active().len(), 2);

    let mut client = TcpStream::connect(("127.0.0.1", local.bound_port())).await?;
    client.write_all(b"x").await?;
    let mut byte = [0u8; 1];
    timeout(Duration::from_secs(5), client.read_exact(&mut byte)).await??;

    session.disconnect();
    assert!(session.forwards().is_empty());
    for handle in [&local, &remote] {
        let exit = timeout(Duration::from_secs(2), handle.wait()).await?;
        assert!(matches!(exit, ForwardExit::Cancelled | ForwardExit::SessionClosed), "unexpected {exit:?}");
    }
    timeout(Duration::from_secs(2), read_until_eof(&mut client)).await??;
    assert!(refuses_connections(local.bound_port()).await);
    assert!(refuses_connections(remote.bound_port()).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bind_conflict_is_reported() -> Result<()> {
    let session = connect().await?;
    let occupied = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = occupied.local_addr()?.port();
    let err = session
        .start_local_forward(LocalForwardSpec::new(port, "127.0.0.1", 9))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::BindFailed { .. }), "unexpected {err:?}");
    assert!(session.forwards().is_empty());

    let err = session
        .start_remote_forward(RemoteForwardSpec::new(port, "127.0.0.1", 9))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Engine { .. }), "unexpected {err:?}");
    session.disconnect();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_require_a_connected_session() -> Result<()> {
    let session = connect().await?;
    session.disconnect();
    let err = session
        .start_local_forward(LocalForwardSpec::new(0, "127.0.0.1", 9))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Disconnected));
    Ok(())
}
