//! TCP server lifecycle and connection tests.

use std::time::Duration;

use futures_util::StreamExt;
use reactive_net::{EventLoopGroup, NetError, Phase, TcpServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

#[tokio::test]
async fn echoes_bytes_back() {
    let server = TcpServer::new(common::options());
    let addr = server.start(common::echo).await.unwrap();
    assert_eq!(server.phase(), Phase::Started);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    drop(stream);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_twice_succeeds() {
    let server = TcpServer::new(common::options());
    server.start(common::echo).await.unwrap();

    server.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
    assert!(server.is_terminated());
    assert_eq!(server.phase(), Phase::Shutdown);
}

#[tokio::test]
async fn shutdown_before_start_is_a_no_op() {
    let server = TcpServer::new(common::options());
    server.shutdown().await.unwrap();
    assert!(!server.is_started());
}

#[tokio::test]
async fn second_bind_on_the_same_address_fails() {
    let first = TcpServer::new(common::options());
    let addr = first.start(common::echo).await.unwrap();

    let mut options = common::options();
    options.bind_address = addr.to_string();
    let second = TcpServer::new(options);
    let result = second.start(common::echo).await;
    assert!(matches!(result, Err(NetError::Bind { .. })), "got {result:?}");

    first.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_address_is_a_bind_error() {
    let mut options = common::options();
    options.bind_address = "not-an-address".into();
    let server = TcpServer::new(options);
    assert!(matches!(
        server.start(common::echo).await,
        Err(NetError::Bind { .. })
    ));
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let server = TcpServer::new(common::options());
    server.start(common::echo).await.unwrap();
    assert!(matches!(
        server.start(common::echo).await,
        Err(NetError::AlreadyStarted)
    ));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_and_await_returns_the_bound_address() {
    let server = TcpServer::new(common::options());
    let addr = server
        .start_and_await(common::echo, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(server.local_addr(), Some(addr));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn external_event_loops_survive_shutdown() {
    let group = EventLoopGroup::new("shared", 1).unwrap();
    let server = TcpServer::new(common::options().with_event_loops(group.clone()));
    server.start(common::echo).await.unwrap();
    server.shutdown().await.unwrap();

    assert!(!group.is_shut_down());
    // The group still runs work after the server let go of it.
    let answer = group.next().spawn(async { 41 + 1 }).await.unwrap();
    assert_eq!(answer, 42);

    group.shutdown().await;
    assert!(group.is_shut_down());
}

#[tokio::test]
async fn a_second_consumer_is_rejected() {
    let server = TcpServer::new(common::options());
    let addr = server
        .start(|conn: reactive_net::Connection| async move {
            let mut first = conn.receive()?;
            let verdict = match conn.receive() {
                Err(NetError::AlreadySubscribed) => "subscribed",
                _ => "unexpected",
            };
            // The first consumer still works.
            let chunk = first.next().await.transpose()?.unwrap_or_default();
            conn.send(format!("{verdict}:{}", String::from_utf8_lossy(&chunk)))
                .await
        })
        .await
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "subscribed:x");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_completion_closes_the_connection() {
    let server = TcpServer::new(common::options());
    let addr = server
        .start(|conn: reactive_net::Connection| async move { conn.send("bye").await })
        .await
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"bye");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_and_reattach_keeps_the_connection_readable() {
    let server = TcpServer::new(common::options());
    let addr = server
        .start(|conn: reactive_net::Connection| async move {
            let mut first = conn.receive()?;
            let one = first.next().await.transpose()?.unwrap_or_default();
            first.cancel();

            // "two" arrives while nobody is attached.
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut second = conn.receive()?;
            let two = match second.next().await.transpose()? {
                Some(chunk) => String::from_utf8_lossy(&chunk).into_owned(),
                None => "EOF".to_string(),
            };
            conn.send(format!("{}+{two}", String::from_utf8_lossy(&one)))
                .await
        })
        .await
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"one").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream.write_all(b"two").await.unwrap();

    let mut reply = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "one+two");

    server.shutdown().await.unwrap();
}
