//! UDP server tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reactive_net::{NetError, UdpServer};
use tokio::net::UdpSocket;

mod common;

async fn roundtrip(socket: &UdpSocket, server: std::net::SocketAddr, payload: &[u8]) -> Vec<u8> {
    socket.send_to(payload, server).await.unwrap();
    let mut buf = [0u8; 1024];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, server);
    buf[..n].to_vec()
}

#[tokio::test]
async fn echoes_datagrams_per_peer() {
    let server = UdpServer::new(common::options());
    let addr = server.start(common::echo).await.unwrap();

    let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    assert_eq!(roundtrip(&alice, addr, b"one").await, b"one");
    assert_eq!(roundtrip(&bob, addr, b"two").await, b"two");
    assert_eq!(roundtrip(&alice, addr, b"three").await, b"three");
    assert_eq!(server.active_connections(), 2);

    server.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
    assert!(server.is_terminated());
}

#[tokio::test]
async fn multicast_requires_a_bound_socket() {
    let server = UdpServer::new(common::options());
    let group = IpAddr::V4(Ipv4Addr::new(239, 255, 0, 1));

    assert!(matches!(
        server.join_group(group, None).await,
        Err(NetError::NotRunning(_))
    ));
    assert!(matches!(
        server.leave_group(group, None).await,
        Err(NetError::NotRunning(_))
    ));
}

#[tokio::test]
async fn family_mismatch_is_a_bind_error() {
    let mut options = common::options();
    options.protocol_family = reactive_net::config::ProtocolFamily::Ipv6;
    let server = UdpServer::new(options);
    assert!(matches!(
        server.start(common::echo).await,
        Err(NetError::Bind { .. })
    ));
}

#[tokio::test]
async fn a_stalled_peer_does_not_block_others() {
    let server = UdpServer::new(common::options());
    let addr = server
        .start(|conn: reactive_net::Connection| async move {
            let mut inbound = conn.receive()?;
            let first = inbound.next().await.transpose()?.unwrap_or_default();
            if &first[..] == b"stall" {
                // Alive, but never asks for more.
                inbound.cancel();
                tokio::time::sleep(Duration::from_secs(10)).await;
                return Ok(());
            }
            conn.send(first).await?;
            while let Some(chunk) = inbound.next().await {
                conn.send(chunk?).await?;
            }
            Ok(())
        })
        .await
        .unwrap();

    let slow = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fast = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    slow.send_to(b"stall", addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    for _ in 0..3 {
        slow.send_to(b"more", addr).await.unwrap();
    }
    assert_eq!(roundtrip(&fast, addr, b"ping").await, b"ping");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn a_finished_peer_is_released() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let server = UdpServer::new(common::options());
    let addr = server
        .start(move |conn: reactive_net::Connection| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let mut inbound = conn.receive()?;
                let chunk = inbound.next().await.transpose()?.unwrap_or_default();
                conn.send(format!("{call}:{}", String::from_utf8_lossy(&chunk)))
                    .await
            }
        })
        .await
        .unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert_eq!(roundtrip(&peer, addr, b"a").await, b"1:a");

    // Wait for the first handler to leave the tracker.
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The same address starts a fresh connection instead of hitting a dead entry.
    assert_eq!(roundtrip(&peer, addr, b"b").await, b"2:b");

    server.shutdown().await.unwrap();
}
