//! Integration test: reaching a hidden service.
//!
//! 1. Directory maps an address to its owning relay and endpoint
//! 2. Client builds a circuit ending at that relay, CONNECTs, then BEGINs
//! 3. The service sees the address first, then stream bytes, and answers
//! 4. With no endpoint in the record, the relay's configured default is used

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use ptor_integration_tests::{directory, relay, spawn_relays, RelayOptions};
use ptor_onion::circuit::ClientEvent;
use ptor_onion::client::OnionClient;
use ptor_types::directory::HiddenService;

const ADDRESS: &str = "shop.ptor";

/// Service that expects the address, then `request`, and answers `reply`.
async fn spawn_service(
    request: &'static [u8],
    reply: &'static [u8],
) -> (String, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let task = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.expect("accept");
        let mut seen = vec![0u8; ADDRESS.len() + request.len()];
        sock.read_exact(&mut seen).await.expect("read");
        sock.write_all(reply).await.expect("write");
        seen
    });
    (addr, task)
}

async fn expect_reply(
    client: &OnionClient,
    circuit: &ptor_types::CircuitId,
    stream: u16,
    reply: &[u8],
) {
    let mut got = Vec::new();
    while got.len() < reply.len() {
        let event = tokio::time::timeout(Duration::from_secs(5), client.next_event(circuit))
            .await
            .expect("event in time")
            .expect("event");
        match event {
            ClientEvent::Data { stream_id, data } => {
                assert_eq!(stream_id, stream);
                got.extend(data);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(got, reply);
}

#[tokio::test]
async fn test_open_hidden_with_endpoint() {
    let relays = spawn_relays(3, RelayOptions::default()).await;
    let (endpoint, service) = spawn_service(b"GET /", b"200 OK").await;

    let listing = directory(&relays);
    listing
        .add_hidden_service(HiddenService {
            address: ADDRESS.to_string(),
            relay_id: "relay-1".to_string(),
            public_key: [9u8; 32],
            endpoint: Some(endpoint),
        })
        .expect("register");
    let client = OnionClient::new(Arc::new(listing));

    let (circuit, stream) = client.open_hidden(ADDRESS, 3).await.expect("open hidden");
    let path = client
        .circuits()
        .find(&circuit)
        .expect("circuit")
        .lock()
        .await
        .relay_ids();
    assert_eq!(path.last().map(String::as_str), Some("relay-1"));

    let owner = relay(&relays, "relay-1").server.repository().find(&circuit).expect("state");
    assert!(owner.is_hidden());

    client.send_data(&circuit, stream, b"GET /").await.expect("send");
    let seen = service.await.expect("service");
    assert_eq!(&seen[..ADDRESS.len()], ADDRESS.as_bytes());
    assert_eq!(&seen[ADDRESS.len()..], b"GET /");

    expect_reply(&client, &circuit, stream, b"200 OK").await;
}

#[tokio::test]
async fn test_open_hidden_uses_relay_default() {
    let (endpoint, service) = spawn_service(b"ping", b"pong").await;
    let relays = spawn_relays(
        2,
        RelayOptions {
            hidden_default: endpoint,
            ..RelayOptions::default()
        },
    )
    .await;

    let listing = directory(&relays);
    listing
        .add_hidden_service(HiddenService {
            address: ADDRESS.to_string(),
            relay_id: "relay-0".to_string(),
            public_key: [9u8; 32],
            endpoint: None,
        })
        .expect("register");
    let client = OnionClient::new(Arc::new(listing));

    let (circuit, stream) = client.open_hidden(ADDRESS, 2).await.expect("open hidden");
    client.send_data(&circuit, stream, b"ping").await.expect("send");
    let seen = service.await.expect("service");
    assert_eq!(&seen[ADDRESS.len()..], b"ping");
    expect_reply(&client, &circuit, stream, b"pong").await;
}
