//! Integration test crate for ptor.
//!
//! The library half is a small harness: real relays on `127.0.0.1:0`, a
//! directory listing them, and plain TCP backends. The scenarios live in
//! `tests/`.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p ptor-integration-tests
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use ptor_onion::directory::StaticDirectory;
use ptor_relay::server::RelayServer;
use ptor_relay::{RelayConfig, DEFAULT_HIDDEN_ADDR};
use ptor_types::directory::RelayInfo;

/// A relay serving on an ephemeral localhost port. Shut down on drop.
pub struct TestRelay {
    pub server: Arc<RelayServer>,
    pub info: RelayInfo,
    task: JoinHandle<()>,
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.server.shutdown();
        self.task.abort();
    }
}

/// Knobs for [`spawn_relay_with`].
#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub state_ttl: Duration,
    pub hidden_default: String,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(60),
            hidden_default: DEFAULT_HIDDEN_ADDR.to_string(),
        }
    }
}

pub async fn spawn_relay(id: &str) -> TestRelay {
    spawn_relay_with(id, RelayOptions::default()).await
}

pub async fn spawn_relay_with(id: &str, options: RelayOptions) -> TestRelay {
    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        state_ttl: options.state_ttl,
        dial_timeout: Duration::from_secs(2),
        hidden_default: options.hidden_default,
    };
    let server = Arc::new(RelayServer::bind(config).await.expect("bind relay"));
    let addr = server.local_addr().expect("relay addr");
    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move {
        runner.run().await.expect("relay run");
    });
    TestRelay {
        server,
        info: RelayInfo {
            id: id.to_string(),
            addr: addr.to_string(),
            public_key: rand::random(),
            online: true,
        },
        task,
    }
}

/// `n` relays named `relay-0` .. `relay-{n-1}`.
pub async fn spawn_relays(n: usize, options: RelayOptions) -> Vec<TestRelay> {
    let mut relays = Vec::with_capacity(n);
    for i in 0..n {
        relays.push(spawn_relay_with(&format!("relay-{i}"), options.clone()).await);
    }
    relays
}

pub fn directory(relays: &[TestRelay]) -> StaticDirectory {
    StaticDirectory::from_relays(relays.iter().map(|r| r.info.clone()).collect())
}

/// Relay by directory id.
pub fn relay<'a>(relays: &'a [TestRelay], id: &str) -> &'a TestRelay {
    relays
        .iter()
        .find(|r| r.info.id == id)
        .expect("relay on path")
}

/// TCP echo server accepting any number of connections.
pub async fn spawn_echo() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr").to_string();
    let task = tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, task)
}

/// An address nothing listens on.
pub async fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

/// Poll `check` every 20 ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
