//! Relay accept loop.
//!
//! Each accepted connection gets its own task reading one frame at a time
//! and handing it to the engine, so cells of one connection are handled in
//! arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use ptor_transport::frame::read_frame;
use ptor_transport::link::Connection;

use crate::engine::Engine;
use crate::repository::StateRepository;
use crate::{RelayConfig, Result};

/// A listening relay.
pub struct RelayServer {
    listener: TcpListener,
    engine: Arc<Engine>,
    stop: watch::Sender<bool>,
}

impl RelayServer {
    /// Bind the listener and start the state repository.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let repository = Arc::new(StateRepository::new(config.state_ttl));
        let engine = Arc::new(Engine::new(
            repository,
            config.dial_timeout,
            config.hidden_default,
        ));
        let (stop, _) = watch::channel(false);
        info!(addr = %listener.local_addr()?, ttl = ?config.state_ttl, "relay listening");
        Ok(Self {
            listener,
            engine,
            stop,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn repository(&self) -> &Arc<StateRepository> {
        self.engine.repository()
    }

    /// Accept until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let mut stop = self.stop.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let engine = Arc::clone(&self.engine);
                        tokio::spawn(serve_conn(engine, Connection::from_tcp(stream)));
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                _ = stop.changed() => {}
            }
        }
        info!("relay stopped accepting");
        Ok(())
    }

    /// Stop accepting, stop the sweep and close every circuit.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        self.engine.repository().shutdown();
    }
}

/// Read frames from one upstream connection until it closes.
pub async fn serve_conn(engine: Arc<Engine>, conn: Connection) {
    let Connection { mut reader, link } = conn;
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = link.closed() => break,
        };
        match frame {
            Ok(Some((circuit_id, cell))) => {
                let command = cell.command;
                if let Err(e) = engine.dispatch(&link, circuit_id, cell).await {
                    engine.report_failure(&circuit_id, command, &e).await;
                }
            }
            Ok(None) => {
                debug!(peer = %link.peer(), "peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %link.peer(), error = %e, "framing error, dropping connection");
                break;
            }
        }
    }
    link.shutdown().await;
}
