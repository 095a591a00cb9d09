//! Server wiring: binds both transports, spawns the reaper, runs
//! until shutdown

use log::{error, info};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::notify::NotificationSink;
use crate::poll::{self, PollState};
use crate::registry::ServerConfig;
use crate::relay::{Relay, SharedRelay, POLL_TIMEOUT, REAP_INTERVAL};
use crate::stream;

/// The assembled relay server: one registry, two transports, one
/// reaper.
pub struct Server {
    relay: SharedRelay,
    stream_listener: TcpListener,
    http_listener: TcpListener,
    stream_addr: SocketAddr,
    http_addr: SocketAddr,
    advertise_addr: String,
}

impl Server {
    /// Binds both listeners. `advertise_addr` is what discovery
    /// listings report, since the bind host may be a wildcard.
    pub async fn bind(
        stream_addr: &str,
        http_addr: &str,
        advertise_addr: String,
        config: ServerConfig,
        notify: NotificationSink,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let relay = Relay::new(config, notify).into_shared();

        let stream_listener = TcpListener::bind(stream_addr).await?;
        let http_listener = TcpListener::bind(http_addr).await?;
        let stream_addr = stream_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;
        info!(
            "Relay listening: stream on {}, poll on {}",
            stream_addr, http_addr
        );

        Ok(Self {
            relay,
            stream_listener,
            http_listener,
            stream_addr,
            http_addr,
            advertise_addr,
        })
    }

    /// Bound stream transport address (useful with port 0).
    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    /// Bound poll transport address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Handle to the relay core for the admin dashboard.
    pub fn relay(&self) -> SharedRelay {
        self.relay.clone()
    }

    /// Spawns the task that evicts idle poll sessions on a fixed
    /// interval.
    fn spawn_reaper(&self) -> JoinHandle<()> {
        let relay = self.relay.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            // The first tick fires immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                let reaped = relay.lock().await.reap(Instant::now(), POLL_TIMEOUT);
                if !reaped.is_empty() {
                    info!("Reaped {} idle poll session(s)", reaped.len());
                }
            }
        })
    }

    /// Runs both transports and the reaper until Ctrl+C or a transport
    /// failure.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let reaper = self.spawn_reaper();

        let stream_task = tokio::spawn(stream::run_listener(
            self.stream_listener,
            self.relay.clone(),
        ));

        let poll_state = PollState {
            relay: self.relay.clone(),
            advertise_addr: self.advertise_addr.clone(),
            port: self.stream_addr.port(),
        };
        let http_task = tokio::spawn(poll::run_http(self.http_listener, poll_state));

        tokio::select! {
            result = stream_task => {
                if let Err(e) = result {
                    error!("Stream transport task panicked: {}", e);
                }
            }
            result = http_task => {
                match result {
                    Ok(Err(e)) => error!("Poll transport failed: {}", e),
                    Err(e) => error!("Poll transport task panicked: {}", e),
                    Ok(Ok(())) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
        }

        reaper.abort();
        Ok(())
    }
}
