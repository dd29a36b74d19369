//! UDP driver feeding a [`QueryEngine`] from a tokio socket

use crate::engine::{QueryEngine, QueryReport};
use crate::error::EngineError;
use log::{debug, error, info};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65_535;

/// How often timers are checked when no datagram arrives.
pub const DEFAULT_TICK: Duration = Duration::from_millis(20);

/// Owns the socket and runs the engine until every target has finished.
pub struct QueryDriver {
    socket: UdpSocket,
    engine: QueryEngine,
    tick: Duration,
}

impl QueryDriver {
    /// Binds a socket with broadcast enabled.
    pub async fn bind(addr: &str, engine: QueryEngine) -> Result<Self, EngineError> {
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        info!("Query socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            engine,
            tick: DEFAULT_TICK,
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EngineError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine_mut(&mut self) -> &mut QueryEngine {
        &mut self.engine
    }

    /// Sends everything the engine queued.
    async fn flush(&mut self) {
        while let Some(transmit) = self.engine.poll_transmit() {
            match self.socket.send_to(&transmit.payload, transmit.addr).await {
                Ok(len) => debug!("Sent {} bytes to {}", len, transmit.addr),
                Err(e) => self.engine.record_send_error(transmit.target, &e),
            }
        }
    }

    /// Runs until no target is left and returns their reports.
    pub async fn run(&mut self) -> Result<Vec<QueryReport>, EngineError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.flush().await;
            if self.engine.is_finished() {
                break;
            }

            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, addr)) => {
                        debug!("Received {} bytes from {}", len, addr);
                        self.engine.on_datagram(addr, &buffer[..len], Instant::now());
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = ticker.tick() => {
                    self.engine.on_tick(Instant::now());
                }
            }
        }

        Ok(self.engine.take_completed())
    }
}
