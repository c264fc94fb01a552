//! UDP listener and datagram dispatch.
//!
//! A single socket feeds the whole adapter. Each datagram that parses as a
//! CoAP message is dispatched into its own task so a slow authorization
//! never head-of-line-blocks the socket; parse failures are dropped and
//! left to peer retransmission.

use super::handlers::CoapService;
use super::observers::ObserverTable;
use crate::auth::Authorizer;
use crate::bus::MessageBus;
use crate::config::CoapConfig;
use crate::time_provider::Clock;
use coap_lite::Packet;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

/// Back-off applied after a transient socket read error.
const READ_RETRY_DELAY: Duration = Duration::from_millis(5);

/// The CoAP front door.
pub struct CoapServer {
    service: Arc<CoapService>,
    socket: Arc<UdpSocket>,
    max_pkt_len: usize,
}

impl CoapServer {
    /// Binds the UDP socket and assembles the service.
    pub async fn bind(
        config: CoapConfig,
        authorizer: Arc<dyn Authorizer>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.port)).await?);
        info!(port = config.port, "CoAP adapter listening");
        let max_pkt_len = config.max_pkt_len;
        let service = Arc::new(CoapService::new(
            authorizer,
            bus,
            Arc::new(ObserverTable::new()),
            clock,
            config,
            Arc::clone(&socket),
        ));
        Ok(Self {
            service,
            socket,
            max_pkt_len,
        })
    }

    /// Local address the socket bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// The observation table, for shutdown accounting and tests.
    pub fn observers(&self) -> Arc<ObserverTable> {
        self.service.observers()
    }

    /// Runs the receive loop until shutdown fires or the socket fails
    /// permanently.
    pub async fn run(&self, shutdown: CancellationToken) -> std::io::Result<()> {
        let mut buf = vec![0u8; self.max_pkt_len];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("CoAP adapter shutting down");
                    self.service.observers().shutdown().await;
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        match Packet::from_bytes(&buf[..len]) {
                            Ok(packet) => {
                                let service = Arc::clone(&self.service);
                                let socket = Arc::clone(&self.socket);
                                tokio::spawn(async move {
                                    if let Some(reply) = service.handle_packet(packet, peer).await {
                                        match reply.to_bytes() {
                                            Ok(bytes) => {
                                                if let Err(e) = socket.send_to(&bytes, peer).await {
                                                    warn!(peer = %peer, error = %e, "response transmit failed");
                                                }
                                            }
                                            Err(e) => warn!(peer = %peer, error = %e, "response encode failed"),
                                        }
                                    }
                                });
                            }
                            Err(_) => trace!(peer = %peer, "dropping unparseable datagram"),
                        }
                    }
                    Err(e) if is_transient(&e) => {
                        tokio::time::sleep(READ_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "permanent listener error");
                        self.service.observers().shutdown().await;
                        return Err(e);
                    }
                },
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
    )
}
