//! Observation sessions and their lifecycle.
//!
//! One observation = one bus subscription + one delivery task + one
//! keep-alive task. The table owns every observer; the tasks hold borrowed
//! `Arc` references and end when the owning entry fires its cancel token.
//! Admission is cancel-previous-then-admit so at most one observation
//! exists per `(token, publisher, channel)` key.

use crate::bus::{BusError, BusHandler, Delivery, Subscription};
use crate::message::Message;
use crate::time_provider::Clock;
use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, ResponseType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Only the low 24 bits of the sequence counter go on the wire.
pub const OBSERVE_MASK: u32 = 0x00FF_FFFF;

/// Retransmissions after the initial keep-alive probe.
const MAX_RETRANSMIT: u32 = 4;

/// Initial ACK wait: 2000 ms scaled by ACK_RANDOM_FACTOR = 1.5.
const ACK_TIMEOUT: Duration = Duration::from_millis(3000);

/// Builds the observation key for `(token, publisher, channel)`.
pub fn observation_key(token: &[u8], publisher: &str, channel: &str) -> String {
    let hex: String = token.iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}-{publisher}-{channel}")
}

/// Encodes an observe sequence number as the 3-byte big-endian option value.
pub fn observe_option_bytes(value: u32) -> Vec<u8> {
    value.to_be_bytes()[1..4].to_vec()
}

/// Decodes an observe option value; an absent/empty option is 0.
pub fn observe_option_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// Per-observation session state.
pub struct Observer {
    key: String,
    token: Vec<u8>,
    peer: SocketAddr,
    seq: AtomicU32,
    expired: AtomicBool,
    cancel: CancellationToken,
}

impl Observer {
    pub(crate) fn new(key: String, token: Vec<u8>, peer: SocketAddr) -> Self {
        Self {
            key,
            token,
            peer,
            seq: AtomicU32::new(0),
            expired: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Observation key in the table.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remote endpoint notifications go to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// CoAP token the client chose at registration.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// Cancel signal shared by the delivery and keep-alive tasks.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next sequence number; the counter is 32-bit and masked on emit so
    /// the transmitted value wraps at 2^24 without gaps.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Whether the last keep-alive probe is still unacknowledged.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn clear_expired(&self) {
        self.expired.store(false, Ordering::SeqCst);
    }

    fn notification_packet(&self, confirmable: bool, payload: Vec<u8>) -> Packet {
        let seq = self.next_seq();
        let mut pkt = Packet::new();
        pkt.header.set_type(if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        pkt.header.code = MessageClass::Response(ResponseType::Content);
        pkt.header.message_id = (seq & 0xFFFF) as u16;
        pkt.set_token(self.token.clone());
        pkt.add_option(
            CoapOption::Observe,
            observe_option_bytes(seq & OBSERVE_MASK),
        );
        pkt.set_content_format(coap_lite::ContentFormat::ApplicationJSON);
        pkt.payload = payload;
        pkt
    }

    async fn transmit(&self, socket: &UdpSocket, pkt: &Packet) -> std::io::Result<()> {
        let bytes = pkt
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        socket.send_to(&bytes, self.peer).await?;
        Ok(())
    }

    /// Sends one notification carrying the message payload.
    async fn notify(&self, socket: &UdpSocket, payload: &[u8]) -> std::io::Result<()> {
        let pkt = self.notification_packet(false, payload.to_vec());
        self.transmit(socket, &pkt).await
    }

    /// Sends a confirmable probe and waits for an acknowledgement, with
    /// bounded retransmission and binary-exponential backoff. Returns false
    /// when every attempt expired.
    async fn probe(&self, socket: &UdpSocket, clock: &dyn Clock) -> bool {
        self.expired.store(true, Ordering::SeqCst);
        let mut wait = ACK_TIMEOUT;
        // Retransmissions reuse the identical message, message id included.
        let pkt = self.notification_packet(true, Vec::new());
        for attempt in 0..=MAX_RETRANSMIT {
            if let Err(e) = self.transmit(socket, &pkt).await {
                warn!(key = %self.key, attempt, error = %e, "keep-alive transmit failed");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = clock.sleep(wait) => {}
            }
            if !self.is_expired() {
                return true;
            }
            wait *= 2;
        }
        false
    }
}

/// Decodes bus envelopes onto the observer's bounded notification queue.
pub(crate) struct NotifyHandler {
    tx: broadcast::Sender<Message>,
}

impl NotifyHandler {
    pub(crate) fn new(tx: broadcast::Sender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl BusHandler for NotifyHandler {
    async fn handle(&self, delivery: Delivery) -> Result<(), BusError> {
        let message = Message::from_envelope(&delivery.payload).map_err(|e| {
            BusError::Malformed {
                reason: e.to_string(),
            }
        })?;
        // No receivers means the observation is tearing down.
        let _ = self.tx.send(message);
        Ok(())
    }
}

struct Entry {
    observer: Arc<Observer>,
    subscription: Box<dyn Subscription>,
}

/// The observation table; sole owner of every active observer.
#[derive(Default)]
pub struct ObserverTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ObserverTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active observations.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("observer table poisoned").len()
    }

    /// True when no observation is active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admits an observer, cancelling any previous observation under the
    /// same key first.
    pub async fn admit(
        &self,
        observer: Arc<Observer>,
        subscription: Box<dyn Subscription>,
    ) {
        let previous = {
            let mut entries = self.entries.lock().expect("observer table poisoned");
            entries.insert(
                observer.key().to_string(),
                Entry {
                    observer,
                    subscription,
                },
            )
        };
        if let Some(entry) = previous {
            debug!(key = %entry.observer.key(), "replacing observation, cancelling previous");
            cancel_entry(entry).await;
        }
    }

    /// Removes and cancels the observation under `key`.
    pub async fn remove(&self, key: &str) -> bool {
        let entry = {
            let mut entries = self.entries.lock().expect("observer table poisoned");
            entries.remove(key)
        };
        match entry {
            Some(entry) => {
                cancel_entry(entry).await;
                true
            }
            None => false,
        }
    }

    /// Removes every observation of `peer`; a Reset without a token can
    /// only be matched by endpoint.
    pub async fn remove_for_peer(&self, peer: SocketAddr) {
        let keys: Vec<String> = {
            let entries = self.entries.lock().expect("observer table poisoned");
            entries
                .values()
                .filter(|e| e.observer.peer() == peer)
                .map(|e| e.observer.key().to_string())
                .collect()
        };
        for key in keys {
            trace!(key = %key, "peer reset, deregistering observation");
            self.remove(&key).await;
        }
    }

    /// Removes every observation whose token and peer match, used for
    /// inbound Reset frames.
    pub async fn remove_matching(&self, token: &[u8], peer: SocketAddr) {
        let keys: Vec<String> = {
            let entries = self.entries.lock().expect("observer table poisoned");
            entries
                .values()
                .filter(|e| e.observer.token() == token && e.observer.peer() == peer)
                .map(|e| e.observer.key().to_string())
                .collect()
        };
        for key in keys {
            trace!(key = %key, "reset received, deregistering observation");
            self.remove(&key).await;
        }
    }

    /// Clears the expiry flag of observations matching an inbound ACK.
    pub fn clear_expired(&self, token: &[u8], peer: SocketAddr) {
        let entries = self.entries.lock().expect("observer table poisoned");
        for entry in entries.values() {
            if entry.observer.token() == token && entry.observer.peer() == peer {
                entry.observer.clear_expired();
            }
        }
    }

    /// Cancels every observation; used on server shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().expect("observer table poisoned");
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in drained {
            cancel_entry(entry).await;
        }
    }
}

async fn cancel_entry(entry: Entry) {
    entry.observer.cancel.cancel();
    if let Err(e) = entry.subscription.unsubscribe().await {
        warn!(key = %entry.observer.key(), error = %e, "unsubscribe failed");
    }
}

/// Spawns the delivery task: dequeues bus messages and transmits each as a
/// NonConfirmable notification in bus-delivery order.
pub(crate) fn spawn_delivery(
    observer: Arc<Observer>,
    mut queue: broadcast::Receiver<Message>,
    socket: Arc<UdpSocket>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = observer.cancelled();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = queue.recv() => match received {
                    Ok(message) => {
                        if let Err(e) = observer.notify(&socket, &message.payload).await {
                            warn!(key = %observer.key(), error = %e, "notification transmit failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(key = %observer.key(), dropped = n, "notification queue overflow");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        trace!(key = %observer.key(), "delivery task stopped");
    })
}

/// Spawns the keep-alive task: periodic confirmable probes; exhausted
/// retransmission removes the observation from the table.
pub(crate) fn spawn_keepalive(
    observer: Arc<Observer>,
    socket: Arc<UdpSocket>,
    table: Arc<ObserverTable>,
    clock: Arc<dyn Clock>,
    ping_period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cancel = observer.cancelled();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = clock.sleep(ping_period) => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            if !observer.probe(&socket, clock.as_ref()).await {
                debug!(key = %observer.key(), "keep-alive unacknowledged, deregistering");
                table.remove(observer.key()).await;
                break;
            }
        }
        trace!(key = %observer.key(), "keep-alive task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    struct NoopSubscription;

    #[async_trait]
    impl Subscription for NoopSubscription {
        async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[test]
    fn observation_key_is_hex_token_publisher_channel() {
        assert_eq!(
            observation_key(&[0xde, 0xad], "p1", "ch1"),
            "dead-p1-ch1"
        );
    }

    #[test]
    fn observe_option_is_three_bytes_big_endian() {
        assert_eq!(observe_option_bytes(2), vec![0, 0, 2]);
        assert_eq!(observe_option_bytes(0x0102_03), vec![1, 2, 3]);
        assert_eq!(observe_option_value(&[0, 0, 2]), 2);
        assert_eq!(observe_option_value(&[]), 0);
    }

    #[test]
    fn sequence_counter_wraps_cleanly_at_24_bits() {
        let observer = Observer::new("k".into(), vec![1], peer());
        observer.seq.store(OBSERVE_MASK - 1, Ordering::SeqCst);
        assert_eq!(observer.next_seq() & OBSERVE_MASK, OBSERVE_MASK);
        assert_eq!(observer.next_seq() & OBSERVE_MASK, 0);
        assert_eq!(observer.next_seq() & OBSERVE_MASK, 1);
    }

    #[tokio::test]
    async fn admit_replaces_previous_observation() {
        let table = ObserverTable::new();
        let first = Arc::new(Observer::new("k1".into(), vec![1], peer()));
        let second = Arc::new(Observer::new("k1".into(), vec![1], peer()));

        table.admit(first.clone(), Box::new(NoopSubscription)).await;
        table.admit(second.clone(), Box::new(NoopSubscription)).await;

        assert_eq!(table.len(), 1);
        assert!(first.cancelled().is_cancelled());
        assert!(!second.cancelled().is_cancelled());
    }

    #[tokio::test]
    async fn remove_matching_deregisters_by_token_and_peer() {
        let table = ObserverTable::new();
        let observer = Arc::new(Observer::new("k1".into(), vec![0xaa], peer()));
        table.admit(observer.clone(), Box::new(NoopSubscription)).await;

        table.remove_matching(&[0xaa], peer()).await;
        assert!(table.is_empty());
        assert!(observer.cancelled().is_cancelled());
    }

    #[tokio::test]
    async fn ack_clears_expiry() {
        let table = ObserverTable::new();
        let observer = Arc::new(Observer::new("k1".into(), vec![0xaa], peer()));
        observer.expired.store(true, Ordering::SeqCst);
        table.admit(observer.clone(), Box::new(NoopSubscription)).await;

        table.clear_expired(&[0xaa], peer());
        assert!(!observer.is_expired());
    }
}
