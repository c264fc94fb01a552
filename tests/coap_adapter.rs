//! End-to-end CoAP adapter tests over a real UDP socket.

mod common;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use common::{InMemoryBus, wait_until};
use edgebus::auth::StaticAuthorizer;
use edgebus::bus::MessageBusExt;
use edgebus::coap::CoapServer;
use edgebus::config::CoapConfig;
use edgebus::message::Message;
use edgebus::time_provider::{Clock, ManualClock, SystemClock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

async fn start_server(
    bus: Arc<InMemoryBus>,
    clock: Arc<dyn Clock>,
) -> (Arc<CoapServer>, SocketAddr, CancellationToken) {
    let authorizer = Arc::new(StaticAuthorizer::new());
    authorizer.grant("K", "p1", "ch1");
    let config = CoapConfig {
        port: 0,
        ..CoapConfig::default()
    };
    let server = Arc::new(
        CoapServer::bind(config, authorizer, bus, clock)
            .await
            .expect("bind"),
    );
    let port = server.local_addr().expect("local addr").port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let shutdown = CancellationToken::new();
    let run_server = Arc::clone(&server);
    let run_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = run_server.run(run_token).await;
    });
    (server, addr, shutdown)
}

struct TestClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl TestClient {
    async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        Self { socket, server }
    }

    async fn send(&self, packet: &Packet) {
        let bytes = packet.to_bytes().expect("encode");
        self.socket
            .send_to(&bytes, self.server)
            .await
            .expect("send");
    }

    async fn recv(&self) -> Option<Packet> {
        let mut buf = [0u8; 1500];
        let received =
            tokio::time::timeout(Duration::from_secs(1), self.socket.recv_from(&mut buf)).await;
        match received {
            Ok(Ok((len, _))) => Packet::from_bytes(&buf[..len]).ok(),
            _ => None,
        }
    }

    /// Receives until a packet satisfies `pick` or the attempts run out.
    async fn recv_where(&self, pick: impl Fn(&Packet) -> bool) -> Option<Packet> {
        for _ in 0..10 {
            match self.recv().await {
                Some(packet) if pick(&packet) => return Some(packet),
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }
}

fn request(
    method: RequestType,
    message_type: MessageType,
    message_id: u16,
    token: &[u8],
    path: &[&str],
    queries: &[&str],
    payload: &[u8],
) -> Packet {
    let mut pkt = Packet::new();
    pkt.header.set_type(message_type);
    pkt.header.code = MessageClass::Request(method);
    pkt.header.message_id = message_id;
    pkt.set_token(token.to_vec());
    for segment in path {
        pkt.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    for query in queries {
        pkt.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
    }
    pkt.payload = payload.to_vec();
    pkt
}

fn observe_register(message_id: u16, token: &[u8], key: &str) -> Packet {
    let mut pkt = request(
        RequestType::Get,
        MessageType::Confirmable,
        message_id,
        token,
        &["channels", "ch1", "messages"],
        &[&format!("key={key}")],
        b"",
    );
    // Register is Observe=0; the preferred uint encoding of zero is empty.
    pkt.add_option(CoapOption::Observe, vec![]);
    pkt
}

fn observe_deregister(message_id: u16, token: &[u8], key: &str) -> Packet {
    let mut pkt = request(
        RequestType::Get,
        MessageType::Confirmable,
        message_id,
        token,
        &["channels", "ch1", "messages"],
        &[&format!("key={key}")],
        b"",
    );
    pkt.add_option(CoapOption::Observe, vec![1]);
    pkt
}

fn status_of(packet: &Packet) -> Option<ResponseType> {
    match packet.header.code {
        MessageClass::Response(status) => Some(status),
        _ => None,
    }
}

#[tokio::test]
async fn confirmable_post_publishes_and_acks() {
    let bus = InMemoryBus::new();
    let (_server, addr, shutdown) = start_server(bus.clone(), Arc::new(SystemClock)).await;
    let client = TestClient::connect(addr).await;

    client
        .send(&request(
            RequestType::Post,
            MessageType::Confirmable,
            0x1234,
            &[0xde, 0xad],
            &["channels", "ch1", "messages"],
            &["key=K"],
            br#"{"v":1}"#,
        ))
        .await;

    let reply = client.recv().await.expect("a response");
    assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(reply.header.message_id, 0x1234);
    assert_eq!(reply.get_token(), &[0xde, 0xad]);
    assert_eq!(status_of(&reply), Some(ResponseType::Changed));

    let published = bus.published_matching("channel.ch1");
    assert_eq!(published.len(), 1);
    let message = Message::from_envelope(&published[0]).unwrap();
    assert_eq!(message.publisher, "p1");
    assert_eq!(message.protocol, "coap");
    assert_eq!(message.payload, br#"{"v":1}"#);

    shutdown.cancel();
}

#[tokio::test]
async fn post_error_mapping() {
    let bus = InMemoryBus::new();
    let (_server, addr, shutdown) = start_server(bus.clone(), Arc::new(SystemClock)).await;
    let client = TestClient::connect(addr).await;

    // Wrong key: the authorizer denies.
    client
        .send(&request(
            RequestType::Post,
            MessageType::Confirmable,
            1,
            &[1],
            &["channels", "ch1", "messages"],
            &["key=wrong"],
            b"{}",
        ))
        .await;
    assert_eq!(
        status_of(&client.recv().await.unwrap()),
        Some(ResponseType::Forbidden)
    );

    // No key option at all.
    client
        .send(&request(
            RequestType::Post,
            MessageType::Confirmable,
            2,
            &[2],
            &["channels", "ch1", "messages"],
            &[],
            b"{}",
        ))
        .await;
    assert_eq!(
        status_of(&client.recv().await.unwrap()),
        Some(ResponseType::BadOption)
    );

    // Unknown path.
    client
        .send(&request(
            RequestType::Post,
            MessageType::Confirmable,
            3,
            &[3],
            &["health"],
            &["key=K"],
            b"{}",
        ))
        .await;
    assert_eq!(
        status_of(&client.recv().await.unwrap()),
        Some(ResponseType::NotFound)
    );

    // Empty confirmable payload.
    client
        .send(&request(
            RequestType::Post,
            MessageType::Confirmable,
            4,
            &[4],
            &["channels", "ch1", "messages"],
            &["key=K"],
            b"",
        ))
        .await;
    assert_eq!(
        status_of(&client.recv().await.unwrap()),
        Some(ResponseType::BadRequest)
    );

    assert!(bus.published_matching("channel.>").is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn observe_register_notify_deregister() {
    let bus = InMemoryBus::new();
    let (server, addr, shutdown) = start_server(bus.clone(), Arc::new(SystemClock)).await;
    let client = TestClient::connect(addr).await;

    client.send(&observe_register(10, &[0xde, 0xad], "K")).await;
    let reply = client.recv().await.expect("registration response");
    assert_eq!(status_of(&reply), Some(ResponseType::Content));
    assert_eq!(reply.get_token(), &[0xde, 0xad]);
    assert_eq!(
        reply.get_first_option(CoapOption::Observe),
        Some(&vec![0, 0, 1])
    );
    assert_eq!(server.observers().len(), 1);

    // A message published on the channel reaches the observer once.
    let message = Message {
        channel: "ch1".into(),
        publisher: "p2".into(),
        protocol: "nats".into(),
        payload: br#"{"t":21}"#.to_vec(),
        ..Message::default()
    };
    bus.publish_message(&message).await.unwrap();

    let notification = client
        .recv_where(|p| p.header.get_type() == MessageType::NonConfirmable)
        .await
        .expect("a notification");
    assert_eq!(notification.get_token(), &[0xde, 0xad]);
    assert_eq!(
        notification.get_first_option(CoapOption::Observe),
        Some(&vec![0, 0, 2])
    );
    assert_eq!(notification.payload, br#"{"t":21}"#);

    // Deregistration stops notifications.
    client
        .send(&observe_deregister(11, &[0xde, 0xad], "K"))
        .await;
    let reply = client
        .recv_where(|p| p.header.get_type() == MessageType::Acknowledgement)
        .await
        .expect("deregistration response");
    assert_eq!(status_of(&reply), Some(ResponseType::Content));
    assert!(
        wait_until(|| server.observers().is_empty(), Duration::from_secs(2)).await,
        "observation should be gone"
    );

    bus.publish_message(&message).await.unwrap();
    assert!(
        client
            .recv_where(|p| p.header.get_type() == MessageType::NonConfirmable)
            .await
            .is_none(),
        "no notification after deregister"
    );

    shutdown.cancel();
}

#[tokio::test]
async fn duplicate_registration_cancels_previous() {
    let bus = InMemoryBus::new();
    let (server, addr, shutdown) = start_server(bus.clone(), Arc::new(SystemClock)).await;
    let client = TestClient::connect(addr).await;

    client.send(&observe_register(20, &[0xaa], "K")).await;
    assert!(client.recv().await.is_some());
    client.send(&observe_register(21, &[0xaa], "K")).await;
    assert!(client.recv().await.is_some());

    assert_eq!(server.observers().len(), 1);
    assert!(
        wait_until(|| bus.subscription_count() == 1, Duration::from_secs(2)).await,
        "previous bus subscription should be released"
    );

    shutdown.cancel();
}

#[tokio::test]
async fn keepalive_exhaustion_removes_observation() {
    let bus = InMemoryBus::new();
    // Virtual clock: the ping period and every retransmission backoff
    // elapse instantly, and no acknowledgement ever arrives in time.
    let (server, addr, shutdown) = start_server(bus.clone(), Arc::new(ManualClock::starting_at(
        chrono::Utc::now(),
    )))
    .await;
    let client = TestClient::connect(addr).await;

    client.send(&observe_register(30, &[0xbb], "K")).await;

    assert!(
        wait_until(
            || server.observers().is_empty() && bus.subscription_count() == 0,
            Duration::from_secs(5),
        )
        .await,
        "unacknowledged keep-alive should deregister and unsubscribe"
    );

    shutdown.cancel();
}

#[tokio::test]
async fn reset_deregisters_observation() {
    let bus = InMemoryBus::new();
    let (server, addr, shutdown) = start_server(bus.clone(), Arc::new(SystemClock)).await;
    let client = TestClient::connect(addr).await;

    client.send(&observe_register(40, &[0xcc], "K")).await;
    assert!(client.recv().await.is_some());
    assert_eq!(server.observers().len(), 1);

    let mut reset = Packet::new();
    reset.header.set_type(MessageType::Reset);
    reset.header.code = MessageClass::Empty;
    reset.header.message_id = 41;
    client.send(&reset).await;

    assert!(
        wait_until(|| server.observers().is_empty(), Duration::from_secs(2)).await,
        "reset should deregister"
    );

    shutdown.cancel();
}
