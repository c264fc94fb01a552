//! Request handling for the messaging resource.
//!
//! The only routable template is `/channels/{id}/messages[/{subtopic...}]`:
//! POST publishes a device write onto the bus, GET with an Observe option
//! manages an observation. The device key travels in Uri-Query as
//! `key=<value>`. Response codes follow RFC 7252; anything unroutable is
//! 4.04 for confirmable requests and silence otherwise.

use super::observers::{
    self, NotifyHandler, Observer, ObserverTable, observation_key, observe_option_bytes,
    observe_option_value,
};
use crate::auth::{AuthError, Authorizer};
use crate::bus::{MessageBus, MessageBusExt};
use crate::config::CoapConfig;
use crate::message::{self, CHANNEL_PREFIX, Message, PROTOCOL_COAP};
use crate::time_provider::Clock;
use coap_lite::{
    CoapOption, CoapResponse, ContentFormat, MessageClass, MessageType, Packet, RequestType,
    ResponseType,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Authorization calls get this long before the request is failed 5.03.
const AUTH_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared state behind every datagram task.
pub struct CoapService {
    authorizer: Arc<dyn Authorizer>,
    bus: Arc<dyn MessageBus>,
    observers: Arc<ObserverTable>,
    clock: Arc<dyn Clock>,
    config: CoapConfig,
    socket: Arc<UdpSocket>,
}

impl CoapService {
    pub(crate) fn new(
        authorizer: Arc<dyn Authorizer>,
        bus: Arc<dyn MessageBus>,
        observers: Arc<ObserverTable>,
        clock: Arc<dyn Clock>,
        config: CoapConfig,
        socket: Arc<UdpSocket>,
    ) -> Self {
        Self {
            authorizer,
            bus,
            observers,
            clock,
            config,
            socket,
        }
    }

    /// The observation table, exposed for shutdown and tests.
    pub fn observers(&self) -> Arc<ObserverTable> {
        Arc::clone(&self.observers)
    }

    /// Handles one parsed datagram; the returned packet, if any, is the
    /// response to transmit.
    pub(crate) async fn handle_packet(&self, packet: Packet, peer: SocketAddr) -> Option<Packet> {
        match packet.header.get_type() {
            MessageType::Acknowledgement => {
                self.observers.clear_expired(packet.get_token(), peer);
                None
            }
            MessageType::Reset => {
                let token = packet.get_token();
                if token.is_empty() {
                    self.observers.remove_for_peer(peer).await;
                } else {
                    self.observers.remove_matching(token, peer).await;
                }
                None
            }
            MessageType::Confirmable | MessageType::NonConfirmable => {
                self.handle_request(packet, peer).await
            }
        }
    }

    async fn handle_request(&self, packet: Packet, peer: SocketAddr) -> Option<Packet> {
        let confirmable = packet.header.get_type() == MessageType::Confirmable;

        let method = match packet.header.code {
            MessageClass::Request(method) => method,
            _ => return None,
        };

        let Some(route) = Route::parse(&packet) else {
            // Unknown path answers 4.04 only when the peer would retransmit.
            if confirmable {
                return error_response(&packet, ResponseType::NotFound);
            }
            return None;
        };

        let key = match extract_key(&packet) {
            Ok(key) => key,
            Err(code) => return error_response(&packet, code),
        };

        match method {
            RequestType::Post => self.publish(&packet, route, &key).await,
            RequestType::Get => self.observe(&packet, peer, route, &key).await,
            _ if confirmable => error_response(&packet, ResponseType::NotFound),
            _ => None,
        }
    }

    async fn publish(&self, packet: &Packet, route: Route, key: &str) -> Option<Packet> {
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        if confirmable && packet.payload.is_empty() {
            return error_response(packet, ResponseType::BadRequest);
        }

        let publisher = match self.authorize(&route.channel, key).await {
            Ok(publisher) => publisher,
            Err(code) => return error_response(packet, code),
        };

        let message = Message {
            domain: String::new(),
            channel: route.channel,
            subtopic: route.subtopic,
            publisher,
            protocol: PROTOCOL_COAP.to_string(),
            created: self.clock.now_nanos(),
            payload: packet.payload.clone(),
        };

        if let Err(e) = self.bus.publish_message(&message).await {
            warn!(channel = %message.channel, error = %e, "bus publish failed");
            return error_response(packet, ResponseType::InternalServerError);
        }

        trace!(channel = %message.channel, publisher = %message.publisher, "message published");
        response(packet, ResponseType::Changed)
    }

    async fn observe(
        &self,
        packet: &Packet,
        peer: SocketAddr,
        route: Route,
        key: &str,
    ) -> Option<Packet> {
        let observe = packet
            .get_first_option(CoapOption::Observe)
            .map(|raw| observe_option_value(raw));

        let publisher = match self.authorize(&route.channel, key).await {
            Ok(publisher) => publisher,
            Err(code) => return error_response(packet, code),
        };

        match observe {
            Some(0) => self.register(packet, peer, route, &publisher).await,
            Some(1) => self.deregister(packet, peer, route, &publisher).await,
            _ => error_response(packet, ResponseType::BadRequest),
        }
    }

    async fn register(
        &self,
        packet: &Packet,
        peer: SocketAddr,
        route: Route,
        publisher: &str,
    ) -> Option<Packet> {
        let obs_key = observation_key(packet.get_token(), publisher, &route.channel);
        let subject = message::subject(CHANNEL_PREFIX, &route.channel, &route.subtopic);

        let (tx, rx) = broadcast::channel(self.config.queue_capacity.into_inner());
        let handler = Arc::new(NotifyHandler::new(tx));
        let subscription = match self.bus.subscribe(&subject, handler).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(subject = %subject, error = %e, "observe subscribe failed");
                return error_response(packet, ResponseType::ServiceUnavailable);
            }
        };

        let observer = Arc::new(Observer::new(
            obs_key.clone(),
            packet.get_token().to_vec(),
            peer,
        ));
        self.observers
            .admit(Arc::clone(&observer), subscription)
            .await;

        observers::spawn_delivery(Arc::clone(&observer), rx, Arc::clone(&self.socket));
        observers::spawn_keepalive(
            Arc::clone(&observer),
            Arc::clone(&self.socket),
            self.observers(),
            Arc::clone(&self.clock),
            self.config.ping_period.as_duration(),
        );

        debug!(key = %obs_key, subject = %subject, "observation registered");

        let mut reply = response(packet, ResponseType::Content)?;
        reply.add_option(
            CoapOption::Observe,
            observe_option_bytes(observer.next_seq() & observers::OBSERVE_MASK),
        );
        reply.set_content_format(ContentFormat::ApplicationJSON);
        Some(reply)
    }

    async fn deregister(
        &self,
        packet: &Packet,
        peer: SocketAddr,
        route: Route,
        publisher: &str,
    ) -> Option<Packet> {
        let obs_key = observation_key(packet.get_token(), publisher, &route.channel);
        if self.observers.remove(&obs_key).await {
            debug!(key = %obs_key, "observation deregistered");
        } else {
            // Also honor deregistration addressed by token alone.
            self.observers
                .remove_matching(packet.get_token(), peer)
                .await;
        }
        response(packet, ResponseType::Content)
    }

    async fn authorize(&self, channel: &str, key: &str) -> Result<String, ResponseType> {
        match tokio::time::timeout(AUTH_TIMEOUT, self.authorizer.authorize(channel, key)).await {
            Ok(Ok(publisher)) => Ok(publisher),
            Ok(Err(AuthError::PermissionDenied)) => Err(ResponseType::Forbidden),
            Ok(Err(AuthError::Unavailable { reason })) => {
                warn!(reason = %reason, "authorizer unavailable");
                Err(ResponseType::ServiceUnavailable)
            }
            Ok(Err(AuthError::Timeout)) | Err(_) => Err(ResponseType::ServiceUnavailable),
            Ok(Err(AuthError::Internal { reason })) => {
                warn!(reason = %reason, "authorizer failure");
                Err(ResponseType::InternalServerError)
            }
        }
    }
}

/// Parsed messaging route.
struct Route {
    channel: String,
    subtopic: String,
}

impl Route {
    /// Accepts `channels/{id}/messages[/{segment}...]`.
    fn parse(packet: &Packet) -> Option<Self> {
        let segments: Vec<String> = packet
            .get_option(CoapOption::UriPath)?
            .iter()
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .collect();

        if segments.len() < 3 || segments[0] != "channels" || segments[2] != "messages" {
            return None;
        }
        if segments[1].is_empty() {
            return None;
        }
        Some(Self {
            channel: segments[1].clone(),
            subtopic: segments[3..].join("."),
        })
    }
}

/// Pulls the device key out of Uri-Query. Missing `key` is a bad option;
/// an empty or repeated one is a bad request.
fn extract_key(packet: &Packet) -> Result<String, ResponseType> {
    let Some(queries) = packet.get_option(CoapOption::UriQuery) else {
        return Err(ResponseType::BadOption);
    };
    let mut key = None;
    for query in queries {
        let query = String::from_utf8_lossy(query);
        if let Some(value) = query.strip_prefix("key=") {
            if value.is_empty() || key.is_some() {
                return Err(ResponseType::BadRequest);
            }
            key = Some(value.to_string());
        }
    }
    key.ok_or(ResponseType::BadOption)
}

fn response(request: &Packet, status: ResponseType) -> Option<Packet> {
    let mut reply = CoapResponse::new(request)?;
    reply.set_status(status);
    Some(reply.message)
}

fn error_response(request: &Packet, status: ResponseType) -> Option<Packet> {
    response(request, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: RequestType, path: &[&str], queries: &[&str]) -> Packet {
        let mut pkt = Packet::new();
        pkt.header.set_type(MessageType::Confirmable);
        pkt.header.code = MessageClass::Request(method);
        pkt.header.message_id = 7;
        pkt.set_token(vec![0xde, 0xad]);
        for segment in path {
            pkt.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        for query in queries {
            pkt.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
        }
        pkt
    }

    #[test]
    fn route_parses_channel_and_subtopic() {
        let pkt = request(
            RequestType::Post,
            &["channels", "ch1", "messages", "temperature", "kitchen"],
            &[],
        );
        let route = Route::parse(&pkt).unwrap();
        assert_eq!(route.channel, "ch1");
        assert_eq!(route.subtopic, "temperature.kitchen");
    }

    #[test]
    fn route_rejects_other_paths() {
        let pkt = request(RequestType::Post, &["health"], &[]);
        assert!(Route::parse(&pkt).is_none());
    }

    #[test]
    fn missing_key_is_bad_option() {
        let pkt = request(RequestType::Post, &["channels", "c", "messages"], &[]);
        assert_eq!(extract_key(&pkt), Err(ResponseType::BadOption));
    }

    #[test]
    fn empty_key_is_bad_request() {
        let pkt = request(RequestType::Post, &["channels", "c", "messages"], &["key="]);
        assert_eq!(extract_key(&pkt), Err(ResponseType::BadRequest));
    }

    #[test]
    fn duplicate_key_is_bad_request() {
        let pkt = request(
            RequestType::Post,
            &["channels", "c", "messages"],
            &["key=a", "key=b"],
        );
        assert_eq!(extract_key(&pkt), Err(ResponseType::BadRequest));
    }

    #[test]
    fn key_is_extracted_among_other_queries() {
        let pkt = request(
            RequestType::Post,
            &["channels", "c", "messages"],
            &["foo=bar", "key=secret"],
        );
        assert_eq!(extract_key(&pkt).unwrap(), "secret");
    }

    #[test]
    fn response_mirrors_message_id_and_token() {
        let pkt = request(RequestType::Post, &["channels", "c", "messages"], &[]);
        let reply = response(&pkt, ResponseType::Changed).unwrap();
        assert_eq!(reply.header.message_id, 7);
        assert_eq!(reply.get_token(), &[0xde, 0xad]);
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(
            reply.header.code,
            MessageClass::Response(ResponseType::Changed)
        );
    }
}
