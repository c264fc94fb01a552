//! CoAP adapter: RFC 7252 request/response and RFC 7641 Observe over a
//! single UDP socket, bridging devices onto the internal bus.

pub mod handlers;
pub mod observers;
pub mod transport;

pub use handlers::CoapService;
pub use observers::{Observer, ObserverTable};
pub use transport::CoapServer;
