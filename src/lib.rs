//! # edgebus: IoT messaging core
//!
//! edgebus bridges device-facing protocols onto an internal pub/sub bus and
//! evaluates per-message user-defined logic at the edge. Three subsystems
//! share its state and failure semantics:
//!
//! - the **CoAP adapter** ([`coap`]): RFC 7252 request/response plus
//!   RFC 7641 Observe over a single UDP socket, translating device writes
//!   into bus publications and bus messages into observe notifications,
//!   with keep-alive probing and bounded retransmission;
//! - the **LoRa bridge** ([`lora`]): an event-sourced route map from
//!   external application/device identifiers to internal channel/client
//!   identifiers, republishing decoded uplinks onto the bus;
//! - the **rules engine** ([`rules`]): a per-message evaluator running Lua
//!   or sandboxed WASM logic against inbound traffic, dispatching results
//!   to typed outputs, plus a ticker for scheduled rules.
//!
//! The subsystems meet on four collaborator seams: [`auth::Authorizer`],
//! [`bus::MessageBus`], [`routemap::RouteMap`] and
//! [`rules::repo::RuleRepository`]. Everything else (HTTP shells, metrics,
//! TLS, provisioning APIs) lives outside this crate.

pub mod auth;
pub mod bus;
pub mod coap;
pub mod config;
pub mod lora;
pub mod message;
pub mod routemap;
pub mod rules;
pub mod senml;
pub mod time_provider;

pub use bus::{MessageBus, MessageBusExt};
pub use config::Config;
pub use message::Message;
