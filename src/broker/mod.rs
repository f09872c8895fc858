//! # Broker Connection Module
//!
//! Owns the single connection to an MQTT broker. Protocol correctness
//! (CONNECT/CONNACK, PUBLISH acknowledgements, SUBSCRIBE handshakes,
//! keep-alive pings, TLS) is delegated entirely to `rumqttc`; this module
//! wraps the client in a connection actor and exposes a cloneable handle.
//!
//! ## Module Architecture
//!
//! ```text
//! broker/
//! ├── config.rs     - BrokerConfig, TLS settings, reconnect policy
//! └── connection.rs - connection actor, BrokerHandle, ConnectionState
//! ```
//!
//! ## Connection Lifecycle
//!
//! The actor task owns the `AsyncClient` and its event loop. Commands
//! (connect, disconnect, subscribe, publish) arrive over an mpsc channel, so
//! publishes from any number of broadcast workers are serialized through a
//! single consumer. Incoming packets and state transitions leave the actor as
//! `BrokerEvent`s on another channel; nothing else touches the rumqttc
//! callback surface.
//!
//! On an unexpected disconnect the actor re-polls with a bounded exponential
//! backoff. The backoff wait happens inside the actor loop, so a second
//! reconnect attempt can never start while one is in flight. Authentication
//! rejections are fatal and never retried.

pub mod config;
pub mod connection;

pub use config::{BrokerConfig, ReconnectPolicy, TlsConfig};
pub use connection::{
    qos_from_level, BrokerError, BrokerEvent, BrokerHandle, ConnectionState, PublishError,
};
