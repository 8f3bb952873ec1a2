//! An in-process message broker with AMQP semantics (exchanges, queues,
//! bindings, acknowledgements, prefetch and publisher confirms), a client for
//! it that speaks a line-delimited JSON protocol over TCP or TLS, and the
//! usual messaging patterns built on top.

pub mod broker;
pub mod client;
pub mod error;
pub mod message;
pub mod patterns;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod settings;
pub mod tls;

pub use broker::{Broker, BrokerConfig};
pub use client::{Channel, Connection, ConnectionParams, Consumer, Delivery};
pub use error::{Error, ReplyCode, Result};
