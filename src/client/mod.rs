//! Client side of the broker protocol, shaped after the usual AMQP client:
//! a [`Connection`] multiplexes [`Channel`]s, channels declare topology,
//! publish and start [`Consumer`]s.

mod channel;
mod connection;
mod consumer;

pub use channel::{Channel, QueueInfo};
pub use connection::{Connection, ConnectionParams, TlsParams, AMQPS_PORT, AMQP_PORT};
pub use consumer::{Consumer, Delivery};
