mod properties;

use serde::{Deserialize, Serialize};

pub use properties::{DeliveryMode, Properties, PropertiesBuilder};

/// Where a delivered message came from and how to acknowledge it.
///
/// `delivery_tag` is scoped to the channel the message was delivered on and
/// starts at 1.
#[derive(Clone, Debug, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}
