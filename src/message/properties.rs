use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// AMQP delivery mode, with its wire values.
#[rustfmt::skip]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

/// Basic content properties carried next to every message body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[derive(Builder, Deserialize, Serialize)]
#[builder(default, pattern = "owned", build_fn(private, name = "try_build"))]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(strip_option))]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(strip_option))]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub message_id: Option<String>,
    /// Accepts a `SystemTime` as well.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(setter(into, strip_option))]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(setter(custom))]
    pub headers: BTreeMap<String, String>,
}

impl Properties {
    pub fn builder() -> PropertiesBuilder {
        PropertiesBuilder::default()
    }

    /// `text/plain`, persisted by the broker.
    pub fn persistent_text_plain() -> Self {
        Self::builder()
            .content_type("text/plain")
            .delivery_mode(DeliveryMode::Persistent)
            .build()
    }

    pub fn persistent_basic() -> Self {
        Self::builder()
            .content_type("application/octet-stream")
            .delivery_mode(DeliveryMode::Persistent)
            .build()
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DeliveryMode::Persistent)
    }
}

impl PropertiesBuilder {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Properties {
        // every field has a default
        self.try_build().unwrap_or_default()
    }
}
