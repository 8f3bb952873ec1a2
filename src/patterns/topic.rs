//! Subscribers pick messages by routing key pattern, e.g. `message.apple.#`.

use tokio::sync::mpsc;

use super::forward;
use crate::client::Channel;
use crate::error::Result;
use crate::message::Properties;
use crate::protocol::{ConsumeOptions, ExchangeOptions};
use crate::routing::ExchangeKind;

pub const EXCHANGE: &str = "warren.topic";

pub async fn setup(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(EXCHANGE, ExchangeKind::Topic, ExchangeOptions { durable: true })
        .await
}

pub fn publish(channel: &Channel, routing_key: &str, message: &str) -> Result<()> {
    channel.basic_publish(EXCHANGE, routing_key, Properties::default(), message)?;
    tracing::info!("Tx: [{routing_key}] {message}");
    Ok(())
}

/// Yields `(routing_key, message)` for every message matching `binding_key`.
pub async fn subscribe(channel: &Channel, binding_key: &str) -> Result<mpsc::UnboundedReceiver<(String, String)>> {
    let queue = channel.queue_declare_exclusive().await?;
    channel.queue_bind(&queue.name, EXCHANGE, binding_key).await?;

    let options = ConsumeOptions {
        no_ack: true,
        exclusive: false,
    };
    let consumer = channel.basic_consume(&queue.name, "", options).await?;

    let binding_key = binding_key.to_owned();
    Ok(forward("topic", consumer, move |delivery| {
        let routing_key = delivery.envelope.routing_key.clone();
        let message = delivery.text().into_owned();
        tracing::info!("Rx: [{binding_key}] {routing_key}: {message}");
        Some((routing_key, message))
    }))
}
