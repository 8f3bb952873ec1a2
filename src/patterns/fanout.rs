//! Every subscriber gets its own copy of every message.

use tokio::sync::mpsc;

use super::forward;
use crate::client::Channel;
use crate::error::Result;
use crate::message::Properties;
use crate::protocol::{ConsumeOptions, ExchangeOptions};
use crate::routing::ExchangeKind;

pub const EXCHANGE: &str = "warren.fanout";

pub async fn setup(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(EXCHANGE, ExchangeKind::Fanout, ExchangeOptions { durable: true })
        .await
}

pub fn broadcast(channel: &Channel, message: &str) -> Result<()> {
    channel.basic_publish(EXCHANGE, "", Properties::default(), message)?;
    tracing::info!("Tx: {message}");
    Ok(())
}

/// Binds a fresh server-named queue to the exchange and consumes from it.
pub async fn subscribe(channel: &Channel, name: &'static str) -> Result<mpsc::UnboundedReceiver<String>> {
    let queue = channel.queue_declare_exclusive().await?;
    channel.queue_bind(&queue.name, EXCHANGE, "").await?;

    let options = ConsumeOptions {
        no_ack: true,
        exclusive: false,
    };
    let consumer = channel.basic_consume(&queue.name, "", options).await?;

    Ok(forward(name, consumer, move |delivery| {
        let message = delivery.text().into_owned();
        tracing::info!("Rx: [{name}] {message}");
        Some(message)
    }))
}
