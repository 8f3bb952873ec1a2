//! Point to point over a direct exchange.

use std::time::Duration;

use tokio::sync::mpsc;

use super::forward;
use crate::client::Channel;
use crate::error::Result;
use crate::message::Properties;
use crate::protocol::{ConsumeOptions, ExchangeOptions, QueueOptions};
use crate::routing::ExchangeKind;

pub const EXCHANGE: &str = "warren.direct";
pub const QUEUE: &str = "warren.hello";
pub const ROUTING_KEY: &str = "hello";

pub async fn setup(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(EXCHANGE, ExchangeKind::Direct, ExchangeOptions { durable: true })
        .await?;
    channel.queue_declare(QUEUE, QueueOptions::default()).await?;
    channel.queue_bind(QUEUE, EXCHANGE, ROUTING_KEY).await
}

pub fn send(channel: &Channel, message: &str) -> Result<()> {
    channel.basic_publish(EXCHANGE, ROUTING_KEY, Properties::default(), message)?;
    tracing::info!("Tx: {message}");
    Ok(())
}

/// Sends a persistent message and waits for the broker to take it.
pub async fn send_confirmed(channel: &Channel, message: &str, timeout: Duration) -> Result<()> {
    channel.confirm_select().await?;
    channel.basic_publish(EXCHANGE, ROUTING_KEY, Properties::persistent_text_plain(), message)?;
    channel.wait_for_confirms_or_die(timeout).await?;

    tracing::info!("Tx: {message} (confirmed)");
    Ok(())
}

/// Starts a consumer on the hello queue. With `manual_ack` only one message
/// is in flight at a time and each is acknowledged after it was handled.
pub async fn receive(channel: &Channel, manual_ack: bool) -> Result<mpsc::UnboundedReceiver<String>> {
    if manual_ack {
        channel.basic_qos(1).await?;
    }

    let options = ConsumeOptions {
        no_ack: !manual_ack,
        exclusive: false,
    };
    let consumer = channel.basic_consume(QUEUE, "", options).await?;

    Ok(forward("hello", consumer, move |delivery| {
        let message = delivery.text().into_owned();
        tracing::info!("Rx: {message}");

        if manual_ack {
            if let Err(err) = delivery.ack() {
                tracing::warn!(%err, "ack failed");
                return None;
            }
        }
        Some(message)
    }))
}
