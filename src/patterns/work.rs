//! Several workers sharing one queue. Each worker holds at most one
//! unacknowledged task, so a slow worker does not pile up work.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::Channel;
use crate::error::Result;
use crate::message::Properties;
use crate::protocol::{ConsumeOptions, ExchangeOptions, QueueOptions};
use crate::routing::ExchangeKind;

pub const EXCHANGE: &str = "warren.work";
pub const QUEUE: &str = "warren.tasks";
pub const ROUTING_KEY: &str = "task";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completed {
    pub worker: String,
    pub task: String,
}

pub async fn setup(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(EXCHANGE, ExchangeKind::Direct, ExchangeOptions { durable: true })
        .await?;
    channel.queue_declare(QUEUE, QueueOptions::default()).await?;
    channel.queue_bind(QUEUE, EXCHANGE, ROUTING_KEY).await
}

pub fn submit(channel: &Channel, task: &str) -> Result<()> {
    channel.basic_publish(EXCHANGE, ROUTING_KEY, Properties::persistent_text_plain(), task)?;
    tracing::info!("Tx: [producer] {task}");
    Ok(())
}

/// Starts a worker that spends `effort` on every task before acknowledging
/// it.
pub async fn spawn_worker(
    channel: &Channel,
    name: impl Into<String>,
    effort: Duration,
) -> Result<mpsc::UnboundedReceiver<Completed>> {
    let name = name.into();
    channel.basic_qos(1).await?;
    let mut consumer = channel.basic_consume(QUEUE, "", ConsumeOptions::default()).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(delivery) = consumer.recv().await {
            let task = delivery.text().into_owned();
            tracing::info!("Rx: [{name}] {task}");

            tokio::time::sleep(effort).await;
            if let Err(err) = delivery.ack() {
                tracing::warn!(worker = %name, %err, "ack failed");
                break;
            }

            let completed = Completed {
                worker: name.clone(),
                task,
            };
            if tx.send(completed).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
