//! Request and reply. The client names its own reply queue in `reply_to` and
//! matches answers to calls by `correlation_id`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{Channel, Consumer};
use crate::error::{Error, Result};
use crate::message::Properties;
use crate::protocol::{ConsumeOptions, ExchangeOptions, QueueOptions};
use crate::routing::ExchangeKind;

pub const EXCHANGE: &str = "warren.rpc.exchange";
pub const QUEUE: &str = "warren.rpc";
pub const ROUTING_KEY: &str = "rpc";

async fn declare_exchange(channel: &Channel) -> Result<()> {
    channel
        .exchange_declare(EXCHANGE, ExchangeKind::Direct, ExchangeOptions { durable: true })
        .await
}

pub fn uppercase(request: &str) -> String {
    request.to_uppercase()
}

/// Answers every request on the rpc queue with `handler(request)`.
pub struct RpcServer {
    task: JoinHandle<()>,
}

impl RpcServer {
    pub async fn start<F>(channel: Channel, handler: F) -> Result<Self>
    where
        F: Fn(&str) -> String + Send + 'static,
    {
        declare_exchange(&channel).await?;
        channel.queue_declare(QUEUE, QueueOptions::default()).await?;
        channel.queue_bind(QUEUE, EXCHANGE, ROUTING_KEY).await?;
        channel.basic_qos(1).await?;

        let consumer = channel.basic_consume(QUEUE, "", ConsumeOptions::default()).await?;
        let task = tokio::spawn(Self::serve(channel, consumer, handler));
        Ok(Self { task })
    }

    #[tracing::instrument(name = "rpc_server", skip_all)]
    async fn serve<F>(channel: Channel, mut consumer: Consumer, handler: F)
    where
        F: Fn(&str) -> String,
    {
        while let Some(delivery) = consumer.recv().await {
            let request = delivery.text();
            tracing::info!("Server Rx: {request}");

            let (Some(reply_to), Some(correlation_id)) =
                (&delivery.properties.reply_to, &delivery.properties.correlation_id)
            else {
                tracing::warn!(delivery_tag = delivery.delivery_tag(), "request without reply_to, dropping");
                if let Err(err) = delivery.reject(false) {
                    tracing::warn!(%err, "reject failed");
                }
                continue;
            };

            let response = handler(&request);
            let properties = Properties::builder().correlation_id(correlation_id.as_str()).build();
            if let Err(err) = channel.basic_publish(EXCHANGE, reply_to, properties, response.as_str()) {
                tracing::warn!(%err, "reply failed");
                break;
            }
            tracing::info!("Server Tx: {response}");

            if let Err(err) = delivery.ack() {
                tracing::warn!(%err, "ack failed");
                break;
            }
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sends requests and waits for the matching replies.
pub struct RpcClient {
    channel: Channel,
    reply_queue: String,
    pending: Arc<DashMap<String, oneshot::Sender<String>>>,
    task: JoinHandle<()>,
}

impl RpcClient {
    pub async fn new(channel: Channel) -> Result<Self> {
        declare_exchange(&channel).await?;
        let reply_queue = channel.queue_declare_exclusive().await?.name;
        // the queue name is unique, so it doubles as the reply routing key
        channel.queue_bind(&reply_queue, EXCHANGE, &reply_queue).await?;

        let options = ConsumeOptions {
            no_ack: true,
            exclusive: true,
        };
        let consumer = channel.basic_consume(&reply_queue, "", options).await?;

        let pending = Arc::new(DashMap::new());
        let task = tokio::spawn(Self::dispatch(consumer, pending.clone()));

        Ok(Self {
            channel,
            reply_queue,
            pending,
            task,
        })
    }

    async fn dispatch(mut consumer: Consumer, pending: Arc<DashMap<String, oneshot::Sender<String>>>) {
        while let Some(delivery) = consumer.recv().await {
            let Some(correlation_id) = &delivery.properties.correlation_id else {
                tracing::warn!("reply without correlation id");
                continue;
            };

            match pending.remove(correlation_id) {
                Some((_, tx)) => {
                    let _ = tx.send(delivery.text().into_owned());
                },
                None => tracing::debug!(%correlation_id, "late or unknown reply"),
            }
        }

        // wake up every caller still waiting
        pending.clear();
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub async fn call(&self, request: &str, timeout: Duration) -> Result<String> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        let properties = Properties::builder()
            .correlation_id(correlation_id.as_str())
            .reply_to(self.reply_queue.as_str())
            .build();
        if let Err(err) = self.channel.basic_publish(EXCHANGE, ROUTING_KEY, properties, request) {
            self.pending.remove(&correlation_id);
            return Err(err);
        }
        tracing::info!("Client Tx: {request}");

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::ChannelClosed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                return Err(Error::Timeout("rpc reply"));
            },
        };

        tracing::info!("Client Rx: {response}");
        Ok(response)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}
