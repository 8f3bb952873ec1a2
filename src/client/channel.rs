use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use super::connection::Shared;
use super::consumer::{Consumer, Delivery};
use crate::error::{Error, ReplyCode, Result};
use crate::message::{Envelope, Properties};
use crate::protocol::{self, ConsumeOptions, ExchangeOptions, Frame, Method, QueueOptions, Reply, MAX_FRAME_SIZE};
use crate::routing::ExchangeKind;

/// Result of a queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

struct ConsumerEntry {
    tx: mpsc::UnboundedSender<Delivery>,
    no_ack: bool,
}

#[derive(Default)]
struct Confirms {
    next_seq: u64,
    outstanding: BTreeSet<u64>,
    nacked: bool,
}

#[derive(Default)]
struct ChannelInner {
    closed: bool,
    failure: Option<(ReplyCode, String)>,
    consumers: HashMap<String, ConsumerEntry>,
    confirms: Option<Confirms>,
}

/// Channel state reachable from the connection reader and from deliveries.
pub(crate) struct ChannelShared {
    id: u16,
    outbound: mpsc::UnboundedSender<Frame>,
    inner: Mutex<ChannelInner>,
    settled: Notify,
}

impl ChannelShared {
    pub(crate) fn new(id: u16, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id,
            outbound,
            inner: Mutex::new(ChannelInner::default()),
            settled: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    fn inner(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(inner: &ChannelInner) -> Result<()> {
        match (&inner.failure, inner.closed) {
            (Some((code, text)), _) => Err(Error::Channel {
                code: *code,
                text: text.clone(),
            }),
            (None, true) => Err(Error::ChannelClosed),
            (None, false) => Ok(()),
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        Self::check_open(&self.inner())
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.ensure_open()?;
        self.outbound.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) fn deliver(self: &Arc<Self>, consumer_tag: String, envelope: Envelope, properties: Properties, body: Vec<u8>) {
        let inner = self.inner();
        let Some(entry) = inner.consumers.get(&consumer_tag) else {
            tracing::debug!(channel = self.id, %consumer_tag, "delivery for an unknown consumer");
            return;
        };

        let delivery_tag = envelope.delivery_tag;
        let no_ack = entry.no_ack;
        let delivery = Delivery {
            consumer_tag,
            envelope,
            properties,
            body,
            channel: self.clone(),
        };

        if entry.tx.send(delivery).is_err() && !no_ack {
            tracing::warn!(channel = self.id, delivery_tag, "consumer dropped, delivery left unacknowledged");
        }
    }

    pub(crate) fn confirm(&self, delivery_tag: u64, ack: bool) {
        let mut inner = self.inner();
        if let Some(confirms) = inner.confirms.as_mut() {
            confirms.outstanding.remove(&delivery_tag);
            confirms.nacked |= !ack;
        }
        drop(inner);

        self.settled.notify_waiters();
    }

    pub(crate) fn cancelled(&self, consumer_tag: &str) {
        tracing::info!(channel = self.id, %consumer_tag, "consumer cancelled by the broker");
        self.inner().consumers.remove(consumer_tag);
    }

    pub(crate) fn mark_closed(&self, failure: Option<(ReplyCode, String)>) {
        let mut inner = self.inner();
        inner.closed = true;
        if inner.failure.is_none() {
            inner.failure = failure;
        }
        inner.consumers.clear();
        drop(inner);

        self.settled.notify_waiters();
    }

    /// `Some(all_acked)` once nothing published is waiting for a confirm.
    fn confirms_settled(&self) -> Result<Option<bool>> {
        let mut inner = self.inner();
        Self::check_open(&inner)?;

        let Some(confirms) = inner.confirms.as_mut() else {
            return Err(Error::Protocol("publisher confirms are not enabled".into()));
        };
        if !confirms.outstanding.is_empty() {
            return Ok(None);
        }

        let all_acked = !confirms.nacked;
        confirms.nacked = false;
        Ok(Some(all_acked))
    }
}

/// A channel on a [`super::Connection`]. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    connection: Arc<Shared>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, connection: Arc<Shared>) -> Self {
        Self { shared, connection }
    }

    pub fn id(&self) -> u16 {
        self.shared.id()
    }

    pub fn is_open(&self) -> bool {
        !self.connection.is_closed() && self.shared.ensure_open().is_ok()
    }

    async fn request(&self, method: Method) -> Result<Reply> {
        self.shared.ensure_open()?;

        match self.connection.request(self.id(), method).await? {
            Reply::Error { code, text } => {
                self.connection.forget_channel(self.id());
                self.shared.mark_closed(Some((code, text.clone())));
                Err(Error::Channel { code, text })
            },
            reply => Ok(reply),
        }
    }

    async fn request_ok(&self, method: Method) -> Result<()> {
        match self.request(method).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<()> {
        self.request_ok(Method::ExchangeDeclare {
            exchange: exchange.to_owned(),
            kind,
            options,
        })
        .await
    }

    pub async fn exchange_delete(&self, exchange: &str) -> Result<()> {
        self.request_ok(Method::ExchangeDelete {
            exchange: exchange.to_owned(),
        })
        .await
    }

    /// Declares a queue. An empty name asks the broker to pick one.
    pub async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<QueueInfo> {
        let method = Method::QueueDeclare {
            queue: queue.to_owned(),
            options,
        };

        match self.request(method).await? {
            Reply::QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => Ok(QueueInfo {
                name: queue,
                message_count,
                consumer_count,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// A server-named queue that lives as long as this connection.
    pub async fn queue_declare_exclusive(&self) -> Result<QueueInfo> {
        let options = QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
        };
        self.queue_declare("", options).await
    }

    pub async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.request_ok(Method::QueueBind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        })
        .await
    }

    pub async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.request_ok(Method::QueueUnbind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        })
        .await
    }

    /// Returns the number of messages dropped.
    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        let reply = self.request(Method::QueuePurge { queue: queue.to_owned() }).await?;
        message_count(reply)
    }

    pub async fn queue_delete(&self, queue: &str) -> Result<u32> {
        let reply = self.request(Method::QueueDelete { queue: queue.to_owned() }).await?;
        message_count(reply)
    }

    /// Limits unacknowledged deliveries per consumer started after this
    /// call. Zero means no limit.
    pub async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.request_ok(Method::BasicQos { prefetch_count }).await
    }

    pub async fn basic_consume(&self, queue: &str, consumer_tag: &str, options: ConsumeOptions) -> Result<Consumer> {
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            consumer_tag.to_owned()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.shared.inner();
            ChannelShared::check_open(&inner)?;
            if inner.consumers.contains_key(&tag) {
                return Err(Error::Protocol(format!("consumer tag '{tag}' is already in use")));
            }
            inner.consumers.insert(
                tag.clone(),
                ConsumerEntry {
                    tx,
                    no_ack: options.no_ack,
                },
            );
        }

        let method = Method::BasicConsume {
            queue: queue.to_owned(),
            consumer_tag: tag.clone(),
            options,
        };
        match self.request(method).await {
            Ok(Reply::ConsumeOk { .. }) => Ok(Consumer::new(tag, rx)),
            Ok(other) => {
                self.shared.inner().consumers.remove(&tag);
                Err(unexpected(other))
            },
            Err(err) => {
                self.shared.inner().consumers.remove(&tag);
                Err(err)
            },
        }
    }

    /// Stops a consumer. Its stream ends once the broker confirms.
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.request_ok(Method::BasicCancel {
            consumer_tag: consumer_tag.to_owned(),
        })
        .await?;

        self.shared.inner().consumers.remove(consumer_tag);
        Ok(())
    }

    pub fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let body = body.into();
        let len = protocol::publish_len(exchange, routing_key, &properties, body.len())?;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        let frame = Frame::Publish {
            channel: self.id(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body,
        };

        // sequence numbers must follow send order
        let mut inner = self.shared.inner();
        ChannelShared::check_open(&inner)?;
        self.connection.send(frame)?;

        if let Some(confirms) = inner.confirms.as_mut() {
            confirms.next_seq += 1;
            confirms.outstanding.insert(confirms.next_seq);
        }
        Ok(())
    }

    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.shared.send(Frame::Ack {
            channel: self.id(),
            delivery_tag,
            multiple,
        })
    }

    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.shared.send(Frame::Nack {
            channel: self.id(),
            delivery_tag,
            multiple,
            requeue,
        })
    }

    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.basic_nack(delivery_tag, false, requeue)
    }

    /// Puts the channel in confirm mode: every publish from now on is
    /// acknowledged by the broker.
    pub async fn confirm_select(&self) -> Result<()> {
        self.request_ok(Method::ConfirmSelect).await?;
        self.shared.inner().confirms.get_or_insert_with(Confirms::default);
        Ok(())
    }

    /// Waits until every publish so far is confirmed. `false` if any was
    /// nacked.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> Result<bool> {
        let wait = async {
            loop {
                let notified = self.shared.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(all_acked) = self.shared.confirms_settled()? {
                    return Ok::<_, Error>(all_acked);
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout("publisher confirms"))?
    }

    /// Like [`Channel::wait_for_confirms`], but a nack is an error.
    pub async fn wait_for_confirms_or_die(&self, timeout: Duration) -> Result<()> {
        match self.wait_for_confirms(timeout).await? {
            true => Ok(()),
            false => Err(Error::Nacked),
        }
    }

    pub async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }

        self.request_ok(Method::ChannelClose).await?;
        self.connection.forget_channel(self.id());
        self.shared.mark_closed(None);
        Ok(())
    }
}

fn message_count(reply: Reply) -> Result<u32> {
    match reply {
        Reply::MessageCount { message_count } => Ok(message_count),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(format!("unexpected reply: {reply:?}"))
}
