use std::borrow::Cow;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::channel::ChannelShared;
use crate::error::Result;
use crate::message::{Envelope, Properties};
use crate::protocol::Frame;

/// One message handed to a consumer.
pub struct Delivery {
    pub consumer_tag: String,
    pub envelope: Envelope,
    pub properties: Properties,
    pub body: Vec<u8>,
    pub(crate) channel: Arc<ChannelShared>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("consumer_tag", &self.consumer_tag)
            .field("envelope", &self.envelope)
            .field("properties", &self.properties)
            .field("body.len", &self.body.len())
            .finish()
    }
}

impl Delivery {
    pub fn delivery_tag(&self) -> u64 {
        self.envelope.delivery_tag
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn ack(&self) -> Result<()> {
        self.channel.send(Frame::Ack {
            channel: self.channel.id(),
            delivery_tag: self.delivery_tag(),
            multiple: false,
        })
    }

    pub fn nack(&self, requeue: bool) -> Result<()> {
        self.channel.send(Frame::Nack {
            channel: self.channel.id(),
            delivery_tag: self.delivery_tag(),
            multiple: false,
            requeue,
        })
    }

    pub fn reject(&self, requeue: bool) -> Result<()> {
        self.nack(requeue)
    }
}

/// Deliveries for one consumer tag. Ends when the consumer is cancelled or
/// its channel closes.
pub struct Consumer {
    tag: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("tag", &self.tag).finish()
    }
}

impl Consumer {
    pub(crate) fn new(tag: String, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { tag, rx }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}
