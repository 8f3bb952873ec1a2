//! Wire frames exchanged between clients and the broker.
//!
//! Every frame is one line of JSON terminated by `\n`. Message bodies are
//! carried base64 encoded so that arbitrary bytes survive the text encoding.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, ReplyCode, Result};
use crate::message::{Envelope, Properties};
use crate::routing::ExchangeKind;

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
pub struct ExchangeOptions {
    #[serde(default)]
    pub durable: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
pub struct QueueOptions {
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
pub struct ConsumeOptions {
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
}

/// Synchronous methods; each one is answered by exactly one [`Reply`].
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum Method {
    ChannelOpen,
    ChannelClose,
    ExchangeDeclare {
        exchange: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
    },
    ExchangeDelete {
        exchange: String,
    },
    QueueDeclare {
        queue: String,
        options: QueueOptions,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    QueuePurge {
        queue: String,
    },
    QueueDelete {
        queue: String,
    },
    BasicQos {
        prefetch_count: u16,
    },
    BasicConsume {
        queue: String,
        consumer_tag: String,
        options: ConsumeOptions,
    },
    BasicCancel {
        consumer_tag: String,
    },
    ConfirmSelect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum Reply {
    Ok,
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    ConsumeOk {
        consumer_tag: String,
    },
    MessageCount {
        message_count: u32,
    },
    Error {
        code: ReplyCode,
        text: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
#[serde(tag = "frame", content = "content", rename_all = "kebab-case")]
pub enum Frame {
    Open {
        username: String,
        password: String,
        vhost: String,
    },
    OpenOk {
        connection: Uuid,
    },
    Request {
        id: u64,
        channel: u16,
        method: Method,
    },
    Response {
        id: u64,
        channel: u16,
        reply: Reply,
    },
    Publish {
        channel: u16,
        exchange: String,
        routing_key: String,
        properties: Properties,
        #[serde(with = "body")]
        body: Vec<u8>,
    },
    Ack {
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
    },
    Nack {
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Deliver {
        channel: u16,
        consumer_tag: String,
        envelope: Envelope,
        properties: Properties,
        #[serde(with = "body")]
        body: Vec<u8>,
    },
    Confirm {
        channel: u16,
        delivery_tag: u64,
        ack: bool,
    },
    Cancel {
        channel: u16,
        consumer_tag: String,
    },
    ChannelClose {
        channel: u16,
        code: ReplyCode,
        text: String,
    },
    Close {
        code: ReplyCode,
        text: String,
    },
    CloseOk,
}

mod body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Reads the next frame. `Ok(None)` means the peer closed the stream between
/// frames.
pub async fn read_frame<R>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();
    let len = (&mut *reader)
        .take(MAX_FRAME_SIZE as u64 + 1)
        .read_until(b'\n', buffer)
        .await?;

    match (len, buffer.last()) {
        (0, _) => Ok(None),
        (_, Some(&b'\n')) => Ok(Some(serde_json::from_slice(&buffer[..len - 1])?)),
        (len, _) if len > MAX_FRAME_SIZE => Err(Error::FrameTooLarge(len)),
        _ => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream closed in the middle of a frame",
        ))),
    }
}

/// Writes one frame. The caller decides when to flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(bytes.len()));
    }
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Encoded size of a publish frame, give or take JSON escaping.
pub fn publish_len(exchange: &str, routing_key: &str, properties: &Properties, body_len: usize) -> Result<usize> {
    const FRAME_FIELDS: usize = 128;
    let properties = serde_json::to_vec(properties)?.len();
    Ok(FRAME_FIELDS + exchange.len() + routing_key.len() + properties + 4 * body_len.div_ceil(3))
}

/// Drains queued frames into `writer`, flushing whenever the queue runs dry.
/// Stops after a connection close has been written or once every sender is
/// gone, then shuts the write side down.
pub async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Frame>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let last = matches!(frame, Frame::Close { .. } | Frame::CloseOk);
        write_frame(&mut writer, &frame).await?;

        if last {
            break;
        }
        if rx.is_empty() {
            writer.flush().await?;
        }
    }

    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}
