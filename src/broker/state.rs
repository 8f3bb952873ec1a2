use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::config::BrokerConfig;
use super::exchange::{self, Exchange};
use super::queue::{ConsumerSlot, Queue, QueuedMessage};
use super::{Overview, QueueStats};
use crate::error::ReplyCode;
use crate::message::{Envelope, Properties};
use crate::protocol::{ConsumeOptions, ExchangeOptions, Frame, Method, QueueOptions, Reply};
use crate::routing::ExchangeKind;

/// A refused operation. On a channel this closes the channel.
#[derive(Debug)]
pub struct Failure {
    pub code: ReplyCode,
    pub text: String,
}

impl Failure {
    pub fn new(code: ReplyCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn into_reply(self) -> Reply {
        Reply::Error {
            code: self.code,
            text: self.text,
        }
    }
}

type Outcome<T> = Result<T, Failure>;

enum Effect {
    Dispatch {
        vhost: String,
        queue: String,
    },
    Cancel {
        connection: Uuid,
        channel: u16,
        consumer_tag: String,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Requeue,
    Drop,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct ChannelState {
    prefetch: u16,
    /// Sequence number of the last publish, once confirms are enabled.
    publish_seq: Option<u64>,
    last_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consumers: HashSet<String>,
}

struct ConnectionState {
    vhost: String,
    outbound: mpsc::UnboundedSender<Frame>,
    channels: HashMap<u16, ChannelState>,
}

impl ConnectionState {
    fn send(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            tracing::trace!("connection writer already gone");
        }
    }
}

struct VHost {
    name: String,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl VHost {
    fn new(name: &str) -> Self {
        let durable = ExchangeOptions { durable: true };
        let exchanges = [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_owned(), Exchange::new(name, kind, durable)))
        .collect();

        Self {
            name: name.to_owned(),
            exchanges,
            queues: HashMap::new(),
        }
    }

    fn queue_for(&mut self, name: &str, connection: Uuid) -> Outcome<&mut Queue> {
        let Some(queue) = self.queues.get_mut(name) else {
            return Err(Failure::new(
                ReplyCode::NotFound,
                format!("no queue '{name}' in vhost '{}'", self.name),
            ));
        };

        if !queue.accessible_by(connection) {
            return Err(Failure::new(
                ReplyCode::ResourceLocked,
                format!(
                    "cannot obtain exclusive access to locked queue '{name}' in vhost '{}'",
                    self.name
                ),
            ));
        }

        Ok(queue)
    }

    fn delete_queue(&mut self, name: &str) -> Option<Queue> {
        let queue = self.queues.remove(name)?;
        for exchange in self.exchanges.values_mut() {
            exchange.unbind_queue(name);
        }

        tracing::debug!(vhost = %self.name, queue = %name, "queue deleted");
        Some(queue)
    }
}

/// Everything a method on one open channel may touch.
struct Scope<'a> {
    connection: Uuid,
    channel: u16,
    vhost: &'a mut VHost,
    state: &'a mut ChannelState,
    outbound: &'a mpsc::UnboundedSender<Frame>,
    effects: &'a mut Vec<Effect>,
}

impl Scope<'_> {
    fn request(&mut self, method: Method) -> Outcome<Reply> {
        match method {
            Method::ExchangeDeclare {
                exchange,
                kind,
                options,
            } => self.exchange_declare(exchange, kind, options),
            Method::ExchangeDelete { exchange } => self.exchange_delete(&exchange),
            Method::QueueDeclare { queue, options } => self.queue_declare(queue, options),
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
            } => self.queue_bind(&queue, &exchange, &routing_key, true),
            Method::QueueUnbind {
                queue,
                exchange,
                routing_key,
            } => self.queue_bind(&queue, &exchange, &routing_key, false),
            Method::QueuePurge { queue } => {
                let queue = self.vhost.queue_for(&queue, self.connection)?;
                Ok(Reply::MessageCount {
                    message_count: queue.purge(),
                })
            },
            Method::QueueDelete { queue } => self.queue_delete(&queue),
            Method::BasicQos { prefetch_count } => {
                self.state.prefetch = prefetch_count;
                Ok(Reply::Ok)
            },
            Method::BasicConsume {
                queue,
                consumer_tag,
                options,
            } => self.basic_consume(queue, consumer_tag, options),
            Method::BasicCancel { consumer_tag } => self.basic_cancel(&consumer_tag),
            Method::ConfirmSelect => {
                self.state.publish_seq.get_or_insert(0);
                Ok(Reply::Ok)
            },
            Method::ChannelOpen | Method::ChannelClose => Err(Failure::new(
                ReplyCode::InternalError,
                "channel lifecycle methods are not scoped to a channel",
            )),
        }
    }

    fn exchange_declare(
        &mut self,
        exchange: String,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Outcome<Reply> {
        if exchange.is_empty() {
            return Err(Failure::new(
                ReplyCode::AccessRefused,
                "the default exchange cannot be declared",
            ));
        }
        if exchange::is_reserved(&exchange) {
            return Err(Failure::new(
                ReplyCode::AccessRefused,
                format!("exchange name '{exchange}' contains reserved prefix 'amq.'"),
            ));
        }

        let vhost = &self.vhost.name;
        match self.vhost.exchanges.get(&exchange) {
            Some(existing) if existing.kind != kind => Err(Failure::new(
                ReplyCode::PreconditionFailed,
                format!(
                    "inequivalent arg 'type' for exchange '{exchange}' in vhost '{vhost}': received '{kind}' but current is '{}'",
                    existing.kind
                ),
            )),
            Some(existing) if existing.options != options => Err(Failure::new(
                ReplyCode::PreconditionFailed,
                format!("inequivalent arg 'durable' for exchange '{exchange}' in vhost '{vhost}'"),
            )),
            Some(_) => Ok(Reply::Ok),
            None => {
                tracing::debug!(%vhost, %exchange, %kind, "exchange declared");
                let declared = Exchange::new(exchange.clone(), kind, options);
                self.vhost.exchanges.insert(exchange, declared);
                Ok(Reply::Ok)
            },
        }
    }

    fn exchange_delete(&mut self, exchange: &str) -> Outcome<Reply> {
        if exchange.is_empty() || exchange::is_reserved(exchange) {
            return Err(Failure::new(
                ReplyCode::AccessRefused,
                format!("exchange '{exchange}' cannot be deleted"),
            ));
        }

        match self.vhost.exchanges.remove(exchange) {
            Some(_) => Ok(Reply::Ok),
            None => Err(Failure::new(
                ReplyCode::NotFound,
                format!("no exchange '{exchange}' in vhost '{}'", self.vhost.name),
            )),
        }
    }

    fn queue_declare(&mut self, queue: String, options: QueueOptions) -> Outcome<Reply> {
        if exchange::is_reserved(&queue) {
            return Err(Failure::new(
                ReplyCode::AccessRefused,
                format!("queue name '{queue}' contains reserved prefix 'amq.'"),
            ));
        }

        let name = if queue.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue
        };

        let connection = self.connection;
        let vhost = &self.vhost.name;
        let queue = match self.vhost.queues.entry(name.clone()) {
            Entry::Occupied(entry) => {
                let queue = entry.into_mut();
                if !queue.accessible_by(connection) {
                    return Err(Failure::new(
                        ReplyCode::ResourceLocked,
                        format!("cannot obtain exclusive access to locked queue '{name}' in vhost '{vhost}'"),
                    ));
                }
                if queue.options != options {
                    return Err(Failure::new(
                        ReplyCode::PreconditionFailed,
                        format!("inequivalent arguments for queue '{name}' in vhost '{vhost}'"),
                    ));
                }
                queue
            },
            Entry::Vacant(entry) => {
                tracing::debug!(%vhost, queue = %name, ?options, "queue declared");
                let owner = options.exclusive.then_some(connection);
                entry.insert(Queue::new(name, options, owner))
            },
        };

        Ok(Reply::QueueDeclareOk {
            queue: queue.name.clone(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str, bind: bool) -> Outcome<Reply> {
        if exchange.is_empty() {
            return Err(Failure::new(
                ReplyCode::AccessRefused,
                "operation not permitted on the default exchange",
            ));
        }

        self.vhost.queue_for(queue, self.connection)?;
        let Some(target) = self.vhost.exchanges.get_mut(exchange) else {
            return Err(Failure::new(
                ReplyCode::NotFound,
                format!("no exchange '{exchange}' in vhost '{}'", self.vhost.name),
            ));
        };

        if bind {
            target.bind(queue, routing_key);
        } else {
            target.unbind(queue, routing_key);
        }
        Ok(Reply::Ok)
    }

    fn queue_delete(&mut self, queue: &str) -> Outcome<Reply> {
        self.vhost.queue_for(queue, self.connection)?;
        let Some(removed) = self.vhost.delete_queue(queue) else {
            return Err(Failure::new(ReplyCode::NotFound, format!("no queue '{queue}'")));
        };

        let message_count = removed.message_count();
        for slot in removed.consumers {
            self.effects.push(Effect::Cancel {
                connection: slot.connection,
                channel: slot.channel,
                consumer_tag: slot.tag,
            });
        }

        Ok(Reply::MessageCount { message_count })
    }

    fn basic_consume(&mut self, queue: String, consumer_tag: String, options: ConsumeOptions) -> Outcome<Reply> {
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            consumer_tag
        };

        if self.state.consumers.contains(&tag) {
            return Err(Failure::new(
                ReplyCode::NotAllowed,
                format!("attempt to reuse consumer tag '{tag}'"),
            ));
        }

        let vhost = self.vhost.name.clone();
        let target = self.vhost.queue_for(&queue, self.connection)?;
        if target.has_exclusive_consumer() || (options.exclusive && target.consumer_count() > 0) {
            return Err(Failure::new(
                ReplyCode::AccessRefused,
                format!("queue '{queue}' in vhost '{vhost}' in exclusive use"),
            ));
        }

        target.add_consumer(ConsumerSlot {
            tag: tag.clone(),
            connection: self.connection,
            channel: self.channel,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            prefetch: self.state.prefetch,
            in_flight: 0,
        });
        self.state.consumers.insert(tag.clone());
        self.effects.push(Effect::Dispatch { vhost, queue });

        Ok(Reply::ConsumeOk { consumer_tag: tag })
    }

    fn basic_cancel(&mut self, tag: &str) -> Outcome<Reply> {
        if !self.state.consumers.remove(tag) {
            return Ok(Reply::Ok);
        }

        let mut emptied = None;
        for queue in self.vhost.queues.values_mut() {
            if queue.remove_consumer(self.connection, self.channel, tag).is_some() {
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    emptied = Some(queue.name.clone());
                }
                break;
            }
        }

        if let Some(name) = emptied {
            self.vhost.delete_queue(&name);
        }
        Ok(Reply::Ok)
    }

    fn publish(&mut self, exchange: String, routing_key: String, properties: Properties, body: Vec<u8>) -> Outcome<()> {
        let targets: Vec<String> = if exchange.is_empty() {
            // the default exchange routes straight to the queue of the same name
            self.vhost
                .queues
                .contains_key(&routing_key)
                .then(|| routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let Some(source) = self.vhost.exchanges.get(&exchange) else {
                return Err(Failure::new(
                    ReplyCode::NotFound,
                    format!("no exchange '{exchange}' in vhost '{}'", self.vhost.name),
                ));
            };
            source.route(&routing_key).into_iter().map(str::to_owned).collect()
        };

        if targets.is_empty() {
            tracing::trace!(%exchange, %routing_key, "unroutable message dropped");
        }

        for name in targets {
            if let Some(queue) = self.vhost.queues.get_mut(&name) {
                queue.enqueue(QueuedMessage {
                    exchange: exchange.clone(),
                    routing_key: routing_key.clone(),
                    properties: properties.clone(),
                    body: body.clone(),
                    redelivered: false,
                });
                self.effects.push(Effect::Dispatch {
                    vhost: self.vhost.name.clone(),
                    queue: name,
                });
            }
        }

        if let Some(seq) = self.state.publish_seq.as_mut() {
            *seq += 1;
            let confirm = Frame::Confirm {
                channel: self.channel,
                delivery_tag: *seq,
                ack: true,
            };
            if self.outbound.send(confirm).is_err() {
                tracing::trace!("connection writer already gone");
            }
        }

        Ok(())
    }

    fn settle(&mut self, delivery_tag: u64, multiple: bool, mode: Settle) -> Outcome<()> {
        let tags: Vec<u64> = match (multiple, delivery_tag) {
            (true, 0) => self.state.unacked.keys().copied().collect(),
            (true, tag) if self.state.unacked.contains_key(&tag) => {
                self.state.unacked.range(..=tag).map(|(tag, _)| *tag).collect()
            },
            (_, tag) if self.state.unacked.contains_key(&tag) => vec![tag],
            _ => vec![],
        };

        if tags.is_empty() {
            return Err(Failure::new(
                ReplyCode::PreconditionFailed,
                format!("unknown delivery tag {delivery_tag}"),
            ));
        }

        // newest first, so requeued messages keep their original order
        for tag in tags.into_iter().rev() {
            let Some(unacked) = self.state.unacked.remove(&tag) else {
                continue;
            };
            let Some(queue) = self.vhost.queues.get_mut(&unacked.queue) else {
                continue;
            };

            if let Some(slot) = queue.consumer_mut(self.connection, self.channel, &unacked.consumer_tag) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
            if mode == Settle::Requeue {
                queue.requeue(unacked.message);
            }

            self.effects.push(Effect::Dispatch {
                vhost: self.vhost.name.clone(),
                queue: unacked.queue,
            });
        }

        Ok(())
    }
}

/// All broker state. Owned by a single task, see [`super::BrokerService`].
pub struct State {
    users: HashMap<String, String>,
    vhosts: HashMap<String, VHost>,
    connections: HashMap<Uuid, ConnectionState>,
    effects: Vec<Effect>,
}

impl State {
    pub fn new(config: &BrokerConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|user| (user.name.clone(), user.password.clone()))
            .collect();
        let vhosts = config
            .vhosts
            .iter()
            .map(|name| (name.clone(), VHost::new(name)))
            .collect();

        Self {
            users,
            vhosts,
            connections: HashMap::new(),
            effects: vec![],
        }
    }

    pub fn open(
        &mut self,
        username: &str,
        password: &str,
        vhost: &str,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Outcome<Uuid> {
        if self.users.get(username).map(String::as_str) != Some(password) {
            return Err(Failure::new(
                ReplyCode::AccessRefused,
                format!("login was refused for user '{username}'"),
            ));
        }
        if !self.vhosts.contains_key(vhost) {
            return Err(Failure::new(
                ReplyCode::NotAllowed,
                format!("vhost '{vhost}' not found"),
            ));
        }

        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            ConnectionState {
                vhost: vhost.to_owned(),
                outbound,
                channels: HashMap::new(),
            },
        );

        tracing::info!(connection = %id, %username, %vhost, "connection opened");
        Ok(id)
    }

    pub fn handle(&mut self, connection: Uuid, frame: Frame) {
        match frame {
            Frame::Request { id, channel, method } => {
                let reply = self.request(connection, channel, method);
                self.send(connection, Frame::Response { id, channel, reply });
            },
            Frame::Publish {
                channel,
                exchange,
                routing_key,
                properties,
                body,
            } => {
                let result = self
                    .scope(connection, channel)
                    .and_then(|mut scope| scope.publish(exchange, routing_key, properties, body));
                if let Err(failure) = result {
                    self.fail_channel(connection, channel, failure);
                }
            },
            Frame::Ack {
                channel,
                delivery_tag,
                multiple,
            } => self.settle(connection, channel, delivery_tag, multiple, Settle::Ack),
            Frame::Nack {
                channel,
                delivery_tag,
                multiple,
                requeue,
            } => {
                let mode = if requeue { Settle::Requeue } else { Settle::Drop };
                self.settle(connection, channel, delivery_tag, multiple, mode);
            },
            Frame::Close { code, text } => {
                tracing::debug!(%connection, %code, %text, "client closing connection");
                self.send(connection, Frame::CloseOk);
                self.disconnect(connection);
            },
            unexpected => {
                tracing::warn!(%connection, ?unexpected, "unexpected frame from client");
                self.send(
                    connection,
                    Frame::Close {
                        code: ReplyCode::FrameError,
                        text: "unexpected frame".into(),
                    },
                );
                self.disconnect(connection);
            },
        }

        self.apply_effects();
    }

    pub fn disconnect(&mut self, connection: Uuid) {
        let Some(state) = self.connections.get(&connection) else {
            return;
        };

        let channels: Vec<u16> = state.channels.keys().copied().collect();
        for channel in channels {
            self.close_channel(connection, channel);
        }

        let Some(state) = self.connections.remove(&connection) else {
            return;
        };
        if let Some(vhost) = self.vhosts.get_mut(&state.vhost) {
            let owned: Vec<String> = vhost
                .queues
                .values()
                .filter(|queue| queue.owner == Some(connection))
                .map(|queue| queue.name.clone())
                .collect();

            for name in owned {
                vhost.delete_queue(&name);
            }
        }

        tracing::info!(%connection, "connection closed");
        self.apply_effects();
    }

    pub fn overview(&self) -> Overview {
        let mut unacked: HashMap<(&str, &str), u32> = HashMap::new();
        let mut channels = 0;
        for connection in self.connections.values() {
            channels += connection.channels.len();
            for channel in connection.channels.values() {
                for pending in channel.unacked.values() {
                    *unacked
                        .entry((connection.vhost.as_str(), pending.queue.as_str()))
                        .or_default() += 1;
                }
            }
        }

        let mut queues: Vec<QueueStats> = self
            .vhosts
            .values()
            .flat_map(|vhost| vhost.queues.values().map(move |queue| (vhost, queue)))
            .map(|(vhost, queue)| QueueStats {
                vhost: vhost.name.clone(),
                name: queue.name.clone(),
                messages_ready: queue.message_count(),
                messages_unacknowledged: unacked
                    .get(&(vhost.name.as_str(), queue.name.as_str()))
                    .copied()
                    .unwrap_or(0),
                consumers: queue.consumer_count(),
            })
            .collect();
        queues.sort_by(|a, b| (&a.vhost, &a.name).cmp(&(&b.vhost, &b.name)));

        Overview {
            connections: self.connections.len(),
            channels,
            exchanges: self.vhosts.values().map(|vhost| vhost.exchanges.len()).sum(),
            queues,
        }
    }

    fn request(&mut self, connection: Uuid, channel: u16, method: Method) -> Reply {
        let result = match method {
            Method::ChannelOpen => return self.open_channel(connection, channel),
            Method::ChannelClose => {
                self.close_channel(connection, channel);
                return Reply::Ok;
            },
            method => self
                .scope(connection, channel)
                .and_then(|mut scope| scope.request(method)),
        };

        result.unwrap_or_else(|failure| {
            tracing::debug!(%connection, channel, code = %failure.code, text = %failure.text, "closing channel");
            self.close_channel(connection, channel);
            failure.into_reply()
        })
    }

    fn open_channel(&mut self, connection: Uuid, channel: u16) -> Reply {
        let Some(state) = self.connections.get_mut(&connection) else {
            return Failure::new(ReplyCode::ChannelError, "connection is not open").into_reply();
        };
        if channel == 0 {
            return Failure::new(ReplyCode::ChannelError, "channel 0 is reserved").into_reply();
        }
        if state.channels.contains_key(&channel) {
            return Failure::new(ReplyCode::ChannelError, format!("channel {channel} is already open"))
                .into_reply();
        }

        state.channels.insert(channel, ChannelState::default());
        Reply::Ok
    }

    fn scope(&mut self, connection: Uuid, channel: u16) -> Outcome<Scope<'_>> {
        let Some(state) = self.connections.get_mut(&connection) else {
            return Err(Failure::new(ReplyCode::ChannelError, "connection is not open"));
        };
        let Some(vhost) = self.vhosts.get_mut(&state.vhost) else {
            return Err(Failure::new(
                ReplyCode::InternalError,
                format!("vhost '{}' is gone", state.vhost),
            ));
        };
        let Some(channel_state) = state.channels.get_mut(&channel) else {
            return Err(Failure::new(
                ReplyCode::ChannelError,
                format!("channel {channel} is not open"),
            ));
        };

        Ok(Scope {
            connection,
            channel,
            vhost,
            state: channel_state,
            outbound: &state.outbound,
            effects: &mut self.effects,
        })
    }

    fn settle(&mut self, connection: Uuid, channel: u16, delivery_tag: u64, multiple: bool, mode: Settle) {
        let result = self
            .scope(connection, channel)
            .and_then(|mut scope| scope.settle(delivery_tag, multiple, mode));
        if let Err(failure) = result {
            self.fail_channel(connection, channel, failure);
        }
    }

    fn fail_channel(&mut self, connection: Uuid, channel: u16, failure: Failure) {
        tracing::debug!(%connection, channel, code = %failure.code, text = %failure.text, "channel failed");
        self.close_channel(connection, channel);
        self.send(
            connection,
            Frame::ChannelClose {
                channel,
                code: failure.code,
                text: failure.text,
            },
        );
    }

    /// Drops the channel's consumers and requeues everything it left
    /// unacknowledged.
    fn close_channel(&mut self, connection: Uuid, channel: u16) {
        let Some(state) = self.connections.get_mut(&connection) else {
            return;
        };
        let Some(closed) = state.channels.remove(&channel) else {
            return;
        };
        let Some(vhost) = self.vhosts.get_mut(&state.vhost) else {
            return;
        };

        let mut emptied = vec![];
        for queue in vhost.queues.values_mut() {
            let removed = queue.remove_channel_consumers(connection, channel);
            if !removed.is_empty() && queue.consumers.is_empty() && queue.options.auto_delete {
                emptied.push(queue.name.clone());
            }
        }

        for (_, unacked) in closed.unacked.into_iter().rev() {
            if let Some(queue) = vhost.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
                self.effects.push(Effect::Dispatch {
                    vhost: vhost.name.clone(),
                    queue: unacked.queue,
                });
            }
        }

        for name in emptied {
            vhost.delete_queue(&name);
        }
    }

    fn send(&self, connection: Uuid, frame: Frame) {
        if let Some(state) = self.connections.get(&connection) {
            state.send(frame);
        }
    }

    fn apply_effects(&mut self) {
        while !self.effects.is_empty() {
            for effect in std::mem::take(&mut self.effects) {
                match effect {
                    Effect::Dispatch { vhost, queue } => self.dispatch(&vhost, &queue),
                    Effect::Cancel {
                        connection,
                        channel,
                        consumer_tag,
                    } => {
                        let Some(state) = self.connections.get_mut(&connection) else {
                            continue;
                        };
                        if let Some(channel_state) = state.channels.get_mut(&channel) {
                            channel_state.consumers.remove(&consumer_tag);
                        }
                        state.send(Frame::Cancel { channel, consumer_tag });
                    },
                }
            }
        }
    }

    /// Hands ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, vhost: &str, queue: &str) {
        let Some(queue) = self.vhosts.get_mut(vhost).and_then(|v| v.queues.get_mut(queue)) else {
            return;
        };

        while !queue.messages.is_empty() {
            let Some(index) = queue.next_consumer() else {
                break;
            };

            let (connection, channel) = (queue.consumers[index].connection, queue.consumers[index].channel);
            let Some(state) = self.connections.get_mut(&connection) else {
                tracing::warn!(%connection, "dropping consumer of a closed connection");
                let tag = queue.consumers[index].tag.clone();
                queue.remove_consumer(connection, channel, &tag);
                continue;
            };
            let Some(channel_state) = state.channels.get_mut(&channel) else {
                tracing::warn!(%connection, channel, "dropping consumer of a closed channel");
                let tag = queue.consumers[index].tag.clone();
                queue.remove_consumer(connection, channel, &tag);
                continue;
            };
            let Some(message) = queue.messages.pop_front() else {
                break;
            };

            channel_state.last_delivery_tag += 1;
            let delivery_tag = channel_state.last_delivery_tag;
            let slot = &mut queue.consumers[index];

            let frame = Frame::Deliver {
                channel,
                consumer_tag: slot.tag.clone(),
                envelope: Envelope {
                    delivery_tag,
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                },
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if !slot.no_ack {
                slot.in_flight += 1;
                channel_state.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue.name.clone(),
                        consumer_tag: slot.tag.clone(),
                        message,
                    },
                );
            }

            tracing::trace!(queue = %queue.name, %connection, channel, delivery_tag, "delivering");
            state.send(frame);
        }
    }
}
