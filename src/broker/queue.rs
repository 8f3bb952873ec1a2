use std::collections::VecDeque;

use uuid::Uuid;

use crate::message::Properties;
use crate::protocol::QueueOptions;

#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Clone, Debug)]
pub struct ConsumerSlot {
    pub tag: String,
    pub connection: Uuid,
    pub channel: u16,
    pub no_ack: bool,
    pub exclusive: bool,
    /// 0 means unlimited
    pub prefetch: u16,
    pub in_flight: u32,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < u32::from(self.prefetch)
    }

    fn is(&self, connection: Uuid, channel: u16, tag: &str) -> bool {
        self.connection == connection && self.channel == channel && self.tag == tag
    }
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    /// Connection holding an exclusive queue.
    pub owner: Option<Uuid>,
    pub messages: VecDeque<QueuedMessage>,
    pub consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl Queue {
    pub fn new(name: impl Into<String>, options: QueueOptions, owner: Option<Uuid>) -> Self {
        Self {
            name: name.into(),
            options,
            owner,
            messages: VecDeque::new(),
            consumers: vec![],
            cursor: 0,
        }
    }

    pub fn accessible_by(&self, connection: Uuid) -> bool {
        self.owner.map_or(true, |owner| owner == connection)
    }

    pub fn enqueue(&mut self, message: QueuedMessage) {
        self.messages.push_back(message);
    }

    /// Puts a message back at the head of the queue.
    pub fn requeue(&mut self, mut message: QueuedMessage) {
        message.redelivered = true;
        self.messages.push_front(message);
    }

    pub fn purge(&mut self) -> u32 {
        let count = self.messages.len();
        self.messages.clear();
        count as u32
    }

    pub fn message_count(&self) -> u32 {
        self.messages.len() as u32
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumers.len() as u32
    }

    pub fn has_exclusive_consumer(&self) -> bool {
        self.consumers.iter().any(|c| c.exclusive)
    }

    pub fn add_consumer(&mut self, slot: ConsumerSlot) {
        self.consumers.push(slot);
    }

    pub fn consumer_mut(&mut self, connection: Uuid, channel: u16, tag: &str) -> Option<&mut ConsumerSlot> {
        self.consumers.iter_mut().find(|c| c.is(connection, channel, tag))
    }

    pub fn remove_consumer(&mut self, connection: Uuid, channel: u16, tag: &str) -> Option<ConsumerSlot> {
        let index = self.consumers.iter().position(|c| c.is(connection, channel, tag))?;
        Some(self.remove_at(index))
    }

    pub fn remove_channel_consumers(&mut self, connection: Uuid, channel: u16) -> Vec<ConsumerSlot> {
        let mut removed = vec![];
        while let Some(index) = self
            .consumers
            .iter()
            .position(|c| c.connection == connection && c.channel == channel)
        {
            removed.push(self.remove_at(index));
        }
        removed
    }

    fn remove_at(&mut self, index: usize) -> ConsumerSlot {
        let slot = self.consumers.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.consumers.len() {
            self.cursor = 0;
        }
        slot
    }

    /// Index of the next consumer, in round-robin order, that may take
    /// another message.
    pub fn next_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        let index = (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&index| self.consumers[index].has_capacity())?;

        self.cursor = (index + 1) % count;
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(tag: &str, prefetch: u16) -> ConsumerSlot {
        ConsumerSlot {
            tag: tag.into(),
            connection: Uuid::nil(),
            channel: 1,
            no_ack: false,
            exclusive: false,
            prefetch,
            in_flight: 0,
        }
    }

    fn message(text: &str) -> QueuedMessage {
        QueuedMessage {
            exchange: String::new(),
            routing_key: "q".into(),
            properties: Properties::default(),
            body: text.as_bytes().to_vec(),
            redelivered: false,
        }
    }

    #[test]
    fn consumers_are_picked_round_robin() {
        let mut queue = Queue::new("q", Default::default(), None);
        queue.add_consumer(slot("a", 0));
        queue.add_consumer(slot("b", 0));
        queue.add_consumer(slot("c", 0));

        let picks: Vec<_> = (0..5).map(|_| queue.next_consumer().unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn full_consumers_are_skipped() {
        let mut queue = Queue::new("q", Default::default(), None);
        queue.add_consumer(slot("a", 1));
        queue.add_consumer(slot("b", 1));
        queue.consumers[0].in_flight = 1;

        assert_eq!(queue.next_consumer(), Some(1));
        queue.consumers[1].in_flight = 1;
        assert_eq!(queue.next_consumer(), None);
    }

    #[test]
    fn removing_consumers_keeps_cursor_valid() {
        let mut queue = Queue::new("q", Default::default(), None);
        queue.add_consumer(slot("a", 0));
        queue.add_consumer(slot("b", 0));
        assert_eq!(queue.next_consumer(), Some(0));
        assert_eq!(queue.next_consumer(), Some(1));

        assert!(queue.remove_consumer(Uuid::nil(), 1, "b").is_some());
        assert_eq!(queue.next_consumer(), Some(0));
        assert_eq!(queue.remove_channel_consumers(Uuid::nil(), 1).len(), 1);
        assert_eq!(queue.next_consumer(), None);
    }

    #[test]
    fn requeued_messages_go_first_and_are_flagged() {
        let mut queue = Queue::new("q", Default::default(), None);
        queue.enqueue(message("second"));
        queue.requeue(message("first"));

        let head = queue.messages.front().unwrap();
        assert_eq!(head.body, b"first");
        assert!(head.redelivered);
        assert_eq!(queue.purge(), 2);
        assert_eq!(queue.message_count(), 0);
    }
}
