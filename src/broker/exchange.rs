use crate::protocol::ExchangeOptions;
use crate::routing::ExchangeKind;

/// Exchanges under this prefix are created by the broker and cannot be
/// declared, deleted or bound to the default exchange by clients.
pub const RESERVED_PREFIX: &str = "amq.";

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub options: ExchangeOptions,
    bindings: Vec<Binding>,
}

impl Exchange {
    pub fn new(name: impl Into<String>, kind: ExchangeKind, options: ExchangeOptions) -> Self {
        Self {
            name: name.into(),
            kind,
            options,
            bindings: vec![],
        }
    }

    pub fn bind(&mut self, queue: &str, routing_key: &str) {
        let exists = self
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);

        if !exists {
            self.bindings.push(Binding {
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }
    }

    pub fn unbind(&mut self, queue: &str, routing_key: &str) {
        self.bindings
            .retain(|b| !(b.queue == queue && b.routing_key == routing_key));
    }

    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Names of the queues a message with `routing_key` goes to, each at most
    /// once, in binding order.
    pub fn route(&self, routing_key: &str) -> Vec<&str> {
        let mut queues: Vec<&str> = vec![];
        for binding in &self.bindings {
            if self.kind.accepts(&binding.routing_key, routing_key)
                && !queues.contains(&binding.queue.as_str())
            {
                queues.push(&binding.queue);
            }
        }
        queues
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_bound_twice_receives_once() {
        let mut exchange = Exchange::new("t", ExchangeKind::Topic, Default::default());
        exchange.bind("q1", "message.#");
        exchange.bind("q1", "message.apple.#");
        exchange.bind("q2", "message.apple.#");
        exchange.bind("q2", "message.apple.#");

        assert_eq!(exchange.bindings().len(), 3);
        assert_eq!(exchange.route("message.apple"), vec!["q1", "q2"]);
        assert_eq!(exchange.route("message.hello"), vec!["q1"]);
        assert!(exchange.route("other").is_empty());
    }

    #[test]
    fn unbinding_removes_only_the_matching_binding() {
        let mut exchange = Exchange::new("d", ExchangeKind::Direct, Default::default());
        exchange.bind("q", "a");
        exchange.bind("q", "b");
        exchange.bind("r", "a");

        exchange.unbind("q", "a");
        assert_eq!(exchange.route("a"), vec!["r"]);
        assert_eq!(exchange.route("b"), vec!["q"]);

        exchange.unbind_queue("q");
        assert!(exchange.route("b").is_empty());
    }

    #[test]
    fn fanout_ignores_routing_key() {
        let mut exchange = Exchange::new("f", ExchangeKind::Fanout, Default::default());
        exchange.bind("a", "");
        exchange.bind("b", "ignored");

        assert_eq!(exchange.route("7"), vec!["a", "b"]);
        assert!(is_reserved("amq.fanout"));
        assert!(!is_reserved("warren.fanout"));
    }
}
