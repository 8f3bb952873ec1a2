//! The classic messaging patterns, each wired onto its own exchange.
//!
//! Every consumer side spawns a task and hands received messages back on an
//! [`mpsc`] receiver, so callers can print them, assert on them or drop them.

pub mod fanout;
pub mod hello;
pub mod rpc;
pub mod topic;
pub mod work;

use tokio::sync::mpsc;

use crate::client::{Consumer, Delivery};

/// Feeds every delivery to `handle` and forwards what it returns. Stops when
/// the consumer ends or nobody listens anymore.
fn forward<T, F>(name: &'static str, mut consumer: Consumer, mut handle: F) -> mpsc::UnboundedReceiver<T>
where
    T: Send + 'static,
    F: FnMut(&Delivery) -> Option<T> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(delivery) = consumer.recv().await {
            let Some(item) = handle(&delivery) else {
                continue;
            };
            if tx.send(item).is_err() {
                break;
            }
        }
        tracing::debug!(consumer = name, tag = consumer.tag(), "consumer finished");
    });
    rx
}
