#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::mpsc;
use warren::client::{Channel, Connection, ConnectionParams, Consumer, Delivery};
use warren::{Broker, BrokerConfig};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn broker() -> Broker {
    Broker::start(BrokerConfig::default())
}

pub async fn connect(broker: &Broker) -> Connection {
    Connection::local(broker, &ConnectionParams::default())
        .await
        .expect("local connection")
}

pub async fn channel(broker: &Broker) -> (Connection, Channel) {
    let connection = connect(broker).await;
    let channel = connection.create_channel().await.expect("channel");
    (connection, channel)
}

pub async fn next(consumer: &mut Consumer) -> Delivery {
    tokio::time::timeout(WAIT, consumer.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("consumer ended")
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("sender dropped")
}

/// Asserts nothing more arrives within a short grace period.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(item)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected message: {item:?}");
    }
}
