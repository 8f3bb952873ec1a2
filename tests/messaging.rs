//! End to end messaging through an in-process broker:
//! - direct, fanout and topic routing
//! - fair dispatch with prefetch
//! - acknowledgements, requeue and redelivery
//! - publisher confirms
//! - request and reply

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{assert_quiet, channel, next, recv, WAIT};
use warren::message::Properties;
use warren::patterns::{fanout, hello, rpc, topic, work};
use warren::protocol::{ConsumeOptions, QueueOptions};

#[tokio::test]
async fn hello_round_trip_with_auto_ack() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    hello::setup(&channel).await.unwrap();

    let mut received = hello::receive(&channel, false).await.unwrap();
    hello::send(&channel, "Hello, World!").unwrap();

    assert_eq!(recv(&mut received).await, "Hello, World!");
    let overview = broker.overview().await.unwrap();
    let stats = overview.queue("/", hello::QUEUE).unwrap();
    assert_eq!((stats.messages_ready, stats.messages_unacknowledged), (0, 0));
}

#[tokio::test]
async fn confirmed_publish_with_manual_ack() {
    let broker = common::broker();
    let (connection, consumer_channel) = channel(&broker).await;
    hello::setup(&consumer_channel).await.unwrap();
    let publisher = connection.create_channel().await.unwrap();

    let mut received = hello::receive(&consumer_channel, true).await.unwrap();
    hello::send_confirmed(&publisher, "persist me", WAIT).await.unwrap();

    assert_eq!(recv(&mut received).await, "persist me");
    // the ack races the overview request, give it a moment
    tokio::time::sleep(Duration::from_millis(50)).await;
    let overview = broker.overview().await.unwrap();
    assert_eq!(overview.queue("/", hello::QUEUE).unwrap().messages_unacknowledged, 0);
}

#[tokio::test]
async fn messages_published_before_consume_are_kept_in_order() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("backlog", QueueOptions::default()).await.unwrap();

    for i in 0..5 {
        channel
            .basic_publish("", "backlog", Properties::default(), format!("m{i}"))
            .unwrap();
    }

    let info = channel.queue_declare("backlog", QueueOptions::default()).await.unwrap();
    assert_eq!(info.message_count, 5);

    let mut consumer = channel
        .basic_consume("backlog", "", ConsumeOptions::default())
        .await
        .unwrap();
    for i in 0..5 {
        let delivery = next(&mut consumer).await;
        assert_eq!(delivery.text(), format!("m{i}"));
        assert_eq!(delivery.delivery_tag(), i + 1);
        assert_eq!(delivery.envelope.exchange, "");
        assert_eq!(delivery.envelope.routing_key, "backlog");
    }
}

#[tokio::test]
async fn work_is_shared_round_robin_with_prefetch_one() {
    let broker = common::broker();
    let (_producer, producer) = channel(&broker).await;
    work::setup(&producer).await.unwrap();

    let mut workers = vec![];
    let mut completed = vec![];
    for name in ["w1", "w2", "w3"] {
        let (connection, channel) = channel(&broker).await;
        completed.push(
            work::spawn_worker(&channel, name, Duration::from_millis(50))
                .await
                .unwrap(),
        );
        workers.push(connection);
    }

    for i in 0..9 {
        work::submit(&producer, &format!("task {i}")).unwrap();
    }

    let deadline = tokio::time::Instant::now() + WAIT * 5;
    let mut seen = HashSet::new();
    let mut per_worker = [0; 3];
    while seen.len() < 9 {
        assert!(tokio::time::Instant::now() < deadline, "only {} tasks done", seen.len());
        for (worker, rx) in completed.iter_mut().enumerate() {
            while let Ok(done) = rx.try_recv() {
                assert!(seen.insert(done.task.clone()), "{done:?} handled twice");
                per_worker[worker] += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // every worker took a share, none hoarded the backlog
    assert!(per_worker.iter().all(|n| *n >= 1), "{per_worker:?}");
    assert!(per_worker.iter().all(|n| *n <= 5), "{per_worker:?}");
    assert_eq!(seen.len(), 9);
}

#[tokio::test]
async fn prefetch_holds_back_until_ack() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("slow", QueueOptions::default()).await.unwrap();
    channel.basic_qos(2).await.unwrap();

    let mut consumer = channel
        .basic_consume("slow", "slow-consumer", ConsumeOptions::default())
        .await
        .unwrap();
    for i in 0..4 {
        channel
            .basic_publish("", "slow", Properties::default(), format!("{i}"))
            .unwrap();
    }

    let first = next(&mut consumer).await;
    let second = next(&mut consumer).await;
    assert!(tokio::time::timeout(Duration::from_millis(200), consumer.recv()).await.is_err());

    first.ack().unwrap();
    assert_eq!(next(&mut consumer).await.text(), "2");
    channel.basic_ack(second.delivery_tag(), false).unwrap();
    assert_eq!(next(&mut consumer).await.text(), "3");
}

#[tokio::test]
async fn nack_with_requeue_redelivers_and_reject_drops() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("retry", QueueOptions::default()).await.unwrap();
    let mut consumer = channel
        .basic_consume("retry", "", ConsumeOptions::default())
        .await
        .unwrap();

    channel.basic_publish("", "retry", Properties::default(), "flaky").unwrap();
    let first = next(&mut consumer).await;
    assert!(!first.envelope.redelivered);
    first.nack(true).unwrap();

    let again = next(&mut consumer).await;
    assert!(again.envelope.redelivered);
    assert_eq!(again.text(), "flaky");
    again.reject(false).unwrap();

    assert!(tokio::time::timeout(Duration::from_millis(200), consumer.recv()).await.is_err());
    let overview = broker.overview().await.unwrap();
    let stats = overview.queue("/", "retry").unwrap();
    assert_eq!((stats.messages_ready, stats.messages_unacknowledged), (0, 0));
}

#[tokio::test]
async fn ack_multiple_settles_everything_up_to_the_tag() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    channel.queue_declare("batch", QueueOptions::default()).await.unwrap();
    let mut consumer = channel
        .basic_consume("batch", "", ConsumeOptions::default())
        .await
        .unwrap();

    for i in 0..3 {
        channel
            .basic_publish("", "batch", Properties::default(), format!("{i}"))
            .unwrap();
    }
    let mut last = 0;
    for _ in 0..3 {
        last = next(&mut consumer).await.delivery_tag();
    }
    channel.basic_ack(last, true).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let overview = broker.overview().await.unwrap();
    assert_eq!(overview.queue("/", "batch").unwrap().messages_unacknowledged, 0);
}

#[tokio::test]
async fn fanout_copies_to_every_subscriber() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    fanout::setup(&channel).await.unwrap();

    let mut first = fanout::subscribe(&channel, "first").await.unwrap();
    let mut second = fanout::subscribe(&channel, "second").await.unwrap();
    for i in 0..3 {
        fanout::broadcast(&channel, &format!("news {i}")).unwrap();
    }

    for rx in [&mut first, &mut second] {
        for i in 0..3 {
            assert_eq!(recv(rx).await, format!("news {i}"));
        }
    }
}

#[tokio::test]
async fn topic_patterns_select_messages() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    topic::setup(&channel).await.unwrap();

    let mut apples = topic::subscribe(&channel, "message.apple.#").await.unwrap();
    let mut all = topic::subscribe(&channel, "message.#").await.unwrap();

    topic::publish(&channel, "message.hello", "Hello").unwrap();
    topic::publish(&channel, "message.apple", "Apple").unwrap();
    topic::publish(&channel, "message.banana", "Banana").unwrap();

    assert_eq!(recv(&mut apples).await, ("message.apple".into(), "Apple".into()));
    assert_quiet(&mut apples).await;

    let keys: Vec<String> = [recv(&mut all).await, recv(&mut all).await, recv(&mut all).await]
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, ["message.hello", "message.apple", "message.banana"]);
}

#[tokio::test]
async fn rpc_calls_are_answered_by_correlation_id() {
    let broker = common::broker();
    let (_server_connection, server_channel) = channel(&broker).await;
    let server = rpc::RpcServer::start(server_channel, rpc::uppercase).await.unwrap();

    let (_first_connection, first) = channel(&broker).await;
    let (_second_connection, second) = channel(&broker).await;
    let first = rpc::RpcClient::new(first).await.unwrap();
    let second = rpc::RpcClient::new(second).await.unwrap();
    assert_ne!(first.reply_queue(), second.reply_queue());

    let (a, b) = tokio::join!(first.call("hello", WAIT), second.call("world", WAIT));
    assert_eq!(a.unwrap(), "HELLO");
    assert_eq!(b.unwrap(), "WORLD");

    server.stop();
}

#[tokio::test]
async fn rpc_call_times_out_without_a_server() {
    let broker = common::broker();
    let (_connection, channel) = channel(&broker).await;
    let client = rpc::RpcClient::new(channel).await.unwrap();

    let err = client.call("anyone?", Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, warren::Error::Timeout(_)));
}
