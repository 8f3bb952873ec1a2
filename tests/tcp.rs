//! The plain TCP listener and the HTTP endpoints.

mod common;

use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use warren::client::{Connection, ConnectionParams};
use warren::patterns::topic;
use warren::server::{http, Server};
use warren::{Error, ReplyCode};

async fn listen(broker: &warren::Broker) -> u16 {
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), broker.clone())
        .await
        .unwrap();
    let port = server.local_addr().unwrap().port();
    server.spawn();
    port
}

async fn get(port: u16, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    let status = head.split(' ').nth(1).unwrap().parse().unwrap();
    (status, serde_json::from_str(body).unwrap())
}

#[tokio::test]
async fn clients_talk_through_the_socket() {
    let broker = common::broker();
    let port = listen(&broker).await;
    let params = ConnectionParams::new("127.0.0.1").port(port);

    let subscriber = Connection::open(&params).await.unwrap();
    let channel = subscriber.create_channel().await.unwrap();
    topic::setup(&channel).await.unwrap();
    let mut received = topic::subscribe(&channel, "*.error").await.unwrap();

    let publisher = Connection::open(&params).await.unwrap();
    let out = publisher.create_channel().await.unwrap();
    topic::publish(&out, "disk.error", "full").unwrap();
    topic::publish(&out, "disk.info", "fine").unwrap();

    assert_eq!(common::recv(&mut received).await, ("disk.error".into(), "full".into()));
    common::assert_quiet(&mut received).await;

    assert_eq!(broker.overview().await.unwrap().connections, 2);
    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn refused_login_over_tcp() {
    let broker = common::broker();
    let port = listen(&broker).await;

    let params = ConnectionParams::new("127.0.0.1")
        .port(port)
        .credentials("guest", "nope");
    match Connection::open(&params).await {
        Err(Error::Refused { code, .. }) => assert_eq!(code, ReplyCode::AccessRefused),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("login should be refused"),
    }
}

#[tokio::test]
async fn a_garbage_line_ends_the_session() {
    let broker = common::broker();
    let port = listen(&broker).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(b"this is not a frame\n").await.unwrap();

    let mut reply = String::new();
    tokio::time::timeout(common::WAIT, stream.read_to_string(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_empty(), "{reply}");
    assert_eq!(broker.overview().await.unwrap().connections, 0);
}

#[tokio::test]
async fn http_reports_health_and_queues() {
    let broker = common::broker();
    let (_connection, channel) = common::channel(&broker).await;
    channel.queue_declare("audit", Default::default()).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = http::router(broker.clone(), SystemTime::now());
    tokio::spawn(async move { axum::serve(listener, router).await });

    let (status, health) = get(port, "/api/checkhealth").await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");
    assert!(health["started"].is_string());

    let (status, overview) = get(port, "/api/overview").await;
    assert_eq!(status, 200);
    assert_eq!(overview["connections"], 1);
    let queues = overview["queues"].as_array().unwrap();
    assert!(queues.iter().any(|queue| queue["name"] == "audit"));
}
