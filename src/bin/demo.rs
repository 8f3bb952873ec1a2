use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use warren::client::{Connection, ConnectionParams, AMQPS_PORT, AMQP_PORT};
use warren::patterns::{fanout, hello, rpc, topic, work};
use warren::{tls, Broker, BrokerConfig};

const HELP_STRING: &str = r#"
usage: warren-demo <scenario> [arguments]

scenarios:
    hello      send and receive one message, auto acknowledged
    ack        persistent message with publisher confirm and manual ack
    work       ten tasks shared by three workers, one task in flight each
    fanout     every subscriber gets every message
    topic      subscribers pick messages by routing key pattern
    rpc        request and reply through a reply queue

arguments:
    --local                 run against a broker inside this process
    --host     <host>       default: localhost
    --port     <port>       default: 5672, or 5671 with --tls
    --user     <name>       default: guest
    --password <password>   default: guest
    --vhost    <vhost>      default: /
    --tls                   connect over TLS 1.3, requires --ca
    --ca       <path>       CA certificate (PEM) to verify the broker with
    --cert     <path>       client certificate (PEM)
    --key      <path>       client key (PEM, optionally encrypted PKCS#8)
    --key-password <pw>     password of an encrypted client key
"#;

struct Args {
    scenario: String,
    local: bool,
    params: ConnectionParams,
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn parse_args() -> anyhow::Result<Args> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP_STRING}");
        std::process::exit(0);
    }

    let local = pargs.contains("--local");
    let use_tls = pargs.contains("--tls");
    let host: String = pargs.opt_value_from_str("--host")?.unwrap_or_else(|| "localhost".into());
    let port = pargs
        .opt_value_from_str("--port")?
        .unwrap_or(if use_tls { AMQPS_PORT } else { AMQP_PORT });
    let user: String = pargs.opt_value_from_str("--user")?.unwrap_or_else(|| "guest".into());
    let password: String = pargs.opt_value_from_str("--password")?.unwrap_or_else(|| "guest".into());
    let vhost: String = pargs.opt_value_from_str("--vhost")?.unwrap_or_else(|| "/".into());
    let ca: Option<PathBuf> = pargs.opt_value_from_str("--ca")?;
    let cert: Option<PathBuf> = pargs.opt_value_from_str("--cert")?;
    let key: Option<PathBuf> = pargs.opt_value_from_str("--key")?;
    let key_password: Option<String> = pargs.opt_value_from_str("--key-password")?;
    let scenario: String = pargs.free_from_str().context("missing scenario")?;

    let mut params = ConnectionParams::new(host.clone())
        .port(port)
        .credentials(user, password)
        .vhost(vhost);

    if use_tls {
        let ca = read(ca.as_ref().context("--tls requires --ca")?)?;
        let config = match (cert, key) {
            (Some(cert), Some(key)) => {
                tls::client_config_with_identity(&ca, &read(&cert)?, &read(&key)?, key_password.as_deref())?
            },
            (None, None) => tls::client_config(&ca)?,
            _ => anyhow::bail!("--cert and --key go together"),
        };
        params = params.tls(config, host).port(port);
    }

    Ok(Args {
        scenario,
        local,
        params,
    })
}

async fn connect(args: &Args, broker: Option<&Broker>) -> anyhow::Result<Connection> {
    let connection = match broker {
        Some(broker) => Connection::local(broker, &args.params).await?,
        None => Connection::open(&args.params).await?,
    };
    Ok(connection)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(error) => {
            eprint!("error: {error}{HELP_STRING}");
            std::process::exit(1);
        },
    };

    let broker = args.local.then(|| Broker::start(BrokerConfig::default()));
    let broker = broker.as_ref();
    let timeout = Duration::from_secs(5);

    match args.scenario.as_str() {
        "hello" => {
            let connection = connect(&args, broker).await?;
            let channel = connection.create_channel().await?;
            hello::setup(&channel).await?;

            let mut received = hello::receive(&channel, false).await?;
            hello::send(&channel, "Hello, World!")?;
            tokio::time::timeout(timeout, received.recv()).await?;
            connection.close().await?;
        },
        "ack" => {
            let connection = connect(&args, broker).await?;
            let channel = connection.create_channel().await?;
            hello::setup(&channel).await?;

            let publisher = connection.create_channel().await?;
            let mut received = hello::receive(&channel, true).await?;
            hello::send_confirmed(&publisher, "Hello, World!", timeout).await?;
            tokio::time::timeout(timeout, received.recv()).await?;
            connection.close().await?;
        },
        "work" => {
            let producer = connect(&args, broker).await?;
            let channel = producer.create_channel().await?;
            work::setup(&channel).await?;

            let mut workers = vec![];
            let mut completed = vec![];
            for name in ["Consumer1", "Consumer2", "Consumer3"] {
                let connection = connect(&args, broker).await?;
                let channel = connection.create_channel().await?;
                completed.push(work::spawn_worker(&channel, name, Duration::from_secs(1)).await?);
                workers.push(connection);
            }

            for i in 0..10 {
                work::submit(&channel, &format!("Hello, {i}"))?;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
            let mut done = 0;
            while done < 10 && tokio::time::Instant::now() < deadline {
                for rx in completed.iter_mut() {
                    while rx.try_recv().is_ok() {
                        done += 1;
                    }
                }
                settle().await;
            }

            for connection in workers {
                connection.close().await?;
            }
            producer.close().await?;
        },
        "fanout" => {
            let connection = connect(&args, broker).await?;
            let channel = connection.create_channel().await?;
            fanout::setup(&channel).await?;

            let _first = fanout::subscribe(&channel, "Consumer1").await?;
            let _second = fanout::subscribe(&channel, "Consumer2").await?;
            for i in 0..3 {
                fanout::broadcast(&channel, &format!("Hello, {i}"))?;
            }
            settle().await;
            connection.close().await?;
        },
        "topic" => {
            let connection = connect(&args, broker).await?;
            let channel = connection.create_channel().await?;
            topic::setup(&channel).await?;

            let _apples = topic::subscribe(&channel, "message.apple.#").await?;
            let _all = topic::subscribe(&channel, "message.#").await?;
            topic::publish(&channel, "message.hello", "Hello")?;
            topic::publish(&channel, "message.apple", "Apple")?;
            topic::publish(&channel, "message.banana", "Banana")?;
            settle().await;
            connection.close().await?;
        },
        "rpc" => {
            let server_connection = connect(&args, broker).await?;
            let server = rpc::RpcServer::start(server_connection.create_channel().await?, rpc::uppercase).await?;

            let connection = connect(&args, broker).await?;
            let client = rpc::RpcClient::new(connection.create_channel().await?).await?;
            for request in ["hello", "world"] {
                let response = client.call(request, timeout).await?;
                println!("{request} -> {response}");
            }

            server.stop();
            connection.close().await?;
            server_connection.close().await?;
        },
        other => {
            eprint!("error: unknown scenario '{other}'{HELP_STRING}");
            std::process::exit(1);
        },
    }

    Ok(())
}
