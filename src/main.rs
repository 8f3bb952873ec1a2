use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};
use warren::{
    broker::{Broker, BrokerConfig},
    server::{http, Server},
    settings::Settings,
    tls,
};

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(if cfg!(debug_assertions) {
            "trace"
        } else {
            "info"
        }));

    let slog_builder = tracing_subscriber::fmt()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_env_filter(env_filter);

    #[cfg(debug_assertions)]
    let slog_builder = slog_builder.with_file(true).with_line_number(true);

    slog_builder.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::instance();
    init_tracing();

    let config = match settings.config() {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::default(),
    };
    tracing::info!(users = config.users.len(), vhosts = ?config.vhosts, "configuration loaded");

    let broker = Broker::start(config.clone());
    let mut tasks = tokio::task::JoinSet::new();

    let server = Server::bind(*settings.addr(), broker.clone()).await?;
    tasks.spawn(server.run());

    if let Some(addr) = settings.tls_addr() {
        let files = config
            .tls
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--tls-addr needs a [tls] section in the configuration"))?;
        let server = Server::bind(*addr, broker.clone())
            .await?
            .with_tls(tls::server_config_from_files(files)?);
        tasks.spawn(server.run());
    }

    if let Some(addr) = settings.http_addr().copied() {
        let router = http::router(broker.clone(), settings.started());
        tasks.spawn(async move {
            if let Err(err) = http::serve(addr, router).await {
                tracing::error!(%err, "http endpoints stopped");
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        Some(finished) = tasks.join_next() => {
            if let Err(err) = finished {
                tracing::error!(task_join_error = %err);
            }
        },
    }

    Ok(())
}
