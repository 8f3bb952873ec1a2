pub mod http;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::broker::Broker;
use crate::error::Result;

pub use session::serve;

/// Accepts client connections and hands each one to the broker.
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    broker: Broker,
}

impl Server {
    pub async fn bind(addr: SocketAddr, broker: Broker) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(server_addr = %listener.local_addr()?, "listening");

        Ok(Self {
            listener,
            tls: None,
            broker,
        })
    }

    /// Wraps every accepted connection in TLS.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(config));
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(name = "server", skip_all, fields(tls = self.tls.is_some()))]
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::info!(client_addr = %addr, "client connected");
                    tokio::spawn(Self::handle(stream, addr, self.tls.clone(), self.broker.clone()));
                },
                Err(err) => tracing::error!(server_stream_error = %err),
            }
        }
    }

    async fn handle(stream: TcpStream, addr: SocketAddr, tls: Option<TlsAcceptor>, broker: Broker) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(client_addr = %addr, %err, "failed to set TCP_NODELAY");
        }

        let result = match tls {
            None => serve(stream, broker).await,
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => serve(stream, broker).await,
                Err(err) => {
                    tracing::warn!(client_addr = %addr, %err, "tls handshake failed");
                    return;
                },
            },
        };

        match result {
            Ok(()) => tracing::info!(client_addr = %addr, "client disconnected"),
            Err(err) => tracing::warn!(client_addr = %addr, %err, "client dropped"),
        }
    }
}
