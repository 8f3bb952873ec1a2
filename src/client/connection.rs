use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use uuid::Uuid;

use super::channel::{Channel, ChannelShared};
use crate::broker::Broker;
use crate::error::{Error, ReplyCode, Result};
use crate::protocol::{read_frame, write_frame, write_frames, Frame, Method, Reply};

pub const AMQP_PORT: u16 = 5672;
pub const AMQPS_PORT: u16 = 5671;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TlsParams {
    pub config: Arc<rustls::ClientConfig>,
    /// Name the broker certificate is checked against.
    pub server_name: String,
}

/// Where and as whom to connect.
#[derive(Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub tls: Option<TlsParams>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: AMQP_PORT,
            username: "guest".into(),
            password: "guest".into(),
            vhost: "/".into(),
            tls: None,
        }
    }
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    /// Connects over TLS, verifying the broker as `server_name`. A port left
    /// at the plain default moves to [`AMQPS_PORT`].
    pub fn tls(mut self, config: Arc<rustls::ClientConfig>, server_name: impl Into<String>) -> Self {
        if self.port == AMQP_PORT {
            self.port = AMQPS_PORT;
        }
        self.tls = Some(TlsParams {
            config,
            server_name: server_name.into(),
        });
        self
    }
}

/// State shared between a connection, its channels and its reader task.
pub(crate) struct Shared {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    channels: DashMap<u16, Arc<ChannelShared>>,
    next_request: AtomicU64,
    next_channel: AtomicU16,
    closed: AtomicBool,
}

impl Shared {
    fn new(outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            outbound,
            pending: DashMap::new(),
            channels: DashMap::new(),
            next_request: AtomicU64::new(1),
            next_channel: AtomicU16::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.outbound.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<Frame> {
        self.outbound.clone()
    }

    /// Sends one method and waits for the broker's reply to it.
    pub(crate) async fn request(&self, channel: u16, method: Method) -> Result<Reply> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(err) = self.send(Frame::Request { id, channel, method }) {
            self.pending.remove(&id);
            return Err(err);
        }

        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Registers a channel under the next id not already in use.
    fn register_channel(&self) -> Result<Arc<ChannelShared>> {
        for _ in 0..=u16::MAX {
            let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.channels.entry(id) {
                let channel = Arc::new(ChannelShared::new(id, self.outbound()));
                entry.insert(channel.clone());
                return Ok(channel);
            }
        }

        Err(Error::Protocol("no free channel id".into()))
    }

    pub(crate) fn forget_channel(&self, channel: u16) {
        self.channels.remove(&channel);
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();

        let channels: Vec<_> = self.channels.iter().map(|entry| entry.value().clone()).collect();
        self.channels.clear();
        for channel in channels {
            channel.mark_closed(None);
        }
    }
}

/// A connection to the broker. Dropping it closes the connection.
pub struct Connection {
    id: Uuid,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connects over TCP, and TLS when `params.tls` is set.
    pub async fn open(params: &ConnectionParams) -> Result<Self> {
        let stream = TcpStream::connect((params.host.as_str(), params.port)).await?;
        stream.set_nodelay(true)?;

        let Some(tls) = &params.tls else {
            return Self::over(stream, params).await;
        };

        let server_name = ServerName::try_from(tls.server_name.clone())
            .map_err(|err| Error::Tls(format!("invalid server name '{}': {err}", tls.server_name)))?;
        let stream = TlsConnector::from(tls.config.clone())
            .connect(server_name, stream)
            .await?;

        tracing::debug!(host = %params.host, port = params.port, "tls established");
        Self::over(stream, params).await
    }

    /// Connects to a broker running in this process, without a socket.
    pub async fn local(broker: &Broker, params: &ConnectionParams) -> Result<Self> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(err) = crate::server::serve(server, broker).await {
                tracing::warn!(%err, "local session failed");
            }
        });

        Self::over(client, params).await
    }

    /// Runs the handshake over an already established stream.
    #[tracing::instrument(name = "connection", skip_all, fields(user = %params.username, vhost = %params.vhost))]
    pub async fn over<S>(stream: S, params: &ConnectionParams) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (mut reader, mut writer) = (BufReader::new(reader), BufWriter::new(writer));

        let open = Frame::Open {
            username: params.username.clone(),
            password: params.password.clone(),
            vhost: params.vhost.clone(),
        };
        write_frame(&mut writer, &open).await?;
        writer.flush().await?;

        let mut rdbuf = Vec::with_capacity(1024);
        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader, &mut rdbuf))
            .await
            .map_err(|_| Error::Timeout("open-ok"))??;

        let id = match handshake {
            Some(Frame::OpenOk { connection }) => connection,
            Some(Frame::Close { code, text }) => return Err(Error::Refused { code, text }),
            Some(other) => return Err(Error::Protocol(format!("expected open-ok, got {other:?}"))),
            None => return Err(Error::ConnectionClosed),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(tx));

        tokio::spawn(async move {
            if let Err(err) = write_frames(writer, rx).await {
                tracing::debug!(%err, "connection writer stopped");
            }
        });
        let reader = tokio::spawn(read_frames(reader, shared.clone()));

        tracing::info!(connection = %id, "connected");
        Ok(Self {
            id,
            shared,
            reader: Some(reader),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    pub async fn create_channel(&self) -> Result<Channel> {
        let channel = self.shared.register_channel()?;
        let id = channel.id();

        match self.shared.request(id, Method::ChannelOpen).await {
            Ok(Reply::Ok) => Ok(Channel::new(channel, self.shared.clone())),
            Ok(Reply::Error { code, text }) => {
                self.shared.forget_channel(id);
                Err(Error::Channel { code, text })
            },
            Ok(other) => {
                self.shared.forget_channel(id);
                Err(Error::Protocol(format!("unexpected reply to channel open: {other:?}")))
            },
            Err(err) => {
                self.shared.forget_channel(id);
                Err(err)
            },
        }
    }

    /// Closes the connection and waits for the broker to confirm it.
    pub async fn close(mut self) -> Result<()> {
        if self.shared.is_closed() {
            return Ok(());
        }

        self.shared.send(Frame::Close {
            code: ReplyCode::Success,
            text: "bye".into(),
        })?;

        if let Some(reader) = self.reader.take() {
            tokio::time::timeout(CLOSE_TIMEOUT, reader)
                .await
                .map_err(|_| Error::Timeout("close-ok"))?
                .map_err(|err| Error::Protocol(err.to_string()))?;
        }

        self.shared.shutdown();
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            let _ = self.shared.send(Frame::Close {
                code: ReplyCode::Success,
                text: "connection dropped".into(),
            });
        }
    }
}

#[tracing::instrument(name = "connection_reader", skip_all)]
async fn read_frames<R>(mut reader: R, shared: Arc<Shared>)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut rdbuf = Vec::with_capacity(1024);
    loop {
        let frame = match read_frame(&mut reader, &mut rdbuf).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("broker closed the stream");
                break;
            },
            Err(err) => {
                tracing::warn!(%err, "connection failed");
                break;
            },
        };

        let channel = |id: u16| shared.channels.get(&id).map(|entry| entry.value().clone());
        match frame {
            Frame::Response { id, reply, .. } => {
                if let Some((_, tx)) = shared.pending.remove(&id) {
                    let _ = tx.send(reply);
                }
            },
            Frame::Deliver {
                channel: id,
                consumer_tag,
                envelope,
                properties,
                body,
            } => match channel(id) {
                Some(channel) => channel.deliver(consumer_tag, envelope, properties, body),
                None => tracing::debug!(channel = id, "delivery for a closed channel"),
            },
            Frame::Confirm {
                channel: id,
                delivery_tag,
                ack,
            } => {
                if let Some(channel) = channel(id) {
                    channel.confirm(delivery_tag, ack);
                }
            },
            Frame::Cancel { channel: id, consumer_tag } => {
                if let Some(channel) = channel(id) {
                    channel.cancelled(&consumer_tag);
                }
            },
            Frame::ChannelClose { channel: id, code, text } => {
                tracing::warn!(channel = id, %code, %text, "broker closed the channel");
                if let Some((_, channel)) = shared.channels.remove(&id) {
                    channel.mark_closed(Some((code, text)));
                }
            },
            Frame::Close { code, text } => {
                tracing::warn!(%code, %text, "broker closed the connection");
                break;
            },
            Frame::CloseOk => break,
            other => tracing::warn!(?other, "unexpected frame from broker"),
        }
    }

    shared.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::protocol::QueueOptions;

    #[test]
    fn tls_moves_the_default_port_only() {
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let config = Arc::new(config);

        let params = ConnectionParams::default().tls(config.clone(), "localhost");
        assert_eq!(params.port, AMQPS_PORT);

        let params = ConnectionParams::default().port(15671).tls(config, "localhost");
        assert_eq!(params.port, 15671);
    }

    #[tokio::test]
    async fn channel_ids_wrap_around_open_channels() {
        let broker = Broker::start(BrokerConfig::default());
        let connection = Connection::local(&broker, &ConnectionParams::default()).await.unwrap();

        let first = connection.create_channel().await.unwrap();
        assert_eq!(first.id(), 1);

        connection.shared.next_channel.store(u16::MAX, Ordering::Relaxed);
        let last = connection.create_channel().await.unwrap();
        assert_eq!(last.id(), u16::MAX);

        // 0 is reserved and 1 is still open
        let wrapped = connection.create_channel().await.unwrap();
        assert_eq!(wrapped.id(), 2);

        first.queue_declare("still-open", QueueOptions::default()).await.unwrap();
        assert!(first.is_open());
        connection.close().await.unwrap();
    }
}
