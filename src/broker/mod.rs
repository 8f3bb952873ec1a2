use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::Frame;

mod config;
mod exchange;
mod queue;
mod state;

pub use config::{BrokerConfig, TlsFiles, User};
pub use exchange::RESERVED_PREFIX;

use state::State;

/// Snapshot of the broker served by the management endpoint.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Overview {
    pub connections: usize,
    pub channels: usize,
    pub exchanges: usize,
    pub queues: Vec<QueueStats>,
}

impl Overview {
    pub fn queue(&self, vhost: &str, name: &str) -> Option<&QueueStats> {
        self.queues.iter().find(|q| q.vhost == vhost && q.name == name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStats {
    pub vhost: String,
    pub name: String,
    pub messages_ready: u32,
    pub messages_unacknowledged: u32,
    pub consumers: u32,
}

enum Command {
    Open {
        username: String,
        password: String,
        vhost: String,
        outbound: mpsc::UnboundedSender<Frame>,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    Frame {
        connection: Uuid,
        frame: Frame,
    },
    Disconnect {
        connection: Uuid,
    },
    Overview {
        reply: oneshot::Sender<Overview>,
    },
}

/// Handle to a running broker. Cheap to clone; the broker stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct Broker {
    tx: mpsc::UnboundedSender<Command>,
}

impl Broker {
    pub fn start(config: BrokerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = BrokerService {
            state: State::new(&config),
            rx,
        };

        tokio::spawn(service.run());
        Self { tx }
    }

    /// Authenticates a new connection. Frames for it are pushed to `outbound`.
    pub async fn open(
        &self,
        username: &str,
        password: &str,
        vhost: &str,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Result<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Open {
            username: username.to_owned(),
            password: password.to_owned(),
            vhost: vhost.to_owned(),
            outbound,
            reply,
        })?;

        rx.await.map_err(|_| Error::BrokerGone)?
    }

    pub fn submit(&self, connection: Uuid, frame: Frame) -> Result<()> {
        self.command(Command::Frame { connection, frame })
    }

    pub fn disconnect(&self, connection: Uuid) {
        if self.command(Command::Disconnect { connection }).is_err() {
            tracing::trace!(%connection, "broker already stopped");
        }
    }

    pub async fn overview(&self) -> Result<Overview> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Overview { reply })?;
        rx.await.map_err(|_| Error::BrokerGone)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::BrokerGone)
    }
}

struct BrokerService {
    state: State,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl BrokerService {
    #[tracing::instrument(name = "broker_service", skip_all)]
    async fn run(mut self) {
        tracing::info!("broker started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Open {
                    username,
                    password,
                    vhost,
                    outbound,
                    reply,
                } => {
                    let opened = self
                        .state
                        .open(&username, &password, &vhost, outbound)
                        .map_err(|failure| {
                            tracing::warn!(%username, %vhost, text = %failure.text, "connection refused");
                            Error::Refused {
                                code: failure.code,
                                text: failure.text,
                            }
                        });

                    if let Err(Ok(connection)) = reply.send(opened) {
                        // the session went away while we were opening it
                        self.state.disconnect(connection);
                    }
                },
                Command::Frame { connection, frame } => self.state.handle(connection, frame),
                Command::Disconnect { connection } => self.state.disconnect(connection),
                Command::Overview { reply } => {
                    let _ = reply.send(self.state.overview());
                },
            }
        }

        tracing::info!("broker stopped");
    }
}
