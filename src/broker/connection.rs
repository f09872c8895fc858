use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::config::{BrokerConfig, TlsConfig};

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected to a broker")]
    NotConnected,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("connection manager is no longer running")]
    ManagerGone,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("connection to broker lost")]
    ConnectionLost,

    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Everything the actor reports to the rest of the application. Consumed by
/// a single dispatcher; the rumqttc callback surface never leaks past here.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    StateChanged(ConnectionState),
    Message { channel: String, payload: String },
    Error(String),
}

pub(crate) enum BrokerCommand {
    Connect {
        config: BrokerConfig,
        respond: oneshot::Sender<Result<ConnectionState, BrokerError>>,
    },
    Disconnect {
        respond: oneshot::Sender<()>,
    },
    Subscribe {
        pattern: String,
        qos: QoS,
        respond: oneshot::Sender<Result<(), BrokerError>>,
    },
    Unsubscribe {
        pattern: String,
        respond: oneshot::Sender<Result<(), BrokerError>>,
    },
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
        retain: bool,
        respond: oneshot::Sender<Result<(), PublishError>>,
    },
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Cloneable handle to the connection actor.
///
/// Publish calls from any number of tasks funnel into the actor's command
/// channel and are executed by its single consumer, which is what makes
/// concurrent publishing from the broadcast workers safe.
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<BrokerCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl BrokerHandle {
    /// Spawns the connection actor. `events` receives state transitions,
    /// incoming messages and surfaced errors.
    pub fn spawn(events: mpsc::Sender<BrokerEvent>) -> Self {
        let (commands, rx) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let actor = ConnectionActor {
            rx,
            events,
            state_tx,
            active: None,
            reconnect_attempts: 0,
        };
        tokio::spawn(actor.run());
        Self { commands, state }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        commands: mpsc::Sender<BrokerCommand>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { commands, state }
    }

    /// Starts connecting and returns the resulting state (`Connecting` on
    /// success). The outcome of the handshake arrives as a `BrokerEvent`.
    pub async fn connect(&self, config: BrokerConfig) -> Result<ConnectionState, BrokerError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Connect { config, respond })
            .await
            .map_err(|_| BrokerError::ManagerGone)?;
        rx.await.map_err(|_| BrokerError::ManagerGone)?
    }

    pub async fn disconnect(&self) {
        let (respond, rx) = oneshot::channel();
        if self
            .commands
            .send(BrokerCommand::Disconnect { respond })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), BrokerError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Subscribe {
                pattern: pattern.to_string(),
                qos,
                respond,
            })
            .await
            .map_err(|_| BrokerError::ManagerGone)?;
        rx.await.map_err(|_| BrokerError::ManagerGone)?
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Unsubscribe {
                pattern: pattern.to_string(),
                respond,
            })
            .await
            .map_err(|_| BrokerError::ManagerGone)?;
        rx.await.map_err(|_| BrokerError::ManagerGone)?
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(BrokerCommand::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
                qos,
                retain,
                respond,
            })
            .await
            .map_err(|_| PublishError::ConnectionLost)?;
        rx.await.map_err(|_| PublishError::ConnectionLost)?
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }
}

struct ActiveConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    config: BrokerConfig,
}

struct ConnectionActor {
    rx: mpsc::Receiver<BrokerCommand>,
    events: mpsc::Sender<BrokerEvent>,
    state_tx: watch::Sender<ConnectionState>,
    active: Option<ActiveConnection>,
    reconnect_attempts: u32,
}

enum Step {
    Cmd(Option<BrokerCommand>),
    Poll(Result<Event, ConnectionError>),
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            let step = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    maybe = self.rx.recv() => Step::Cmd(maybe),
                    polled = active.eventloop.poll() => Step::Poll(polled),
                },
                None => Step::Cmd(self.rx.recv().await),
            };

            match step {
                Step::Cmd(None) => break,
                Step::Cmd(Some(cmd)) => self.handle_command(cmd).await,
                Step::Poll(Ok(event)) => self.handle_event(event).await,
                Step::Poll(Err(err)) => self.handle_poll_error(err).await,
            }
        }
        debug!("connection actor stopped");
    }

    async fn handle_command(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::Connect { config, respond } => {
                let result = self.start_connection(config).await;
                let _ = respond.send(result);
            }
            BrokerCommand::Disconnect { respond } => {
                if let Some(active) = self.active.take() {
                    let _ = active.client.disconnect().await;
                }
                self.reconnect_attempts = 0;
                self.set_state(ConnectionState::Disconnected).await;
                let _ = respond.send(());
            }
            BrokerCommand::Subscribe {
                pattern,
                qos,
                respond,
            } => {
                let client = self.active.as_ref().map(|active| active.client.clone());
                let result = match client {
                    Some(client) => client
                        .subscribe(pattern, qos)
                        .await
                        .map_err(BrokerError::from),
                    None => Err(BrokerError::NotConnected),
                };
                let _ = respond.send(result);
            }
            BrokerCommand::Unsubscribe { pattern, respond } => {
                let client = self.active.as_ref().map(|active| active.client.clone());
                let result = match client {
                    Some(client) => client
                        .unsubscribe(pattern)
                        .await
                        .map_err(BrokerError::from),
                    None => Err(BrokerError::NotConnected),
                };
                let _ = respond.send(result);
            }
            BrokerCommand::Publish {
                topic,
                payload,
                qos,
                retain,
                respond,
            } => {
                let connected = *self.state_tx.borrow() == ConnectionState::Connected;
                let client = self.active.as_ref().map(|active| active.client.clone());
                let result = match client {
                    Some(client) if connected => client
                        .publish(topic, qos, retain, payload)
                        .await
                        .map_err(|e| PublishError::Rejected(e.to_string())),
                    _ => Err(PublishError::ConnectionLost),
                };
                let _ = respond.send(result);
            }
        }
    }

    async fn start_connection(
        &mut self,
        config: BrokerConfig,
    ) -> Result<ConnectionState, BrokerError> {
        if let Some(old) = self.active.take() {
            let _ = old.client.disconnect().await;
        }

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        if let Some(user) = &config.username {
            options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }
        if let Some(tls) = &config.tls {
            options.set_transport(build_transport(tls)?);
        }

        info!("connecting to {}:{}", config.host, config.port);
        let (client, eventloop) = AsyncClient::new(options, 100);
        self.active = Some(ActiveConnection {
            client,
            eventloop,
            config,
        });
        self.reconnect_attempts = 0;
        self.set_state(ConnectionState::Connecting).await;
        Ok(ConnectionState::Connecting)
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("broker accepted connection");
                    self.reconnect_attempts = 0;
                    self.set_state(ConnectionState::Connected).await;
                } else {
                    // Refusals also surface as poll errors, where the fatal
                    // auth cases are decided.
                    warn!("broker refused connection: {:?}", ack.code);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                // try_send keeps the actor responsive under a message flood;
                // a full queue drops the message rather than stalling the
                // command loop.
                if self
                    .events
                    .try_send(BrokerEvent::Message {
                        channel: publish.topic,
                        payload,
                    })
                    .is_err()
                {
                    warn!("event queue full, dropping incoming message");
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("broker sent disconnect");
                self.set_state(ConnectionState::Reconnecting).await;
            }
            _ => {}
        }
    }

    async fn handle_poll_error(&mut self, err: ConnectionError) {
        if let ConnectionError::ConnectionRefused(code) = &err {
            if matches!(
                code,
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
            ) {
                error!("broker rejected credentials: {:?}", code);
                self.fail(format!("authentication rejected: {code:?}")).await;
                return;
            }
        }

        let policy = match self.active.as_ref() {
            Some(active) => active.config.reconnect.clone(),
            None => return,
        };

        self.reconnect_attempts += 1;
        if policy.exhausted(self.reconnect_attempts) {
            error!(
                "giving up after {} reconnect attempts: {}",
                self.reconnect_attempts, err
            );
            self.fail(format!("connection lost: {err}")).await;
            return;
        }

        let delay = policy.delay_for(self.reconnect_attempts);
        warn!(
            "connection error: {} (attempt {}, retrying in {:?})",
            err, self.reconnect_attempts, delay
        );
        self.set_state(ConnectionState::Reconnecting).await;
        self.backoff_wait(delay).await;
    }

    /// Waits out the backoff delay while still answering commands. Because
    /// the wait happens here, inside the actor loop, a second reconnect
    /// attempt can never overlap with this one.
    async fn backoff_wait(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                maybe = self.rx.recv() => match maybe {
                    Some(cmd) => {
                        let replaces_connection = matches!(
                            cmd,
                            BrokerCommand::Connect { .. } | BrokerCommand::Disconnect { .. }
                        );
                        self.handle_command(cmd).await;
                        if replaces_connection {
                            return;
                        }
                    }
                    None => return,
                },
            }
        }
    }

    async fn fail(&mut self, reason: String) {
        self.active = None;
        self.reconnect_attempts = 0;
        let _ = self.events.send(BrokerEvent::Error(reason)).await;
        self.set_state(ConnectionState::Failed).await;
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        let _ = self.state_tx.send(state.clone());
        let _ = self.events.send(BrokerEvent::StateChanged(state)).await;
    }
}

fn build_transport(tls: &TlsConfig) -> Result<Transport, BrokerError> {
    let ca = match &tls.ca_file {
        Some(path) => Some(std::fs::read(path).map_err(|e| {
            BrokerError::Tls(format!("failed to read CA file {}: {e}", path.display()))
        })?),
        None => None,
    };

    let client_auth = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => {
            let cert = std::fs::read(cert).map_err(|e| {
                BrokerError::Tls(format!("failed to read client cert {}: {e}", cert.display()))
            })?;
            let key = std::fs::read(key).map_err(|e| {
                BrokerError::Tls(format!("failed to read client key {}: {e}", key.display()))
            })?;
            Some((cert, key))
        }
        (None, None) => None,
        _ => {
            return Err(BrokerError::Tls(
                "client cert and key must be provided together".to_string(),
            ))
        }
    };

    match (ca, client_auth) {
        (Some(ca), client_auth) => Ok(Transport::tls(ca, client_auth, None)),
        (None, Some(_)) => Err(BrokerError::Tls(
            "client authentication requires a CA file".to_string(),
        )),
        (None, None) => Ok(Transport::tls_with_default_config()),
    }
}
