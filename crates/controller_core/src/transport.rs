//! Reconnecting device link.
//!
//! The link runs as its own task. The agent hands it [`LinkMessage`]s through
//! a [`LinkHandle`] and receives inbound messages and connection changes as
//! [`LinkEvent`]s. Envelope sequencing, heartbeats, retransmission and the
//! outbox overflow policy never leave this module.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    backoff::Backoff,
    domain::DeviceId,
    error::SyncError,
    protocol::{Envelope, HeartbeatPayload, HelloPayload, LinkMessage},
    sequence::SequenceWindow,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::outbox::Outbox;

type LinkSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type LinkWriter = SplitSink<LinkSocket, Message>;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Backend base URL, `http(s)://` or `ws(s)://`.
    pub server_url: String,
    pub device_id: DeviceId,
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeats without an echo before the link is declared stale.
    pub max_missed_heartbeats: u32,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub outbox_capacity: usize,
}

impl LinkConfig {
    pub fn new(server_url: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            server_url: server_url.into(),
            device_id,
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            reconnect_initial: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(30),
            outbox_capacity: 256,
        }
    }

    pub fn link_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url '{}'", self.server_url))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(anyhow!("unsupported server url scheme '{other}'")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch '{}' to {scheme}", self.server_url))?;
        let path = format!("{}/link", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("device_id", self.device_id.as_str());
        Ok(url)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    /// `stale` is set when the link gave up on missing heartbeat echoes rather
    /// than seeing the connection close.
    Disconnected { stale: bool },
    Message(LinkMessage),
}

pub struct LinkHandle {
    outbound: mpsc::UnboundedSender<LinkMessage>,
    events: mpsc::Receiver<LinkEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    /// Queues a message for delivery. Never blocks; while disconnected the
    /// message waits in the outbox.
    pub fn send(&self, message: LinkMessage) -> Result<(), SyncError> {
        self.outbound
            .send(message)
            .map_err(|_| SyncError::Transport("link task has stopped".to_string()))
    }

    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Starts the link task. The `hello` receiver is read on every (re)connect so
/// the backend always gets the agent's current full state.
pub fn spawn(config: LinkConfig, hello: watch::Receiver<HelloPayload>) -> Result<LinkHandle> {
    let url = config.link_url()?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = LinkWorker {
        outbox: Outbox::new(config.device_id.clone(), config.outbox_capacity),
        config,
        url,
        outbound: outbound_rx,
        events: events_tx,
        hello,
        shutdown: shutdown_rx,
    };
    let task = tokio::spawn(worker.run());

    Ok(LinkHandle {
        outbound: outbound_tx,
        events: events_rx,
        shutdown: shutdown_tx,
        task,
    })
}

enum SessionEnd {
    Closed,
    Stale,
    Shutdown,
}

struct LinkWorker {
    config: LinkConfig,
    url: Url,
    outbox: Outbox,
    outbound: mpsc::UnboundedReceiver<LinkMessage>,
    events: mpsc::Sender<LinkEvent>,
    hello: watch::Receiver<HelloPayload>,
    shutdown: watch::Receiver<bool>,
}

impl LinkWorker {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect_initial, self.config.reconnect_max);
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = self.shutdown.changed() => return,
            };

            match connected {
                Ok((socket, _)) => {
                    backoff.reset();
                    info!(
                        device_id = %self.config.device_id,
                        url = %self.url,
                        "link: connected"
                    );
                    let stale = match self.session(socket).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Closed => false,
                        SessionEnd::Stale => true,
                    };
                    if self
                        .events
                        .send(LinkEvent::Disconnected { stale })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => warn!(
                    device_id = %self.config.device_id,
                    url = %self.url,
                    error = %err,
                    "link: connect failed"
                ),
            }

            let delay = backoff.next_delay();
            debug!(
                device_id = %self.config.device_id,
                delay_ms = delay.as_millis() as u64,
                buffered = self.outbox.len(),
                "link: waiting before reconnect"
            );
            if !self.buffer_until(delay).await {
                return;
            }
        }
    }

    /// Collects outbound messages into the outbox while offline. Returns
    /// false when the link should stop.
    async fn buffer_until(&mut self, delay: Duration) -> bool {
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                message = self.outbound.recv() => match message {
                    Some(message) => {
                        self.outbox.push(message);
                    }
                    None => return false,
                },
                _ = self.shutdown.changed() => return false,
            }
        }
    }

    async fn session(&mut self, socket: LinkSocket) -> SessionEnd {
        let device_id = self.config.device_id.clone();
        let (mut writer, mut reader) = socket.split();
        // The backend numbers each connection from scratch.
        let mut inbound = SequenceWindow::new();

        let mut opening = self.outbox.retransmits();
        let retransmitted = opening.len();
        let hello = LinkMessage::Hello(self.hello.borrow().clone());
        opening.push(self.outbox.stamp(hello));
        let flushed = self.outbox.take_unsent();
        let flushed_count = flushed.len();
        opening.extend(flushed);
        if let Err(err) = send_all(&mut writer, &opening).await {
            warn!(device_id = %device_id, error = %err, "link: opening send failed");
            return SessionEnd::Closed;
        }
        info!(
            device_id = %device_id,
            retransmitted,
            flushed = flushed_count,
            "link: hello sent"
        );
        if self.events.send(LinkEvent::Connected).await.is_err() {
            return SessionEnd::Shutdown;
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0u32;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                message = self.outbound.recv() => {
                    let Some(message) = message else {
                        let _ = writer.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    };
                    self.outbox.push(message);
                    let batch = self.outbox.take_unsent();
                    if let Err(err) = send_all(&mut writer, &batch).await {
                        warn!(device_id = %device_id, error = %err, "link: send failed");
                        return SessionEnd::Closed;
                    }
                }
                _ = heartbeat.tick() => {
                    if missed >= self.config.max_missed_heartbeats {
                        warn!(
                            device_id = %device_id,
                            missed,
                            "link: heartbeat echoes missing, marking stale"
                        );
                        return SessionEnd::Stale;
                    }
                    missed += 1;
                    let beat = self
                        .outbox
                        .stamp(LinkMessage::Heartbeat(HeartbeatPayload::default()));
                    if let Err(err) = send_all(&mut writer, std::slice::from_ref(&beat)).await {
                        warn!(device_id = %device_id, error = %err, "link: heartbeat send failed");
                        return SessionEnd::Closed;
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let envelope = match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => envelope,
                            Err(err) => {
                                warn!(device_id = %device_id, error = %err, "link: dropping malformed frame");
                                continue;
                            }
                        };
                        if !inbound.accept(envelope.sequence_number) {
                            debug!(
                                device_id = %device_id,
                                sequence_number = envelope.sequence_number,
                                "link: dropping duplicate envelope"
                            );
                            continue;
                        }
                        match envelope.message {
                            LinkMessage::Heartbeat(echo) => {
                                missed = 0;
                                if let Some(through) = echo.received_through {
                                    self.outbox.confirm_through(through);
                                }
                            }
                            message => {
                                if self.events.send(LinkEvent::Message(message)).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(device_id = %device_id, "link: closed by backend");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(device_id = %device_id, error = %err, "link: receive failed");
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }
}

async fn send_all(writer: &mut LinkWriter, envelopes: &[Envelope]) -> Result<()> {
    for envelope in envelopes {
        let text = serde_json::to_string(envelope).context("failed to encode envelope")?;
        writer
            .send(Message::Text(text))
            .await
            .with_context(|| format!("failed to write {} frame", envelope.kind()))?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
