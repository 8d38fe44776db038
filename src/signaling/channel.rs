use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::RoomConfig;
use crate::signaling::messages::SignalingMessage;
use crate::types::ParticipantMetadata;
use crate::utils::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything a subscriber can observe on the channel: inbound messages plus
/// connection lifecycle notices.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(SignalingMessage),
    Reconnecting { attempt: u32 },
    Reconnected,
    Closed,
}

enum LoopExit {
    SocketDown,
    Finished,
}

/// A single long-lived connection to the signaling server.
///
/// One supervisor task owns the socket: it pumps inbound frames out as
/// `ChannelEvent`s, drains the outbound queue (sends never interleave), and
/// reconnects on transport drop, re-issuing the last join so the server sees
/// the client come back on its own. `subscribe` hands out broadcast
/// receivers; dropping the receiver is unsubscription.
pub struct SignalingChannel {
    outbound: mpsc::Sender<SignalingMessage>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: watch::Sender<bool>,
    alive: watch::Receiver<bool>,
    last_join: Arc<Mutex<Option<SignalingMessage>>>,
}

impl SignalingChannel {
    /// Establishes the initial connection. Failure here is terminal for room
    /// entry; only drops of an established connection are retried.
    pub async fn connect(config: &RoomConfig) -> Result<Self> {
        let (socket, _) = connect_async(config.signaling_url.as_str())
            .await
            .map_err(|e| Error::SignalingUnreachable(e.to_string()))?;
        info!("Connected to signaling server at {}", config.signaling_url);

        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let (events_tx, _) = broadcast::channel(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (alive_tx, alive_rx) = watch::channel(true);
        let last_join = Arc::new(Mutex::new(None));

        tokio::spawn(Self::run_supervisor(
            socket,
            config.signaling_url.clone(),
            config.reconnect_attempts,
            config.reconnect_delay,
            outbound_rx,
            events_tx.clone(),
            shutdown_rx,
            alive_tx,
            last_join.clone(),
        ));

        Ok(Self {
            outbound: outbound_tx,
            events: events_tx,
            shutdown: shutdown_tx,
            alive: alive_rx,
            last_join,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Announces presence in a room. The join is recorded so the supervisor
    /// can replay it after an automatic reconnect.
    pub async fn join(&self, room_id: &str, metadata: &ParticipantMetadata) -> Result<()> {
        let msg = SignalingMessage::JoinRoom {
            room_id: room_id.to_string(),
            metadata: metadata.clone(),
        };
        *self.last_join.lock() = Some(msg.clone());
        self.send(msg).await
    }

    /// Fire-and-forget send; messages are queued and written in order by the
    /// supervisor task.
    pub async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        !*self.alive.borrow()
    }

    /// Tells the server we are leaving and tears the connection down.
    /// Idempotent; waits for the supervisor to finish.
    pub async fn close(&self) {
        let _ = self.outbound.send(SignalingMessage::Disconnect).await;
        let _ = self.shutdown.send(true);
        let mut alive = self.alive.clone();
        while *alive.borrow() {
            if alive.changed().await.is_err() {
                break;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_supervisor(
        mut socket: WsStream,
        url: String,
        reconnect_attempts: u32,
        reconnect_delay: Duration,
        mut outbound_rx: mpsc::Receiver<SignalingMessage>,
        events: broadcast::Sender<ChannelEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
        alive: watch::Sender<bool>,
        last_join: Arc<Mutex<Option<SignalingMessage>>>,
    ) {
        let mut resumed = false;
        'connection: loop {
            let (mut write, mut read) = socket.split();

            if resumed {
                let _ = events.send(ChannelEvent::Reconnected);
                let rejoin = last_join.lock().clone();
                if let Some(join) = rejoin {
                    match serde_json::to_string(&join) {
                        Ok(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                match Self::reconnect(&url, reconnect_attempts, reconnect_delay, &events).await {
                                    Some(s) => {
                                        socket = s;
                                        continue 'connection;
                                    }
                                    None => break 'connection,
                                }
                            }
                            info!("Re-sent join after reconnect");
                        }
                        Err(e) => warn!("Failed to serialize join for replay: {}", e),
                    }
                }
            }

            let reason = loop {
                tokio::select! {
                    inbound = read.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SignalingMessage>(&text) {
                                Ok(msg) => {
                                    let _ = events.send(ChannelEvent::Message(msg));
                                }
                                Err(e) => warn!("Dropping malformed signaling frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break LoopExit::SocketDown,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signaling socket error: {}", e);
                            break LoopExit::SocketDown;
                        }
                    },
                    queued = outbound_rx.recv() => match queued {
                        Some(msg) => match serde_json::to_string(&msg) {
                            Ok(text) => {
                                if let Err(e) = write.send(Message::Text(text)).await {
                                    warn!("Outbound send failed, socket down: {}", e);
                                    break LoopExit::SocketDown;
                                }
                            }
                            Err(e) => warn!("Failed to serialize outbound message: {}", e),
                        },
                        None => break LoopExit::Finished,
                    },
                    _ = shutdown_rx.changed() => break LoopExit::Finished,
                }
            };

            match reason {
                LoopExit::Finished => {
                    // Flush whatever was queued before the shutdown signal,
                    // the disconnect notice in particular.
                    while let Ok(msg) = outbound_rx.try_recv() {
                        if let Ok(text) = serde_json::to_string(&msg) {
                            let _ = write.send(Message::Text(text)).await;
                        }
                    }
                    let _ = write.send(Message::Close(None)).await;
                    break 'connection;
                }
                LoopExit::SocketDown => {
                    match Self::reconnect(&url, reconnect_attempts, reconnect_delay, &events).await {
                        Some(s) => {
                            socket = s;
                            resumed = true;
                        }
                        None => break 'connection,
                    }
                }
            }
        }

        let _ = events.send(ChannelEvent::Closed);
        let _ = alive.send(false);
        info!("Signaling channel closed");
    }

    async fn reconnect(
        url: &str,
        attempts: u32,
        delay: Duration,
        events: &broadcast::Sender<ChannelEvent>,
    ) -> Option<WsStream> {
        for attempt in 1..=attempts {
            let _ = events.send(ChannelEvent::Reconnecting { attempt });
            info!("Reconnecting to signaling server (attempt {}/{})", attempt, attempts);
            tokio::time::sleep(delay).await;
            match connect_async(url).await {
                Ok((socket, _)) => {
                    info!("Signaling connection re-established");
                    return Some(socket);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        error!("Exhausted signaling reconnect attempts, giving up");
        None
    }

    /// Builds a channel wired to in-process endpoints instead of a socket so
    /// session logic can be driven without a server.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, TestChannelSide) {
        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let (events_tx, _) = broadcast::channel(100);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (alive_tx, alive_rx) = watch::channel(true);

        let events_for_task = events_tx.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.changed().await;
            let _ = events_for_task.send(ChannelEvent::Closed);
            let _ = alive_tx.send(false);
        });

        let channel = Self {
            outbound: outbound_tx,
            events: events_tx.clone(),
            shutdown: shutdown_tx,
            alive: alive_rx,
            last_join: Arc::new(Mutex::new(None)),
        };
        let side = TestChannelSide {
            outbound: outbound_rx,
            events: events_tx,
        };
        (channel, side)
    }
}

/// The far end of a `test_pair` channel: what the session sent, and a way to
/// feed it events.
#[cfg(test)]
pub(crate) struct TestChannelSide {
    pub outbound: mpsc::Receiver<SignalingMessage>,
    pub events: broadcast::Sender<ChannelEvent>,
}
