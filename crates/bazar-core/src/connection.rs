//! Lifecycle of the persistent transport to the messaging server.
//!
//! One connection per session, multiplexed across every joined
//! conversation room. A background task owns the socket and handles:
//!
//! - connect + bearer-token handshake
//! - automatic reconnection on a capped backoff schedule, after which
//!   retries stop and a terminal `Disconnected` state is surfaced
//! - re-joining all rooms after a reconnect, before `Connected` is
//!   signaled, so no event is dropped into an un-joined room
//! - FIFO queueing of `invoke` calls issued while not connected
//!
//! The manager never touches a message store; it only emits events and
//! lifecycle transitions that downstream components react to.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{ChatError, Result};
use crate::wire::{ClientFrame, ServerEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 256;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

enum ConnCmd {
    Invoke {
        frame: ClientFrame,
        done: oneshot::Sender<Result<()>>,
    },
    Join(String),
    Leave(String),
    Disconnect,
}

/// Handle to the background connection task.
#[derive(Debug)]
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<ConnCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    event_tx: broadcast::Sender<ServerEvent>,
    invoke_wait: Duration,
}

impl ConnectionManager {
    /// Spawn the connection task. Fails fast with [`ChatError::Auth`]
    /// when no credential is available; the engine never dials without
    /// one.
    pub fn connect(cfg: &CoreConfig, auth_token: &str) -> Result<Self> {
        if auth_token.is_empty() {
            return Err(ChatError::Auth("no bearer token supplied".into()));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task = ConnectionTask {
            url: cfg.socket_url.clone(),
            token: auth_token.to_string(),
            backoff: cfg.backoff.clone(),
            cmd_rx,
            state_tx,
            event_tx: event_tx.clone(),
            rooms: HashSet::new(),
            queue: VecDeque::new(),
        };
        tokio::spawn(task.run());

        Ok(Self {
            cmd_tx,
            state_rx,
            event_tx,
            invoke_wait: cfg.invoke_wait,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch lifecycle transitions. Downstream components use this to
    /// gate send availability and presence authority.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to server events. Every subscriber sees every event;
    /// filtering by conversation is the caller's job.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn join_room(&self, conversation_id: impl Into<String>) -> Result<()> {
        self.cmd_tx
            .send(ConnCmd::Join(conversation_id.into()))
            .await
            .map_err(|_| ChatError::Closed)
    }

    pub async fn leave_room(&self, conversation_id: impl Into<String>) -> Result<()> {
        self.cmd_tx
            .send(ConnCmd::Leave(conversation_id.into()))
            .await
            .map_err(|_| ChatError::Closed)
    }

    /// Send a frame to the server.
    ///
    /// While connecting or reconnecting the call is queued and flushed
    /// FIFO once the channel comes up. If the connection does not
    /// recover within the bounded wait window the call rejects with
    /// [`ChatError::NotConnected`] instead of hanging.
    pub async fn invoke(&self, frame: ClientFrame) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::Invoke {
                frame,
                done: done_tx,
            })
            .await
            .map_err(|_| ChatError::Closed)?;

        match tokio::time::timeout(self.invoke_wait, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChatError::Closed),
            Err(_) => Err(ChatError::NotConnected),
        }
    }

    /// Graceful shutdown of the background task.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Disconnect).await;
    }

    /// Block until the state leaves Connecting/Reconnecting or the wait
    /// elapses. Convenience for callers that want to fail fast instead
    /// of queueing.
    pub async fn wait_for_connected(&self, wait: Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => return Err(ChatError::NotConnected),
                _ => {}
            }
            if tokio::time::timeout_at(deadline, rx.changed()).await.is_err() {
                return Err(ChatError::NotConnected);
            }
        }
    }
}

struct ConnectionTask {
    url: String,
    token: String,
    backoff: Vec<Duration>,
    cmd_rx: mpsc::Receiver<ConnCmd>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ServerEvent>,
    rooms: HashSet<String>,
    queue: VecDeque<(ClientFrame, oneshot::Sender<Result<()>>)>,
}

enum LoopExit {
    /// Socket dropped; try to reconnect.
    ConnectionLost,
    /// Caller asked for shutdown, or the handle was dropped.
    Shutdown,
}

enum WaitOutcome {
    Elapsed,
    Shutdown,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut attempt: usize = 0;
        let mut ever_connected = false;

        loop {
            if attempt >= self.backoff.len() {
                info!("reconnect attempts exhausted, going offline");
                self.terminal_disconnected().await;
                return;
            }

            let delay = self.backoff[attempt];
            self.set_state(if ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            if !delay.is_zero() {
                debug!(?delay, attempt, "waiting before reconnect attempt");
                if let WaitOutcome::Shutdown = self.wait_and_buffer(delay).await {
                    self.reject_queue();
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }

            match self.dial().await {
                Ok(ws) => {
                    let (mut sink, source) = ws.split();
                    // Re-join every room before signaling Connected, so
                    // nothing is pushed into a room we aren't in yet.
                    if self.rejoin_rooms(&mut sink).await.is_err() {
                        attempt += 1;
                        continue;
                    }
                    self.set_state(ConnectionState::Connected);
                    ever_connected = true;
                    attempt = 0;

                    if self.flush_queue(&mut sink).await.is_err() {
                        continue;
                    }

                    match self.serve(sink, source).await {
                        LoopExit::ConnectionLost => {
                            warn!("live channel lost, reconnecting");
                        }
                        LoopExit::Shutdown => {
                            self.reject_queue();
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
                Err(ChatError::Auth(reason)) => {
                    warn!(%reason, "server rejected credential");
                    self.terminal_disconnected().await;
                    return;
                }
                Err(e) => {
                    debug!(error = %e, attempt, "connect attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    async fn dial(&self) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| ChatError::Protocol(e.to_string()))?;
        let header = format!("Bearer {}", self.token)
            .parse()
            .map_err(|_| ChatError::Auth("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        match connect_async(request).await {
            Ok((ws, _response)) => Ok(ws),
            Err(WsError::Http(response))
                if response.status() == 401 || response.status() == 403 =>
            {
                Err(ChatError::Auth(format!(
                    "handshake rejected with {}",
                    response.status()
                )))
            }
            Err(e) => {
                debug!(error = %e, "websocket handshake failed");
                Err(ChatError::NotConnected)
            }
        }
    }

    async fn rejoin_rooms(&mut self, sink: &mut WsSink) -> std::result::Result<(), WsError> {
        for room in &self.rooms {
            debug!(%room, "re-joining room");
            send_frame(
                sink,
                &ClientFrame::Join {
                    conversation_id: room.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn flush_queue(&mut self, sink: &mut WsSink) -> std::result::Result<(), WsError> {
        while let Some((frame, done)) = self.queue.pop_front() {
            // The caller's bounded wait already elapsed with an error;
            // sending its frame late would execute an operation the
            // caller believes failed.
            if done.is_closed() {
                debug!("dropping queued frame whose caller gave up");
                continue;
            }
            match send_frame(sink, &frame).await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                Err(e) => {
                    // Put it back; it flushes on the next connection.
                    self.queue.push_front((frame, done));
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Buffer commands while waiting out a backoff delay.
    async fn wait_and_buffer(&mut self, delay: Duration) -> WaitOutcome {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Elapsed,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Invoke { frame, done }) => {
                        self.queue.push_back((frame, done));
                    }
                    Some(ConnCmd::Join(room)) => {
                        self.rooms.insert(room);
                    }
                    Some(ConnCmd::Leave(room)) => {
                        self.rooms.remove(&room);
                    }
                    Some(ConnCmd::Disconnect) | None => return WaitOutcome::Shutdown,
                },
            }
        }
    }

    /// Connected event loop: route inbound frames to subscribers, apply
    /// commands directly to the socket, keep the connection alive.
    async fn serve(&mut self, mut sink: WsSink, mut source: WsSource) -> LoopExit {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Invoke { frame, done }) => {
                        if done.is_closed() {
                            debug!("dropping invoke whose caller gave up");
                            continue;
                        }
                        match send_frame(&mut sink, &frame).await {
                            Ok(()) => {
                                let _ = done.send(Ok(()));
                            }
                            Err(_) => {
                                self.queue.push_back((frame, done));
                                return LoopExit::ConnectionLost;
                            }
                        }
                    }
                    Some(ConnCmd::Join(room)) => {
                        let frame = ClientFrame::Join { conversation_id: room.clone() };
                        self.rooms.insert(room);
                        if send_frame(&mut sink, &frame).await.is_err() {
                            return LoopExit::ConnectionLost;
                        }
                    }
                    Some(ConnCmd::Leave(room)) => {
                        let frame = ClientFrame::Leave { conversation_id: room.clone() };
                        self.rooms.remove(&room);
                        if send_frame(&mut sink, &frame).await.is_err() {
                            return LoopExit::ConnectionLost;
                        }
                    }
                    Some(ConnCmd::Disconnect) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return LoopExit::Shutdown;
                    }
                },
                inbound = source.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => self.route_event(&text),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            return LoopExit::ConnectionLost;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return LoopExit::ConnectionLost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        return LoopExit::ConnectionLost;
                    }
                },
                _ = keepalive.tick() => {
                    if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        return LoopExit::ConnectionLost;
                    }
                }
            }
        }
    }

    fn route_event(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                // Lagging or absent subscribers are fine.
                let _ = self.event_tx.send(event);
            }
            Err(e) => warn!(error = %e, "unparseable server frame"),
        }
    }

    /// No more automatic retries: reject everything queued, surface the
    /// terminal state, and keep rejecting invokes until dropped.
    async fn terminal_disconnected(&mut self) {
        self.reject_queue();
        self.set_state(ConnectionState::Disconnected);

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ConnCmd::Invoke { done, .. } => {
                    let _ = done.send(Err(ChatError::NotConnected));
                }
                ConnCmd::Join(room) => {
                    self.rooms.insert(room);
                }
                ConnCmd::Leave(room) => {
                    self.rooms.remove(&room);
                }
                ConnCmd::Disconnect => return,
            }
        }
    }

    fn reject_queue(&mut self) {
        for (_, done) in self.queue.drain(..) {
            let _ = done.send(Err(ChatError::NotConnected));
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> std::result::Result<(), WsError> {
    match serde_json::to_string(frame) {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize client frame");
            Ok(())
        }
    }
}
