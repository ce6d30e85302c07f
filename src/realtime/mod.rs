//! Persistent channel to the companion monitoring process.
//!
//! One logical connection per process. The channel reconnects on its own
//! with exponential backoff until the retry budget runs out, after which
//! it stays disconnected until [`RealtimeChannel::connect`] is called
//! again. Subscribers receive inbound frames and connection status
//! transitions; sends are at-most-once and never queue while closed.

mod protocol;

pub use protocol::{frame_type, parse_frame, WireMessage};

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::metrics::ActivityMetrics;

pub const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_RETRIES: u32 = 5;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Realtime channel error types.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection attempt failed")]
    ConnectFailed,
    #[error("connection attempt superseded")]
    Superseded,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// A connected socket as a pair of string-frame channels.
pub struct Socket {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Socket factory, abstracted so tests can script connection failures.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<Socket, RealtimeError>>;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<Socket, RealtimeError>> {
        Box::pin(async move {
            let (ws, _) = connect_async(url).await?;
            let (mut sink, mut stream) = ws.split();
            let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
            let (in_tx, in_rx) = mpsc::channel::<String>(64);

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            if in_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                // Dropping in_tx closes the inbound channel, which the
                // read loop treats as a disconnect.
            });

            Ok(Socket {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

struct ChannelState {
    user_id: Option<String>,
    status: ConnectionStatus,
    outbound: Option<mpsc::Sender<String>>,
    retry_count: u32,
    retry_interval: Duration,
    /// Bumped on teardown; stale attempts and read loops check it.
    epoch: u64,
    /// Heartbeat and read-loop tasks of the live connection, aborted
    /// on teardown so a superseded socket closes immediately.
    tasks: Vec<JoinHandle<()>>,
}

type MessageHandler = Arc<dyn Fn(&WireMessage) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    message: HashMap<u64, MessageHandler>,
    status: HashMap<u64, StatusHandler>,
}

struct Inner {
    url: String,
    connector: Arc<dyn Connector>,
    state: Mutex<ChannelState>,
    status_tx: watch::Sender<ConnectionStatus>,
    handlers: Mutex<Handlers>,
}

/// Shared handle to the process-wide realtime connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<Inner>,
}

impl RealtimeChannel {
    pub fn new(url: &str, connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.to_string(),
                connector,
                state: Mutex::new(ChannelState {
                    user_id: None,
                    status: ConnectionStatus::Disconnected,
                    outbound: None,
                    retry_count: 0,
                    retry_interval: INITIAL_RETRY_INTERVAL,
                    epoch: 0,
                    tasks: Vec::new(),
                }),
                status_tx,
                handlers: Mutex::new(Handlers::default()),
            }),
        }
    }

    /// Connect on behalf of `user_id`.
    ///
    /// Idempotent while connected for the same user; a different user
    /// tears the existing connection down first. Concurrent callers
    /// share one in-flight attempt. The result reflects the first
    /// attempt only; reconnection continues in the background.
    pub async fn connect(&self, user_id: &str) -> Result<(), RealtimeError> {
        enum Action {
            Done,
            Wait(watch::Receiver<ConnectionStatus>),
            Attempt(u64),
        }

        let action = {
            let mut st = self.inner.state.lock().unwrap();
            if st.user_id.as_deref() != Some(user_id) {
                Inner::teardown_locked(&mut st);
                st.user_id = Some(user_id.to_string());
            }
            match st.status {
                ConnectionStatus::Connected => Action::Done,
                ConnectionStatus::Connecting => Action::Wait(self.inner.status_tx.subscribe()),
                ConnectionStatus::Disconnected => {
                    st.status = ConnectionStatus::Connecting;
                    st.retry_count = 0;
                    st.retry_interval = INITIAL_RETRY_INTERVAL;
                    Action::Attempt(st.epoch)
                }
            }
        };

        match action {
            Action::Done => Ok(()),
            Action::Wait(mut rx) => {
                let settled = rx
                    .wait_for(|s| *s != ConnectionStatus::Connecting)
                    .await
                    .map(|s| *s)
                    .unwrap_or(ConnectionStatus::Disconnected);
                if settled == ConnectionStatus::Connected {
                    Ok(())
                } else {
                    Err(RealtimeError::ConnectFailed)
                }
            }
            Action::Attempt(epoch) => {
                self.inner.status_tx.send_replace(ConnectionStatus::Connecting);
                Inner::attempt(self.inner.clone(), epoch).await
            }
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Dispatch a frame if the socket is open. Returns whether it was
    /// handed to the socket; closed channels drop the message.
    pub fn send(&self, msg: &WireMessage) -> bool {
        let st = self.inner.state.lock().unwrap();
        if st.status != ConnectionStatus::Connected {
            return false;
        }
        match &st.outbound {
            Some(tx) => tx.try_send(msg.to_json()).is_ok(),
            None => false,
        }
    }

    /// Best-effort activity push used by the event monitor.
    pub fn notify_activity(&self, metrics: &ActivityMetrics) -> bool {
        self.send(&WireMessage::ActivityUpdate {
            data: metrics.clone(),
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    pub fn start_monitoring(&self) -> bool {
        self.send(&WireMessage::StartMonitoring)
    }

    pub fn stop_monitoring(&self) -> bool {
        self.send(&WireMessage::StopMonitoring)
    }

    /// Register an inbound-frame handler.
    pub fn on_message(&self, handler: impl Fn(&WireMessage) + Send + Sync + 'static) -> u64 {
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers.message.insert(id, Arc::new(handler));
        id
    }

    pub fn remove_message_handler(&self, id: u64) {
        self.inner.handlers.lock().unwrap().message.remove(&id);
    }

    /// Register a status handler. It is immediately told the current
    /// status, so a late subscriber never misses the initial state.
    pub fn on_status(&self, handler: impl Fn(bool) + Send + Sync + 'static) -> u64 {
        let handler: StatusHandler = Arc::new(handler);
        let connected = self.status() == ConnectionStatus::Connected;
        handler(connected);
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers.next_id += 1;
        let id = handlers.next_id;
        handlers.status.insert(id, handler);
        id
    }

    pub fn remove_status_handler(&self, id: u64) {
        self.inner.handlers.lock().unwrap().status.remove(&id);
    }
}

impl Inner {
    fn teardown_locked(st: &mut ChannelState) {
        st.epoch += 1;
        // Aborting the read loop stops stale dispatch; aborting the
        // heartbeat drops the last outbound sender, which closes the
        // socket's writer side.
        for task in st.tasks.drain(..) {
            task.abort();
        }
        st.outbound = None;
        st.status = ConnectionStatus::Disconnected;
        st.retry_count = 0;
        st.retry_interval = INITIAL_RETRY_INTERVAL;
    }

    async fn attempt(inner: Arc<Inner>, epoch: u64) -> Result<(), RealtimeError> {
        {
            let st = inner.state.lock().unwrap();
            if st.epoch != epoch || st.status != ConnectionStatus::Connecting {
                return Err(RealtimeError::Superseded);
            }
        }

        match inner.connector.connect(inner.url.clone()).await {
            Ok(socket) => {
                let user_id = {
                    let mut st = inner.state.lock().unwrap();
                    if st.epoch != epoch {
                        // A teardown won the race; let the socket drop.
                        return Err(RealtimeError::Superseded);
                    }
                    st.outbound = Some(socket.outbound.clone());
                    st.status = ConnectionStatus::Connected;
                    st.retry_count = 0;
                    st.retry_interval = INITIAL_RETRY_INTERVAL;
                    st.user_id.clone().unwrap_or_default()
                };
                inner.status_tx.send_replace(ConnectionStatus::Connected);

                let auth = WireMessage::Auth {
                    user_id,
                    timestamp: Utc::now().to_rfc3339(),
                };
                let _ = socket.outbound.send(auth.to_json()).await;

                tracing::info!("Realtime: connected to {}", inner.url);
                inner.notify_status(true);

                let heartbeat = tokio::spawn(Inner::run_heartbeat(socket.outbound.clone()));
                let reader =
                    tokio::spawn(Inner::run_read_loop(inner.clone(), socket.inbound, epoch));
                {
                    let mut st = inner.state.lock().unwrap();
                    if st.epoch == epoch {
                        st.tasks = vec![heartbeat, reader];
                    } else {
                        // A teardown raced us; kill the fresh tasks too.
                        heartbeat.abort();
                        reader.abort();
                    }
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Realtime: connection attempt failed: {}", e);
                {
                    let mut st = inner.state.lock().unwrap();
                    if st.epoch != epoch {
                        return Err(e);
                    }
                    st.status = ConnectionStatus::Disconnected;
                }
                inner.status_tx.send_replace(ConnectionStatus::Disconnected);
                Inner::schedule_reconnect(&inner);
                Err(e)
            }
        }
    }

    /// Heartbeat keeps the connection alive; the task ends as soon as
    /// the socket side of the channel is gone.
    async fn run_heartbeat(outbound: mpsc::Sender<String>) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let ping = WireMessage::Ping {
                timestamp: Utc::now().to_rfc3339(),
            };
            if outbound.send(ping.to_json()).await.is_err() {
                break;
            }
        }
    }

    async fn run_read_loop(inner: Arc<Inner>, mut inbound: mpsc::Receiver<String>, epoch: u64) {
        while let Some(text) = inbound.recv().await {
            // Frames from a superseded connection are never delivered.
            if inner.state.lock().unwrap().epoch != epoch {
                return;
            }
            inner.dispatch(&text);
        }
        inner.handle_disconnect(epoch);
    }

    fn handle_disconnect(self: &Arc<Inner>, epoch: u64) {
        {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return;
            }
            // Stops the heartbeat; aborting the read loop's own handle
            // is a no-op since it is already returning.
            for task in st.tasks.drain(..) {
                task.abort();
            }
            st.outbound = None;
            st.status = ConnectionStatus::Disconnected;
        }
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
        tracing::info!("Realtime: connection closed");
        self.notify_status(false);
        Inner::schedule_reconnect(self);
    }

    fn schedule_reconnect(inner: &Arc<Inner>) {
        let scheduled = {
            let mut st = inner.state.lock().unwrap();
            if st.status != ConnectionStatus::Disconnected || st.retry_count >= MAX_RETRIES {
                None
            } else {
                st.retry_count += 1;
                let delay = st.retry_interval;
                st.retry_interval = advance_backoff(st.retry_interval);
                st.status = ConnectionStatus::Connecting;
                Some((delay, st.retry_count, st.epoch))
            }
        };

        match scheduled {
            Some((delay, attempt, epoch)) => {
                inner.status_tx.send_replace(ConnectionStatus::Connecting);
                tracing::info!(
                    "Realtime: retrying in {:?} ({}/{})",
                    delay,
                    attempt,
                    MAX_RETRIES
                );
                let inner = inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = Inner::attempt(inner, epoch).await;
                });
            }
            None => {
                tracing::warn!("Realtime: retry budget exhausted; staying disconnected");
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match parse_frame(text) {
            Ok(WireMessage::Pong { .. }) => {}
            Ok(msg) => {
                let handlers: Vec<MessageHandler> =
                    self.handlers.lock().unwrap().message.values().cloned().collect();
                for handler in handlers {
                    handler(&msg);
                }
            }
            Err(_) => match frame_type(text) {
                Some(kind) => tracing::warn!("Realtime: ignoring unknown message type {:?}", kind),
                None => tracing::warn!("Realtime: ignoring unparseable frame"),
            },
        }
    }

    fn notify_status(&self, connected: bool) {
        let handlers: Vec<StatusHandler> =
            self.handlers.lock().unwrap().status.values().cloned().collect();
        for handler in handlers {
            handler(connected);
        }
    }
}

/// Next reconnect interval: doubled and capped.
pub fn advance_backoff(interval: Duration) -> Duration {
    (interval * 2).min(MAX_RETRY_INTERVAL)
}
