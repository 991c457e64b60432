//! Async client for the shard channel
//!
//! [`SignalingClient`] is a thin handle over a background transport loop.
//! Commands are queued on an unbounded channel; server frames come back as
//! [`SignalingEvent`]s on a bounded channel. The loop registers as soon as
//! the socket is open and drives the heartbeat and position cadences until
//! the channel closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::geo::Vec3;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Heartbeat cadence while the channel is open
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default position polling cadence
pub const DEFAULT_POSITION_INTERVAL: Duration = Duration::from_millis(150);

/// Floor on the position polling cadence; the cell drops anything faster
const MIN_POSITION_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the bounded event channel. When the consumer lags, events
/// other than `Disconnected` are dropped with a warning.
const EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Supplies the local pose for the position cadence
pub type PositionSource = Arc<dyn Fn() -> Option<Vec3> + Send + Sync>;

/// Invoked with each position just before it is sent
pub type PositionHook = Arc<dyn Fn(Vec3) + Send + Sync>;

/// Configuration for one shard-channel connection
#[derive(Clone)]
pub struct SignalingConfig {
    /// Player id issued alongside the session token at admission
    pub player_id: String,
    /// One-time session token from the admission response
    pub session_token: String,
    pub heartbeat_interval: Duration,
    pub position_interval: Duration,
    pub position_source: Option<PositionSource>,
    pub position_sent_hook: Option<PositionHook>,
}

impl SignalingConfig {
    pub fn new(player_id: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            session_token: session_token.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            position_interval: DEFAULT_POSITION_INTERVAL,
            position_source: None,
            position_sent_hook: None,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_position_interval(mut self, interval: Duration) -> Self {
        self.position_interval = interval;
        self
    }

    /// Poll this source on the position cadence once registered
    pub fn with_position_source(
        mut self,
        source: impl Fn() -> Option<Vec3> + Send + Sync + 'static,
    ) -> Self {
        self.position_source = Some(Arc::new(source));
        self
    }

    /// Observe each position about to be sent (e.g. to feed the peer manager)
    pub fn with_position_sent_hook(mut self, hook: impl Fn(Vec3) + Send + Sync + 'static) -> Self {
        self.position_sent_hook = Some(Arc::new(hook));
        self
    }
}

/// Events delivered to the consumer
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// A decoded server frame
    Frame(ServerMsg),
    /// The channel closed; always delivered, always last
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("channel is closed")]
    NotConnected,
}

/// Handle to a connected shard channel
pub struct SignalingClient {
    cmd_tx: mpsc::UnboundedSender<ClientMsg>,
    registered: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl SignalingClient {
    /// Open the shard channel; `register` is the first frame on the wire.
    pub async fn connect(
        url: &str,
        config: SignalingConfig,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), SignalingError> {
        let (ws, _response) = connect_async(url).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientMsg>();
        let (event_tx, event_rx) = mpsc::channel::<SignalingEvent>(EVENT_CHANNEL_CAPACITY);
        let registered = Arc::new(AtomicBool::new(false));

        // Queued before the loop starts so it goes out first
        let _ = cmd_tx.send(ClientMsg::Register {
            player_id: config.player_id.clone(),
            session_token: config.session_token.clone(),
        });

        let task = tokio::spawn(run_loop(ws, cmd_rx, event_tx, registered.clone(), config));

        Ok((
            Self {
                cmd_tx,
                registered,
                task,
            },
            event_rx,
        ))
    }

    /// Queue a signaling payload for another player in the cell
    pub fn send_signal(
        &self,
        target_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), SignalingError> {
        self.send(ClientMsg::Signal {
            target_id: target_id.into(),
            payload,
        })
    }

    /// Queue a one-off position report outside the polling cadence
    pub fn send_position(&self, position: Vec3) -> Result<(), SignalingError> {
        self.send(ClientMsg::Position { position })
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Tear the channel down; the loop emits `Disconnected` on its way out.
    /// The loop gets a grace period to finish, then is aborted.
    pub async fn shutdown(self) {
        drop(self.cmd_tx);
        let mut task = self.task;
        if time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
            warn!("Shard channel loop did not stop in time, aborting");
            task.abort();
        }
    }

    fn send(&self, msg: ClientMsg) -> Result<(), SignalingError> {
        self.cmd_tx
            .send(msg)
            .map_err(|_| SignalingError::NotConnected)
    }
}

async fn run_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMsg>,
    event_tx: mpsc::Sender<SignalingEvent>,
    registered: Arc<AtomicBool>,
    config: SignalingConfig,
) {
    let (mut sink, mut stream) = ws.split();

    let heartbeat_period = config.heartbeat_interval;
    let position_period = config.position_interval.max(MIN_POSITION_INTERVAL);
    let mut heartbeat =
        time::interval_at(time::Instant::now() + heartbeat_period, heartbeat_period);
    let mut position_timer =
        time::interval_at(time::Instant::now() + position_period, position_period);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(msg) => {
                    if send_frame(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = stream.next() => {
                if !handle_server_frame(frame, &event_tx, &registered).await {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut sink, &ClientMsg::Heartbeat).await.is_err() {
                    break;
                }
            }
            _ = position_timer.tick() => {
                if !registered.load(Ordering::SeqCst) {
                    continue;
                }
                let Some(source) = &config.position_source else {
                    continue;
                };
                if let Some(position) = source() {
                    if let Some(hook) = &config.position_sent_hook {
                        hook(position);
                    }
                    if send_frame(&mut sink, &ClientMsg::Position { position }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    registered.store(false, Ordering::SeqCst);
    // Delivered even when the event channel is full
    let _ = event_tx.send(SignalingEvent::Disconnected).await;
    debug!("Shard channel loop stopped");
}

/// Returns false when the transport is done
async fn handle_server_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    event_tx: &mpsc::Sender<SignalingEvent>,
    registered: &AtomicBool,
) -> bool {
    match frame {
        Some(Ok(Message::Text(text))) => {
            match serde_json::from_str::<ServerMsg>(&text) {
                Ok(msg) => {
                    if matches!(msg, ServerMsg::Registered { .. }) {
                        registered.store(true, Ordering::SeqCst);
                    }
                    if event_tx.try_send(SignalingEvent::Frame(msg)).is_err() {
                        warn!("Event channel full, dropping server frame");
                    }
                }
                Err(e) => warn!(error = %e, "Unparseable server frame"),
            }
            true
        }
        Some(Ok(Message::Close(frame))) => {
            debug!(reason = ?frame, "Server closed the channel");
            false
        }
        Some(Ok(_)) => true,
        Some(Err(e)) => {
            warn!(error = %e, "Channel receive error");
            false
        }
        None => false,
    }
}

async fn send_frame(
    sink: &mut SplitSink<WsStream, Message>,
    msg: &ClientMsg,
) -> Result<(), SignalingError> {
    let json = serde_json::to_string(msg).map_err(|_| SignalingError::NotConnected)?;
    sink.send(Message::Text(json))
        .await
        .map_err(SignalingError::Connect)
}
