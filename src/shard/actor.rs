//! Cell state and the actor task that owns it
//!
//! One `WorldShard` exclusively owns everything for one cell: pending
//! admission sessions, anonymous and registered sockets, last-known
//! positions, per-observer peer views, and the timers. All mutation happens
//! inside the actor loop; the rest of the process talks to it through the
//! mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::geo::Vec3;
use crate::ws::protocol::{ClientMsg, ServerMsg};

use super::proximity;
use super::{ConnectionSender, ShardCommand, ShardHandle};

/// How long an admission pre-registration stays consumable
pub const PENDING_SESSION_TTL: Duration = Duration::from_secs(60);

/// A registered connection silent for longer than this is force-closed.
/// The cleanup sweep runs with the same period.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum spacing between accepted position updates per connection
pub const POSITION_UPDATE_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Coalescing window for proximity recomputation
pub const PROXIMITY_DEBOUNCE: Duration = Duration::from_millis(50);

/// Close code for superseded or timed-out connections
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code for a failed session-token check at register
pub const CLOSE_INVALID_SESSION: u16 = 4001;

/// An admission pre-registration awaiting its socket
struct PendingSession {
    player_id: String,
    created_at: Instant,
}

/// A socket that consumed a session token and owns a player id
struct PlayerConnection {
    connection_id: Uuid,
    player_id: String,
    sender: ConnectionSender,
    last_seen: Instant,
    last_position_at: Option<Instant>,
    position: Option<Vec3>,
}

/// The per-cell presence and signaling actor
pub struct WorldShard {
    cell_id: String,
    rx: mpsc::UnboundedReceiver<ShardCommand>,
    /// Pending sessions by token
    pending_by_token: HashMap<String, PendingSession>,
    /// Pending token by player, so a fresh admission evicts the prior one
    pending_by_player: HashMap<String, String>,
    /// Accepted sockets that have not registered yet
    anonymous: HashMap<Uuid, ConnectionSender>,
    /// Registered connections keyed by player id
    connections: HashMap<String, PlayerConnection>,
    /// Connection id -> player id, for socket-event lookups
    registered_ids: HashMap<Uuid, String>,
    /// Distances last emitted to each observer
    peer_views: HashMap<String, HashMap<String, f64>>,
    /// Armed debounce deadline, if any
    recalc_at: Option<Instant>,
    player_count: Arc<AtomicUsize>,
}

impl WorldShard {
    /// Spawn the actor task for a cell. The registry owns the join handle.
    pub fn spawn(cell_id: String) -> (ShardHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let player_count = Arc::new(AtomicUsize::new(0));

        let shard = Self {
            cell_id: cell_id.clone(),
            rx,
            pending_by_token: HashMap::new(),
            pending_by_player: HashMap::new(),
            anonymous: HashMap::new(),
            connections: HashMap::new(),
            registered_ids: HashMap::new(),
            peer_views: HashMap::new(),
            recalc_at: None,
            player_count: player_count.clone(),
        };

        let task = tokio::spawn(shard.run());

        (
            ShardHandle {
                cell_id,
                tx,
                player_count,
            },
            task,
        )
    }

    async fn run(mut self) {
        info!(cell_id = %self.cell_id, "Cell actor started");

        let mut cleanup = time::interval_at(Instant::now() + HEARTBEAT_TIMEOUT, HEARTBEAT_TIMEOUT);
        cleanup.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = Self::debounce(self.recalc_at), if self.recalc_at.is_some() => {
                    self.recalc_at = None;
                    self.recompute_proximity();
                }
                _ = cleanup.tick() => {
                    self.expire_stale();
                    self.prune_pending();
                    if self.is_idle() {
                        break;
                    }
                }
            }
        }

        info!(cell_id = %self.cell_id, "Cell actor stopped");
    }

    /// One-shot armed by `schedule_recalc`; pending forever while unarmed
    async fn debounce(at: Option<Instant>) {
        match at {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    fn handle_command(&mut self, cmd: ShardCommand) {
        match cmd {
            ShardCommand::Prepare {
                player_id,
                session_token,
                reply,
            } => {
                self.handle_prepare(player_id, session_token);
                let _ = reply.send(());
            }
            ShardCommand::Attach {
                connection_id,
                sender,
            } => {
                debug!(cell_id = %self.cell_id, connection_id = %connection_id, "Socket attached");
                self.anonymous.insert(connection_id, sender);
            }
            ShardCommand::Inbound { connection_id, msg } => self.handle_frame(connection_id, msg),
            ShardCommand::Closed { connection_id } => self.handle_closed(connection_id),
        }
    }

    /// Store a pending session. Not an authentication step: the pair is a
    /// one-time capability that becomes valid when a socket registers with
    /// it inside the TTL.
    fn handle_prepare(&mut self, player_id: String, session_token: String) {
        self.prune_pending();

        if let Some(old_token) = self.pending_by_player.remove(&player_id) {
            self.pending_by_token.remove(&old_token);
        }

        self.pending_by_token.insert(
            session_token.clone(),
            PendingSession {
                player_id: player_id.clone(),
                created_at: Instant::now(),
            },
        );
        self.pending_by_player.insert(player_id, session_token);
    }

    fn prune_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending_by_token
            .iter()
            .filter(|(_, s)| now.duration_since(s.created_at) > PENDING_SESSION_TTL)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(session) = self.pending_by_token.remove(&token) {
                if self.pending_by_player.get(&session.player_id) == Some(&token) {
                    self.pending_by_player.remove(&session.player_id);
                }
            }
        }
    }

    fn handle_frame(&mut self, connection_id: Uuid, msg: ClientMsg) {
        // Every inbound frame refreshes liveness for a registered connection,
        // including frames the position rate limit later drops.
        if let Some(player_id) = self.registered_ids.get(&connection_id) {
            if let Some(conn) = self.connections.get_mut(player_id) {
                conn.last_seen = Instant::now();
            }
        }

        match msg {
            ClientMsg::Register {
                player_id,
                session_token,
            } => self.handle_register(connection_id, player_id, session_token),
            ClientMsg::Heartbeat => {}
            ClientMsg::Position { position } => self.handle_position(connection_id, position),
            ClientMsg::Signal { target_id, payload } => {
                self.handle_signal(connection_id, target_id, payload)
            }
        }
    }

    fn handle_register(&mut self, connection_id: Uuid, player_id: String, session_token: String) {
        self.prune_pending();

        let Some(sender) = self.sender_of(connection_id) else {
            return;
        };

        let valid = self
            .pending_by_token
            .get(&session_token)
            .is_some_and(|s| s.player_id == player_id);
        if !valid {
            warn!(
                cell_id = %self.cell_id,
                player_id = %player_id,
                "Register with unknown or mismatched session token"
            );
            Self::send(
                &sender,
                &ServerMsg::Error {
                    message: "invalid session token".to_string(),
                },
            );
            Self::send_close(&sender, CLOSE_INVALID_SESSION, "invalid session token");
            return;
        }

        // Consume the one-time session from both indexes
        self.pending_by_token.remove(&session_token);
        if self.pending_by_player.get(&player_id) == Some(&session_token) {
            self.pending_by_player.remove(&player_id);
        }

        self.anonymous.remove(&connection_id);

        // A new register for the same player supersedes the old socket
        if let Some(old) = self.connections.remove(&player_id) {
            if old.connection_id != connection_id {
                debug!(
                    cell_id = %self.cell_id,
                    player_id = %player_id,
                    "Superseding existing connection"
                );
                Self::send_close(&old.sender, CLOSE_GOING_AWAY, "superseded by a new connection");
                self.registered_ids.remove(&old.connection_id);
            }
        }
        self.peer_views.remove(&player_id);

        self.connections.insert(
            player_id.clone(),
            PlayerConnection {
                connection_id,
                player_id: player_id.clone(),
                sender: sender.clone(),
                last_seen: Instant::now(),
                last_position_at: None,
                position: None,
            },
        );
        self.registered_ids.insert(connection_id, player_id.clone());
        self.update_player_count();

        Self::send(
            &sender,
            &ServerMsg::Registered {
                player_id: player_id.clone(),
            },
        );
        info!(
            cell_id = %self.cell_id,
            player_id = %player_id,
            players = self.connections.len(),
            "Player registered"
        );
        self.schedule_recalc();
    }

    fn handle_position(&mut self, connection_id: Uuid, position: Vec3) {
        let Some(player_id) = self.registered_ids.get(&connection_id) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(player_id) else {
            return;
        };

        let now = Instant::now();
        let due = conn
            .last_position_at
            .map_or(true, |at| now.duration_since(at) >= POSITION_UPDATE_MIN_INTERVAL);
        if !due {
            // Dropped by the rate limit; liveness was already refreshed.
            return;
        }

        conn.position = Some(position);
        conn.last_position_at = Some(now);
        self.schedule_recalc();
    }

    fn handle_signal(&mut self, connection_id: Uuid, target_id: String, payload: serde_json::Value) {
        let Some(reply_to) = self.sender_of(connection_id) else {
            return;
        };

        let source = self.registered_ids.get(&connection_id);
        let target = self.connections.get(&target_id);

        match (source, target) {
            (Some(from), Some(target)) => {
                Self::send(
                    &target.sender,
                    &ServerMsg::Signal {
                        from: from.clone(),
                        payload,
                    },
                );
            }
            _ => {
                debug!(cell_id = %self.cell_id, target_id = %target_id, "Undeliverable signal");
                Self::send(&reply_to, &ServerMsg::SignalDeliveryFailed { target_id });
            }
        }
    }

    fn handle_closed(&mut self, connection_id: Uuid) {
        self.anonymous.remove(&connection_id);

        let Some(player_id) = self.registered_ids.remove(&connection_id) else {
            return;
        };
        // A superseded socket's id was unlinked at register time, so this
        // only ever removes the connection it still belongs to.
        if self
            .connections
            .get(&player_id)
            .is_some_and(|c| c.connection_id == connection_id)
        {
            self.connections.remove(&player_id);
            self.peer_views.remove(&player_id);
            self.update_player_count();
            info!(cell_id = %self.cell_id, player_id = %player_id, "Player disconnected");
            self.schedule_recalc();
        }
    }

    /// Force-close registered connections that have gone silent
    fn expire_stale(&mut self) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .connections
            .values()
            .filter(|c| now.duration_since(c.last_seen) > HEARTBEAT_TIMEOUT)
            .map(|c| c.player_id.clone())
            .collect();

        for player_id in stale {
            if let Some(conn) = self.connections.remove(&player_id) {
                warn!(
                    cell_id = %self.cell_id,
                    player_id = %player_id,
                    "Heartbeat timeout, closing connection"
                );
                Self::send_close(&conn.sender, CLOSE_GOING_AWAY, "heartbeat timeout");
                self.registered_ids.remove(&conn.connection_id);
                self.peer_views.remove(&player_id);
                self.update_player_count();
                self.schedule_recalc();
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.connections.is_empty() && self.anonymous.is_empty() && self.pending_by_token.is_empty()
    }

    /// Arm the debounce one-shot; idempotent while armed
    fn schedule_recalc(&mut self) {
        if self.recalc_at.is_none() {
            self.recalc_at = Some(Instant::now() + PROXIMITY_DEBOUNCE);
        }
    }

    /// One recomputation pass: rebuild every positioned observer's view from
    /// a single snapshot, emit a `peers` frame only where the diff says so,
    /// and commit emitted views.
    fn recompute_proximity(&mut self) {
        let total_players = self.connections.len();
        let positioned: Vec<(String, Vec3)> = self
            .connections
            .values()
            .filter_map(|c| c.position.map(|p| (c.player_id.clone(), p)))
            .collect();

        let empty = HashMap::new();
        for (observer, origin) in &positioned {
            let next = proximity::neighborhood(observer, *origin, &positioned);
            let previous = self.peer_views.get(observer).unwrap_or(&empty);
            let diff = proximity::diff_views(previous, &next);
            if diff.is_empty() {
                continue;
            }

            let Some(conn) = self.connections.get(observer) else {
                continue;
            };

            let mut peers: Vec<String> = next.keys().cloned().collect();
            peers.sort();
            let distances: HashMap<String, f64> = next
                .iter()
                .map(|(id, snap)| (id.clone(), snap.distance))
                .collect();
            let positions: HashMap<String, Vec3> = next
                .iter()
                .map(|(id, snap)| (id.clone(), snap.position))
                .collect();

            Self::send(
                &conn.sender,
                &ServerMsg::Peers {
                    peers,
                    added: (!diff.added.is_empty()).then(|| diff.added.clone()),
                    removed: (!diff.removed.is_empty()).then(|| diff.removed.clone()),
                    distances: distances.clone(),
                    positions,
                    total_players,
                },
            );
            self.peer_views.insert(observer.clone(), distances);
        }
    }

    fn sender_of(&self, connection_id: Uuid) -> Option<ConnectionSender> {
        if let Some(sender) = self.anonymous.get(&connection_id) {
            return Some(sender.clone());
        }
        self.registered_ids
            .get(&connection_id)
            .and_then(|player_id| self.connections.get(player_id))
            .map(|c| c.sender.clone())
    }

    fn update_player_count(&self) {
        self.player_count
            .store(self.connections.len(), Ordering::Relaxed);
    }

    fn send(sender: &ConnectionSender, msg: &ServerMsg) {
        if let Ok(json) = serde_json::to_string(msg) {
            let _ = sender.send(Message::Text(json));
        }
    }

    fn send_close(sender: &ConnectionSender, code: u16, reason: &'static str) {
        let _ = sender.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
    }
}
