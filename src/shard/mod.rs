//! Spatial cell actors and their registry

pub mod actor;
pub mod proximity;

pub use actor::WorldShard;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ws::protocol::ClientMsg;

/// Outbound frame sender for one socket; a writer task drains it into the sink
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Commands accepted by a cell actor's mailbox
pub enum ShardCommand {
    /// Admission pre-registration of a `(playerId, sessionToken)` pair
    Prepare {
        player_id: String,
        session_token: String,
        reply: oneshot::Sender<()>,
    },
    /// A freshly upgraded socket, not yet registered
    Attach {
        connection_id: Uuid,
        sender: ConnectionSender,
    },
    /// A decoded, validated frame from a socket
    Inbound {
        connection_id: Uuid,
        msg: ClientMsg,
    },
    /// The socket closed or errored
    Closed { connection_id: Uuid },
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("cell actor is unavailable")]
    Unavailable,
}

/// Handle to a running cell actor
#[derive(Clone)]
pub struct ShardHandle {
    pub cell_id: String,
    tx: mpsc::UnboundedSender<ShardCommand>,
    player_count: Arc<AtomicUsize>,
}

impl ShardHandle {
    /// Pre-register a pending session; resolves once the actor stored it.
    pub async fn prepare(&self, player_id: String, session_token: String) -> Result<(), ShardError> {
        let (reply, ack) = oneshot::channel();
        self.tx
            .send(ShardCommand::Prepare {
                player_id,
                session_token,
                reply,
            })
            .map_err(|_| ShardError::Unavailable)?;
        ack.await.map_err(|_| ShardError::Unavailable)
    }

    /// Hand a newly accepted socket to the actor.
    pub fn attach(&self, connection_id: Uuid, sender: ConnectionSender) -> Result<(), ShardError> {
        self.tx
            .send(ShardCommand::Attach {
                connection_id,
                sender,
            })
            .map_err(|_| ShardError::Unavailable)
    }

    /// Forward a decoded frame. Frames to a stopped actor are dropped; the
    /// socket will observe the closed channel shortly after.
    pub fn inbound(&self, connection_id: Uuid, msg: ClientMsg) {
        let _ = self.tx.send(ShardCommand::Inbound { connection_id, msg });
    }

    /// Report a closed socket.
    pub fn closed(&self, connection_id: Uuid) {
        let _ = self.tx.send(ShardCommand::Closed { connection_id });
    }

    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Registry of live cell actors, keyed by cell id
#[derive(Clone, Default)]
pub struct ShardRegistry {
    shards: Arc<DashMap<String, ShardHandle>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self {
            shards: Arc::new(DashMap::new()),
        }
    }

    /// Get the live handle for a cell, spawning the actor on first use or
    /// when the previous actor has already shut down.
    pub fn handle(&self, cell_id: &str) -> ShardHandle {
        let mut entry = self
            .shards
            .entry(cell_id.to_string())
            .or_insert_with(|| self.spawn(cell_id));
        if entry.is_closed() {
            *entry = self.spawn(cell_id);
        }
        entry.clone()
    }

    fn spawn(&self, cell_id: &str) -> ShardHandle {
        let (handle, task) = WorldShard::spawn(cell_id.to_string());
        let shards = self.shards.clone();
        let cell = cell_id.to_string();
        let spawned = handle.clone();
        tokio::spawn(async move {
            let _ = task.await;
            // Only drop the entry if it still refers to this actor; a new
            // actor may already have replaced it.
            shards.remove_if(&cell, |_, h| h.tx.same_channel(&spawned.tx));
        });
        handle
    }

    pub fn active_cells(&self) -> usize {
        self.shards.len()
    }

    pub fn total_players(&self) -> usize {
        self.shards.iter().map(|e| e.value().player_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_reuses_live_actor() {
        let registry = ShardRegistry::new();
        let a = registry.handle("cell:0:0:0");
        let b = registry.handle("cell:0:0:0");
        assert!(a.tx.same_channel(&b.tx));
        assert_eq!(registry.active_cells(), 1);

        let other = registry.handle("cell:1:0:0");
        assert!(!a.tx.same_channel(&other.tx));
        assert_eq!(registry.active_cells(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_actor_is_replaced_on_next_use() {
        let registry = ShardRegistry::new();
        let first = registry.handle("cell:0:0:0");

        // With nothing pending and no sockets the actor exits at the first
        // cleanup tick.
        tokio::time::sleep(std::time::Duration::from_secs(31)).await;
        assert!(first.is_closed());

        let second = registry.handle("cell:0:0:0");
        assert!(!second.is_closed());
        assert!(!first.tx.same_channel(&second.tx));
    }
}
