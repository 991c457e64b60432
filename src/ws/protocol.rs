//! Shard-channel protocol message definitions
//! These are the wire types for client-cell communication

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geo::Vec3;

/// Messages sent from client to cell
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    /// Consume a pending session and promote the socket to a player connection
    Register {
        player_id: String,
        session_token: String,
    },

    /// Liveness refresh with no other effect
    Heartbeat,

    /// Report the player's current world position
    Position { position: Vec3 },

    /// Relay an opaque negotiation payload to another player in the cell
    Signal {
        target_id: String,
        /// Passed through verbatim; the cell never inspects it
        payload: serde_json::Value,
    },
}

impl ClientMsg {
    /// Field-shape validation beyond what serde enforces.
    /// Decoding fails closed: frames that do not pass are answered with an
    /// `error` frame and never reach the cell actor.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            ClientMsg::Register {
                player_id,
                session_token,
            } => {
                if player_id.is_empty() {
                    return Err("playerId must be a non-empty string");
                }
                if session_token.is_empty() {
                    return Err("sessionToken must be a non-empty string");
                }
                Ok(())
            }
            ClientMsg::Heartbeat => Ok(()),
            ClientMsg::Position { position } => {
                if !position.is_finite() {
                    return Err("position components must be finite");
                }
                Ok(())
            }
            ClientMsg::Signal { target_id, .. } => {
                if target_id.is_empty() {
                    return Err("targetId must be a non-empty string");
                }
                Ok(())
            }
        }
    }
}

/// Messages sent from cell to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    /// Registration succeeded; the connection now owns the player id
    Registered { player_id: String },

    /// Audibility neighborhood update for one observer
    Peers {
        /// Full current peer set
        peers: Vec<String>,
        /// Peers entering the set since the last frame to this observer
        #[serde(skip_serializing_if = "Option::is_none")]
        added: Option<Vec<String>>,
        /// Peers leaving the set since the last frame to this observer
        #[serde(skip_serializing_if = "Option::is_none")]
        removed: Option<Vec<String>>,
        /// Observer-to-peer distances for every peer in the set
        distances: HashMap<String, f64>,
        /// Last-known positions for every peer in the set
        positions: HashMap<String, Vec3>,
        /// Registered connections in the cell at emission time
        total_players: usize,
    },

    /// A relayed negotiation payload from another player
    Signal {
        from: String,
        payload: serde_json::Value,
    },

    /// The target of an outbound `signal` was not reachable in this cell
    SignalDeliveryFailed { target_id: String },

    /// Protocol-level error; the connection stays open
    Error { message: String },
}
