//! Client-side peer selection
//!
//! The cell reports who is audible; this layer decides who actually gets a
//! media link. Admission uses `connect_radius`, release uses
//! `connect_radius × disconnect_radius_multiplier`, so a peer hovering at
//! the boundary cannot flap a link, and a hard cap bounds simultaneous
//! connections regardless of crowd size.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::geo::Vec3;

/// Peer state entries idle longer than this, and no longer candidates,
/// are dropped to bound memory.
const PEER_STATE_MAX_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    /// Distance at or below which a new peer may be admitted
    pub connect_radius: f64,
    /// Peers stay connected until distance exceeds `connect_radius` × this
    pub disconnect_radius_multiplier: f64,
    /// Hard cap on simultaneously connected peers
    pub max_peers: usize,
    /// Delay of the evaluation one-shot armed by any input
    pub evaluation_debounce: Duration,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            connect_radius: 30.0,
            disconnect_radius_multiplier: 1.5,
            max_peers: 8,
            evaluation_debounce: Duration::from_millis(250),
        }
    }
}

/// Connection decisions for the external media machinery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connect(String),
    Disconnect(String),
}

#[derive(Debug, Clone, Copy)]
struct PeerTrack {
    distance: f64,
    last_updated: Instant,
    /// Whether the distance came from the server rather than being derived
    /// from positions
    explicit_distance: bool,
}

/// A candidate-set update, typically folded from a server `peers` frame.
/// An absolute `peers` list replaces the candidate set; otherwise the
/// `added`/`removed` deltas apply.
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    pub peers: Option<Vec<String>>,
    pub added: Option<Vec<String>>,
    pub removed: Option<Vec<String>>,
    pub distances: Option<HashMap<String, f64>>,
    pub positions: Option<HashMap<String, Vec3>>,
}

pub struct PeerManager {
    config: PeerManagerConfig,
    /// Players the cell currently reports in range
    candidates: HashSet<String>,
    tracks: HashMap<String, PeerTrack>,
    positions: HashMap<String, Vec3>,
    local_position: Option<Vec3>,
    connected: HashSet<String>,
    /// Armed evaluation deadline, if any
    eval_due: Option<Instant>,
}

impl PeerManager {
    pub fn new(config: PeerManagerConfig) -> Self {
        Self {
            config,
            candidates: HashSet::new(),
            tracks: HashMap::new(),
            positions: HashMap::new(),
            local_position: None,
            connected: HashSet::new(),
            eval_due: None,
        }
    }

    /// Update the local pose and re-derive every stored peer distance from
    /// positions. Server-reported distances arriving later overwrite these.
    pub fn update_local_position(&mut self, position: Vec3) {
        self.local_position = Some(position);
        let now = Instant::now();
        for (id, peer_pos) in &self.positions {
            self.tracks.insert(
                id.clone(),
                PeerTrack {
                    distance: position.distance_to(*peer_pos),
                    last_updated: now,
                    explicit_distance: false,
                },
            );
        }
        self.schedule_evaluation();
    }

    /// Store or clear a peer's position; derives its distance when the local
    /// pose is known, otherwise the peer is treated as unreachable.
    pub fn update_peer_position(&mut self, id: &str, position: Option<Vec3>) {
        let distance = match position {
            Some(pos) => {
                self.positions.insert(id.to_string(), pos);
                self.local_position
                    .map(|local| local.distance_to(pos))
                    .unwrap_or(f64::INFINITY)
            }
            None => {
                self.positions.remove(id);
                f64::INFINITY
            }
        };
        self.tracks.insert(
            id.to_string(),
            PeerTrack {
                distance,
                last_updated: Instant::now(),
                explicit_distance: false,
            },
        );
        self.schedule_evaluation();
    }

    /// Record a server-reported distance; `None` marks the peer unreachable.
    pub fn update_peer_distance(&mut self, id: &str, distance: Option<f64>) {
        self.tracks.insert(
            id.to_string(),
            PeerTrack {
                distance: distance.unwrap_or(f64::INFINITY),
                last_updated: Instant::now(),
                explicit_distance: distance.is_some(),
            },
        );
        self.schedule_evaluation();
    }

    /// Fold in a candidate-set update from the cell.
    pub fn apply_peer_update(&mut self, update: PeerUpdate) {
        if let Some(peers) = update.peers {
            self.candidates = peers.into_iter().collect();
        } else {
            if let Some(added) = update.added {
                self.candidates.extend(added);
            }
            if let Some(removed) = update.removed {
                for id in removed {
                    self.candidates.remove(&id);
                }
            }
        }

        // Positions first so explicit server distances win
        if let Some(positions) = update.positions {
            for (id, pos) in positions {
                self.update_peer_position(&id, Some(pos));
            }
        }
        if let Some(distances) = update.distances {
            for (id, dist) in distances {
                self.update_peer_distance(&id, Some(dist));
            }
        }

        self.schedule_evaluation();
    }

    /// Unconditionally forget a peer. Returns the disconnect event when the
    /// peer had an active link.
    pub fn remove_peer(&mut self, id: &str) -> Vec<PeerEvent> {
        self.candidates.remove(id);
        self.tracks.remove(id);
        self.positions.remove(id);
        if self.connected.remove(id) {
            debug!(peer_id = %id, "Peer removed while connected");
            vec![PeerEvent::Disconnect(id.to_string())]
        } else {
            Vec::new()
        }
    }

    /// Run an evaluation pass if the armed one-shot is due.
    pub fn poll(&mut self, now: Instant) -> Vec<PeerEvent> {
        match self.eval_due {
            Some(due) if due <= now => self.evaluate(now),
            _ => Vec::new(),
        }
    }

    /// The deadline of the armed evaluation one-shot, if any
    pub fn next_evaluation(&self) -> Option<Instant> {
        self.eval_due
    }

    /// One selection pass. Disconnects are decided and emitted before any
    /// admission so freed slots can be refilled in the same pass; admissions
    /// go closest-first.
    pub fn evaluate(&mut self, now: Instant) -> Vec<PeerEvent> {
        self.eval_due = None;

        let release_radius = self.config.connect_radius * self.config.disconnect_radius_multiplier;
        let mut events = Vec::new();
        let mut dropped: HashSet<String> = HashSet::new();

        let connected_ids: Vec<String> = self.connected.iter().cloned().collect();
        for id in connected_ids {
            let keep = self.candidates.contains(&id) && self.distance_of(&id) <= release_radius;
            if !keep {
                self.connected.remove(&id);
                dropped.insert(id.clone());
                events.push(PeerEvent::Disconnect(id));
            }
        }

        let free_slots = self.config.max_peers.saturating_sub(self.connected.len());
        if free_slots > 0 {
            let mut admissible: Vec<(String, f64)> = self
                .candidates
                .iter()
                .filter(|id| !self.connected.contains(*id) && !dropped.contains(*id))
                .filter_map(|id| {
                    let distance = self.distance_of(id);
                    (distance <= self.config.connect_radius).then(|| (id.clone(), distance))
                })
                .collect();
            admissible.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

            for (id, _) in admissible.into_iter().take(free_slots) {
                self.connected.insert(id.clone());
                events.push(PeerEvent::Connect(id));
            }
        }

        // Bound memory: forget stale state for peers the cell no longer reports
        self.tracks.retain(|id, track| {
            self.candidates.contains(id)
                || now.duration_since(track.last_updated) <= PEER_STATE_MAX_IDLE
        });
        let tracks = &self.tracks;
        self.positions
            .retain(|id, _| self.candidates.contains(id) || tracks.contains_key(id));

        events
    }

    pub fn connected_peers(&self) -> &HashSet<String> {
        &self.connected
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.connected.contains(id)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    fn distance_of(&self, id: &str) -> f64 {
        self.tracks
            .get(id)
            .map(|t| t.distance)
            .unwrap_or(f64::INFINITY)
    }

    /// Arm the evaluation one-shot; idempotent while armed
    fn schedule_evaluation(&mut self) {
        if self.eval_due.is_none() {
            self.eval_due = Some(Instant::now() + self.config.evaluation_debounce);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_peers: usize) -> PeerManager {
        PeerManager::new(PeerManagerConfig {
            connect_radius: 30.0,
            disconnect_radius_multiplier: 1.5,
            max_peers,
            evaluation_debounce: Duration::from_millis(250),
        })
    }

    fn candidates(mgr: &mut PeerManager, entries: &[(&str, f64)]) {
        mgr.apply_peer_update(PeerUpdate {
            peers: Some(entries.iter().map(|(id, _)| id.to_string()).collect()),
            distances: Some(
                entries
                    .iter()
                    .map(|(id, d)| (id.to_string(), *d))
                    .collect(),
            ),
            ..PeerUpdate::default()
        });
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[tokio::test]
    async fn hysteresis_full_scenario() {
        let mut mgr = manager(2);
        candidates(&mut mgr, &[("p1", 10.0), ("p2", 20.0), ("p3", 25.0)]);

        let events = mgr.evaluate(now());
        assert_eq!(
            events,
            vec![
                PeerEvent::Connect("p1".to_string()),
                PeerEvent::Connect("p2".to_string()),
            ]
        );

        // p2 leaves the release band; the freed slot goes to p3 in the same pass
        mgr.update_peer_distance("p2", Some(60.0));
        let events = mgr.evaluate(now());
        assert_eq!(
            events,
            vec![
                PeerEvent::Disconnect("p2".to_string()),
                PeerEvent::Connect("p3".to_string()),
            ]
        );

        // Inside the release band: connected peers stay, nothing new admits
        mgr.update_peer_distance("p3", Some(42.0));
        assert!(mgr.evaluate(now()).is_empty());

        mgr.update_peer_distance("p3", Some(55.0));
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Disconnect("p3".to_string())]
        );

        // Back inside the release band but outside the admit radius: no reconnect
        mgr.update_peer_distance("p3", Some(42.0));
        assert!(mgr.evaluate(now()).is_empty());
    }

    #[tokio::test]
    async fn reentry_requires_admit_radius() {
        let mut mgr = manager(8);
        candidates(&mut mgr, &[("p1", 20.0)]);
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Connect("p1".to_string())]
        );

        mgr.update_peer_distance("p1", Some(44.0));
        assert!(mgr.evaluate(now()).is_empty());

        mgr.update_peer_distance("p1", Some(46.0));
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Disconnect("p1".to_string())]
        );

        mgr.update_peer_distance("p1", Some(44.0));
        assert!(mgr.evaluate(now()).is_empty());

        mgr.update_peer_distance("p1", Some(29.0));
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Connect("p1".to_string())]
        );
    }

    #[tokio::test]
    async fn cap_admits_closest_first() {
        let mut mgr = manager(3);
        let entries: Vec<(String, f64)> = (0..10)
            .map(|i| (format!("p{}", i), 5.0 + i as f64))
            .collect();
        mgr.apply_peer_update(PeerUpdate {
            peers: Some(entries.iter().map(|(id, _)| id.clone()).collect()),
            distances: Some(entries.iter().cloned().collect()),
            ..PeerUpdate::default()
        });

        let events = mgr.evaluate(now());
        assert_eq!(
            events,
            vec![
                PeerEvent::Connect("p0".to_string()),
                PeerEvent::Connect("p1".to_string()),
                PeerEvent::Connect("p2".to_string()),
            ]
        );
        assert_eq!(mgr.connected_peers().len(), 3);
    }

    #[tokio::test]
    async fn removal_frees_a_slot_for_the_next_closest() {
        let mut mgr = manager(2);
        candidates(&mut mgr, &[("p1", 10.0), ("p2", 15.0), ("p3", 20.0)]);
        mgr.evaluate(now());
        assert!(mgr.is_connected("p1") && mgr.is_connected("p2"));

        let events = mgr.remove_peer("p2");
        assert_eq!(events, vec![PeerEvent::Disconnect("p2".to_string())]);

        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Connect("p3".to_string())]
        );
    }

    #[tokio::test]
    async fn candidate_drop_disconnects_on_next_pass() {
        let mut mgr = manager(8);
        candidates(&mut mgr, &[("p1", 10.0)]);
        mgr.evaluate(now());
        assert!(mgr.is_connected("p1"));

        mgr.apply_peer_update(PeerUpdate {
            peers: Some(Vec::new()),
            ..PeerUpdate::default()
        });
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Disconnect("p1".to_string())]
        );
    }

    #[tokio::test]
    async fn deltas_apply_without_absolute_list() {
        let mut mgr = manager(8);
        candidates(&mut mgr, &[("p1", 10.0)]);
        mgr.evaluate(now());

        mgr.apply_peer_update(PeerUpdate {
            added: Some(vec!["p2".to_string()]),
            distances: Some(HashMap::from([("p2".to_string(), 12.0)])),
            ..PeerUpdate::default()
        });
        assert_eq!(mgr.candidate_count(), 2);
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Connect("p2".to_string())]
        );

        mgr.apply_peer_update(PeerUpdate {
            removed: Some(vec!["p1".to_string()]),
            ..PeerUpdate::default()
        });
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Disconnect("p1".to_string())]
        );
    }

    #[tokio::test]
    async fn distances_derive_from_positions_when_local_pose_known() {
        let mut mgr = manager(8);
        mgr.apply_peer_update(PeerUpdate {
            peers: Some(vec!["p1".to_string()]),
            positions: Some(HashMap::from([(
                "p1".to_string(),
                Vec3::new(10.0, 0.0, 0.0),
            )])),
            ..PeerUpdate::default()
        });

        // No local pose yet: derived distance is unreachable
        assert!(mgr.evaluate(now()).is_empty());

        mgr.update_local_position(Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Connect("p1".to_string())]
        );
    }

    #[tokio::test]
    async fn null_distance_marks_peer_unreachable() {
        let mut mgr = manager(8);
        candidates(&mut mgr, &[("p1", 10.0)]);
        mgr.evaluate(now());
        assert!(mgr.is_connected("p1"));

        mgr.update_peer_distance("p1", None);
        assert_eq!(
            mgr.evaluate(now()),
            vec![PeerEvent::Disconnect("p1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn evaluation_is_debounced() {
        let mut mgr = manager(8);
        candidates(&mut mgr, &[("p1", 10.0)]);

        let armed = mgr.next_evaluation().expect("one-shot should be armed");
        assert!(mgr.poll(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(Instant::now() >= armed);
        assert_eq!(
            mgr.poll(Instant::now()),
            vec![PeerEvent::Connect("p1".to_string())]
        );
        assert!(mgr.next_evaluation().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_non_candidate_state_is_pruned() {
        let mut mgr = manager(8);
        candidates(&mut mgr, &[("stays", 10.0)]);
        mgr.update_peer_distance("goes", Some(12.0)); // never a candidate

        tokio::time::advance(Duration::from_secs(61)).await;
        mgr.evaluate(Instant::now());

        assert_eq!(mgr.distance_of("goes"), f64::INFINITY);
        assert!((mgr.distance_of("stays") - 10.0).abs() < 1e-9);
    }
}
