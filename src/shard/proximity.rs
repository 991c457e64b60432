//! Audibility neighborhood computation for one cell

use std::collections::HashMap;

use crate::geo::Vec3;

/// Audibility radius in world units
pub const PROXIMITY_RADIUS_METERS: f64 = 45.0;

/// Distance delta below which an unchanged peer set emits no frame
pub const DISTANCE_CHANGE_EPSILON: f64 = 0.5;

/// One peer as seen by one observer in a single recomputation pass
#[derive(Debug, Clone, Copy)]
pub struct PeerSnapshot {
    pub distance: f64,
    pub position: Vec3,
}

/// Compute the observer's next peer view: every other positioned player
/// within the audibility radius, with distance and last-known position.
/// The observer itself never appears in its own view.
pub fn neighborhood(
    observer: &str,
    origin: Vec3,
    positioned: &[(String, Vec3)],
) -> HashMap<String, PeerSnapshot> {
    let mut next = HashMap::new();
    for (id, pos) in positioned {
        if id == observer {
            continue;
        }
        let distance = origin.distance_to(*pos);
        if distance <= PROXIMITY_RADIUS_METERS {
            next.insert(
                id.clone(),
                PeerSnapshot {
                    distance,
                    position: *pos,
                },
            );
        }
    }
    next
}

/// Diff of one observer's next view against the previously emitted one
#[derive(Debug, Clone, Default)]
pub struct ViewDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub distance_changed: bool,
}

impl ViewDiff {
    /// Nothing entered, nothing left, and no retained peer moved more than
    /// the epsilon: the frame is suppressed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.distance_changed
    }
}

/// Diff `next` against the distances last sent to this observer.
/// `added` and `removed` come out sorted for stable emission order.
pub fn diff_views(previous: &HashMap<String, f64>, next: &HashMap<String, PeerSnapshot>) -> ViewDiff {
    let mut added: Vec<String> = next
        .keys()
        .filter(|id| !previous.contains_key(*id))
        .cloned()
        .collect();
    let mut removed: Vec<String> = previous
        .keys()
        .filter(|id| !next.contains_key(*id))
        .cloned()
        .collect();
    added.sort();
    removed.sort();

    let distance_changed = next.iter().any(|(id, snap)| {
        previous
            .get(id)
            .is_some_and(|prev| (snap.distance - prev).abs() > DISTANCE_CHANGE_EPSILON)
    });

    ViewDiff {
        added,
        removed,
        distance_changed,
    }
}
