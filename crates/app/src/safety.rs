//! Correlation of tracked people against the active zones.
//!
//! Owns the only piece of cross-cycle state in the correlation path: the
//! last known line side per track identity. The geometry itself stays in the
//! zone registry; this module reads one snapshot per cycle so a concurrent
//! reconfiguration is observed either fully before or fully after the cycle.

use std::collections::{HashMap, HashSet};

use detect_core::{Detection, TrackedPerson};
use serde::Serialize;
use tracing::debug;

use crate::{
    geometry::{line_side, polygon_contains, Side},
    zones::{Direction, ZoneRegistry},
};

/// Minimum intersection-over-PPE-box-area for a PPE detection to count as
/// worn by the person it overlaps.
pub const PPE_OVERLAP_THRESHOLD: f32 = 0.3;

/// Identities unseen for this many cycles are forgotten, so churning tracks
/// cannot grow the side map without bound.
pub const SIDE_STATE_EVICT_CYCLES: u64 = 900;

const HELMET_CLASS: &str = "helmet";
const VEST_CLASS: &str = "safety_vest";

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyEvent {
    LineCrossing {
        track_id: i64,
        direction: Direction,
        in_count: u64,
        out_count: u64,
        position: (f32, f32),
        timestamp_ms: i64,
    },
    Violation {
        track_id: i64,
        missing: Vec<&'static str>,
        position: (f32, f32),
        timestamp_ms: i64,
    },
}

struct SideRecord {
    side: Side,
    last_seen: u64,
}

pub struct SafetyMonitor {
    sides: HashMap<i64, SideRecord>,
    zone_version: u64,
    evict_after: u64,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self::with_eviction(SIDE_STATE_EVICT_CYCLES)
    }

    pub fn with_eviction(evict_after: u64) -> Self {
        Self {
            sides: HashMap::new(),
            zone_version: 0,
            evict_after,
        }
    }

    /// Forget all side state. Called when tracking is toggled so recycled
    /// identities cannot inherit a stale side.
    pub fn reset(&mut self) {
        self.sides.clear();
    }

    /// Evaluate one cycle's tracked people against the current zones,
    /// emitting crossing and PPE-violation events and advancing the
    /// registry's counters.
    pub fn evaluate(
        &mut self,
        cycle: u64,
        timestamp_ms: i64,
        people: &[TrackedPerson],
        ppe: &[Detection],
        zones: &ZoneRegistry,
    ) -> Vec<SafetyEvent> {
        let snapshot = zones.snapshot();
        if snapshot.version != self.zone_version {
            // Sides recorded against the old geometry are meaningless; a
            // fresh map avoids phantom crossings right after reconfiguration.
            self.sides.clear();
            self.zone_version = snapshot.version;
        }

        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for person in people {
            // One crossing and one violation at most per identity per cycle.
            if !seen.insert(person.track_id) {
                continue;
            }

            let side = line_side(person.centroid, snapshot.line.start, snapshot.line.end);
            let previous = self.sides.get(&person.track_id).map(|record| record.side);

            let direction = match (previous, side) {
                (Some(Side::Left), Side::Right) => Some(Direction::In),
                (Some(Side::Right), Side::Left) => Some(Direction::Out),
                _ => None,
            };
            if let Some(direction) = direction {
                let (in_count, out_count) = zones.record_crossing(direction);
                debug!(
                    "Track {} crossed {:?} (in={}, out={})",
                    person.track_id, direction, in_count, out_count
                );
                metrics::counter!("sitewatch_safety_events_total", "kind" => "crossing")
                    .increment(1);
                events.push(SafetyEvent::LineCrossing {
                    track_id: person.track_id,
                    direction,
                    in_count,
                    out_count,
                    position: person.centroid,
                    timestamp_ms,
                });
            }

            // A tie keeps the previous side so Left -> On -> Right still
            // counts once, when Right is reached.
            let stored = match side {
                Side::On => previous.unwrap_or(Side::On),
                other => other,
            };
            self.sides.insert(
                person.track_id,
                SideRecord {
                    side: stored,
                    last_seen: cycle,
                },
            );

            if polygon_contains(person.centroid, &snapshot.polygon) {
                if let Some(missing) = missing_equipment(person, ppe) {
                    metrics::counter!("sitewatch_safety_events_total", "kind" => "violation")
                        .increment(1);
                    events.push(SafetyEvent::Violation {
                        track_id: person.track_id,
                        missing,
                        position: person.centroid,
                        timestamp_ms,
                    });
                }
            }
        }

        let evict_after = self.evict_after;
        self.sides
            .retain(|_, record| cycle.saturating_sub(record.last_seen) <= evict_after);

        events
    }
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// PPE check for one person: every overlapping helmet/vest box above the
/// overlap threshold satisfies that item; anything left over is missing.
fn missing_equipment(person: &TrackedPerson, ppe: &[Detection]) -> Option<Vec<&'static str>> {
    let person_box = &person.detection.bbox;
    let mut helmet = false;
    let mut vest = false;

    for item in ppe {
        let area = item.bbox.area();
        if area <= 0.0 {
            continue;
        }
        let ratio = person_box.intersection_area(&item.bbox) / area;
        if ratio > PPE_OVERLAP_THRESHOLD {
            match item.class.as_str() {
                HELMET_CLASS => helmet = true,
                VEST_CLASS => vest = true,
                _ => {}
            }
        }
    }

    let mut missing = Vec::new();
    if !helmet {
        missing.push("helmet");
    }
    if !vest {
        missing.push("vest");
    }
    if missing.is_empty() {
        None
    } else {
        Some(missing)
    }
}

#[cfg(test)]
mod tests {
    use detect_core::BoundingBox;

    use super::*;

    fn person_at(track_id: i64, cx: f32, cy: f32) -> TrackedPerson {
        TrackedPerson::new(
            Detection {
                class: "person".into(),
                confidence: 0.9,
                bbox: BoundingBox::new(cx - 40.0, cy - 90.0, cx + 40.0, cy + 90.0),
            },
            track_id,
        )
    }

    fn ppe(class: &str, bbox: BoundingBox) -> Detection {
        Detection {
            class: class.into(),
            confidence: 0.8,
            bbox,
        }
    }

    /// Registry with the default (0,250)-(800,250) line and a polygon
    /// covering the whole test frame so containment never interferes with
    /// crossing tests.
    fn registry_with_wide_polygon() -> ZoneRegistry {
        let registry = ZoneRegistry::new(true);
        registry
            .reconfigure_polygon(vec![
                (-1000.0, -1000.0),
                (2000.0, -1000.0),
                (2000.0, 2000.0),
                (-1000.0, 2000.0),
            ])
            .unwrap();
        registry
    }

    #[test]
    fn side_flip_emits_exactly_one_crossing_and_bumps_in_count() {
        let registry = ZoneRegistry::new(true);
        let mut monitor = SafetyMonitor::new();

        // Left of the directed line in cycle k (below, in image space),
        // right of it in cycle k+1.
        let below = monitor.evaluate(1, 100, &[person_at(7, 400.0, 400.0)], &[], &registry);
        assert!(!below
            .iter()
            .any(|event| matches!(event, SafetyEvent::LineCrossing { .. })));

        let events = monitor.evaluate(2, 133, &[person_at(7, 400.0, 100.0)], &[], &registry);
        let crossings: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, SafetyEvent::LineCrossing { .. }))
            .collect();
        assert_eq!(crossings.len(), 1);
        match crossings[0] {
            SafetyEvent::LineCrossing {
                track_id,
                direction,
                in_count,
                ..
            } => {
                assert_eq!(*track_id, 7);
                assert_eq!(*direction, Direction::In);
                assert_eq!(*in_count, 1);
            }
            _ => unreachable!(),
        }
        assert_eq!(registry.snapshot().line.in_count, 1);
        assert_eq!(registry.snapshot().line.out_count, 0);

        // Staying on the same side emits nothing further.
        let again = monitor.evaluate(3, 166, &[person_at(7, 380.0, 90.0)], &[], &registry);
        assert!(!again
            .iter()
            .any(|event| matches!(event, SafetyEvent::LineCrossing { .. })));
    }

    #[test]
    fn tie_on_the_line_is_not_a_transition() {
        let registry = registry_with_wide_polygon();
        let mut monitor = SafetyMonitor::new();

        monitor.evaluate(1, 0, &[person_at(3, 400.0, 100.0)], &[], &registry);
        // Exactly on the line: no event, previous side retained.
        let on = monitor.evaluate(2, 33, &[person_at(3, 400.0, 250.0)], &[], &registry);
        assert!(!on
            .iter()
            .any(|event| matches!(event, SafetyEvent::LineCrossing { .. })));

        // Completing the crossing still counts once.
        let events = monitor.evaluate(3, 66, &[person_at(3, 400.0, 400.0)], &[], &registry);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, SafetyEvent::LineCrossing { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn full_ppe_inside_polygon_produces_no_violation() {
        let registry = ZoneRegistry::new(true);
        let mut monitor = SafetyMonitor::new();
        let person = person_at(1, 400.0, 300.0);

        let helmet = ppe("helmet", BoundingBox::new(380.0, 210.0, 420.0, 240.0));
        let vest = ppe("safety_vest", BoundingBox::new(370.0, 280.0, 430.0, 350.0));

        let events = monitor.evaluate(1, 0, &[person.clone()], &[helmet.clone(), vest], &registry);
        assert!(events.is_empty());

        // Dropping the vest yields exactly one violation naming it.
        let events = monitor.evaluate(2, 33, &[person], &[helmet], &registry);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SafetyEvent::Violation {
                track_id, missing, ..
            } => {
                assert_eq!(*track_id, 1);
                assert_eq!(missing, &vec!["vest"]);
            }
            other => panic!("expected a violation, got {other:?}"),
        }
    }

    #[test]
    fn person_outside_polygon_never_violates() {
        let registry = ZoneRegistry::new(true);
        let mut monitor = SafetyMonitor::new();
        // Far outside the default polygon, no PPE at all.
        let events = monitor.evaluate(1, 0, &[person_at(9, 700.0, 100.0)], &[], &registry);
        assert!(events.is_empty());
    }

    #[test]
    fn non_overlapping_ppe_does_not_satisfy_the_rule() {
        let registry = ZoneRegistry::new(true);
        let mut monitor = SafetyMonitor::new();
        let person = person_at(2, 400.0, 300.0);
        // Helmet on the other side of the frame.
        let helmet = ppe("helmet", BoundingBox::new(10.0, 10.0, 50.0, 40.0));
        let vest = ppe("safety_vest", BoundingBox::new(370.0, 280.0, 430.0, 350.0));

        let events = monitor.evaluate(1, 0, &[person], &[helmet, vest], &registry);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SafetyEvent::Violation { missing, .. } => assert_eq!(missing, &vec!["helmet"]),
            other => panic!("expected a violation, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_identities_in_one_cycle_emit_at_most_one_crossing() {
        let registry = registry_with_wide_polygon();
        let mut monitor = SafetyMonitor::new();

        monitor.evaluate(1, 0, &[person_at(5, 400.0, 100.0)], &[], &registry);
        let doubled = vec![person_at(5, 400.0, 400.0), person_at(5, 410.0, 420.0)];
        let events = monitor.evaluate(2, 33, &doubled, &[], &registry);
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, SafetyEvent::LineCrossing { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn zone_reconfiguration_clears_side_state() {
        let registry = registry_with_wide_polygon();
        let mut monitor = SafetyMonitor::new();

        monitor.evaluate(1, 0, &[person_at(4, 400.0, 100.0)], &[], &registry);
        registry
            .reconfigure_line((0.0, 300.0), (800.0, 300.0))
            .unwrap();

        // First observation against the new line must not count a crossing,
        // even though the recorded side would have flipped.
        let events = monitor.evaluate(2, 33, &[person_at(4, 400.0, 400.0)], &[], &registry);
        assert!(!events
            .iter()
            .any(|event| matches!(event, SafetyEvent::LineCrossing { .. })));
    }

    #[test]
    fn stale_identities_are_evicted() {
        let registry = registry_with_wide_polygon();
        let mut monitor = SafetyMonitor::with_eviction(5);

        monitor.evaluate(1, 0, &[person_at(8, 400.0, 100.0)], &[], &registry);
        // Cycles pass without track 8.
        for cycle in 2..10 {
            monitor.evaluate(cycle, 0, &[], &[], &registry);
        }

        // Track 8 reappears on the other side; its old side was evicted so
        // this is a first observation, not a crossing.
        let events = monitor.evaluate(10, 0, &[person_at(8, 400.0, 400.0)], &[], &registry);
        assert!(!events
            .iter()
            .any(|event| matches!(event, SafetyEvent::LineCrossing { .. })));
    }
}
