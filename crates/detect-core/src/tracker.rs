//! Greedy IoU association tracker.
//!
//! Matches the current cycle's person boxes against remembered tracks by
//! intersection-over-union, highest overlap first. Unmatched boxes open new
//! tracks; tracks unseen for `max_misses` consecutive updates are retired and
//! their identity is never handed out again.

use anyhow::Result;

use crate::{BoundingBox, Detection, TrackedPerson, Tracker};

const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_MISSES: u32 = 30;

struct Track {
    id: i64,
    bbox: BoundingBox,
    misses: u32,
}

pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: i64,
    iou_threshold: f32,
    max_misses: u32,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_MISSES)
    }
}

impl IouTracker {
    pub fn new(iou_threshold: f32, max_misses: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold,
            max_misses,
        }
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: Vec<Detection>) -> Result<Vec<TrackedPerson>> {
        // Score every (track, detection) pair above the threshold, then
        // commit greedily from the best score down.
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (track_idx, track) in self.tracks.iter().enumerate() {
            for (det_idx, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((iou, track_idx, det_idx));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut track_for_det: Vec<Option<usize>> = vec![None; detections.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, track_idx, det_idx) in pairs {
            if track_taken[track_idx] || track_for_det[det_idx].is_some() {
                continue;
            }
            track_taken[track_idx] = true;
            track_for_det[det_idx] = Some(track_idx);
        }

        let mut output = Vec::with_capacity(detections.len());
        for (det_idx, detection) in detections.into_iter().enumerate() {
            let id = match track_for_det[det_idx] {
                Some(track_idx) => {
                    let track = &mut self.tracks[track_idx];
                    track.bbox = detection.bbox;
                    track.misses = 0;
                    track.id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        bbox: detection.bbox,
                        misses: 0,
                    });
                    track_taken.push(true);
                    id
                }
            };
            output.push(TrackedPerson::new(detection, id));
        }

        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if !track_taken.get(idx).copied().unwrap_or(false) {
                track.misses += 1;
            }
        }
        let max_misses = self.max_misses;
        self.tracks.retain(|track| track.misses <= max_misses);

        Ok(output)
    }

    fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }
}
