//! tracking: point tracker giving players stable identities across a window
//!
//! Each track follows the centre of a player box with a 2D constant-velocity
//! Kalman filter.  Association is greedy nearest-neighbour on Euclidean
//! distance with a hard gate; lifetimes follow a hit counter that rises by one
//! per matched frame (capped) and falls by one per missed frame.
//!
//! State vector: [cx, cy, vx, vy]ᵀ  (position + velocity in pixels/frame)
//! Measurement:  [cx, cy]ᵀ

use anyhow::Result;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};
use tracing::debug;

use crate::geometry::BBox;

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Process noise: how much we trust the motion model.
const PROCESS_NOISE: f32 = 4.0;
/// Measurement noise: how much we trust the detector.
const MEASUREMENT_NOISE: f32 = 16.0;
/// Side of the square box synthesised around a track centre.
pub const TRACK_BOX_SIZE: f32 = 20.0;

// ── Kalman filter ─────────────────────────────────────────────────────────────

/// A minimal 2D constant-velocity Kalman filter.
#[derive(Debug, Clone)]
struct Kalman2D {
    /// State: [cx, cy, vx, vy]
    x: Vector4<f32>,
    /// State covariance
    p: Matrix4<f32>,
    /// State transition matrix (F)
    f: Matrix4<f32>,
    /// Measurement matrix (H): extracts [cx, cy] from state
    h: Matrix2x4<f32>,
    /// Process noise covariance (Q)
    q: Matrix4<f32>,
    /// Measurement noise covariance (R)
    r: Matrix2<f32>,
}

impl Kalman2D {
    fn new(cx: f32, cy: f32) -> Self {
        let x = Vector4::new(cx, cy, 0.0, 0.0);
        let p = Matrix4::identity() * 100.0;

        // x_{k+1} = F * x_k
        let f = Matrix4::new(
            1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
        );

        let h = Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0);

        let q = Matrix4::identity() * PROCESS_NOISE;
        let r = Matrix2::identity() * MEASUREMENT_NOISE;

        Self { x, p, f, h, q, r }
    }

    /// Predict step: advance state one frame.
    fn predict(&mut self) {
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    /// Update step: incorporate a new measurement [cx, cy].
    fn update(&mut self, cx: f32, cy: f32) {
        let z = Vector2::new(cx, cy);
        let y = z - self.h * self.x; // innovation
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix4x2<f32> = self.p * self.h.transpose() * s_inv;
        self.x += k * y;
        self.p = (Matrix4::identity() - k * self.h) * self.p;
    }

    fn cx(&self) -> f32 {
        self.x[0]
    }
    fn cy(&self) -> f32 {
        self.x[1]
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Largest centre distance (pixels) at which a detection may join a track.
    pub distance_threshold: f32,
    /// Cap on the hit counter, i.e. how many consecutive missed frames a
    /// well-established track survives.
    pub hit_counter_max: i32,
    /// Matched frames (including the one that spawned it) before a track is
    /// confirmed and given an id.
    pub initialization_delay: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 30.0,
            hit_counter_max: 30,
            initialization_delay: 1,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.distance_threshold > 0.0,
            "distance_threshold must be positive"
        );
        anyhow::ensure!(
            self.initialization_delay >= 1,
            "initialization_delay must be at least 1"
        );
        anyhow::ensure!(
            self.initialization_delay as i64 <= self.hit_counter_max as i64,
            "initialization_delay must not exceed hit_counter_max"
        );
        Ok(())
    }
}

// ── Tracks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Seen, but not yet for `initialization_delay` frames.  Not emitted.
    Pending,
    /// Emitted with a stable id.
    Confirmed,
    /// Hit counter ran out; removed at the end of the update.
    Lost,
}

/// A confirmed track as seen by downstream consumers.  The box is a fixed
/// square around the filtered centre, not a tight player box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Track {
    pub id: u32,
    pub bbox: BBox,
    /// Confidence of the last detection associated with the track.
    pub confidence: f32,
}

#[derive(Debug, Clone)]
struct TrackedPoint {
    /// 0 until confirmed.
    id: u32,
    state: TrackState,
    filter: Kalman2D,
    hit_counter: i32,
    hits: u32,
    confidence: f32,
}

impl TrackedPoint {
    fn center(&self) -> (f32, f32) {
        (self.filter.cx(), self.filter.cy())
    }

    fn distance_to(&self, (x, y): (f32, f32)) -> f32 {
        let (cx, cy) = self.center();
        ((cx - x).powi(2) + (cy - y).powi(2)).sqrt()
    }
}

/// A detection fed to the tracker: a point plus its detector confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointDetection {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl PointDetection {
    pub fn from_box(bbox: &BBox, confidence: f32) -> Self {
        Self {
            x: bbox.center_x(),
            y: bbox.center_y(),
            confidence,
        }
    }
}

// ── PlayerTracker ─────────────────────────────────────────────────────────────

/// Multi-player point tracker.  Ids are unique only within one instance.
pub struct PlayerTracker {
    config: TrackerConfig,
    tracks: Vec<TrackedPoint>,
    next_id: u32,
    frame_index: u64,
}

impl PlayerTracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
            frame_index: 0,
        })
    }

    /// Advance one frame with this frame's detections and return the
    /// confirmed tracks, in creation order.
    pub fn update(&mut self, detections: &[PointDetection]) -> Vec<Track> {
        self.frame_index += 1;

        // Age everything; a track that runs out of hits is lost.
        for t in &mut self.tracks {
            t.hit_counter -= 1;
            t.filter.predict();
            if t.hit_counter < 0 {
                t.state = TrackState::Lost;
            }
        }
        let before = self.tracks.len();
        self.tracks.retain(|t| t.state != TrackState::Lost);
        if self.tracks.len() < before {
            debug!(
                frame = self.frame_index,
                dropped = before - self.tracks.len(),
                "tracks expired"
            );
        }

        let mut unmatched: Vec<usize> = (0..detections.len()).collect();
        for state in [TrackState::Confirmed, TrackState::Pending] {
            let candidates: Vec<usize> = (0..self.tracks.len())
                .filter(|&i| self.tracks[i].state == state)
                .collect();
            let pairs = self.associate(&candidates, detections, &unmatched);
            for (track_idx, det_idx) in pairs {
                self.hit(track_idx, &detections[det_idx]);
                unmatched.retain(|&d| d != det_idx);
            }
        }

        for det_idx in unmatched {
            self.spawn(&detections[det_idx]);
        }

        self.tracks()
    }

    /// Confirmed tracks without advancing the frame.
    fn tracks(&self) -> Vec<Track> {
        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| {
                let (cx, cy) = t.center();
                Track {
                    id: t.id,
                    bbox: BBox::around(cx, cy, TRACK_BOX_SIZE),
                    confidence: t.confidence,
                }
            })
            .collect()
    }

    /// Number of live tracks, pending included.
    pub fn live_count(&self) -> usize {
        self.tracks.len()
    }

    /// Forget every track and restart ids.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
        self.frame_index = 0;
    }

    /// Greedy nearest-neighbour: repeatedly take the globally closest
    /// (track, detection) pair within the gate.
    fn associate(
        &self,
        candidates: &[usize],
        detections: &[PointDetection],
        available: &[usize],
    ) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        let mut distances: Vec<(f32, usize, usize)> = Vec::new();
        for &ti in candidates {
            for &di in available {
                let d = &detections[di];
                let dist = self.tracks[ti].distance_to((d.x, d.y));
                if dist <= self.config.distance_threshold {
                    distances.push((dist, ti, di));
                }
            }
        }
        // Stable sort keeps (track, detection) order on ties.
        distances.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_tracks = Vec::new();
        let mut used_dets = Vec::new();
        for (_, ti, di) in distances {
            if used_tracks.contains(&ti) || used_dets.contains(&di) {
                continue;
            }
            used_tracks.push(ti);
            used_dets.push(di);
            pairs.push((ti, di));
        }
        pairs
    }

    fn hit(&mut self, idx: usize, det: &PointDetection) {
        let max = self.config.hit_counter_max;
        let delay = self.config.initialization_delay;
        let t = &mut self.tracks[idx];
        t.hit_counter = (t.hit_counter + 2).min(max);
        t.hits += 1;
        t.confidence = det.confidence;
        t.filter.update(det.x, det.y);
        if t.state == TrackState::Pending && t.hits >= delay {
            t.state = TrackState::Confirmed;
            t.id = self.next_id;
            self.next_id += 1;
            debug!(id = t.id, frame = self.frame_index, "track confirmed");
        }
    }

    fn spawn(&mut self, det: &PointDetection) {
        let mut t = TrackedPoint {
            id: 0,
            state: TrackState::Pending,
            filter: Kalman2D::new(det.x, det.y),
            hit_counter: 1,
            hits: 1,
            confidence: det.confidence,
        };
        if t.hits >= self.config.initialization_delay {
            t.state = TrackState::Confirmed;
            t.id = self.next_id;
            self.next_id += 1;
        }
        debug!(
            id = t.id,
            x = det.x,
            y = det.y,
            frame = self.frame_index,
            "track spawned"
        );
        self.tracks.push(t);
    }
}
