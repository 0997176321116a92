//! attribution: tracked players ranked by distance to the ball
//!
//! Windowed path ([`AttributionEngine::attribute_window`]):
//!   1. detect on every frame, feed the actor centres of each frame in order
//!      into the engine's [`PlayerTracker`], reset at the start of the window
//!   2. take the ball from the last frame only
//!   3. rank confirmed tracks by squared centre distance to the ball (stable,
//!      ties keep track order)
//!   4. pass → nearest two are passer and receiver; anything else → nearest
//!   5. read the number under each selected track in the last frame,
//!      optionally narrowed to the torso found by the pose model
//!
//! Single-frame path ([`AttributionEngine::attribute_frame`]) is the degraded
//! mode used without a usable window: no tracking, no ranking; the first (and
//! for a pass, second) actor in detection order.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::detection::{actor_boxes, ball_box, Detection, DetectionClass, ObjectDetector};
use crate::events::EventKind;
use crate::geometry::BBox;
use crate::pose::{torso_region, PoseEstimator};
use crate::recognition::{Jersey, JerseyRecognizer};
use crate::tracking::{PlayerTracker, PointDetection, Track, TrackerConfig};
use crate::video::RgbFrame;

/// Track boxes are small squares on the player centre; the pose model gets
/// this much extra room on each side to see a whole body.
const PERSON_MARGIN_X: f32 = 20.0;
const PERSON_MARGIN_Y: f32 = 50.0;

/// Log engine timings every this many detected frames.
const PROFILE_EVERY: u64 = 300;

/// Longest accepted `half_window`, in seconds.
pub const MAX_HALF_WINDOW: f64 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttributionConfig {
    /// Seconds of video on each side of the event timestamp.
    pub half_window: f64,
    pub tracker: TrackerConfig,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            half_window: 1.0,
            tracker: TrackerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionResult {
    /// Single-actor events (shot, tackle, ...).
    Single { player: Jersey },
    /// Passes: passer and receiver.
    Dual { player: Jersey, receiver: Jersey },
}

impl AttributionResult {
    /// Every role unknown, shaped for `kind`.
    pub fn unknown(kind: EventKind) -> Self {
        match kind {
            EventKind::Pass => AttributionResult::Dual {
                player: Jersey::None,
                receiver: Jersey::None,
            },
            EventKind::Other => AttributionResult::Single {
                player: Jersey::None,
            },
        }
    }

    pub fn player(&self) -> &Jersey {
        match self {
            AttributionResult::Single { player } | AttributionResult::Dual { player, .. } => {
                player
            }
        }
    }

    /// `None` for single-actor results.
    pub fn receiver(&self) -> Option<&Jersey> {
        match self {
            AttributionResult::Single { .. } => None,
            AttributionResult::Dual { receiver, .. } => Some(receiver),
        }
    }
}

/// Accumulated stage timings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineTimings {
    pub frames: u64,
    pub detect: Duration,
    pub recognize: Duration,
}

pub struct AttributionEngine {
    detector: Box<dyn ObjectDetector>,
    recognizer: Option<Box<dyn JerseyRecognizer>>,
    pose: Option<Box<dyn PoseEstimator>>,
    tracker: PlayerTracker,
    config: AttributionConfig,
    prof: EngineTimings,
}

impl AttributionEngine {
    pub fn new(
        detector: Box<dyn ObjectDetector>,
        recognizer: Option<Box<dyn JerseyRecognizer>>,
        pose: Option<Box<dyn PoseEstimator>>,
        config: AttributionConfig,
    ) -> Result<Self> {
        let tracker = PlayerTracker::new(config.tracker)?;
        anyhow::ensure!(
            (0.0..=MAX_HALF_WINDOW).contains(&config.half_window),
            "half_window must be between 0 and {MAX_HALF_WINDOW} seconds, got {}",
            config.half_window
        );
        if recognizer.is_none() {
            warn!("no jersey recognizer configured; every player will read as NONE");
        }
        Ok(Self {
            detector,
            recognizer,
            pose,
            tracker,
            config,
            prof: EngineTimings::default(),
        })
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    pub fn timings(&self) -> EngineTimings {
        self.prof
    }

    /// Attribute an event from the frames around it, oldest first.
    pub fn attribute_window(&mut self, frames: &[RgbFrame], kind: EventKind) -> AttributionResult {
        let Some(last) = frames.last() else {
            debug!("empty window");
            return AttributionResult::unknown(kind);
        };

        // Track ids and state never carry over between events.
        self.tracker.reset();

        let mut tracks = Vec::new();
        let mut last_detections = Vec::new();
        for frame in frames {
            let detections = self.detect(frame);
            let actors: Vec<PointDetection> = detections
                .iter()
                .filter(|d| d.class == DetectionClass::Actor)
                .map(|d| PointDetection::from_box(&d.bbox, d.confidence))
                .collect();
            tracks = self.tracker.update(&actors);
            last_detections = detections;
        }

        let Some(ball) = ball_box(&last_detections) else {
            debug!(
                tracks = tracks.len(),
                live = self.tracker.live_count(),
                "no ball in the last frame"
            );
            return AttributionResult::unknown(kind);
        };
        let ranked = rank_by_ball_distance(tracks, &ball);
        debug!(
            ranked = ?ranked.iter().map(|t| t.id).collect::<Vec<_>>(),
            "tracks nearest the ball"
        );

        let mut nearest = ranked.iter().map(|t| person_region(&t.bbox));
        let first = nearest.next();
        let second = nearest.next();
        self.read_roles(last, kind, first, second, true)
    }

    /// Degraded single-frame attribution: no tracking, actors taken in
    /// detection order regardless of where the ball is.
    pub fn attribute_frame(&mut self, frame: &RgbFrame, kind: EventKind) -> AttributionResult {
        let detections = self.detect(frame);
        let actors = actor_boxes(&detections);
        self.read_roles(
            frame,
            kind,
            actors.first().map(|b| (*b, *b)),
            actors.get(1).map(|b| (*b, *b)),
            false,
        )
    }

    /// `first`/`second` are `(recognition box, pose search region)` pairs.
    fn read_roles(
        &mut self,
        frame: &RgbFrame,
        kind: EventKind,
        first: Option<(BBox, BBox)>,
        second: Option<(BBox, BBox)>,
        windowed: bool,
    ) -> AttributionResult {
        let player = first.map_or(Jersey::None, |(b, r)| self.read_jersey(frame, &b, &r));
        let result = match kind {
            EventKind::Pass => {
                let receiver =
                    second.map_or(Jersey::None, |(b, r)| self.read_jersey(frame, &b, &r));
                AttributionResult::Dual { player, receiver }
            }
            EventKind::Other => AttributionResult::Single { player },
        };
        debug!(windowed, ?result, "attribution");
        result
    }

    fn detect(&mut self, frame: &RgbFrame) -> Vec<Detection> {
        let start = Instant::now();
        let detections = match self.detector.detect(frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(pts = frame.pts, "detection failed: {e:#}");
                Vec::new()
            }
        };
        self.prof.detect += start.elapsed();
        self.prof.frames += 1;

        if self.prof.frames % PROFILE_EVERY == 0 {
            info!(
                frames = self.prof.frames,
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof.detect.as_secs_f64() * 1000.0 / self.prof.frames as f64
                ),
                recognize_ms_total = format!("{:.2}", self.prof.recognize.as_secs_f64() * 1000.0),
                "attribution timings"
            );
        }
        detections
    }

    /// Number under `bbox`, narrowed to the torso when a pose model finds one
    /// inside `search`.
    fn read_jersey(&mut self, frame: &RgbFrame, bbox: &BBox, search: &BBox) -> Jersey {
        if self.recognizer.is_none() {
            return Jersey::None;
        }
        let start = Instant::now();
        let region = self.refine_with_pose(frame, search).unwrap_or(*bbox);

        let jersey = match self.recognizer.as_mut() {
            Some(recognizer) => match recognizer.recognize(frame, &region) {
                Ok(j) => j,
                Err(e) => {
                    warn!("jersey recognition failed: {e:#}");
                    Jersey::None
                }
            },
            None => Jersey::None,
        };
        self.prof.recognize += start.elapsed();
        jersey
    }

    fn refine_with_pose(&mut self, frame: &RgbFrame, search: &BBox) -> Option<BBox> {
        let pose = self.pose.as_mut()?;
        match pose.estimate(frame, search) {
            Ok(Some(p)) => {
                let torso = torso_region(&p)?;
                // Only worth it if something of the torso is on screen.
                frame.crop(&torso).map(|_| torso)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("pose estimation failed: {e:#}");
                None
            }
        }
    }
}

/// Stable ascending sort by squared centre distance to `ball`.
fn rank_by_ball_distance(tracks: Vec<Track>, ball: &BBox) -> Vec<Track> {
    let mut scored: Vec<(f32, Track)> = tracks
        .into_iter()
        .map(|t| (t.bbox.center_distance_sq(ball), t))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored.into_iter().map(|(_, t)| t).collect()
}

/// `(track box, body-sized region around it)`.
fn person_region(track_box: &BBox) -> (BBox, BBox) {
    (
        *track_box,
        track_box.expand(PERSON_MARGIN_X, PERSON_MARGIN_Y),
    )
}
