//! pipeline: model loading and the batch event loop
//!
//! Events are handled strictly one after another: extract the window (or the
//! single frame), attribute, format the output row.  Latency covers frame
//! extraction plus attribution for that one event.

use anyhow::Result;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::attribution::{AttributionConfig, AttributionEngine, AttributionResult};
use crate::detection::{ObjectDetector, YoloDetector};
use crate::events::{EventRecord, SubmissionRow};
use crate::pose::{PoseEstimator, VitPoseEstimator};
use crate::recognition::{Jersey, JerseyRecognizer, ParseqRecognizer};
use crate::runtime::Device;
use crate::video::{extract_window, frame_at_timestamp, probe_frame_rate, VideoSource};

/// Where the ONNX models live and which device runs them.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: Option<PathBuf>,
    pub pose: Option<PathBuf>,
    pub device: Device,
}

/// The model services, built once per process.
pub struct Models {
    pub detector: Box<dyn ObjectDetector>,
    pub recognizer: Option<Box<dyn JerseyRecognizer>>,
    pub pose: Option<Box<dyn PoseEstimator>>,
}

impl Models {
    /// The detector is required.  The recognizer and pose models are
    /// optional; one that fails to load is reported and left out.
    pub fn load(paths: &ModelPaths) -> Result<Self> {
        let detector = YoloDetector::load(&paths.detector, paths.device)?;
        info!(path = %paths.detector.display(), device = %paths.device, "detector loaded");

        let recognizer = paths.recognizer.as_ref().and_then(|path| {
            match ParseqRecognizer::load(path, paths.device) {
                Ok(r) => {
                    info!(path = %path.display(), "jersey recognizer loaded");
                    Some(Box::new(r) as Box<dyn JerseyRecognizer>)
                }
                Err(e) => {
                    warn!(path = %path.display(), "jersey recognizer unavailable: {e:#}");
                    None
                }
            }
        });

        let pose = paths.pose.as_ref().and_then(|path| {
            match VitPoseEstimator::load(path, paths.device) {
                Ok(p) => {
                    info!(path = %path.display(), "pose model loaded");
                    Some(Box::new(p) as Box<dyn PoseEstimator>)
                }
                Err(e) => {
                    warn!(path = %path.display(), "pose model unavailable: {e:#}");
                    None
                }
            }
        });

        Ok(Self {
            detector: Box::new(detector),
            recognizer,
            pose,
        })
    }

    pub fn into_engine(self, config: AttributionConfig) -> Result<AttributionEngine> {
        AttributionEngine::new(self.detector, self.recognizer, self.pose, config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Track over `timestamp ± half_window`.
    #[default]
    Window,
    /// Degraded: one frame, no tracking.
    SingleFrame,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub attributed: usize,
    pub total_latency: Duration,
    pub max_latency: Duration,
}

impl RunSummary {
    pub fn mean_latency(&self) -> Duration {
        if self.processed == 0 {
            Duration::ZERO
        } else {
            self.total_latency / self.processed as u32
        }
    }
}

pub struct EventProcessor<'a> {
    engine: AttributionEngine,
    source: &'a dyn VideoSource,
    frame_rate: f64,
    mode: Mode,
    summary: RunSummary,
}

impl<'a> EventProcessor<'a> {
    pub fn new(engine: AttributionEngine, source: &'a dyn VideoSource, mode: Mode) -> Self {
        let frame_rate = probe_frame_rate(source);
        info!(frame_rate, ?mode, "event processor ready");
        Self {
            engine,
            source,
            frame_rate,
            mode,
            summary: RunSummary::default(),
        }
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    /// Attribute one event and format its output row.
    pub fn process(&mut self, record: &EventRecord) -> SubmissionRow {
        let kind = record.kind();
        let start = Instant::now();
        let result = match self.mode {
            Mode::Window => {
                let frames = extract_window(
                    self.source,
                    record.timestamp,
                    self.engine.config().half_window,
                    self.frame_rate,
                );
                self.engine.attribute_window(&frames, kind)
            }
            Mode::SingleFrame => match frame_at_timestamp(self.source, record.timestamp) {
                Some(frame) => self.engine.attribute_frame(&frame, kind),
                None => AttributionResult::unknown(kind),
            },
        };
        let latency = start.elapsed();

        self.summary.processed += 1;
        if !result.player().is_none() {
            self.summary.attributed += 1;
        }
        self.summary.total_latency += latency;
        self.summary.max_latency = self.summary.max_latency.max(latency);

        let receiver = result.receiver().cloned().unwrap_or(Jersey::None);
        info!(
            timestamp = record.timestamp,
            event = %record.event,
            player = %result.player(),
            receiver = %receiver,
            latency_ms = format!("{:.1}", latency.as_secs_f64() * 1000.0),
            "event attributed"
        );
        SubmissionRow::new(record, result.player(), &receiver, latency.as_secs_f64())
    }

    /// Every event in order; `on_done` is called after each one.
    pub fn process_all<F: FnMut(&SubmissionRow)>(
        &mut self,
        events: &[EventRecord],
        mut on_done: F,
    ) -> Vec<SubmissionRow> {
        events
            .iter()
            .map(|record| {
                let row = self.process(record);
                on_done(&row);
                row
            })
            .collect()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Log run totals and engine stage timings.
    pub fn log_summary(&self) {
        let timings = self.engine.timings();
        info!(
            events = self.summary.processed,
            attributed = self.summary.attributed,
            mean_latency_ms = format!("{:.1}", self.summary.mean_latency().as_secs_f64() * 1000.0),
            max_latency_ms = format!("{:.1}", self.summary.max_latency.as_secs_f64() * 1000.0),
            frames = timings.frames,
            detect_ms = format!("{:.1}", timings.detect.as_secs_f64() * 1000.0),
            recognize_ms = format!("{:.1}", timings.recognize.as_secs_f64() * 1000.0),
            "run summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detection, DetectionClass};
    use crate::events::read_events_from;
    use crate::geometry::BBox;
    use crate::video::memory::MemoryVideo;
    use crate::video::RgbFrame;

    const FPS: f64 = 10.0;

    /// Same detections on every frame.
    struct StaticDetector(Vec<Detection>);

    impl ObjectDetector for StaticDetector {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    /// Reads "7" left of x = 160 and "10" right of it.
    struct SplitRecognizer;

    impl JerseyRecognizer for SplitRecognizer {
        fn recognize(&mut self, _frame: &RgbFrame, bbox: &BBox) -> Result<Jersey> {
            let n = if bbox.center_x() < 160.0 { "7" } else { "10" };
            Ok(Jersey::Number(n.into()))
        }
    }

    fn det(bbox: BBox, class: DetectionClass) -> Detection {
        Detection {
            bbox,
            confidence: 0.8,
            class,
        }
    }

    fn video(seconds: u32) -> MemoryVideo {
        let frames = (0..(seconds as i64 * FPS as i64))
            .map(|pts| RgbFrame {
                pts,
                ..RgbFrame::blank(320, 240)
            })
            .collect();
        MemoryVideo::new(frames, FPS)
    }

    fn processor<'a>(
        source: &'a MemoryVideo,
        detections: Vec<Detection>,
        recognizer: Option<Box<dyn JerseyRecognizer>>,
        mode: Mode,
    ) -> EventProcessor<'a> {
        let engine = AttributionEngine::new(
            Box::new(StaticDetector(detections)),
            recognizer,
            None,
            AttributionConfig::default(),
        )
        .unwrap();
        EventProcessor::new(engine, source, mode)
    }

    #[test]
    fn shot_row_end_to_end() {
        let source = video(8);
        let detections = vec![
            det(BBox::new(100.0, 80.0, 140.0, 180.0), DetectionClass::Actor),
            det(BBox::new(115.0, 160.0, 125.0, 170.0), DetectionClass::Ball),
        ];
        let mut processor = processor(&source, detections, Some(Box::new(SplitRecognizer)), Mode::Window);

        let log = read_events_from("timestamp,event\n00:00:05,Shot\n".as_bytes()).unwrap();
        let rows = processor.process_all(&log.events, |_| {});

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.timestamp, "00:00:05");
        assert_eq!(row.event, "Shot");
        assert_eq!(row.player, "7");
        assert_eq!(row.receiver, "NONE");
        assert!(row.latency.parse::<f64>().unwrap() >= 0.0);
        assert_eq!(processor.summary().processed, 1);
        assert_eq!(processor.summary().attributed, 1);
    }

    #[test]
    fn pass_row_end_to_end() {
        let source = video(8);
        let detections = vec![
            det(BBox::new(100.0, 80.0, 140.0, 180.0), DetectionClass::Actor),
            det(BBox::new(200.0, 80.0, 240.0, 180.0), DetectionClass::Actor),
            det(BBox::new(140.0, 160.0, 150.0, 170.0), DetectionClass::Ball),
        ];
        let mut processor = processor(&source, detections, Some(Box::new(SplitRecognizer)), Mode::Window);

        let record = EventRecord {
            timestamp: 3.0,
            event: "Pass".into(),
        };
        let row = processor.process(&record);
        assert_eq!(row.player, "7");
        assert_eq!(row.receiver, "10");
        assert_eq!(row.timestamp, "00:00:03");
    }

    #[test]
    fn unreadable_video_gives_none_rows() {
        let source = MemoryVideo::unopenable();
        let detections = vec![det(BBox::new(0.0, 0.0, 10.0, 10.0), DetectionClass::Actor)];
        let mut processor = processor(&source, detections, Some(Box::new(SplitRecognizer)), Mode::Window);

        let record = EventRecord {
            timestamp: 1.0,
            event: "pass".into(),
        };
        let row = processor.process(&record);
        assert_eq!((row.player.as_str(), row.receiver.as_str()), ("NONE", "NONE"));
        assert_eq!(processor.summary().attributed, 0);
    }

    #[test]
    fn single_frame_mode_skips_tracking() {
        let source = video(4);
        // Far actor listed first; the fallback does not look at the ball.
        let detections = vec![
            det(BBox::new(200.0, 80.0, 240.0, 180.0), DetectionClass::Actor),
            det(BBox::new(100.0, 80.0, 140.0, 180.0), DetectionClass::Actor),
            det(BBox::new(115.0, 160.0, 125.0, 170.0), DetectionClass::Ball),
        ];
        let mut processor = processor(
            &source,
            detections,
            Some(Box::new(SplitRecognizer)),
            Mode::SingleFrame,
        );
        let record = EventRecord {
            timestamp: 2.0,
            event: "Shot".into(),
        };
        assert_eq!(processor.process(&record).player, "10");
    }

    #[test]
    fn frame_rate_comes_from_the_source() {
        let source = video(1);
        let processor = processor(&source, Vec::new(), None, Mode::Window);
        assert_eq!(processor.frame_rate(), FPS);
    }

    #[test]
    fn progress_callback_sees_every_row() {
        let source = video(2);
        let mut processor = processor(&source, Vec::new(), None, Mode::Window);
        let events = vec![
            EventRecord {
                timestamp: 0.5,
                event: "Shot".into(),
            },
            EventRecord {
                timestamp: 1.5,
                event: "Pass".into(),
            },
        ];
        let mut seen = Vec::new();
        let rows = processor.process_all(&events, |row| seen.push(row.timestamp.clone()));
        assert_eq!(rows.len(), 2);
        assert_eq!(seen, vec!["00:00:00.5", "00:00:01.5"]);
        assert_eq!(processor.summary().processed, 2);
        assert!(processor.summary().mean_latency() <= processor.summary().max_latency);
    }
}
