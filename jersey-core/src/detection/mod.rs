//! detection: YOLOv8 player and ball detection
//!
//! Load yolov8n.onnx, run inference on a 640×640 resize of the frame and keep
//! only the two COCO classes the attribution cares about: "person" (players)
//! and "sports ball".

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::geometry::BBox;
use crate::runtime::{build_session, planar_unit_tensor, Device};
use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// YOLOv8 input size (square).
const YOLO_SIZE: u32 = 640;
/// COCO class index for "person".
pub const PERSON_CLASS: usize = 0;
/// COCO class index for "sports ball".
pub const BALL_CLASS: usize = 32;
/// Confidence threshold, matching the upstream predictor default.
const CONF_THRESHOLD: f32 = 0.25;
/// IoU threshold for NMS.
const IOU_THRESHOLD: f32 = 0.45;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionClass {
    /// A player (COCO "person").
    Actor,
    Ball,
}

impl DetectionClass {
    pub fn from_coco(class: usize) -> Option<Self> {
        match class {
            PERSON_CLASS => Some(Self::Actor),
            BALL_CLASS => Some(Self::Ball),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class: DetectionClass,
}

/// Frame in, detections out.  Implementations keep only actors and balls and
/// return them in model order.
pub trait ObjectDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>>;
}

/// Boxes of all actors, in detection order.
pub fn actor_boxes(detections: &[Detection]) -> Vec<BBox> {
    detections
        .iter()
        .filter(|d| d.class == DetectionClass::Actor)
        .map(|d| d.bbox)
        .collect()
}

/// Box of the first detected ball, if any.
pub fn ball_box(detections: &[Detection]) -> Option<BBox> {
    detections
        .iter()
        .find(|d| d.class == DetectionClass::Ball)
        .map(|d| d.bbox)
}

// ── Detector ─────────────────────────────────────────────────────────────────

/// Wraps the YOLOv8 ONNX session.
pub struct YoloDetector {
    session: Session,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl YoloDetector {
    /// Load a YOLOv8 ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
        let session = build_session(
            model_path.as_ref(),
            device,
            "failed to load YOLOv8 ONNX model",
        )?;
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (YOLO_SIZE * YOLO_SIZE * 3) as usize],
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            YOLO_SIZE,
            YOLO_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize YOLO downscale failed")?;

        self.resize_buf = dst.into_vec();
        let tensor_data = planar_unit_tensor(&self.resize_buf, (YOLO_SIZE * YOLO_SIZE) as usize);

        let shape = [1usize, 3, YOLO_SIZE as usize, YOLO_SIZE as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

impl ObjectDetector for YoloDetector {
    /// Run inference on `frame` and return actor/ball boxes (in original frame
    /// pixel coordinates) after per-class NMS, most confident first.
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("YOLOv8 inference failed")?;

        // YOLOv8 output: [1, 4 + classes, proposals]
        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLOv8 output tensor")?;
        anyhow::ensure!(
            shape.len() == 3 && shape[1] > 4,
            "unexpected YOLOv8 output shape {shape:?}"
        );
        let num_classes = shape[1] as usize - 4;
        let num_proposals = shape[2] as usize;

        let layout = OutputLayout {
            num_classes,
            num_proposals,
            scale_x: frame.width as f32 / YOLO_SIZE as f32,
            scale_y: frame.height as f32 / YOLO_SIZE as f32,
            frame_width: frame.width as f32,
            frame_height: frame.height as f32,
        };
        let detections = nms(decode_predictions(data, &layout), IOU_THRESHOLD);

        debug!(count = detections.len(), "frame detections");
        Ok(detections)
    }
}

// ── Pre/post-processing helpers ──────────────────────────────────────────────

struct OutputLayout {
    num_classes: usize,
    num_proposals: usize,
    scale_x: f32,
    scale_y: f32,
    frame_width: f32,
    frame_height: f32,
}

/// Turn the raw YOLOv8 output into candidate detections of interest.
fn decode_predictions(data: &[f32], layout: &OutputLayout) -> Vec<Detection> {
    let n = layout.num_proposals;

    (0..n)
        .into_par_iter()
        .filter_map(|i| {
            // Data layout: [cx, cy, w, h, cls0_score, cls1_score, ...]
            // Stored column-major across the rows.
            let cx = data[i];
            let cy = data[n + i];
            let w = data[2 * n + i];
            let h = data[3 * n + i];

            let mut best_class = 0usize;
            let mut best_score = f32::MIN;
            for c in 0..layout.num_classes {
                let s = data[(4 + c) * n + i];
                if s > best_score {
                    best_score = s;
                    best_class = c;
                }
            }

            if best_score < CONF_THRESHOLD {
                return None;
            }
            let class = DetectionClass::from_coco(best_class)?;

            // Convert YOLO (cx,cy,w,h) in 640-space → (x1,y1,x2,y2) in original frame
            let x1 = (cx - w / 2.0) * layout.scale_x;
            let y1 = (cy - h / 2.0) * layout.scale_y;
            let x2 = (cx + w / 2.0) * layout.scale_x;
            let y2 = (cy + h / 2.0) * layout.scale_y;

            Some(Detection {
                bbox: BBox::new(
                    x1.max(0.0),
                    y1.max(0.0),
                    x2.min(layout.frame_width),
                    y2.min(layout.frame_height),
                ),
                confidence: best_score,
                class,
            })
        })
        .collect()
}

// ── Non-Maximum Suppression ──────────────────────────────────────────────────

/// Greedy per-class NMS: sort by confidence descending, suppress overlapping
/// boxes of the same class.
fn nms(mut dets: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; dets.len()];

    for i in 0..dets.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(dets[i]);
        for j in (i + 1)..dets.len() {
            if dets[i].class == dets[j].class && dets[i].bbox.iou(&dets[j].bbox) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }

    kept
}
