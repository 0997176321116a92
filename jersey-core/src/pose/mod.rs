//! pose: ViTPose keypoints and the torso region derived from them
//!
//! Keypoints follow the 17-joint COCO order.  Only shoulders and hips are used
//! downstream, to narrow a player crop to the shirt area before reading the
//! number.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use std::path::Path;
use tracing::debug;

use crate::geometry::BBox;
use crate::runtime::{build_session, nchw_input, Device};
use crate::video::RgbFrame;

const INPUT_SIZE: u32 = 256;

pub const LEFT_SHOULDER: usize = 5;
pub const RIGHT_SHOULDER: usize = 6;
pub const LEFT_HIP: usize = 11;
pub const RIGHT_HIP: usize = 12;

/// Pixels added on every side of the torso rectangle.
const TORSO_PADDING: f32 = 10.0;

/// Keypoints in frame coordinates plus one confidence score per joint.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    pub keypoints: Vec<(f32, f32)>,
    pub scores: Vec<f32>,
}

pub trait PoseEstimator {
    /// Keypoints for the player inside `bbox`; `None` when the crop is empty.
    fn estimate(&mut self, frame: &RgbFrame, bbox: &BBox) -> Result<Option<Pose>>;
}

/// Shirt rectangle: horizontally spanning shoulders and hips, vertically from
/// the higher shoulder to the lower hip, padded and truncated to whole
/// pixels.  `None` when the pose lacks any of the four joints.
pub fn torso_region(pose: &Pose) -> Option<BBox> {
    let kp = |i: usize| pose.keypoints.get(i).copied();
    let ls = kp(LEFT_SHOULDER)?;
    let rs = kp(RIGHT_SHOULDER)?;
    let lh = kp(LEFT_HIP)?;
    let rh = kp(RIGHT_HIP)?;

    let x1 = ls.0.min(rs.0).min(lh.0).min(rh.0);
    let x2 = ls.0.max(rs.0).max(lh.0).max(rh.0);
    let y1 = ls.1.min(rs.1);
    let y2 = lh.1.max(rh.1);

    Some(BBox::new(
        (x1 - TORSO_PADDING).max(0.0).trunc(),
        (y1 - TORSO_PADDING).max(0.0).trunc(),
        (x2 + TORSO_PADDING).trunc(),
        (y2 + TORSO_PADDING).trunc(),
    ))
}

pub struct VitPoseEstimator {
    session: Session,
    resizer: fr::Resizer,
}

impl VitPoseEstimator {
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
        let session = build_session(
            model_path.as_ref(),
            device,
            "failed to load ViTPose ONNX model",
        )?;
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
        })
    }
}

impl PoseEstimator for VitPoseEstimator {
    fn estimate(&mut self, frame: &RgbFrame, bbox: &BBox) -> Result<Option<Pose>> {
        let Some((x, y, w, h)) = bbox.clip_to(frame.width, frame.height) else {
            return Ok(None);
        };
        let Some(crop) = frame.crop(bbox) else {
            return Ok(None);
        };

        let input = nchw_input(
            &mut self.resizer,
            &crop.data,
            crop.width,
            crop.height,
            INPUT_SIZE,
            INPUT_SIZE,
        )?;

        let input_name = self.session.inputs[0].name.clone();
        let outputs = self
            .session
            .run(ort::inputs![input_name.as_str() => input])
            .context("ViTPose inference failed")?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("failed to extract ViTPose output tensor")?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

        let raw = decode_output(&dims, data)?;
        let region = CropRegion {
            x: x as f32,
            y: y as f32,
            width: w as f32,
            height: h as f32,
        };
        let pose = region.project(raw);
        debug!(joints = pose.keypoints.len(), "pose estimated");
        Ok(Some(pose))
    }
}

/// Keypoints normalised to the crop, `(u, v)` in [0, 1].
struct RawPose {
    points: Vec<(f32, f32)>,
    scores: Vec<f32>,
}

/// Accept either heatmaps `[1, K, H, W]` or direct keypoints `[1, K, 3]` in
/// model-input pixels.
fn decode_output(dims: &[usize], data: &[f32]) -> Result<RawPose> {
    match dims {
        [1, k, h, w] => {
            let (k, h, w) = (*k, *h, *w);
            anyhow::ensure!(h > 0 && w > 0, "empty ViTPose heatmap");
            let mut points = Vec::with_capacity(k);
            let mut scores = Vec::with_capacity(k);
            for map in data.chunks_exact(h * w).take(k) {
                let (idx, peak) = map
                    .iter()
                    .copied()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .unwrap_or((0, 0.0));
                let (row, col) = (idx / w, idx % w);
                points.push(((col as f32 + 0.5) / w as f32, (row as f32 + 0.5) / h as f32));
                scores.push(peak);
            }
            Ok(RawPose { points, scores })
        }
        [1, k, 3] => {
            let size = INPUT_SIZE as f32;
            let (points, scores) = data
                .chunks_exact(3)
                .take(*k)
                .map(|p| ((p[0] / size, p[1] / size), p[2]))
                .unzip();
            Ok(RawPose { points, scores })
        }
        other => anyhow::bail!("unexpected ViTPose output shape {other:?}"),
    }
}

struct CropRegion {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

impl CropRegion {
    fn project(&self, raw: RawPose) -> Pose {
        Pose {
            keypoints: raw
                .points
                .into_iter()
                .map(|(u, v)| (self.x + u * self.width, self.y + v * self.height))
                .collect(),
            scores: raw.scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_with(points: &[(usize, (f32, f32))]) -> Pose {
        let mut keypoints = vec![(0.0, 0.0); 17];
        for &(i, p) in points {
            keypoints[i] = p;
        }
        Pose {
            keypoints,
            scores: vec![1.0; 17],
        }
    }

    #[test]
    fn torso_spans_shoulders_to_hips_with_padding() {
        let pose = pose_with(&[
            (LEFT_SHOULDER, (120.0, 50.0)),
            (RIGHT_SHOULDER, (100.0, 52.0)),
            (LEFT_HIP, (118.0, 110.0)),
            (RIGHT_HIP, (104.5, 112.7)),
        ]);
        assert_eq!(torso_region(&pose), Some(BBox::new(90.0, 40.0, 130.0, 122.0)));
    }

    #[test]
    fn torso_is_clamped_at_frame_origin() {
        let pose = pose_with(&[
            (LEFT_SHOULDER, (5.0, 3.0)),
            (RIGHT_SHOULDER, (25.0, 4.0)),
            (LEFT_HIP, (6.0, 40.0)),
            (RIGHT_HIP, (24.0, 41.0)),
        ]);
        let torso = torso_region(&pose).unwrap();
        assert_eq!((torso.x1, torso.y1), (0.0, 0.0));
    }

    #[test]
    fn short_pose_has_no_torso() {
        let pose = Pose {
            keypoints: vec![(0.0, 0.0); 7],
            scores: vec![1.0; 7],
        };
        assert_eq!(torso_region(&pose), None);
    }

    #[test]
    fn heatmap_peaks_map_into_the_crop() {
        // Two joints on a 4×4 heatmap.
        let mut data = vec![0f32; 2 * 16];
        data[4 + 2] = 0.8; // joint 0 at row 1, col 2
        data[16 + 3 * 4] = 0.6; // joint 1 at row 3, col 0
        let raw = decode_output(&[1, 2, 4, 4], &data).unwrap();
        let region = CropRegion {
            x: 100.0,
            y: 200.0,
            width: 40.0,
            height: 80.0,
        };
        let pose = region.project(raw);
        assert_eq!(pose.keypoints[0], (125.0, 230.0));
        assert_eq!(pose.keypoints[1], (105.0, 270.0));
        assert_eq!(pose.scores, vec![0.8, 0.6]);
    }

    #[test]
    fn direct_keypoints_are_scaled_from_input_size() {
        let data = [128.0, 64.0, 0.9];
        let raw = decode_output(&[1, 1, 3], &data).unwrap();
        let region = CropRegion {
            x: 10.0,
            y: 20.0,
            width: 50.0,
            height: 100.0,
        };
        let pose = region.project(raw);
        assert_eq!(pose.keypoints, vec![(35.0, 45.0)]);
        assert_eq!(pose.scores, vec![0.9]);
    }

    #[test]
    fn unknown_output_shape_is_an_error() {
        assert!(decode_output(&[1, 17], &[0.0; 17]).is_err());
    }
}
