//! recognition: jersey-number reading with a PARSeq text recognizer
//!
//! The crop under a player box is resized to the recognizer's 128×32 input,
//! decoded greedily into text and reduced to its digits.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::geometry::BBox;
use crate::runtime::{build_session, nchw_input, Device};
use crate::video::RgbFrame;

const INPUT_WIDTH: u32 = 128;
const INPUT_HEIGHT: u32 = 32;

/// PARSeq output alphabet.  Logit index 0 is end-of-sequence, index `i + 1`
/// is `CHARSET[i]`.
const CHARSET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// A jersey number, or the absence of a readable one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Jersey {
    Number(String),
    #[default]
    None,
}

impl Jersey {
    /// Keep only the ASCII digits of `text`; nothing left means no number.
    pub fn from_text(text: &str) -> Self {
        let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            Jersey::None
        } else {
            Jersey::Number(digits)
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Jersey::None)
    }
}

impl fmt::Display for Jersey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Jersey::Number(n) => f.write_str(n),
            Jersey::None => f.write_str("NONE"),
        }
    }
}

/// Reads the number printed inside `bbox` of `frame`.  An empty crop is not
/// an error; it reads as [`Jersey::None`].
pub trait JerseyRecognizer {
    fn recognize(&mut self, frame: &RgbFrame, bbox: &BBox) -> Result<Jersey>;
}

pub struct ParseqRecognizer {
    session: Session,
    resizer: fr::Resizer,
}

impl ParseqRecognizer {
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device) -> Result<Self> {
        let session = build_session(
            model_path.as_ref(),
            device,
            "failed to load PARSeq ONNX model",
        )?;
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
        })
    }
}

impl JerseyRecognizer for ParseqRecognizer {
    fn recognize(&mut self, frame: &RgbFrame, bbox: &BBox) -> Result<Jersey> {
        let Some(crop) = frame.crop(bbox) else {
            return Ok(Jersey::None);
        };

        let input = nchw_input(
            &mut self.resizer,
            &crop.data,
            crop.width,
            crop.height,
            INPUT_WIDTH,
            INPUT_HEIGHT,
        )?;

        let input_name = self.session.inputs[0].name.clone();
        let outputs = self
            .session
            .run(ort::inputs![input_name.as_str() => input])
            .context("PARSeq inference failed")?;

        // Logits: [1, T, C]
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("failed to extract PARSeq output tensor")?;
        anyhow::ensure!(
            shape.len() == 3 && shape[2] > 0,
            "unexpected PARSeq output shape {shape:?}"
        );
        let steps = shape[1] as usize;
        let classes = shape[2] as usize;

        let text = greedy_decode(data, steps, classes);
        debug!(%text, "jersey text");
        Ok(Jersey::from_text(&text))
    }
}

/// Arg-max per step until end-of-sequence.
fn greedy_decode(logits: &[f32], steps: usize, classes: usize) -> String {
    let charset: Vec<char> = CHARSET.chars().collect();
    let mut text = String::new();
    for step in logits.chunks_exact(classes).take(steps) {
        let best = step
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        if best == 0 {
            break;
        }
        if let Some(&c) = charset.get(best - 1) {
            text.push(c);
        }
    }
    text
}
