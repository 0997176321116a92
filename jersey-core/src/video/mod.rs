//! video: FFmpeg frame source and event-window extraction
//!
//! The extractor only needs sequential reads from an arbitrary start frame, so
//! the FFmpeg details sit behind [`VideoSource`] / [`FrameReader`].  Every
//! extraction opens its own reader and drops it before returning.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, frame, media, software::scaling};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::geometry::BBox;

/// Scaling flags: bilinear is fast and good enough for the decode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// FFmpeg's internal time base (microseconds) used by container-level seeks.
const AV_TIME_BASE: f64 = 1_000_000.0;
/// Frame rate assumed when the container does not report one.
pub const DEFAULT_FRAME_RATE: f64 = 20.0;
/// Upper bound on the up-front allocation for a window; longer windows grow
/// as frames arrive.
const MAX_PREALLOCATED_FRAMES: u64 = 1024;

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// Solid black frame, mostly useful for tests and placeholders.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height * 3) as usize],
            width,
            height,
            pts: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Copy out the region under `bbox`, clipped to the frame.  `None` when the
    /// clipped region has no pixels.
    pub fn crop(&self, bbox: &BBox) -> Option<RgbFrame> {
        if self.is_empty() {
            return None;
        }
        let (x, y, w, h) = bbox.clip_to(self.width, self.height)?;

        let src_stride = (self.width * 3) as usize;
        let dst_stride = (w * 3) as usize;
        let mut data = Vec::with_capacity(dst_stride * h as usize);
        for row in 0..h as usize {
            let start = (y as usize + row) * src_stride + x as usize * 3;
            data.extend_from_slice(&self.data[start..start + dst_stride]);
        }

        Some(RgbFrame {
            data,
            width: w,
            height: h,
            pts: self.pts,
        })
    }
}

// ── Source traits ────────────────────────────────────────────────────────────

/// A sequential reader over decoded frames.
pub trait FrameReader {
    /// Native frame rate of the stream in frames per second.
    fn frame_rate(&self) -> f64;
    /// Position the reader so that the next [`FrameReader::next_frame`] yields
    /// frame `index`.  Only called once, before the first read.
    fn seek_to_frame(&mut self, index: u64) -> Result<()>;
    /// Next decoded frame, `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbFrame>>;
}

/// Something that can hand out fresh [`FrameReader`]s, e.g. a file on disk.
pub trait VideoSource {
    fn open(&self) -> Result<Box<dyn FrameReader + '_>>;
}

// ── Window extraction ────────────────────────────────────────────────────────

/// Frames spanning `center_time ± half_window` seconds at `frame_rate`.
///
/// Reads from `max(0, floor((center - half) * fps))` through
/// `floor((center + half) * fps)` inclusive.  A source that cannot be opened,
/// positioned or read yields whatever was decoded so far (possibly nothing).
pub fn extract_window(
    source: &dyn VideoSource,
    center_time: f64,
    half_window: f64,
    frame_rate: f64,
) -> Vec<RgbFrame> {
    let start = ((center_time - half_window) * frame_rate).floor().max(0.0);
    let end = ((center_time + half_window) * frame_rate).floor();
    if end.is_nan() || end < start {
        return Vec::new();
    }
    // Float-to-int casts saturate, so an enormous span ends at u64::MAX.
    let (start, end) = (start as u64, end as u64);

    let mut reader = match source.open() {
        Ok(reader) => reader,
        Err(e) => {
            warn!("could not open video source: {e:#}");
            return Vec::new();
        }
    };

    if let Err(e) = reader.seek_to_frame(start) {
        warn!(start, "could not position video source: {e:#}");
        return Vec::new();
    }

    let span = end.saturating_sub(start).saturating_add(1);
    let mut frames = Vec::with_capacity(span.min(MAX_PREALLOCATED_FRAMES) as usize);
    for _ in start..=end {
        match reader.next_frame() {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => break,
            Err(e) => {
                warn!(read = frames.len(), "frame read failed: {e:#}");
                break;
            }
        }
    }

    debug!(start, end, frames = frames.len(), "extracted event window");
    frames
}

/// The single frame at `floor(timestamp * fps)`, or `None` when unavailable.
/// A source without a usable rate is read at [`DEFAULT_FRAME_RATE`].
pub fn frame_at_timestamp(source: &dyn VideoSource, timestamp: f64) -> Option<RgbFrame> {
    let mut reader = match source.open() {
        Ok(reader) => reader,
        Err(e) => {
            warn!("could not open video source: {e:#}");
            return None;
        }
    };

    let index = (timestamp * usable_rate(reader.frame_rate())).floor().max(0.0) as u64;
    let frame = reader
        .seek_to_frame(index)
        .and_then(|_| reader.next_frame());
    match frame {
        Ok(Some(frame)) => Some(frame),
        Ok(None) => {
            warn!(timestamp, index, "no frame at timestamp");
            None
        }
        Err(e) => {
            warn!(timestamp, index, "could not read frame: {e:#}");
            None
        }
    }
}

/// Frame rate of `source`, falling back to [`DEFAULT_FRAME_RATE`].
pub fn probe_frame_rate(source: &dyn VideoSource) -> f64 {
    match source.open() {
        Ok(reader) => {
            let fps = usable_rate(reader.frame_rate());
            if fps != reader.frame_rate() {
                warn!("video reports no frame rate; assuming {DEFAULT_FRAME_RATE}");
            }
            fps
        }
        Err(e) => {
            warn!("could not probe frame rate ({e:#}); assuming {DEFAULT_FRAME_RATE}");
            DEFAULT_FRAME_RATE
        }
    }
}

fn usable_rate(fps: f64) -> f64 {
    if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        DEFAULT_FRAME_RATE
    }
}

// ── FFmpeg backend ───────────────────────────────────────────────────────────

/// A video file decoded with FFmpeg.
pub struct FfmpegVideo {
    path: PathBuf,
}

impl FfmpegVideo {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl VideoSource for FfmpegVideo {
    fn open(&self) -> Result<Box<dyn FrameReader + '_>> {
        Ok(Box::new(FfmpegReader::open(&self.path)?))
    }
}

/// Decoder state for one pass over a file.  Dropping it closes the input.
pub struct FfmpegReader {
    ictx: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    /// Seconds per pts unit.
    time_base: f64,
    /// Stream start time in pts units; frame 0 carries this timestamp.
    start_pts: i64,
    fps: f64,
    width: u32,
    height: u32,
    /// Frames with a smaller index are decoded and discarded.
    skip_until: u64,
    /// Index assigned to the next frame when it carries no timestamp.
    next_index: u64,
    eof: bool,
    decoded: frame::Video,
    rgb: frame::Video,
}

impl FfmpegReader {
    pub fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let ictx = format::input(&path)
            .with_context(|| format!("could not open input file {}", path.display()))?;

        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();

        let tb = stream.time_base();
        let time_base = if tb.denominator() != 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            0.0
        };

        let start_pts = match stream.start_time() {
            ffmpeg::ffi::AV_NOPTS_VALUE => 0,
            start => start,
        };

        let rate = if stream.avg_frame_rate().numerator() > 0 {
            stream.avg_frame_rate()
        } else {
            stream.rate()
        };
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();

        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            width,
            height,
            fps,
            path = %path.display(),
            "opened input video stream"
        );

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            time_base,
            start_pts,
            fps,
            width,
            height,
            skip_until: 0,
            next_index: 0,
            eof: false,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
        })
    }

    fn frame_index(&self, pts: Option<i64>) -> u64 {
        match pts {
            Some(pts) if self.time_base > 0.0 && self.fps > 0.0 => {
                pts_to_index(pts, self.start_pts, self.time_base, self.fps)
            }
            _ => self.next_index,
        }
    }

    /// Convert the frame sitting in `self.decoded` to packed RGB24.
    fn convert_decoded(&mut self, pts: i64) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let row_len = self.width as usize * 3;
        let mut data = Vec::with_capacity(row_len * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        Ok(RgbFrame {
            data,
            width: self.width,
            height: self.height,
            pts,
        })
    }
}

impl FrameReader for FfmpegReader {
    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn seek_to_frame(&mut self, index: u64) -> Result<()> {
        self.skip_until = index;
        if index == 0 || self.fps <= 0.0 {
            return Ok(());
        }

        // Land on the keyframe at or before the target; frames up to the target
        // are decoded and dropped in `next_frame`.
        let start_secs = self.start_pts as f64 * self.time_base;
        let ts = seek_timestamp(index, self.fps, start_secs);
        self.ictx
            .seek(ts, ..ts)
            .with_context(|| format!("seek to frame {index} failed"))?;
        self.decoder.flush();
        self.next_index = index;
        self.eof = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            while self.decoder.receive_frame(&mut self.decoded).is_ok() {
                let pts = self.decoded.timestamp().or(self.decoded.pts());
                let index = self.frame_index(pts);
                self.next_index = index + 1;
                if index < self.skip_until {
                    continue;
                }
                let frame = self.convert_decoded(pts.unwrap_or(index as i64))?;
                return Ok(Some(frame));
            }

            if self.eof {
                return Ok(None);
            }

            let next = self
                .ictx
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("decoder send_packet")?;
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof().ok();
                    self.eof = true;
                }
            }
        }
    }
}

/// Frame index of a timestamp, counted from the stream's first frame.
fn pts_to_index(pts: i64, start_pts: i64, time_base: f64, fps: f64) -> u64 {
    (pts.saturating_sub(start_pts) as f64 * time_base * fps)
        .round()
        .max(0.0) as u64
}

/// Container seek target (in [`AV_TIME_BASE`] units) for frame `index` of a
/// stream that starts `start_secs` into the file.
fn seek_timestamp(index: u64, fps: f64, start_secs: f64) -> i64 {
    ((index as f64 / fps + start_secs) * AV_TIME_BASE).round() as i64
}

// ── In-memory source for tests ───────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod memory {
    use super::*;

    /// Pre-decoded frames served like a video file.
    pub struct MemoryVideo {
        pub frames: Vec<RgbFrame>,
        pub fps: f64,
        pub openable: bool,
    }

    impl MemoryVideo {
        pub fn new(frames: Vec<RgbFrame>, fps: f64) -> Self {
            Self {
                frames,
                fps,
                openable: true,
            }
        }

        pub fn unopenable() -> Self {
            Self {
                frames: Vec::new(),
                fps: 20.0,
                openable: false,
            }
        }
    }

    struct MemoryReader<'a> {
        frames: &'a [RgbFrame],
        fps: f64,
        pos: usize,
    }

    impl FrameReader for MemoryReader<'_> {
        fn frame_rate(&self) -> f64 {
            self.fps
        }

        fn seek_to_frame(&mut self, index: u64) -> Result<()> {
            anyhow::ensure!(index as usize >= self.pos, "backward seek");
            self.pos = index as usize;
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
            let frame = self.frames.get(self.pos).cloned();
            self.pos += 1;
            Ok(frame)
        }
    }

    impl VideoSource for MemoryVideo {
        fn open(&self) -> Result<Box<dyn FrameReader + '_>> {
            anyhow::ensure!(self.openable, "cannot open in-memory video");
            Ok(Box::new(MemoryReader {
                frames: &self.frames,
                fps: self.fps,
                pos: 0,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryVideo;
    use super::*;

    fn numbered(count: usize) -> MemoryVideo {
        let frames = (0..count)
            .map(|i| {
                let mut f = RgbFrame::blank(4, 4);
                f.pts = i as i64;
                f
            })
            .collect();
        MemoryVideo::new(frames, 20.0)
    }

    fn pts(frames: &[RgbFrame]) -> Vec<i64> {
        frames.iter().map(|f| f.pts).collect()
    }

    #[test]
    fn window_spans_both_sides_inclusive() {
        let video = numbered(200);
        let frames = extract_window(&video, 5.0, 1.0, 20.0);
        assert_eq!(frames.len(), 41);
        assert_eq!(frames.first().map(|f| f.pts), Some(80));
        assert_eq!(frames.last().map(|f| f.pts), Some(120));
    }

    #[test]
    fn window_start_is_clamped_to_zero() {
        let video = numbered(200);
        let frames = extract_window(&video, 0.5, 1.0, 20.0);
        assert_eq!(pts(&frames), (0..=30).collect::<Vec<_>>());
    }

    #[test]
    fn window_truncates_at_end_of_stream() {
        let video = numbered(100);
        let frames = extract_window(&video, 4.75, 1.0, 20.0);
        // start = 75, end = 115 but the stream stops at 99.
        assert_eq!(pts(&frames), (75..100).collect::<Vec<_>>());
    }

    #[test]
    fn window_past_end_is_empty() {
        let video = numbered(10);
        assert!(extract_window(&video, 30.0, 1.0, 20.0).is_empty());
    }

    #[test]
    fn oversized_window_reads_what_the_stream_has() {
        let video = numbered(50);
        let frames = extract_window(&video, 5.0, 1e300, 20.0);
        assert_eq!(pts(&frames), (0..50).collect::<Vec<_>>());
        assert_eq!(extract_window(&video, 5.0, 1e7, 20.0).len(), 50);
    }

    #[test]
    fn nan_window_is_empty() {
        let video = numbered(50);
        assert!(extract_window(&video, f64::NAN, 1.0, 20.0).is_empty());
    }

    #[test]
    fn unopenable_source_yields_empty_window() {
        let video = MemoryVideo::unopenable();
        assert!(extract_window(&video, 5.0, 1.0, 20.0).is_empty());
        assert!(frame_at_timestamp(&video, 5.0).is_none());
        assert_eq!(probe_frame_rate(&video), DEFAULT_FRAME_RATE);
    }

    #[test]
    fn single_frame_uses_source_rate() {
        let mut video = numbered(100);
        video.fps = 10.0;
        let frame = frame_at_timestamp(&video, 2.55).map(|f| f.pts);
        assert_eq!(frame, Some(25));
    }

    #[test]
    fn single_frame_without_rate_assumes_default() {
        let mut video = numbered(100);
        video.fps = 0.0;
        assert_eq!(frame_at_timestamp(&video, 1.0).map(|f| f.pts), Some(20));
        assert_eq!(probe_frame_rate(&video), DEFAULT_FRAME_RATE);
    }

    #[test]
    fn frame_index_counts_from_stream_start() {
        // 1/12800 time base, 25 fps, stream starting at 1.4 s.
        let tb = 1.0 / 12_800.0;
        let start = 17_920;
        assert_eq!(pts_to_index(start, start, tb, 25.0), 0);
        assert_eq!(pts_to_index(start + 512, start, tb, 25.0), 1);
        assert_eq!(pts_to_index(start + 80 * 512, start, tb, 25.0), 80);
        assert_eq!(pts_to_index(0, 0, tb, 25.0), 0);
    }

    #[test]
    fn seek_target_includes_stream_start() {
        assert_eq!(seek_timestamp(80, 25.0, 0.0), 3_200_000);
        assert_eq!(seek_timestamp(80, 25.0, 1.4), 4_600_000);
    }

    #[test]
    fn crop_clips_to_frame() {
        let mut frame = RgbFrame::blank(10, 10);
        // Mark pixel (9, 9).
        let idx = (9 * 10 + 9) * 3;
        frame.data[idx] = 255;

        let crop = frame
            .crop(&BBox::new(7.0, 7.0, 20.0, 20.0))
            .expect("non-empty crop");
        assert_eq!((crop.width, crop.height), (3, 3));
        assert_eq!(crop.data.len(), 27);
        assert_eq!(crop.data[(2 * 3 + 2) * 3], 255);

        assert!(frame.crop(&BBox::new(12.0, 0.0, 20.0, 5.0)).is_none());
        assert!(RgbFrame::blank(0, 0).crop(&BBox::new(0.0, 0.0, 1.0, 1.0)).is_none());
    }
}
