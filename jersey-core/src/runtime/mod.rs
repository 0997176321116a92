use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use rayon::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Compute device an ONNX session should prefer.  Unavailable providers fall
/// back to the CPU at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    CoreMl,
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            "coreml" => Ok(Device::CoreMl),
            other => anyhow::bail!("unknown device '{other}' (expected cpu, cuda or coreml)"),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::CoreMl => "coreml",
        })
    }
}

/// Build a single-threaded ORT session for `model_path` on `device`.
pub fn build_session(model_path: &Path, device: Device, load_error: &'static str) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;

    builder = match device {
        Device::Cpu => builder,
        Device::Cuda => builder
            .with_execution_providers([ep::CUDAExecutionProvider::default().build()])
            .context("failed to register CUDA execution provider")?,
        Device::CoreMl => builder
            .with_execution_providers([ep::CoreMLExecutionProvider::default()
                .with_compute_units(ep::coreml::CoreMLComputeUnits::CPUAndNeuralEngine)
                .build()])
            .context("failed to register CoreML execution provider")?,
    };

    tracing::debug!(path = %model_path.display(), %device, "loading ONNX model");
    builder.commit_from_file(model_path).context(load_error)
}

/// Packed RGB bytes → planar NCHW floats scaled to [0, 1].
pub(crate) fn planar_unit_tensor(raw: &[u8], size: usize) -> Vec<f32> {
    let mut tensor_data = vec![0f32; 3 * size];
    tensor_data
        .par_chunks_mut(size)
        .enumerate()
        .for_each(|(channel, plane)| {
            for (idx, out) in plane.iter_mut().enumerate() {
                *out = raw[idx * 3 + channel] as f32 / 255.0;
            }
        });
    tensor_data
}

/// Resize a packed RGB24 image to `width × height` (bilinear).
pub(crate) fn resize_rgb(
    resizer: &mut fr::Resizer,
    data: &[u8],
    src_width: u32,
    src_height: u32,
    width: u32,
    height: u32,
) -> Result<Vec<u8>> {
    let src = fr::images::ImageRef::new(src_width, src_height, data, fr::PixelType::U8x3)
        .context("failed to create fast_image_resize source")?;
    let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);
    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .context("fast_image_resize failed")?;
    Ok(dst.into_vec())
}

/// `[1, 3, height, width]` input tensor from a packed RGB24 crop.
pub(crate) fn nchw_input(
    resizer: &mut fr::Resizer,
    data: &[u8],
    src_width: u32,
    src_height: u32,
    width: u32,
    height: u32,
) -> Result<DynValue> {
    let resized = resize_rgb(resizer, data, src_width, src_height, width, height)?;
    let tensor_data = planar_unit_tensor(&resized, (width * height) as usize);
    let shape = [1usize, 3, height as usize, width as usize];
    Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
        .context("failed to create input tensor")?
        .into_dyn())
}

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/libonnxruntime.{so,dylib} near current exe/cwd
/// 3) system library directories (last-resort fallback)
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    for candidate in ort_candidates() {
        if candidate.is_file() {
            // SAFETY: called once from main before any ORT session exists and
            // before other threads are spawned.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
            return;
        }
    }

    tracing::warn!("could not locate the ONNX Runtime shared library; set ORT_DYLIB_PATH");
}

#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

fn ort_candidates() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..4 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB_NAME));
        candidates.push(root.join("models").join(ORT_LIB_NAME));
    }

    candidates.push(PathBuf::from("/usr/local/lib").join(ORT_LIB_NAME));
    candidates.push(PathBuf::from("/opt/homebrew/lib").join(ORT_LIB_NAME));
    candidates
}
