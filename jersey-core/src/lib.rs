pub mod attribution;
pub mod detection;
pub mod events;
pub mod geometry;
pub mod pipeline;
pub mod pose;
pub mod recognition;
pub mod runtime;
pub mod tracking;
pub mod video;

// Re-export the top-level error type so callers only need `jersey_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
