//! Core services.

mod pipeline;

pub use pipeline::{Pipeline, PipelineConfig};
