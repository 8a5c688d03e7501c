//! Application layer: the render pipeline, its queue worker and metrics.

pub mod error;
pub mod jobs;
pub mod metrics;
pub mod render;
pub mod repos;
