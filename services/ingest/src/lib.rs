pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod timeline;

pub use pipeline::{IngestHandler, IngestPipeline};
