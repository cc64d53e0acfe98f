pub mod config;
pub mod encoder;
pub mod inference;
pub mod pipeline;
pub mod records;
pub mod render;
pub mod store;
pub mod tracker;
pub mod video;

pub use config::PipelineConfig;
pub use pipeline::{run_pipeline, PipelineContext, Progress};
pub use records::PipelineRun;
