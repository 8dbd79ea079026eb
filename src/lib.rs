pub mod common;
pub mod config;
pub mod domain;
pub mod observability;
pub mod pipeline;
pub mod registry;

// Layered boundaries: ports and their adapters
pub mod app;
pub mod infra;

pub use common::error::{PipelineError, Result};
pub use config::PipelineConfig;
pub use pipeline::PipelineContext;
pub use registry::TableRegistry;
