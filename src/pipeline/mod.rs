// Data quality pipeline: ingestion, processing, storage and the two stage drivers

pub mod context;
pub mod curated_to_prod;
pub mod events;
pub mod ingestion;
pub mod outcome;
pub mod processing;
pub mod raw_to_curated;
pub mod retry;
pub mod storage;

pub use context::PipelineContext;
pub use outcome::{BatchCounts, PipelineOutcome, PipelineStatus, ProdOutcome};
