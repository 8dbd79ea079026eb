// Pipeline ingestion: reading raw extracts into batches

pub mod extract_reader;

pub use extract_reader::ExtractRequest;
