// Pipeline processing: validation, dedup, masking, scoring and transformation

pub mod anomaly;
pub mod business_rules;
pub mod dedup;
pub mod masking;
pub mod quality_gate;
pub mod schema_validator;
pub mod transform;
