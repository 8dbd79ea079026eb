//! Shared error types and constants

pub mod constants;
pub mod error;
