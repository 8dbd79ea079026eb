// Adapters for the ports in `app::ports`

pub mod catalog;
pub mod event_log;
pub mod local_store;
pub mod memory_store;
