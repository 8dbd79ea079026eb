/// Table names with built-in bundles in the registry
pub const CUSTOMERS: &str = "customers";
pub const ORDERS: &str = "orders";
pub const ORDER_ITEMS: &str = "order_items";
pub const PRODUCTS: &str = "products";
pub const INVENTORY: &str = "inventory";
pub const PAYMENTS: &str = "payments";

/// CDC timestamp column written by the replication task
pub const CDC_TIMESTAMP_COLUMN: &str = "dms_timestamp";

/// Storage layer prefixes
pub const CURATED_PREFIX: &str = "curated";
pub const PROD_PREFIX: &str = "prod";
pub const QUARANTINE_PREFIX: &str = "quarantine";
pub const ERRORS_PREFIX: &str = "errors";

/// Event type published after a curated batch commits
pub const CURATED_BATCH_WRITTEN: &str = "curated_batch_written";

/// Separator used when joining composite primary keys
pub const KEY_SEPARATOR: &str = "|";

/// Length of the hex batch id derived from the extract contents
pub const BATCH_ID_LEN: usize = 16;
