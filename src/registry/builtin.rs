use crate::common::constants::{
    CDC_TIMESTAMP_COLUMN, CUSTOMERS, INVENTORY, ORDERS, ORDER_ITEMS, PAYMENTS, PRODUCTS,
};
use crate::domain::{ColumnSpec, ColumnType, Schema, Severity};
use crate::pipeline::processing::business_rules::{BusinessRule, RuleKind};
use crate::pipeline::processing::masking::{ColumnMask, MaskFunction, MaskingPolicy};
use crate::pipeline::processing::transform::TransformKind;

use super::{PartitionKey, TableBundle};

const SCHEMA_VERSION: &str = "v1";
const EMAIL_PATTERN: &str = r"^[\w.-]+@[\w.-]+\.\w+$";
const ORDER_STATUSES: &[&str] = &[
    "pending",
    "processing",
    "shipped",
    "delivered",
    "cancelled",
    "returned",
];
const PAYMENT_STATUSES: &[&str] = &["pending", "completed", "failed", "refunded"];

fn rule(id: &str, kind: RuleKind) -> BusinessRule {
    BusinessRule {
        id: id.to_string(),
        severity: Severity::Reject,
        kind,
    }
}

fn warn_rule(id: &str, kind: RuleKind) -> BusinessRule {
    BusinessRule {
        severity: Severity::Warn,
        ..rule(id, kind)
    }
}

fn col(name: &str) -> String {
    name.to_string()
}

fn non_negative(column: &str) -> RuleKind {
    RuleKind::NonNegative { column: col(column) }
}

fn positive(column: &str) -> RuleKind {
    RuleKind::Positive { column: col(column) }
}

fn not_in_future(column: &str) -> RuleKind {
    RuleKind::NotInFuture { column: col(column) }
}

fn one_of(column: &str, values: &[&str]) -> RuleKind {
    RuleKind::OneOf {
        column: col(column),
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

fn schema(table_name: &str, columns: Vec<ColumnSpec>) -> Schema {
    let mut columns = columns;
    columns.push(ColumnSpec::optional(CDC_TIMESTAMP_COLUMN, ColumnType::Timestamp));
    Schema {
        table_name: table_name.to_string(),
        version: SCHEMA_VERSION.to_string(),
        columns,
    }
}

fn masks(entries: &[(&str, MaskFunction)]) -> MaskingPolicy {
    entries
        .iter()
        .map(|(column, function)| (col(column), ColumnMask::new(*function)))
        .collect()
}

fn bundle(schema: Schema, primary_key: &[&str]) -> TableBundle {
    TableBundle {
        schema,
        primary_key: primary_key.iter().map(|c| col(c)).collect(),
        timestamp_column: Some(col(CDC_TIMESTAMP_COLUMN)),
        rules: Vec::new(),
        masking: MaskingPolicy::new(),
        transform: TransformKind::Passthrough,
        partition: PartitionKey::IngestDate,
        sort_column: None,
    }
}

pub fn customers() -> TableBundle {
    use ColumnType::*;
    TableBundle {
        rules: vec![
            rule(
                "customers.email_format",
                RuleKind::Matches {
                    column: col("email"),
                    pattern: EMAIL_PATTERN.to_string(),
                },
            ),
            rule("customers.created_not_in_future", not_in_future("created_at")),
            warn_rule("customers.total_spent_non_negative", non_negative("total_spent")),
        ],
        masking: masks(&[
            ("phone", MaskFunction::Phone),
            ("drivers_license", MaskFunction::Redact),
            ("passport_number", MaskFunction::Redact),
            ("tax_id", MaskFunction::Redact),
        ]),
        transform: TransformKind::Customers,
        sort_column: Some(col("created_at")),
        ..bundle(
            schema(
                CUSTOMERS,
                vec![
                    ColumnSpec::required("customer_id", String),
                    ColumnSpec::required("email", String),
                    ColumnSpec::optional("first_name", String),
                    ColumnSpec::optional("last_name", String),
                    ColumnSpec::optional("phone", String),
                    ColumnSpec::optional("drivers_license", String),
                    ColumnSpec::optional("passport_number", String),
                    ColumnSpec::optional("tax_id", String),
                    ColumnSpec::optional("total_spent", Float),
                    ColumnSpec::required("created_at", Timestamp),
                ],
            ),
            &["customer_id"],
        )
    }
}

pub fn orders() -> TableBundle {
    use ColumnType::*;
    TableBundle {
        rules: vec![
            rule("orders.total_non_negative", non_negative("total")),
            rule("orders.status_valid", one_of("order_status", ORDER_STATUSES)),
            rule("orders.date_not_in_future", not_in_future("order_date")),
            rule(
                "orders.total_matches_components",
                RuleKind::SumEquals {
                    parts: vec![col("subtotal"), col("tax"), col("shipping_cost")],
                    subtract: Vec::new(),
                    total: col("total"),
                    epsilon: 0.01,
                },
            ),
            rule(
                "orders.total_matches_items",
                RuleKind::GroupSumMatches {
                    key: col("order_id"),
                    total: col("total"),
                    reference_table: col(ORDER_ITEMS),
                    reference_key: col("order_id"),
                    amount: col("total"),
                    epsilon: 0.01,
                },
            ),
            warn_rule(
                "orders.customer_exists",
                RuleKind::ReferenceExists {
                    column: col("customer_id"),
                    reference_table: col(CUSTOMERS),
                    reference_column: col("customer_id"),
                },
            ),
        ],
        transform: TransformKind::Orders,
        sort_column: Some(col("order_date")),
        ..bundle(
            schema(
                ORDERS,
                vec![
                    ColumnSpec::required("order_id", String),
                    ColumnSpec::required("customer_id", String),
                    ColumnSpec::required("order_date", Timestamp),
                    ColumnSpec::optional("subtotal", Float).with_min(0.0),
                    ColumnSpec::optional("tax", Float).with_min(0.0),
                    ColumnSpec::optional("shipping_cost", Float).with_min(0.0),
                    ColumnSpec::required("total", Float).with_min(0.0),
                    ColumnSpec::required("order_status", String),
                ],
            ),
            &["order_id"],
        )
    }
}

pub fn order_items() -> TableBundle {
    use ColumnType::*;
    TableBundle {
        rules: vec![
            rule("order_items.quantity_positive", positive("quantity")),
            rule("order_items.unit_price_non_negative", non_negative("unit_price")),
            rule(
                "order_items.total_matches_line",
                RuleKind::LineTotalMatches {
                    quantity: col("quantity"),
                    unit_price: col("unit_price"),
                    discount: Some(col("discount")),
                    total: col("total"),
                    epsilon: 0.01,
                },
            ),
        ],
        transform: TransformKind::OrderItems,
        ..bundle(
            schema(
                ORDER_ITEMS,
                vec![
                    ColumnSpec::required("order_item_id", String),
                    ColumnSpec::required("order_id", String),
                    ColumnSpec::required("product_id", String),
                    ColumnSpec::required("quantity", Int),
                    ColumnSpec::required("unit_price", Float).with_min(0.0),
                    ColumnSpec::optional("discount", Float).with_min(0.0),
                    ColumnSpec::required("total", Float),
                ],
            ),
            &["order_item_id"],
        )
    }
}

pub fn products() -> TableBundle {
    use ColumnType::*;
    TableBundle {
        rules: vec![
            rule("products.price_positive", positive("price")),
            rule("products.weight_non_negative", non_negative("weight")),
            warn_rule(
                "products.cost_not_above_price",
                RuleKind::NotGreaterThan {
                    column: col("cost"),
                    limit: col("price"),
                },
            ),
        ],
        transform: TransformKind::Products,
        sort_column: Some(col("created_date")),
        ..bundle(
            schema(
                PRODUCTS,
                vec![
                    ColumnSpec::required("product_id", String),
                    ColumnSpec::required("name", String),
                    ColumnSpec::required("price", Float).with_min(0.0),
                    ColumnSpec::optional("cost", Float).with_min(0.0),
                    ColumnSpec::optional("category_id", String),
                    ColumnSpec::optional("weight", Float),
                    ColumnSpec::optional("created_date", Timestamp),
                ],
            ),
            &["product_id"],
        )
    }
}

pub fn inventory() -> TableBundle {
    use ColumnType::*;
    TableBundle {
        rules: vec![
            rule("inventory.quantity_non_negative", non_negative("quantity")),
            rule("inventory.available_non_negative", non_negative("available_quantity")),
            rule(
                "inventory.reserved_within_quantity",
                RuleKind::NotGreaterThan {
                    column: col("reserved_quantity"),
                    limit: col("quantity"),
                },
            ),
            rule(
                "inventory.available_matches",
                RuleKind::SumEquals {
                    parts: vec![col("quantity")],
                    subtract: vec![col("reserved_quantity")],
                    total: col("available_quantity"),
                    epsilon: 0.0,
                },
            ),
        ],
        ..bundle(
            schema(
                INVENTORY,
                vec![
                    ColumnSpec::required("product_id", String),
                    ColumnSpec::required("warehouse_id", String),
                    ColumnSpec::required("quantity", Int),
                    ColumnSpec::optional("reserved_quantity", Int),
                    ColumnSpec::optional("available_quantity", Int),
                    ColumnSpec::optional("timestamp", Timestamp),
                ],
            ),
            &["product_id", "warehouse_id"],
        )
    }
}

pub fn payments() -> TableBundle {
    use ColumnType::*;
    TableBundle {
        rules: vec![
            rule("payments.amount_positive", positive("amount")),
            rule("payments.date_not_in_future", not_in_future("payment_date")),
            rule("payments.status_valid", one_of("payment_status", PAYMENT_STATUSES)),
            warn_rule(
                "payments.completed_has_transaction",
                RuleKind::RequiredWhen {
                    column: col("transaction_id"),
                    when_column: col("payment_status"),
                    equals: "completed".to_string(),
                },
            ),
        ],
        masking: masks(&[
            ("card_number", MaskFunction::CardNumber),
            ("cvv", MaskFunction::Cvv),
            ("card_holder_name", MaskFunction::Name),
            ("ssn", MaskFunction::Ssn),
            ("billing_phone", MaskFunction::Phone),
        ]),
        sort_column: Some(col("payment_date")),
        ..bundle(
            schema(
                PAYMENTS,
                vec![
                    ColumnSpec::required("payment_id", String),
                    ColumnSpec::required("order_id", String),
                    ColumnSpec::required("amount", Float),
                    ColumnSpec::required("payment_date", Timestamp),
                    ColumnSpec::required("payment_status", String),
                    ColumnSpec::optional("payment_method", String),
                    ColumnSpec::optional("transaction_id", String),
                    ColumnSpec::optional("card_number", String),
                    ColumnSpec::optional("cvv", String),
                    ColumnSpec::optional("card_holder_name", String),
                    ColumnSpec::optional("ssn", String),
                    ColumnSpec::optional("billing_phone", String),
                ],
            ),
            &["payment_id"],
        )
    }
}

pub fn bundles() -> Vec<TableBundle> {
    vec![customers(), orders(), order_items(), products(), inventory(), payments()]
}
