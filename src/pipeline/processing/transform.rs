use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Record, Value};

/// Derived-column sets applied on the way to the prod layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Orders,
    Customers,
    Products,
    OrderItems,
    #[default]
    Passthrough,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn number(record: &Record, column: &str) -> Option<f64> {
    record.get(column).and_then(Value::as_f64)
}

fn int_or_null(v: Option<i64>) -> Value {
    v.map_or(Value::Null, Value::Int)
}

fn float_or_null(v: Option<f64>) -> Value {
    v.map_or(Value::Null, Value::Float)
}

/// Right-closed price bands: (0, 10], (10, 50], (50, 100], (100, 500], above.
pub fn price_category(price: f64) -> Option<&'static str> {
    match price {
        p if p <= 0.0 => None,
        p if p <= 10.0 => Some("budget"),
        p if p <= 50.0 => Some("economy"),
        p if p <= 100.0 => Some("standard"),
        p if p <= 500.0 => Some("premium"),
        _ => Some("luxury"),
    }
}

impl TransformKind {
    /// Add this table's derived columns. Ages are measured against
    /// `processed_at` so a rerun derives the same values.
    pub fn apply(&self, record: &mut Record, processed_at: DateTime<Utc>) {
        match self {
            TransformKind::Orders => {
                let date = record.update_timestamp("order_date");
                record.set("order_year", int_or_null(date.map(|d| d.year() as i64)));
                record.set("order_month", int_or_null(date.map(|d| d.month() as i64)));
                record.set("order_day", int_or_null(date.map(|d| d.day() as i64)));
                record.set(
                    "order_day_of_week",
                    int_or_null(date.map(|d| d.weekday().num_days_from_monday() as i64)),
                );
                record.set(
                    "order_age_days",
                    int_or_null(date.map(|d| (processed_at - d).num_days())),
                );
            }
            TransformKind::Customers => {
                let created = record.update_timestamp("created_at");
                record.set(
                    "customer_age_days",
                    int_or_null(created.map(|d| (processed_at - d).num_days())),
                );
                if record.is_missing("total_spent") {
                    record.set("total_spent", Value::Float(0.0));
                }
            }
            TransformKind::Products => {
                let price = number(record, "price");
                if record.contains("cost") {
                    let margin = match (price, number(record, "cost")) {
                        (Some(p), Some(c)) if p != 0.0 => Some(round2((p - c) / p * 100.0)),
                        _ => None,
                    };
                    record.set("profit_margin", float_or_null(margin));
                }
                let category = price.and_then(price_category);
                record.set(
                    "price_category",
                    category.map_or(Value::Null, |c| Value::String(c.to_string())),
                );
            }
            TransformKind::OrderItems => {
                let line_total = match (number(record, "quantity"), number(record, "unit_price")) {
                    (Some(q), Some(p)) => Some(q * p),
                    _ => None,
                };
                record.set("line_total", float_or_null(line_total));

                let discount = if record.contains("discount_percent") {
                    number(record, "discount_percent").map(|pct| (pct, true))
                } else {
                    number(record, "discount").map(|abs| (abs, false))
                };
                if let Some(total) = line_total {
                    let discount_amount = match discount {
                        Some((pct, true)) => round2(total * pct / 100.0),
                        Some((abs, false)) => abs,
                        None => 0.0,
                    };
                    record.set("discount_amount", Value::Float(discount_amount));
                    record.set("final_amount", Value::Float(round2(total - discount_amount)));
                } else {
                    record.set("discount_amount", Value::Null);
                    record.set("final_amount", Value::Null);
                }
            }
            TransformKind::Passthrough => {}
        }
    }
}
