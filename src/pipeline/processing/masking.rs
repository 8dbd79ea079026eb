//! Fail-closed masking of payment and PII columns.
//!
//! Every mask is one-way and deterministic, and re-masking an already masked
//! value returns it unchanged. A value that does not look like what its
//! policy expects is never passed through: the whole record is dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::common::error::MaskingError;
use crate::domain::{IssueKind, Record, Severity, TrackedRecord, ValidationIssue, Value};

pub const REDACTED: &str = "[REDACTED]";
const CVV_MASK_LEN: usize = 3;

fn default_mask_char() -> char {
    '*'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskFunction {
    CardNumber,
    Cvv,
    Ssn,
    Phone,
    Name,
    Redact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskParameters {
    #[serde(default = "default_mask_char")]
    pub mask_char: char,
}

impl Default for MaskParameters {
    fn default() -> Self {
        Self {
            mask_char: default_mask_char(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMask {
    pub mask_function: MaskFunction,
    #[serde(default)]
    pub parameters: MaskParameters,
}

impl ColumnMask {
    pub fn new(mask_function: MaskFunction) -> Self {
        Self {
            mask_function,
            parameters: MaskParameters::default(),
        }
    }
}

/// Column name to mask, for one table.
pub type MaskingPolicy = BTreeMap<String, ColumnMask>;

fn digits_only(value: &str, separators: &[char]) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_ascii_digit() {
            out.push(c);
        } else if !separators.contains(&c) {
            return None;
        }
    }
    Some(out)
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn all_mask(s: &str, mask_char: char) -> bool {
    !s.is_empty() && s.chars().all(|c| c == mask_char)
}

/// Whether `value` is already in the output shape of `function`.
pub fn is_masked(function: MaskFunction, value: &str, mask_char: char) -> bool {
    match function {
        MaskFunction::CardNumber => {
            let chars: Vec<char> = value.chars().collect();
            let len = chars.len();
            (13..=19).contains(&len)
                && chars[..6].iter().all(char::is_ascii_digit)
                && chars[6..len - 4].iter().all(|c| *c == mask_char)
                && chars[len - 4..].iter().all(char::is_ascii_digit)
        }
        MaskFunction::Cvv => value.chars().count() == CVV_MASK_LEN && all_mask(value, mask_char),
        MaskFunction::Ssn => {
            let prefix: String = [mask_char; 3]
                .iter()
                .chain(['-'].iter())
                .chain([mask_char; 2].iter())
                .chain(['-'].iter())
                .collect();
            value
                .strip_prefix(prefix.as_str())
                .map_or(false, |last| last.len() == 4 && all_digits(last))
        }
        MaskFunction::Phone => {
            let parts: Vec<&str> = value.split('-').collect();
            parts.len() == 3
                && parts[0].len() == 3
                && all_digits(parts[0])
                && parts[1].chars().count() == 3
                && all_mask(parts[1], mask_char)
                && parts[2].len() == 4
                && all_digits(parts[2])
        }
        MaskFunction::Name => {
            let chars: Vec<char> = value.chars().collect();
            match chars.len() {
                0 => false,
                1 | 2 => chars.iter().all(|c| *c == mask_char),
                n => chars[1..n - 1].iter().all(|c| *c == mask_char),
            }
        }
        MaskFunction::Redact => value == REDACTED,
    }
}

/// Mask one textual value.
pub fn mask_str(function: MaskFunction, value: &str, mask_char: char) -> Result<String, MaskingError> {
    if is_masked(function, value, mask_char) {
        return Ok(value.to_string());
    }
    let bad = |expected: &'static str| MaskingError::UnexpectedFormat {
        expected,
        found_len: value.chars().count(),
    };

    match function {
        MaskFunction::CardNumber => {
            let digits = digits_only(value, &[' ', '-']).ok_or_else(|| bad("13-19 digit card number"))?;
            if !(13..=19).contains(&digits.len()) {
                return Err(bad("13-19 digit card number"));
            }
            let middle: String = std::iter::repeat(mask_char).take(digits.len() - 10).collect();
            Ok(format!("{}{}{}", &digits[..6], middle, &digits[digits.len() - 4..]))
        }
        MaskFunction::Cvv => {
            let trimmed = value.trim();
            if !(3..=4).contains(&trimmed.len()) || !all_digits(trimmed) {
                return Err(bad("3-4 digit security code"));
            }
            Ok(std::iter::repeat(mask_char).take(CVV_MASK_LEN).collect())
        }
        MaskFunction::Ssn => {
            let digits = digits_only(value, &[' ', '-']).ok_or_else(|| bad("9 digit ssn"))?;
            if digits.len() != 9 {
                return Err(bad("9 digit ssn"));
            }
            Ok(format!("{m}{m}{m}-{m}{m}-{}", &digits[5..], m = mask_char))
        }
        MaskFunction::Phone => {
            let digits = digits_only(value, &[' ', '-', '(', ')', '.', '+'])
                .ok_or_else(|| bad("10 digit phone number"))?;
            let national = match digits.len() {
                10 => digits.as_str(),
                11 if digits.starts_with('1') => &digits[1..],
                _ => return Err(bad("10 digit phone number")),
            };
            Ok(format!(
                "{}-{m}{m}{m}-{}",
                &national[..3],
                &national[6..],
                m = mask_char
            ))
        }
        MaskFunction::Name => {
            let chars: Vec<char> = value.chars().collect();
            match chars.len() {
                0 => Err(bad("non-empty name")),
                n @ (1 | 2) => Ok(std::iter::repeat(mask_char).take(n).collect()),
                n => {
                    let mut out = String::with_capacity(value.len());
                    out.push(chars[0]);
                    out.extend(std::iter::repeat(mask_char).take(n - 2));
                    out.push(chars[n - 1]);
                    Ok(out)
                }
            }
        }
        MaskFunction::Redact => Ok(REDACTED.to_string()),
    }
}

/// Mask one cell. Nulls stay null.
pub fn mask_value(mask: &ColumnMask, value: &Value) -> Result<Value, MaskingError> {
    let mask_char = mask.parameters.mask_char;
    let text = match value {
        Value::Null => return Ok(Value::Null),
        _ if mask.mask_function == MaskFunction::Redact => return Ok(Value::String(REDACTED.to_string())),
        Value::String(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        other => return Err(MaskingError::UnsupportedType(other.type_name())),
    };
    mask_str(mask.mask_function, &text, mask_char).map(Value::String)
}

/// Mask every policy column of one record, failing on the first bad cell.
pub fn mask_record(policy: &MaskingPolicy, record: &Record) -> Result<Record, (String, MaskingError)> {
    let mut masked = record.clone();
    for (column, mask) in policy {
        if let Some(value) = record.get(column) {
            let out = mask_value(mask, value).map_err(|e| (column.clone(), e))?;
            masked.set(column.clone(), out);
        }
    }
    Ok(masked)
}

/// Post-mask check that no policy column holds an unmasked value.
pub fn find_unmasked(policy: &MaskingPolicy, record: &Record) -> Option<String> {
    policy.iter().find_map(|(column, mask)| match record.get(column) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if is_masked(mask.mask_function, s, mask.parameters.mask_char) => None,
        Some(_) => Some(column.clone()),
    })
}

#[derive(Debug, Clone, Default)]
pub struct MaskOutcome {
    pub records: Vec<TrackedRecord>,
    pub dropped: usize,
    pub issues: Vec<ValidationIssue>,
}

pub struct SensitiveFieldMasker {
    policy: MaskingPolicy,
    key_columns: Vec<String>,
}

impl SensitiveFieldMasker {
    pub fn new(policy: MaskingPolicy, key_columns: Vec<String>) -> Self {
        Self { policy, key_columns }
    }

    pub fn policy(&self) -> &MaskingPolicy {
        &self.policy
    }

    #[instrument(skip_all, fields(records = records.len(), columns = self.policy.len()))]
    pub fn apply(&self, records: Vec<TrackedRecord>) -> MaskOutcome {
        let mut outcome = MaskOutcome::default();
        if self.policy.is_empty() {
            outcome.records = records;
            return outcome;
        }

        for tracked in records {
            let record_ref = tracked.record_ref(&self.key_columns);
            let masked = mask_record(&self.policy, &tracked.record).and_then(|masked| {
                match find_unmasked(&self.policy, &masked) {
                    None => Ok(masked),
                    Some(column) => Err((
                        column,
                        MaskingError::UnexpectedFormat {
                            expected: "masked value",
                            found_len: 0,
                        },
                    )),
                }
            });

            match masked {
                Ok(record) => outcome.records.push(TrackedRecord { record, ..tracked }),
                Err((column, error)) => {
                    // The offending value is never logged.
                    warn!(index = tracked.index, column = %column, error = %error, "Masking failed, dropping record");
                    outcome.dropped += 1;
                    outcome.issues.push(
                        ValidationIssue::new(
                            IssueKind::MaskingFailure,
                            Severity::Reject,
                            "masking.unexpected_format",
                            format!("column '{column}' could not be masked: {error}"),
                        )
                        .for_record(record_ref)
                        .on_column(column),
                    );
                }
            }
        }

        info!(
            masked = outcome.records.len(),
            dropped = outcome.dropped,
            "Sensitive field masking complete"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(function: MaskFunction, value: &str) -> String {
        mask_str(function, value, '*').unwrap()
    }

    #[test]
    fn test_card_number_keeps_bin_and_last_four() {
        assert_eq!(mask(MaskFunction::CardNumber, "4111111111111111"), "411111******1111");
        assert_eq!(mask(MaskFunction::CardNumber, "4111 1111 1111 1111"), "411111******1111");
        assert_eq!(mask(MaskFunction::CardNumber, "378282246310005"), "378282*****0005");
    }

    #[test]
    fn test_other_masks() {
        assert_eq!(mask(MaskFunction::Cvv, "123"), "***");
        assert_eq!(mask(MaskFunction::Cvv, "1234"), "***");
        assert_eq!(mask(MaskFunction::Ssn, "123-45-6789"), "***-**-6789");
        assert_eq!(mask(MaskFunction::Phone, "(206) 555-4567"), "206-***-4567");
        assert_eq!(mask(MaskFunction::Phone, "+1 206 555 4567"), "206-***-4567");
        assert_eq!(mask(MaskFunction::Name, "Annie"), "A***e");
        assert_eq!(mask(MaskFunction::Name, "Al"), "**");
        assert_eq!(mask(MaskFunction::Redact, "X1234567"), REDACTED);
    }

    #[test]
    fn test_masking_is_idempotent() {
        let cases = [
            (MaskFunction::CardNumber, "5500000000000004"),
            (MaskFunction::Cvv, "987"),
            (MaskFunction::Ssn, "987654321"),
            (MaskFunction::Phone, "206.555.0100"),
            (MaskFunction::Name, "Zoë Washburne"),
            (MaskFunction::Redact, "D1234-5678"),
        ];
        for (function, raw) in cases {
            let once = mask(function, raw);
            assert_eq!(mask(function, &once), once, "{function:?}");
            assert!(is_masked(function, &once, '*'));
        }
    }

    #[test]
    fn test_masked_output_hides_the_original() {
        let raw = "4111111111111111";
        let masked = mask(MaskFunction::CardNumber, raw);
        assert_ne!(masked, raw);
        assert!(!masked.contains("111111111111"));
        assert_eq!(mask(MaskFunction::Cvv, "123"), mask(MaskFunction::Cvv, "456"));
    }

    #[test]
    fn test_unexpected_formats_fail() {
        assert!(mask_str(MaskFunction::CardNumber, "4111-abc", '*').is_err());
        assert!(mask_str(MaskFunction::CardNumber, "123456", '*').is_err());
        assert!(mask_str(MaskFunction::Cvv, "12", '*').is_err());
        assert!(mask_str(MaskFunction::Ssn, "12345", '*').is_err());
        assert!(mask_str(MaskFunction::Phone, "555-0100", '*').is_err());
        assert!(mask_str(MaskFunction::Name, "", '*').is_err());
    }

    #[test]
    fn test_custom_mask_char() {
        assert_eq!(
            mask_str(MaskFunction::CardNumber, "4111111111111111", 'X').unwrap(),
            "411111XXXXXX1111"
        );
    }

    #[test]
    fn test_mask_value_types() {
        let cvv = ColumnMask::new(MaskFunction::Cvv);
        assert_eq!(mask_value(&cvv, &Value::Int(123)).unwrap(), Value::String("***".into()));
        assert_eq!(mask_value(&cvv, &Value::Null).unwrap(), Value::Null);
        assert_eq!(
            mask_value(&cvv, &Value::Bool(true)),
            Err(MaskingError::UnsupportedType("bool"))
        );
        let redact = ColumnMask::new(MaskFunction::Redact);
        assert_eq!(
            mask_value(&redact, &Value::Float(1.5)).unwrap(),
            Value::String(REDACTED.into())
        );
    }

    #[test]
    fn test_masker_drops_failing_record_without_leaking() {
        let policy = MaskingPolicy::from([
            ("card_number".to_string(), ColumnMask::new(MaskFunction::CardNumber)),
            ("cvv".to_string(), ColumnMask::new(MaskFunction::Cvv)),
        ]);
        let masker = SensitiveFieldMasker::new(policy, vec!["payment_id".to_string()]);
        let good = Record::from_pairs([
            ("payment_id", Value::String("P1".into())),
            ("card_number", Value::String("4111111111111111".into())),
            ("cvv", Value::String("123".into())),
        ]);
        let bad = Record::from_pairs([
            ("payment_id", Value::String("P2".into())),
            ("card_number", Value::String("4111-XXXX-oops".into())),
            ("cvv", Value::String("123".into())),
        ]);
        let records = vec![
            TrackedRecord { index: 0, record: good, warned: false },
            TrackedRecord { index: 1, record: bad, warned: false },
        ];
        let out = masker.apply(records);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.dropped, 1);
        assert_eq!(
            out.records[0].record.get("card_number"),
            Some(&Value::String("411111******1111".into()))
        );
        assert_eq!(out.records[0].record.get("cvv"), Some(&Value::String("***".into())));
        let issue = &out.issues[0];
        assert_eq!(issue.kind, IssueKind::MaskingFailure);
        assert!(!issue.message.contains("oops"));
        assert_eq!(issue.record_ref.as_ref().unwrap().primary_key.as_deref(), Some("P2"));
    }

    #[test]
    fn test_policy_deserializes() {
        let policy: MaskingPolicy = serde_json::from_str(
            r##"{"card_number": {"mask_function": "card_number", "parameters": {"mask_char": "#"}},
                "holder": {"mask_function": "name"}}"##,
        )
        .unwrap();
        assert_eq!(policy["card_number"].parameters.mask_char, '#');
        assert_eq!(policy["holder"].parameters.mask_char, '*');
    }
}
