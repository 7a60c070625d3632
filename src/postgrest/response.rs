//! Response shaping: the array/single/maybeSingle envelope and the
//! `text/csv` encoder (spec.md §4.3).

use crate::error::AppError;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    Array,
    /// `Accept: application/vnd.pgrst.object+json` — exactly one row or `PGRST116`.
    Single,
    /// `Prefer: ... ; maybe` variant some clients send — zero or one row.
    MaybeSingle,
}

pub fn shape_rows(rows: Vec<Value>, envelope: Envelope) -> Result<Value, AppError> {
    match envelope {
        Envelope::Array => Ok(Value::Array(rows)),
        Envelope::Single => {
            if rows.len() != 1 {
                return Err(AppError::single_row_violation(format!(
                    "expected exactly one row, got {}",
                    rows.len()
                )));
            }
            Ok(rows.into_iter().next().unwrap())
        }
        Envelope::MaybeSingle => {
            if rows.len() > 1 {
                return Err(AppError::single_row_violation(format!(
                    "expected at most one row, got {}",
                    rows.len()
                )));
            }
            Ok(rows.into_iter().next().unwrap_or(Value::Null))
        }
    }
}

/// Encodes rows (an array of flat JSON objects) as CSV: header from the
/// first row's keys, fields containing `,`/`"`/newline quoted with `"`
/// escaped as `""`, nulls as empty fields.
pub fn encode_csv(rows: &[Value]) -> String {
    let mut out = String::new();
    let Some(first) = rows.first().and_then(|r| r.as_object()) else {
        return out;
    };
    let columns: Vec<&String> = first.keys().collect();
    out.push_str(&columns.iter().map(|c| csv_field(c)).collect::<Vec<_>>().join(","));
    out.push_str("\r\n");
    for row in rows {
        let obj = row.as_object();
        let fields: Vec<String> = columns
            .iter()
            .map(|c| {
                let value = obj.and_then(|o| o.get(*c));
                csv_value(value)
            })
            .collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

fn csv_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => csv_field(s),
        Some(other) => csv_field(&other.to_string()),
    }
}

fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// `Content-Range: <a>-<b>/<total-or-*>` for `Prefer: count=...` and
/// paginated reads.
pub fn content_range(offset: usize, returned: usize, total: Option<u64>) -> String {
    let total_str = total.map(|t| t.to_string()).unwrap_or_else(|| "*".to_string());
    if returned == 0 {
        format!("{}-{}/{}", offset, offset.saturating_sub(1), total_str)
    } else {
        format!("{}-{}/{}", offset, offset + returned - 1, total_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_csv_with_quoting() {
        let rows = vec![json!({"a": "x,y", "b": "plain"}), json!({"a": "has\"quote", "b": null})];
        let csv = encode_csv(&rows);
        assert!(csv.starts_with("a,b\r\n"));
        assert!(csv.contains("\"x,y\",plain"));
        assert!(csv.contains("\"has\"\"quote\","));
    }

    #[test]
    fn single_envelope_errors_on_multiple_rows() {
        let rows = vec![json!({"a": 1}), json!({"a": 2})];
        let err = shape_rows(rows, Envelope::Single).unwrap_err();
        assert_eq!(err.code(), "PGRST116");
    }

    #[test]
    fn content_range_formats_total() {
        assert_eq!(content_range(0, 10, Some(42)), "0-9/42");
        assert_eq!(content_range(0, 0, Some(0)), "0--1/0");
    }
}
