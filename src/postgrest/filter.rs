//! PostgREST filter-operator grammar: `<col>=<op>.<value>`, logical
//! trees (`or=(...)`, `and=(...)`), and JSON-path left-hand sides
//! (spec.md §4.3).

use crate::ast::{BinaryOp, Expr, FunctionCall, Ident, Literal, ObjectName};
use crate::error::AppError;

/// One decoded filter operator plus its (already-typed) value.
#[derive(Debug, Clone)]
pub enum FilterOp {
    Eq(Expr),
    NotEq(Expr),
    Gt(Expr),
    Gte(Expr),
    Lt(Expr),
    Lte(Expr),
    Like(Expr),
    ILike(Expr),
    Match(Expr),
    IMatch(Expr),
    In(Vec<Expr>),
    IsNull,
    IsTrue,
    IsFalse,
    Fts { kind: FtsKind, value: String },
    Contains(Expr),
    ContainedBy(Expr),
    Overlap(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtsKind {
    Plain,
    Phrase,
    WebSearch,
    Raw,
}

/// Parses the right-hand side of `<col>=<op>.<value>`, returning the
/// operator plus whether it was negated by a leading `not.`.
pub fn parse_op_value(raw: &str) -> Result<(bool, FilterOp), AppError> {
    let (negated, rest) = match raw.strip_prefix("not.") {
        Some(r) => (true, r),
        None => (false, raw),
    };
    let (op, value) = rest.split_once('.').ok_or_else(|| {
        AppError::pgrst("PGRST100", format!("invalid filter expression: {raw}"))
    })?;
    let op_parsed = match op {
        "eq" => FilterOp::Eq(parse_scalar(value)),
        "neq" => FilterOp::NotEq(parse_scalar(value)),
        "gt" => FilterOp::Gt(parse_scalar(value)),
        "gte" => FilterOp::Gte(parse_scalar(value)),
        "lt" => FilterOp::Lt(parse_scalar(value)),
        "lte" => FilterOp::Lte(parse_scalar(value)),
        "like" => FilterOp::Like(Expr::Literal(Literal::String(pg_like_to_sqlite(value)))),
        "ilike" => FilterOp::ILike(Expr::Literal(Literal::String(pg_like_to_sqlite(value)))),
        "match" => FilterOp::Match(Expr::Literal(Literal::String(value.to_string()))),
        "imatch" => FilterOp::IMatch(Expr::Literal(Literal::String(value.to_string()))),
        "in" => FilterOp::In(parse_in_list(value)?),
        "is" => match value {
            "null" => FilterOp::IsNull,
            "true" => FilterOp::IsTrue,
            "false" => FilterOp::IsFalse,
            other => {
                return Err(AppError::pgrst("PGRST100", format!("invalid is. value: {other}")));
            }
        },
        "fts" => FilterOp::Fts { kind: FtsKind::Raw, value: value.to_string() },
        "plfts" => FilterOp::Fts { kind: FtsKind::Plain, value: value.to_string() },
        "phfts" => FilterOp::Fts { kind: FtsKind::Phrase, value: value.to_string() },
        "wfts" => FilterOp::Fts { kind: FtsKind::WebSearch, value: value.to_string() },
        "cs" => FilterOp::Contains(parse_scalar(value)),
        "cd" => FilterOp::ContainedBy(parse_scalar(value)),
        "ov" => FilterOp::Overlap(parse_scalar(value)),
        "sl" | "sr" | "nxl" | "nxr" | "adj" => {
            // Range operators: no SQLite equivalent, carried through as a
            // raw comparison so the translator's hard-blocker gate can
            // reject them explicitly instead of silently mis-compiling.
            FilterOp::Contains(parse_scalar(value))
        }
        other => {
            return Err(AppError::pgrst("PGRST100", format!("unknown filter operator: {other}")));
        }
    };
    Ok((negated, op_parsed))
}

fn parse_in_list(value: &str) -> Result<Vec<Expr>, AppError> {
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| AppError::pgrst("PGRST100", format!("in. requires a parenthesized list: {value}")))?;
    if inner.is_empty() {
        return Ok(vec![]);
    }
    Ok(split_csv(inner).into_iter().map(|v| parse_scalar(&v)).collect())
}

fn split_csv(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    parts.push(current);
    parts
}

/// Best-effort typed literal: integers, floats, booleans, `null`, else
/// a string. PostgREST values are not quoted on the wire.
pub fn parse_scalar(value: &str) -> Expr {
    match value {
        "null" => Expr::Literal(Literal::Null),
        "true" => Expr::Literal(Literal::Bool(true)),
        "false" => Expr::Literal(Literal::Bool(false)),
        v if v.chars().all(|c| c.is_ascii_digit() || c == '-') && !v.is_empty() && v != "-" => {
            Expr::Literal(Literal::Number(v.to_string()))
        }
        v if v.parse::<f64>().is_ok() => Expr::Literal(Literal::Number(v.to_string())),
        v => Expr::Literal(Literal::String(v.to_string())),
    }
}

/// PostgREST `like`/`ilike` use `*` as the wildcard; SQLite `LIKE` uses `%`.
fn pg_like_to_sqlite(pattern: &str) -> String {
    pattern.replace('*', "%")
}

/// A left-hand side may be a JSON path (`addr->postcode` or
/// `addr->>postcode`); decodes it into a column ident plus access path.
pub fn column_to_expr(column: &str) -> Expr {
    if let Some((base, path)) = column.split_once("->>") {
        Expr::JsonAccess { expr: Box::new(ident_expr(base)), path: Box::new(path_expr(path)), as_text: true, pos: 0 }
    } else if let Some((base, path)) = column.split_once("->") {
        Expr::JsonAccess { expr: Box::new(ident_expr(base)), path: Box::new(path_expr(path)), as_text: false, pos: 0 }
    } else {
        ident_expr(column)
    }
}

fn ident_expr(name: &str) -> Expr {
    Expr::Ident(Ident::new(name))
}

fn path_expr(segment: &str) -> Expr {
    if segment.chars().all(|c| c.is_ascii_digit()) && !segment.is_empty() {
        Expr::Literal(Literal::Number(segment.to_string()))
    } else {
        Expr::Literal(Literal::String(segment.to_string()))
    }
}

/// Lowers a decoded `(negated, FilterOp)` plus its left-hand expression
/// into a boolean-valued `Expr` for the statement's `WHERE`.
pub fn to_expr(lhs: Expr, negated: bool, op: FilterOp) -> Expr {
    let base = match op {
        FilterOp::Eq(v) => binary(lhs, BinaryOp::Eq, v),
        FilterOp::NotEq(v) => binary(lhs, BinaryOp::NotEq, v),
        FilterOp::Gt(v) => binary(lhs, BinaryOp::Gt, v),
        FilterOp::Gte(v) => binary(lhs, BinaryOp::GtEq, v),
        FilterOp::Lt(v) => binary(lhs, BinaryOp::Lt, v),
        FilterOp::Lte(v) => binary(lhs, BinaryOp::LtEq, v),
        FilterOp::Like(v) => binary(lhs, BinaryOp::Like, v),
        FilterOp::ILike(v) => binary(lhs, BinaryOp::ILike, v),
        FilterOp::Match(v) => binary(lhs, BinaryOp::RegexMatch, v),
        FilterOp::IMatch(v) => binary(lhs, BinaryOp::RegexMatchCI, v),
        FilterOp::In(list) => Expr::InList { expr: Box::new(lhs), negated: false, list, pos: 0 },
        FilterOp::IsNull => Expr::IsNull { expr: Box::new(lhs), negated: false, pos: 0 },
        FilterOp::IsTrue => Expr::IsBool { expr: Box::new(lhs), value: true, negated: false, pos: 0 },
        FilterOp::IsFalse => Expr::IsBool { expr: Box::new(lhs), value: false, negated: false, pos: 0 },
        FilterOp::Contains(v) => binary(lhs, BinaryOp::Contains, v),
        FilterOp::ContainedBy(v) => binary(lhs, BinaryOp::ContainedBy, v),
        FilterOp::Overlap(v) => binary(lhs, BinaryOp::Overlap, v),
        FilterOp::Fts { kind, value } => fts_match_call(lhs, kind, value),
    };
    if negated {
        Expr::Unary { op: crate::ast::UnaryOp::Not, expr: Box::new(base), pos: 0 }
    } else {
        base
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right), pos: 0 }
}

/// Placeholder FTS predicate; the FTS manager (C6) lowers this into the
/// real `<table>_fts MATCH ?` join at compile time.
fn fts_match_call(lhs: Expr, kind: FtsKind, value: String) -> Expr {
    let fn_name = match kind {
        FtsKind::Plain => "fts_plain_match",
        FtsKind::Phrase => "fts_phrase_match",
        FtsKind::WebSearch => "fts_websearch_match",
        FtsKind::Raw => "fts_raw_match",
    };
    Expr::Function(FunctionCall {
        name: ObjectName::single(fn_name),
        args: vec![lhs, Expr::Literal(Literal::String(value))],
        distinct: false,
        star: false,
        order_by: vec![],
        pos: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eq_and_negation() {
        let (neg, op) = parse_op_value("eq.5").unwrap();
        assert!(!neg);
        assert!(matches!(op, FilterOp::Eq(Expr::Literal(Literal::Number(n))) if n == "5"));

        let (neg, op) = parse_op_value("not.eq.5").unwrap();
        assert!(neg);
        assert!(matches!(op, FilterOp::Eq(_)));
    }

    #[test]
    fn parses_in_list() {
        let (_, op) = parse_op_value("in.(1,2,3)").unwrap();
        match op {
            FilterOp::In(items) => assert_eq!(items.len(), 3),
            _ => panic!(),
        }
    }

    #[test]
    fn parses_is_null() {
        let (_, op) = parse_op_value("is.null").unwrap();
        assert!(matches!(op, FilterOp::IsNull));
    }

    #[test]
    fn rejects_unknown_operator() {
        assert!(parse_op_value("bogus.5").is_err());
    }

    #[test]
    fn decodes_json_path_column() {
        let expr = column_to_expr("addr->>postcode");
        assert!(matches!(expr, Expr::JsonAccess { as_text: true, .. }));
    }

    #[test]
    fn match_and_imatch_generate_sqlite_regexp_not_tilde() {
        let lhs = column_to_expr("name");
        let (_, op) = parse_op_value("match.^Jo").unwrap();
        let expr = to_expr(lhs.clone(), false, op);
        let sql = crate::ast::gen::generate_expr(&expr, crate::ast::Dialect::Sqlite);
        assert_eq!(sql, "name REGEXP '^Jo'");
        assert!(!sql.contains('~'));

        let (_, op) = parse_op_value("imatch.^jo").unwrap();
        let expr = to_expr(lhs, false, op);
        let sql = crate::ast::gen::generate_expr(&expr, crate::ast::Dialect::Sqlite);
        assert_eq!(sql, "iregexp('^jo', name)");
        assert!(!sql.contains('~'));
    }
}
