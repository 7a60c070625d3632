//! C6: FTS5 external-content virtual tables, their sync triggers, and
//! query-string-to-`MATCH`-expression translation (spec.md §4.5).

use crate::ast::{Expr, Literal};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tokenizer {
    Unicode61,
    Porter,
    Ascii,
    Trigram,
}

impl Tokenizer {
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "unicode61" => Ok(Tokenizer::Unicode61),
            "porter" => Ok(Tokenizer::Porter),
            "ascii" => Ok(Tokenizer::Ascii),
            "trigram" => Ok(Tokenizer::Trigram),
            other => Err(AppError::new(crate::error::ErrorKind::UnsupportedFeature, format!("unknown FTS tokenizer: {other}")).with_code("PGRST100")),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Tokenizer::Unicode61 => "unicode61",
            Tokenizer::Porter => "porter",
            Tokenizer::Ascii => "ascii",
            Tokenizer::Trigram => "trigram",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FtsIndex {
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    pub tokenizer: Tokenizer,
    pub pk_column: String,
}

impl FtsIndex {
    pub fn fts_table_name(&self) -> String {
        format!("{}_fts_{}", self.table, self.name)
    }

    /// DDL + trigger statements for `CreateIndex`; run inside one
    /// transaction by the caller, in this order.
    pub fn create_statements(&self) -> Vec<String> {
        let fts = self.fts_table_name();
        let cols = self.columns.join(", ");
        let mut stmts = vec![format!(
            "CREATE VIRTUAL TABLE {fts} USING fts5({cols}, content={table}, content_rowid={pk}, tokenize='{tok}')",
            fts = fts,
            cols = cols,
            table = self.table,
            pk = self.pk_column,
            tok = self.tokenizer.as_str(),
        )];

        let col_list = self.columns.join(", ");
        let new_cols = self.columns.iter().map(|c| format!("new.{c}")).collect::<Vec<_>>().join(", ");
        let old_cols = self.columns.iter().map(|c| format!("old.{c}")).collect::<Vec<_>>().join(", ");

        stmts.push(format!(
            "CREATE TRIGGER {fts}_ai AFTER INSERT ON {table} BEGIN \
             INSERT INTO {fts}(rowid, {col_list}) VALUES (new.{pk}, {new_cols}); END",
            fts = fts,
            table = self.table,
            col_list = col_list,
            pk = self.pk_column,
            new_cols = new_cols,
        ));
        stmts.push(format!(
            "CREATE TRIGGER {fts}_ad AFTER DELETE ON {table} BEGIN \
             INSERT INTO {fts}({fts}, rowid, {col_list}) VALUES ('delete', old.{pk}, {old_cols}); END",
            fts = fts,
            table = self.table,
            col_list = col_list,
            pk = self.pk_column,
            old_cols = old_cols,
        ));
        stmts.push(format!(
            "CREATE TRIGGER {fts}_au AFTER UPDATE ON {table} BEGIN \
             INSERT INTO {fts}({fts}, rowid, {col_list}) VALUES ('delete', old.{pk}, {old_cols}); \
             INSERT INTO {fts}(rowid, {col_list}) VALUES (new.{pk}, {new_cols}); END",
            fts = fts,
            table = self.table,
            col_list = col_list,
            pk = self.pk_column,
            old_cols = old_cols,
            new_cols = new_cols,
        ));
        stmts.push(format!("INSERT INTO {fts}({fts}) VALUES('rebuild')", fts = fts));
        stmts
    }

    pub fn drop_statements(&self) -> Vec<String> {
        let fts = self.fts_table_name();
        vec![
            format!("DROP TRIGGER IF EXISTS {fts}_ai"),
            format!("DROP TRIGGER IF EXISTS {fts}_ad"),
            format!("DROP TRIGGER IF EXISTS {fts}_au"),
            format!("DROP TABLE IF EXISTS {fts}"),
        ]
    }

    pub fn rebuild_statement(&self) -> String {
        let fts = self.fts_table_name();
        format!("INSERT INTO {fts}({fts}) VALUES('rebuild')", fts = fts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Plain,
    Phrase,
    WebSearch,
    Fts,
}

/// `ConvertQuery(q, kind)` — spec.md §4.5.
pub fn convert_query(q: &str, kind: QueryKind) -> String {
    match kind {
        QueryKind::Plain => q
            .split_whitespace()
            .map(strip_special_chars)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" AND "),
        QueryKind::Phrase => format!("\"{}\"", q.replace('"', "")),
        QueryKind::WebSearch => convert_websearch(q),
        QueryKind::Fts => convert_tsquery(q),
    }
}

fn strip_special_chars(token: &str) -> String {
    token.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect()
}

fn convert_websearch(q: &str) -> String {
    let mut out = Vec::new();
    let mut chars = q.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                current.push('"');
                in_quotes = !in_quotes;
                if !in_quotes {
                    out.push(std::mem::take(&mut current));
                }
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }

    out.into_iter()
        .map(|tok| {
            if tok.eq_ignore_ascii_case("or") {
                "OR".to_string()
            } else if let Some(rest) = tok.strip_prefix('-') {
                format!("NOT {rest}")
            } else {
                tok
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn convert_tsquery(q: &str) -> String {
    let mut out = String::new();
    for c in q.chars() {
        match c {
            '&' => out.push_str(" AND "),
            '|' => out.push_str(" OR "),
            '!' => out.push_str(" NOT "),
            '\'' => out.push(' '),
            ':' => {}
            other => out.push(other),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Builds the `rowid IN (SELECT rowid FROM <fts> WHERE <fts> MATCH ?)`
/// condition, with `match_value` as a standalone bound-parameter
/// placeholder the caller binds separately (never inlined as a literal,
/// to keep FTS query syntax out of the SQL text).
pub fn match_condition(fts_table: &str, ranked: bool) -> String {
    if ranked {
        format!("rowid IN (SELECT rowid FROM {fts_table} WHERE {fts_table} MATCH ? ORDER BY rank)")
    } else {
        format!("rowid IN (SELECT rowid FROM {fts_table} WHERE {fts_table} MATCH ?)")
    }
}

/// Lowers a `fts_*_match(column, value)` placeholder call produced by
/// the PostgREST filter compiler into the real FTS condition once the
/// column's index is known. Returns `42P01` when no index covers the
/// column.
pub fn lower_fts_call(
    column: &str,
    kind: QueryKind,
    value: &str,
    index_for_column: impl Fn(&str) -> Option<FtsIndex>,
) -> Result<(Expr, String), AppError> {
    let Some(index) = index_for_column(column) else {
        return Err(AppError::not_found(format!("no FTS index on column {column}")));
    };
    if value.trim().is_empty() {
        // Empty query: no rows, not an error.
        return Ok((Expr::Literal(crate::ast::Literal::Bool(false)), String::new()));
    }
    let condition = match_condition(&index.fts_table_name(), false);
    let translated = convert_query(value, kind);
    Ok((Expr::Raw(crate::ast::RawSql { text: condition, pos: 0 }), translated))
}

fn fts_kind_for_fn_name(name: &str) -> Option<QueryKind> {
    match name {
        "fts_plain_match" => Some(QueryKind::Plain),
        "fts_phrase_match" => Some(QueryKind::Phrase),
        "fts_websearch_match" => Some(QueryKind::WebSearch),
        "fts_raw_match" => Some(QueryKind::Fts),
        _ => None,
    }
}

fn column_name_from_expr(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Ident(ident) => Some(ident.value.as_str()),
        Expr::CompoundIdent(parts) => parts.last().map(|i| i.value.as_str()),
        Expr::JsonAccess { expr, .. } => column_name_from_expr(expr),
        _ => None,
    }
}

/// Walks a compiled filter tree and lowers every `fts_*_match` placeholder
/// planted by `postgrest::filter::fts_match_call` into its real
/// `rowid IN (...)` condition, appending the translated MATCH value to
/// `params` in the same left-to-right order the generator emits their `?`
/// placeholders. Leaves every other node untouched.
pub fn lower_filter_tree(
    expr: Expr,
    index_for_column: &impl Fn(&str) -> Option<FtsIndex>,
    params: &mut Vec<String>,
) -> Result<Expr, AppError> {
    match expr {
        Expr::Binary { op, left, right, pos } => Ok(Expr::Binary {
            op,
            left: Box::new(lower_filter_tree(*left, index_for_column, params)?),
            right: Box::new(lower_filter_tree(*right, index_for_column, params)?),
            pos,
        }),
        Expr::Unary { op, expr: inner, pos } => {
            Ok(Expr::Unary { op, expr: Box::new(lower_filter_tree(*inner, index_for_column, params)?), pos })
        }
        Expr::Function(call) => {
            let fn_name = call.name.last().value.to_ascii_lowercase();
            match fts_kind_for_fn_name(&fn_name) {
                Some(kind) => {
                    let column = call
                        .args
                        .first()
                        .and_then(column_name_from_expr)
                        .ok_or_else(|| AppError::internal("fts filter placeholder missing column argument"))?
                        .to_string();
                    let value = match call.args.get(1) {
                        Some(Expr::Literal(Literal::String(s))) => s.clone(),
                        _ => return Err(AppError::internal("fts filter placeholder missing value argument")),
                    };
                    let (condition, translated) = lower_fts_call(&column, kind, &value, index_for_column)?;
                    if !translated.is_empty() {
                        params.push(translated);
                    }
                    Ok(condition)
                }
                None => Ok(Expr::Function(call)),
            }
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_statements_cover_table_triggers_and_rebuild() {
        let idx = FtsIndex {
            table: "docs".to_string(),
            name: "body".to_string(),
            columns: vec!["title".to_string(), "body".to_string()],
            tokenizer: Tokenizer::Porter,
            pk_column: "id".to_string(),
        };
        let stmts = idx.create_statements();
        assert!(stmts[0].contains("CREATE VIRTUAL TABLE docs_fts_body USING fts5"));
        assert!(stmts.iter().any(|s| s.contains("_ai AFTER INSERT")));
        assert!(stmts.iter().any(|s| s.contains("_ad AFTER DELETE")));
        assert!(stmts.iter().any(|s| s.contains("_au AFTER UPDATE")));
        assert!(stmts.last().unwrap().contains("VALUES('rebuild')"));
    }

    #[test]
    fn converts_plain_query() {
        assert_eq!(convert_query("hello world!!", QueryKind::Plain), "hello AND world");
    }

    #[test]
    fn converts_phrase_query() {
        assert_eq!(convert_query("quick brown fox", QueryKind::Phrase), "\"quick brown fox\"");
    }

    #[test]
    fn converts_websearch_query() {
        let out = convert_query("cats or dogs -fleas \"exact phrase\"", QueryKind::WebSearch);
        assert_eq!(out, "cats OR dogs NOT fleas \"exact phrase\"");
    }

    #[test]
    fn converts_fts_tsquery_operators() {
        let out = convert_query("cat & dog", QueryKind::Fts);
        assert_eq!(out, "cat AND dog");
    }

    #[test]
    fn unknown_tokenizer_rejected() {
        assert!(Tokenizer::parse("bogus").is_err());
    }

    fn sample_index() -> FtsIndex {
        FtsIndex {
            table: "articles".to_string(),
            name: "body".to_string(),
            columns: vec!["body".to_string()],
            tokenizer: Tokenizer::Unicode61,
            pk_column: "id".to_string(),
        }
    }

    #[test]
    fn lower_filter_tree_replaces_placeholder_and_collects_match_value() {
        use crate::ast::{BinaryOp, FunctionCall, Ident, ObjectName};

        let placeholder = Expr::Binary {
            op: BinaryOp::And,
            left: Box::new(Expr::Binary {
                op: BinaryOp::Eq,
                left: Box::new(Expr::Ident(Ident::new("published"))),
                right: Box::new(Expr::Literal(Literal::Bool(true))),
                pos: 0,
            }),
            right: Box::new(Expr::Function(FunctionCall {
                name: ObjectName::single("fts_websearch_match"),
                args: vec![Expr::Ident(Ident::new("body")), Expr::Literal(Literal::String("cat -dog".to_string()))],
                distinct: false,
                star: false,
                order_by: vec![],
                pos: 0,
            })),
            pos: 0,
        };

        let index = sample_index();
        let lookup = |col: &str| if col == "body" { Some(index.clone()) } else { None };
        let mut params = Vec::new();
        let lowered = lower_filter_tree(placeholder, &lookup, &mut params).unwrap();

        assert_eq!(params, vec!["cat NOT dog".to_string()]);
        match lowered {
            Expr::Binary { right, .. } => match *right {
                Expr::Raw(raw) => assert!(raw.text.contains("articles_fts_body MATCH ?")),
                other => panic!("expected raw fts condition, got {other:?}"),
            },
            other => panic!("expected binary node, got {other:?}"),
        }
    }

    #[test]
    fn lower_filter_tree_errors_when_no_index_covers_the_column() {
        use crate::ast::{FunctionCall, Ident, ObjectName};

        let placeholder = Expr::Function(FunctionCall {
            name: ObjectName::single("fts_plain_match"),
            args: vec![Expr::Ident(Ident::new("body")), Expr::Literal(Literal::String("hi".to_string()))],
            distinct: false,
            star: false,
            order_by: vec![],
            pos: 0,
        });
        let lookup = |_: &str| None;
        let mut params = Vec::new();
        assert!(lower_filter_tree(placeholder, &lookup, &mut params).is_err());
    }
}
