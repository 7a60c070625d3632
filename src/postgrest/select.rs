//! `select=` column-list grammar: aliasing, JSON paths, embedded
//! relations, `!inner`, and `count()` aggregates (spec.md §4.3).

use crate::ast::{Expr, FunctionCall, Ident, ObjectName, SelectItem};
use crate::postgrest::filter::column_to_expr;

#[derive(Debug, Clone)]
pub struct EmbedSpec {
    pub alias: Option<String>,
    pub table: String,
    pub inner: bool,
    pub columns: Vec<SelectColumn>,
}

#[derive(Debug, Clone)]
pub enum SelectColumn {
    Plain { alias: Option<String>, column: String },
    Count,
    Embed(EmbedSpec),
}

/// Splits `select=a,b:c,orders!inner(id,total)` into top-level items,
/// respecting nested parens so an embed's inner commas aren't split on.
pub fn parse_select_list(input: &str) -> Vec<SelectColumn> {
    split_top_level(input).into_iter().map(parse_one).collect()
}

fn split_top_level(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn parse_one(item: String) -> SelectColumn {
    let item = item.trim();
    if item == "count()" {
        return SelectColumn::Count;
    }

    // alias:rest, where rest may itself be an embed.
    let (alias, rest) = match item.split_once(':') {
        Some((a, r)) if !r.starts_with(':') => (Some(a.to_string()), r),
        _ => (None, item),
    };

    if let Some(open) = rest.find('(') {
        if rest.ends_with(')') {
            let head = &rest[..open];
            let inner = &rest[open + 1..rest.len() - 1];
            let (table, inner_flag) = match head.strip_suffix("!inner") {
                Some(t) => (t.to_string(), true),
                None => (head.to_string(), false),
            };
            return SelectColumn::Embed(EmbedSpec {
                alias,
                table,
                inner: inner_flag,
                columns: parse_select_list(inner),
            });
        }
    }

    SelectColumn::Plain { alias, column: rest.to_string() }
}

/// Lowers plain (non-embed) columns into `SelectItem`s. Embeds are
/// handled separately by the compiler, which needs table context to
/// build the correlated subquery.
pub fn plain_to_select_item(alias: Option<String>, column: &str) -> SelectItem {
    SelectItem { expr: column_to_expr(column), alias: alias.map(Ident::new) }
}

pub fn count_star_item() -> SelectItem {
    SelectItem {
        expr: Expr::Function(FunctionCall {
            name: ObjectName::single("count"),
            args: vec![],
            distinct: false,
            star: true,
            order_by: vec![],
            pos: 0,
        }),
        alias: Some(Ident::new("count")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_columns() {
        let cols = parse_select_list("id,name");
        assert_eq!(cols.len(), 2);
    }

    #[test]
    fn parses_aliased_column() {
        let cols = parse_select_list("full_name:name");
        match &cols[0] {
            SelectColumn::Plain { alias, column } => {
                assert_eq!(alias.as_deref(), Some("full_name"));
                assert_eq!(column, "name");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_inner_embed() {
        let cols = parse_select_list("id,o:orders!inner(id,total)");
        match &cols[1] {
            SelectColumn::Embed(spec) => {
                assert_eq!(spec.alias.as_deref(), Some("o"));
                assert_eq!(spec.table, "orders");
                assert!(spec.inner);
                assert_eq!(spec.columns.len(), 2);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn parses_count_aggregate() {
        let cols = parse_select_list("id,count()");
        assert!(matches!(cols[1], SelectColumn::Count));
    }
}
