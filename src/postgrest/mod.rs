//! C4: compiles a PostgREST-shaped request (path + query string +
//! `Prefer`/`Accept` headers + JSON body) into the executable AST,
//! wiring in the C5 RLS hook (spec.md §4.3).

pub mod filter;
pub mod response;
pub mod select;

use std::collections::HashMap;

use crate::ast::{
    BinaryOp, Delete, Expr, From, Insert, InsertSource, Literal, ObjectName,
    OrderByExpr, Select, SelectItem, TableRef, Update,
};
use crate::error::AppError;
use crate::rls::{AuthContext, Command, RlsRegistry};
use response::Envelope;
use select::SelectColumn;

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub params: HashMap<String, Vec<String>>,
}

impl QueryParams {
    pub fn parse(query: &str) -> Self {
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urldecode(k);
            let value = urldecode(v);
            params.entry(key).or_default().push(value);
        }
        Self { params }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.first()).map(|s| s.as_str())
    }

    fn filter_columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

const RESERVED_PARAMS: &[&str] = &["select", "order", "limit", "offset", "range", "or", "and"];

/// Percent-decodes a query-string component via the `urlencoding` crate
/// (the same crate the teacher depends on for building Supabase query
/// strings); `+` is treated as a space first, matching
/// `application/x-www-form-urlencoded` query-string conventions.
fn urldecode(s: &str) -> String {
    let with_spaces = s.replace('+', " ");
    urlencoding::decode(&with_spaces).map(|cow| cow.into_owned()).unwrap_or(with_spaces)
}

/// Request metadata the HTTP layer extracts from `Prefer`/`Accept`.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    pub count_exact: bool,
    pub return_representation: bool,
    pub resolution_merge_duplicates: bool,
    pub envelope: Option<Envelope>,
}

pub struct CompiledRead {
    pub select: Select,
    pub count_select: Option<Select>,
    pub envelope: Envelope,
    /// Translated FTS `MATCH` values, in the order their `?` placeholders
    /// appear in the generated SQL (spec.md §4.5); bound positionally
    /// against both `select` and `count_select`.
    pub params: Vec<String>,
    /// Resolved zero-based row offset (from `offset=` or `range=a-b`),
    /// used to build the `Content-Range` response header.
    pub offset: i64,
}

/// Compiles `GET/HEAD /<table>?<query>` into an executable `Select`,
/// plus an optional `COUNT(*)` query for `Prefer: count=exact`.
pub fn compile_read(
    table: &str,
    query: &QueryParams,
    prefs: &Preferences,
    rls: &RlsRegistry,
    auth: &AuthContext,
    fts_lookup: &impl Fn(&str) -> Option<crate::fts::FtsIndex>,
) -> Result<CompiledRead, AppError> {
    let columns = query.get("select").map(select::parse_select_list).unwrap_or_else(|| vec![select::SelectColumn::Plain { alias: None, column: "*".to_string() }]);

    let mut select_items = Vec::new();
    let mut inner_embed_predicates = Vec::new();
    for col in &columns {
        match col {
            SelectColumn::Plain { alias, column } if column == "*" => {
                select_items.push(SelectItem { expr: Expr::Wildcard, alias: alias.clone().map(crate::ast::Ident::new) });
            }
            SelectColumn::Plain { alias, column } => {
                select_items.push(select::plain_to_select_item(alias.clone(), column));
            }
            SelectColumn::Count => select_items.push(select::count_star_item()),
            SelectColumn::Embed(embed) => {
                let item = compile_embed(table, embed)?;
                if embed.inner {
                    inner_embed_predicates.push(Expr::Binary {
                        op: BinaryOp::Gt,
                        left: Box::new(Expr::Function(crate::ast::FunctionCall {
                            name: ObjectName::single("json_array_length"),
                            args: vec![item.expr.clone()],
                            distinct: false,
                            star: false,
                            order_by: vec![],
                            pos: 0,
                        })),
                        right: Box::new(Expr::Literal(Literal::Number("0".to_string()))),
                        pos: 0,
                    });
                }
                select_items.push(item);
            }
        }
    }

    let mut params = Vec::new();
    let mut filter = build_filter_tree(query)?;
    if let Some(f) = filter {
        filter = Some(crate::fts::lower_filter_tree(f, fts_lookup, &mut params)?);
    }
    for pred in inner_embed_predicates {
        filter = Some(and_opt(filter, pred));
    }
    if let Some(rls_pred) = rls.using_predicate(table, Command::Select, auth) {
        filter = Some(and_opt(filter, rls_pred));
    }

    let order_by = query.get("order").map(parse_order_by).transpose()?.unwrap_or_default();
    let (limit_n, offset_n) = if let Some(range) = query.get("range").and_then(parse_range) {
        (Some(range.1 - range.0 + 1), Some(range.0))
    } else {
        (
            query.get("limit").and_then(|v| v.parse::<i64>().ok()),
            query.get("offset").and_then(|v| v.parse::<i64>().ok()),
        )
    };
    let limit = limit_n.map(|n| Expr::Literal(Literal::Number(n.to_string())));
    let offset = offset_n.map(|n| Expr::Literal(Literal::Number(n.to_string())));

    let select = Select {
        with: None,
        distinct: false,
        columns: select_items,
        from: vec![From { table: TableRef::Named { name: ObjectName::single(table), alias: None }, joins: vec![] }],
        filter: filter.clone(),
        group_by: vec![],
        having: None,
        order_by,
        limit,
        offset,
        union: None,
        pos: 0,
    };

    let count_select = if prefs.count_exact {
        Some(Select {
            columns: vec![select::count_star_item()],
            from: select.from.clone(),
            filter,
            limit: None,
            offset: None,
            order_by: vec![],
            ..Select::empty()
        })
    } else {
        None
    };

    let envelope = prefs.envelope.unwrap_or(Envelope::Array);
    Ok(CompiledRead { select, count_select, envelope, params, offset: offset_n.unwrap_or(0) })
}

/// Lowers an embedded relation into a correlated `json_group_array`
/// subquery select item (no `JOIN` is emitted — the shape needed is
/// nested JSON attached to the parent row, not a flattened join result).
/// `!inner` is enforced by the caller filtering on
/// `json_array_length(...) > 0` over the returned expression.
///
/// SQLite's `json_object()` takes alternating `label, value` arguments
/// and has no `*` shorthand, so the child row is built as one explicit
/// `json_object('col', col, ...)` call per embedded column rather than
/// the `json_object(*)` PostgREST itself never has to spell out.
fn compile_embed(parent: &str, embed: &select::EmbedSpec) -> Result<SelectItem, AppError> {
    let child_table = embed.table.clone();
    let fk_column = format!("{parent_singular}_id", parent_singular = singularize(parent));

    let mut json_pairs = Vec::new();
    for col in &embed.columns {
        match col {
            SelectColumn::Plain { alias, column } => {
                let label = alias.clone().unwrap_or_else(|| column.clone());
                json_pairs.push(Expr::Literal(Literal::String(label)));
                json_pairs.push(select::plain_to_select_item(None, column).expr);
            }
            SelectColumn::Count => {
                json_pairs.push(Expr::Literal(Literal::String("count".to_string())));
                json_pairs.push(select::count_star_item().expr);
            }
            SelectColumn::Embed(nested) => {
                let item = compile_embed(&child_table, nested)?;
                let label = item.alias.clone().map(|a| a.value).unwrap_or_else(|| nested.table.clone());
                json_pairs.push(Expr::Literal(Literal::String(label)));
                json_pairs.push(item.expr);
            }
        }
    }

    let row_object = Expr::Function(crate::ast::FunctionCall {
        name: ObjectName::single("json_object"),
        args: json_pairs,
        distinct: false,
        star: false,
        order_by: vec![],
        pos: 0,
    });

    let inner_select = Select {
        columns: vec![SelectItem { expr: row_object, alias: Some(crate::ast::Ident::new("doc")) }],
        from: vec![From {
            table: TableRef::Named { name: ObjectName::single(&child_table), alias: None },
            joins: vec![],
        }],
        filter: Some(Expr::Binary {
            op: BinaryOp::Eq,
            left: Box::new(Expr::Ident(crate::ast::Ident::new(fk_column.as_str()))),
            right: Box::new(Expr::Ident(crate::ast::Ident::new(format!("{parent}.id")))),
            pos: 0,
        }),
        ..Select::empty()
    };

    let subquery_text = crate::ast::gen::generate(&crate::ast::Stmt::Select(inner_select), crate::ast::Dialect::Sqlite);
    let wrapped = format!("(SELECT json_group_array(doc) FROM ({subquery_text}))");
    let alias_name = embed.alias.clone().unwrap_or_else(|| embed.table.clone());

    let item = SelectItem { expr: Expr::Raw(crate::ast::RawSql { text: wrapped, pos: 0 }), alias: Some(crate::ast::Ident::new(alias_name)) };
    Ok(item)
}

fn singularize(table: &str) -> String {
    table.strip_suffix('s').unwrap_or(table).to_string()
}

fn build_filter_tree(query: &QueryParams) -> Result<Option<Expr>, AppError> {
    let mut conditions = Vec::new();
    for (col, raw_value) in query.filter_columns() {
        let (negated, op) = filter::parse_op_value(raw_value)?;
        let lhs = filter::column_to_expr(col);
        conditions.push(filter::to_expr(lhs, negated, op));
    }
    let and_tree = conditions.into_iter().reduce(|a, b| Expr::Binary { op: BinaryOp::And, left: Box::new(a), right: Box::new(b), pos: 0 });

    if let Some(or_expr) = query.get("or") {
        let or_tree = parse_logic_group(or_expr, BinaryOp::Or)?;
        return Ok(Some(and_opt(and_tree, or_tree)));
    }
    if let Some(and_expr) = query.get("and") {
        let extra = parse_logic_group(and_expr, BinaryOp::And)?;
        return Ok(Some(and_opt(and_tree, extra)));
    }
    Ok(and_tree)
}

/// Parses `(col1.op.val,col2.op.val)` logical-group syntax.
fn parse_logic_group(group: &str, joiner: BinaryOp) -> Result<Expr, AppError> {
    let inner = group.strip_prefix('(').and_then(|s| s.strip_suffix(')')).ok_or_else(|| AppError::pgrst("PGRST100", format!("malformed logic group: {group}")))?;
    let mut exprs = Vec::new();
    for part in split_top_level_commas(inner) {
        let (col, op_value) = part.split_once('.').ok_or_else(|| AppError::pgrst("PGRST100", format!("malformed logic condition: {part}")))?;
        let (negated, op) = filter::parse_op_value(op_value)?;
        exprs.push(filter::to_expr(filter::column_to_expr(col), negated, op));
    }
    exprs
        .into_iter()
        .reduce(|a, b| Expr::Binary { op: joiner, left: Box::new(a), right: Box::new(b), pos: 0 })
        .ok_or_else(|| AppError::pgrst("PGRST100", "empty logic group"))
}

fn split_top_level_commas(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
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

fn and_opt(existing: Option<Expr>, extra: Expr) -> Expr {
    match existing {
        Some(e) => Expr::Binary { op: BinaryOp::And, left: Box::new(e), right: Box::new(extra), pos: 0 },
        None => extra,
    }
}

/// Parses `range=a-b` (inclusive, zero-indexed) into `(offset, last_index)`.
/// Also accepts the HTTP `Range` header's `a-b` form once the caller has
/// stripped its `items=` unit prefix.
fn parse_range(spec: &str) -> Option<(i64, i64)> {
    let (a, b) = spec.split_once('-')?;
    let a = a.trim().parse::<i64>().ok()?;
    let b = b.trim().parse::<i64>().ok()?;
    if b < a {
        return None;
    }
    Some((a, b))
}

fn parse_order_by(spec: &str) -> Result<Vec<OrderByExpr>, AppError> {
    spec.split(',')
        .map(|term| {
            let mut parts = term.split('.');
            let col = parts.next().ok_or_else(|| AppError::pgrst("PGRST100", "empty order term"))?;
            let mut asc = None;
            let mut nulls_first = None;
            for modifier in parts {
                match modifier {
                    "asc" => asc = Some(true),
                    "desc" => asc = Some(false),
                    "nullsfirst" => nulls_first = Some(true),
                    "nullslast" => nulls_first = Some(false),
                    other => return Err(AppError::pgrst("PGRST100", format!("unknown order modifier: {other}"))),
                }
            }
            Ok(OrderByExpr { expr: filter::column_to_expr(col), asc, nulls_first })
        })
        .collect()
}

/// Compiles `POST /<table>` (JSON object or array body) into an
/// `Insert`, applying the RLS `CHECK` predicate on conflict-update rows.
pub fn compile_insert(
    table: &str,
    rows: &[serde_json::Map<String, serde_json::Value>],
    on_conflict_columns: Option<Vec<String>>,
    rls: &RlsRegistry,
    auth: &AuthContext,
) -> Result<Insert, AppError> {
    if rows.is_empty() {
        return Err(AppError::pgrst("PGRST100", "empty insert body"));
    }
    let columns: Vec<crate::ast::Ident> = rows[0].keys().map(|k| crate::ast::Ident::new(k.as_str())).collect();
    let mut values = Vec::new();
    for row in rows {
        let mut tuple = Vec::new();
        for col in &columns {
            let v = row.get(&col.value).cloned().unwrap_or(serde_json::Value::Null);
            tuple.push(json_to_expr(&v));
        }
        values.push(tuple);
    }

    let on_conflict = on_conflict_columns.map(|cols| crate::ast::OnConflict::DoUpdate {
        target: Some(crate::ast::ConflictTarget::Columns(cols.iter().map(|c| crate::ast::Ident::new(c.as_str())).collect())),
        assignments: columns
            .iter()
            .map(|c| crate::ast::Assignment { column: c.clone(), value: Expr::Ident(crate::ast::Ident::new(format!("excluded.{}", c.value))) })
            .collect(),
        filter: None,
    });

    if let Some(check) = rls.check_predicate(table, Command::Insert, auth) {
        if matches!(check, Expr::Literal(Literal::Bool(false))) {
            return Err(AppError::permission_denied("new row violates row-level security policy"));
        }
    }

    Ok(Insert {
        table: ObjectName::single(table),
        columns,
        source: InsertSource::Values(values),
        on_conflict,
        returning: vec![SelectItem { expr: Expr::Wildcard, alias: None }],
        pos: 0,
    })
}

/// Compiles `PATCH /<table>?<query>` into an `Update`, folding in both
/// the `USING` (row visibility) and `CHECK` (post-write) predicates.
/// Returns the translated FTS `MATCH` values (if any `fts`/`plfts`/
/// `phfts`/`wfts` filter appears in the query string) alongside the
/// statement, to be bound positionally when it executes.
pub fn compile_update(
    table: &str,
    query: &QueryParams,
    body: &serde_json::Map<String, serde_json::Value>,
    rls: &RlsRegistry,
    auth: &AuthContext,
    fts_lookup: &impl Fn(&str) -> Option<crate::fts::FtsIndex>,
) -> Result<(Update, Vec<String>), AppError> {
    let assignments = body
        .iter()
        .map(|(k, v)| crate::ast::Assignment { column: crate::ast::Ident::new(k), value: json_to_expr(v) })
        .collect();

    let mut params = Vec::new();
    let mut filter = build_filter_tree(query)?;
    if let Some(f) = filter {
        filter = Some(crate::fts::lower_filter_tree(f, fts_lookup, &mut params)?);
    }
    if let Some(using) = rls.using_predicate(table, Command::Update, auth) {
        filter = Some(and_opt(filter, using));
    }

    let update = Update { table: ObjectName::single(table), assignments, filter, returning: vec![SelectItem { expr: Expr::Wildcard, alias: None }], pos: 0 };
    Ok((update, params))
}

/// Compiles `DELETE /<table>?<query>`, returning any translated FTS
/// `MATCH` values alongside the statement (see [`compile_update`]).
pub fn compile_delete(
    table: &str,
    query: &QueryParams,
    rls: &RlsRegistry,
    auth: &AuthContext,
    fts_lookup: &impl Fn(&str) -> Option<crate::fts::FtsIndex>,
) -> Result<(Delete, Vec<String>), AppError> {
    let mut params = Vec::new();
    let mut filter = build_filter_tree(query)?;
    if let Some(f) = filter {
        filter = Some(crate::fts::lower_filter_tree(f, fts_lookup, &mut params)?);
    }
    if let Some(using) = rls.using_predicate(table, Command::Delete, auth) {
        filter = Some(and_opt(filter, using));
    }
    let delete = Delete { table: ObjectName::single(table), filter, returning: vec![SelectItem { expr: Expr::Wildcard, alias: None }], pos: 0 };
    Ok((delete, params))
}

fn json_to_expr(v: &serde_json::Value) -> Expr {
    match v {
        serde_json::Value::Null => Expr::Literal(Literal::Null),
        serde_json::Value::Bool(b) => Expr::Literal(Literal::Bool(*b)),
        serde_json::Value::Number(n) => Expr::Literal(Literal::Number(n.to_string())),
        serde_json::Value::String(s) => Expr::Literal(Literal::String(s.clone())),
        other => Expr::Literal(Literal::String(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_params_with_url_decoding() {
        let q = QueryParams::parse("name=eq.Jo%20Jo&select=id,name");
        assert_eq!(q.get("name"), Some("eq.Jo Jo"));
        assert_eq!(q.get("select"), Some("id,name"));
    }

    fn no_fts_index(_: &str) -> Option<crate::fts::FtsIndex> {
        None
    }

    #[test]
    fn compile_read_applies_deny_by_default_rls() {
        let mut rls = RlsRegistry::new();
        rls.set_enabled("notes", true);
        let auth = AuthContext::anonymous();
        let q = QueryParams::parse("select=id");
        let compiled = compile_read("notes", &q, &Preferences::default(), &rls, &auth, &no_fts_index).unwrap();
        match compiled.select.filter {
            Some(Expr::Literal(Literal::Bool(false))) => {}
            other => panic!("expected deny-by-default filter, got {other:?}"),
        }
    }

    #[test]
    fn compile_read_builds_or_group() {
        let rls = RlsRegistry::new();
        let auth = AuthContext::anonymous();
        let q = QueryParams::parse("or=(id.eq.1,id.eq.2)");
        let compiled = compile_read("notes", &q, &Preferences::default(), &rls, &auth, &no_fts_index).unwrap();
        assert!(matches!(compiled.select.filter, Some(Expr::Binary { op: BinaryOp::Or, .. })));
    }

    #[test]
    fn compile_read_lowers_fts_filter_into_bound_match_param() {
        let rls = RlsRegistry::new();
        let auth = AuthContext::anonymous();
        let q = QueryParams::parse("body=wfts.cat%20-dog");
        let index = crate::fts::FtsIndex {
            table: "articles".to_string(),
            name: "body".to_string(),
            columns: vec!["body".to_string()],
            tokenizer: crate::fts::Tokenizer::Porter,
            pk_column: "id".to_string(),
        };
        let lookup = |col: &str| if col == "body" { Some(index.clone()) } else { None };
        let compiled = compile_read("articles", &q, &Preferences::default(), &rls, &auth, &lookup).unwrap();
        assert_eq!(compiled.params, vec!["cat NOT dog".to_string()]);
        match compiled.select.filter {
            Some(Expr::Raw(raw)) => assert!(raw.text.contains("articles_fts_body")),
            other => panic!("expected lowered fts raw condition, got {other:?}"),
        }
    }

    #[test]
    fn compile_insert_rejects_when_rls_denies_all() {
        let mut rls = RlsRegistry::new();
        rls.set_enabled("notes", true);
        let auth = AuthContext::anonymous();
        let mut row = serde_json::Map::new();
        row.insert("title".to_string(), serde_json::json!("hi"));
        let err = compile_insert("notes", &[row], None, &rls, &auth).unwrap_err();
        assert_eq!(err.code(), "42501");
    }

    #[test]
    fn parse_order_by_reads_modifiers() {
        let order = parse_order_by("name.desc.nullslast").unwrap();
        assert_eq!(order[0].asc, Some(false));
        assert_eq!(order[0].nulls_first, Some(false));
    }

    #[test]
    fn compile_read_embed_emits_no_join() {
        let rls = RlsRegistry::new();
        let auth = AuthContext::anonymous();
        let q = QueryParams::parse("select=name,instruments(name)");
        let compiled = compile_read("orchestral_sections", &q, &Preferences::default(), &rls, &auth, &no_fts_index).unwrap();
        assert!(compiled.select.from[0].joins.is_empty());
        let sql = crate::ast::gen::generate(&crate::ast::Stmt::Select(compiled.select), crate::ast::Dialect::Sqlite);
        assert!(!sql.contains("JOIN"));
        assert!(sql.contains("json_group_array"));
    }

    #[test]
    fn compile_read_inner_embed_filters_empty_children() {
        let rls = RlsRegistry::new();
        let auth = AuthContext::anonymous();
        let q = QueryParams::parse("select=name,instruments!inner(name)");
        let compiled = compile_read("orchestral_sections", &q, &Preferences::default(), &rls, &auth, &no_fts_index).unwrap();
        let sql = crate::ast::gen::generate(&crate::ast::Stmt::Select(compiled.select), crate::ast::Dialect::Sqlite);
        assert!(sql.contains("json_array_length"));
        assert!(sql.contains("> 0"));
    }

    #[test]
    fn compile_read_range_sets_limit_and_offset() {
        let rls = RlsRegistry::new();
        let auth = AuthContext::anonymous();
        let q = QueryParams::parse("range=2-5");
        let compiled = compile_read("notes", &q, &Preferences::default(), &rls, &auth, &no_fts_index).unwrap();
        assert_eq!(compiled.offset, 2);
        match compiled.select.limit {
            Some(Expr::Literal(Literal::Number(n))) => assert_eq!(n, "4"),
            other => panic!("expected limit literal, got {other:?}"),
        }
        match compiled.select.offset {
            Some(Expr::Literal(Literal::Number(n))) => assert_eq!(n, "2"),
            other => panic!("expected offset literal, got {other:?}"),
        }
    }
}
