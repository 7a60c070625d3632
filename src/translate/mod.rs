//! C3: the PG → SQLite dialect translator. Rewrites a parsed AST in
//! place before generation, dropping what SQLite can emulate and
//! refusing (with a fallback) what it structurally cannot.

pub mod types;
pub mod uuid_gen;

use crate::ast::*;

/// Output of a single translation pass over one statement.
pub struct Translated {
    pub stmt: Stmt,
    /// `false` when a hard blocker was found; `stmt` is then the
    /// original, untouched input and the caller should surface
    /// `42883`/`42P01` or forward the statement to SQLite verbatim.
    pub translated: bool,
    pub blocker_reason: Option<String>,
    /// Columns of a `CREATE TABLE` whose `DEFAULT gen_random_uuid()` was
    /// stripped from the DDL; the registry records `default_value =
    /// 'gen_random_uuid()'` for each so inserts missing the column get
    /// the UUID injected by the REST/wire layer.
    pub stripped_uuid_defaults: Vec<String>,
}

/// Implements `TranslateWithFallback` from spec.md §4.2: checks hard
/// blockers first, then runs the rewrite pass.
pub fn translate_with_fallback(stmt: Stmt) -> Translated {
    if let Some(reason) = hard_blocker_reason(&stmt) {
        return Translated { stmt, translated: false, blocker_reason: Some(reason), stripped_uuid_defaults: vec![] };
    }
    let mut stripped = Vec::new();
    let stmt = rewrite_stmt(stmt, &mut stripped);
    Translated { stmt, translated: true, blocker_reason: None, stripped_uuid_defaults: stripped }
}

// ---------------------------------------------------------------------
// Hard blocker detection
// ---------------------------------------------------------------------

/// PG array/range operators SQLite cannot express relationally.
fn is_blocked_binary_op(op: BinaryOp) -> bool {
    matches!(op, BinaryOp::Contains | BinaryOp::ContainedBy | BinaryOp::Overlap)
}

fn hard_blocker_reason(stmt: &Stmt) -> Option<String> {
    match stmt {
        Stmt::Select(s) => blocker_in_select(s),
        Stmt::Insert(i) => match &i.source {
            InsertSource::Select(s) => blocker_in_select(s),
            InsertSource::Values(rows) => rows.iter().flatten().find_map(blocker_in_expr),
        },
        Stmt::Update(u) => u.filter.as_ref().and_then(blocker_in_expr).or_else(|| {
            u.assignments.iter().find_map(|a| blocker_in_expr(&a.value))
        }),
        Stmt::Delete(d) => d.filter.as_ref().and_then(blocker_in_expr),
        Stmt::Raw(r) => blocker_in_raw_text(&r.text),
        Stmt::CreateTable(_) | Stmt::CreateFunction(_) | Stmt::Drop(_) => None,
    }
}

fn blocker_in_select(s: &Select) -> Option<String> {
    if let Some(reason) = s.columns.iter().find_map(|c| blocker_in_expr(&c.expr)) {
        return Some(reason);
    }
    for from in &s.from {
        if let Some(r) = blocker_in_table_ref(&from.table) {
            return Some(r);
        }
        for join in &from.joins {
            if let Some(r) = blocker_in_table_ref(&join.table) {
                return Some(r);
            }
            if let Some(on) = &join.on {
                if let Some(r) = blocker_in_expr(on) {
                    return Some(r);
                }
            }
        }
    }
    if let Some(r) = s.filter.as_ref().and_then(blocker_in_expr) {
        return Some(r);
    }
    if let Some(r) = s.group_by.iter().find_map(blocker_in_expr) {
        return Some(r);
    }
    if let Some(r) = s.having.as_ref().and_then(blocker_in_expr) {
        return Some(r);
    }
    if let Some((_, rest)) = &s.union {
        if let Some(r) = blocker_in_select(rest) {
            return Some(r);
        }
    }
    if let Some(with) = &s.with {
        for cte in &with.ctes {
            if let Some(r) = blocker_in_select(&cte.query) {
                return Some(r);
            }
        }
    }
    None
}

fn blocker_in_table_ref(t: &TableRef) -> Option<String> {
    match t {
        TableRef::Derived { subquery, .. } => blocker_in_select(subquery),
        TableRef::Named { .. } => None,
        TableRef::Raw(r) => blocker_in_raw_text(&r.text),
    }
}

fn blocker_in_raw_text(text: &str) -> Option<String> {
    let upper = text.to_ascii_uppercase();
    for marker in ["FOR UPDATE", "FOR SHARE", "LATERAL", "WINDOW "] {
        if upper.contains(marker) {
            return Some(format!("unparsed text contains hard blocker {marker}"));
        }
    }
    None
}

fn blocker_in_expr(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Binary { op, left, right, .. } => {
            if is_blocked_binary_op(*op) {
                return Some(format!("PG array/range operator {:?} has no SQLite equivalent", op));
            }
            blocker_in_expr(left).or_else(|| blocker_in_expr(right))
        }
        Expr::Unary { expr, .. } => blocker_in_expr(expr),
        Expr::Function(call) => {
            if call.name.last().eq_ci("array_agg") && !call.order_by.is_empty() {
                return Some("ARRAY_AGG with inline ORDER BY is not supported".to_string());
            }
            call.args.iter().find_map(blocker_in_expr)
        }
        Expr::Cast { expr, .. } => blocker_in_expr(expr),
        Expr::JsonAccess { expr, path, .. } => blocker_in_expr(expr).or_else(|| blocker_in_expr(path)),
        Expr::Case { operand, whens, else_result, .. } => operand
            .as_deref()
            .and_then(blocker_in_expr)
            .or_else(|| whens.iter().find_map(|w| blocker_in_expr(&w.condition).or_else(|| blocker_in_expr(&w.result))))
            .or_else(|| else_result.as_deref().and_then(blocker_in_expr)),
        Expr::Between { expr, low, high, .. } => {
            blocker_in_expr(expr).or_else(|| blocker_in_expr(low)).or_else(|| blocker_in_expr(high))
        }
        Expr::InList { expr, list, .. } => blocker_in_expr(expr).or_else(|| list.iter().find_map(blocker_in_expr)),
        Expr::InSubquery { expr, subquery, .. } => blocker_in_expr(expr).or_else(|| blocker_in_select(subquery)),
        Expr::IsNull { expr, .. } | Expr::IsBool { expr, .. } => blocker_in_expr(expr),
        Expr::Exists { subquery, .. } => blocker_in_select(subquery),
        Expr::Extract { expr, .. } => blocker_in_expr(expr),
        Expr::ArrayLiteral { elements, .. } => elements.iter().find_map(blocker_in_expr),
        Expr::ArraySubscript { expr, index, .. } => blocker_in_expr(expr).or_else(|| blocker_in_expr(index)),
        Expr::Subquery(s) => blocker_in_select(s),
        Expr::Paren(e) => blocker_in_expr(e),
        Expr::Raw(r) => blocker_in_raw_text(&r.text),
        Expr::Ident(_)
        | Expr::CompoundIdent(_)
        | Expr::Literal(_)
        | Expr::Interval { .. }
        | Expr::Wildcard
        | Expr::QualifiedWildcard(_)
        | Expr::Placeholder(_) => None,
    }
}

// ---------------------------------------------------------------------
// Rewrite pass
// ---------------------------------------------------------------------

fn rewrite_stmt(stmt: Stmt, stripped: &mut Vec<String>) -> Stmt {
    match stmt {
        Stmt::Select(s) => Stmt::Select(rewrite_select(s)),
        Stmt::Insert(mut i) => {
            i.source = match i.source {
                InsertSource::Values(rows) => InsertSource::Values(
                    rows.into_iter().map(|row| row.into_iter().map(rewrite_expr).collect()).collect(),
                ),
                InsertSource::Select(s) => InsertSource::Select(Box::new(rewrite_select(*s))),
            };
            i.on_conflict = i.on_conflict.map(rewrite_on_conflict);
            i.returning = i.returning.into_iter().map(rewrite_select_item).collect();
            Stmt::Insert(i)
        }
        Stmt::Update(mut u) => {
            u.assignments = u.assignments.into_iter().map(|a| Assignment { column: a.column, value: rewrite_expr(a.value) }).collect();
            u.filter = u.filter.map(rewrite_expr);
            u.returning = u.returning.into_iter().map(rewrite_select_item).collect();
            Stmt::Update(u)
        }
        Stmt::Delete(mut d) => {
            d.filter = d.filter.map(rewrite_expr);
            d.returning = d.returning.into_iter().map(rewrite_select_item).collect();
            Stmt::Delete(d)
        }
        Stmt::CreateTable(c) => Stmt::CreateTable(rewrite_create_table(c, stripped)),
        Stmt::CreateFunction(f) => Stmt::CreateFunction(f),
        other @ (Stmt::Drop(_) | Stmt::Raw(_)) => other,
    }
}

fn rewrite_on_conflict(oc: OnConflict) -> OnConflict {
    match oc {
        OnConflict::DoNothing { target } => OnConflict::DoNothing { target },
        OnConflict::DoUpdate { target, assignments, filter } => OnConflict::DoUpdate {
            target,
            assignments: assignments.into_iter().map(|a| Assignment { column: a.column, value: rewrite_expr(a.value) }).collect(),
            filter: filter.map(rewrite_expr),
        },
    }
}

fn rewrite_select_item(item: SelectItem) -> SelectItem {
    SelectItem { expr: rewrite_expr(item.expr), alias: item.alias }
}

fn rewrite_select(mut s: Select) -> Select {
    s.columns = s.columns.into_iter().map(rewrite_select_item).collect();
    s.from = s
        .from
        .into_iter()
        .map(|from| From {
            table: rewrite_table_ref(from.table),
            joins: from
                .joins
                .into_iter()
                .map(|j| Join { kind: j.kind, table: rewrite_table_ref(j.table), on: j.on.map(rewrite_expr) })
                .collect(),
        })
        .collect();
    s.filter = s.filter.map(rewrite_expr);
    s.group_by = s.group_by.into_iter().map(rewrite_expr).collect();
    s.having = s.having.map(rewrite_expr);
    s.order_by = s
        .order_by
        .into_iter()
        .map(|ob| OrderByExpr { expr: rewrite_expr(ob.expr), asc: ob.asc, nulls_first: ob.nulls_first })
        .collect();
    s.limit = s.limit.map(rewrite_expr);
    s.offset = s.offset.map(rewrite_expr);
    s.union = s.union.map(|(op, rest)| (op, Box::new(rewrite_select(*rest))));
    if let Some(with) = s.with {
        s.with = Some(WithClause {
            recursive: with.recursive,
            ctes: with
                .ctes
                .into_iter()
                .map(|cte| CommonTableExpr { name: cte.name, columns: cte.columns, query: Box::new(rewrite_select(*cte.query)) })
                .collect(),
        });
    }
    s
}

fn rewrite_table_ref(t: TableRef) -> TableRef {
    match t {
        TableRef::Derived { subquery, alias } => TableRef::Derived { subquery: Box::new(rewrite_select(*subquery)), alias },
        other => other,
    }
}

fn rewrite_create_table(mut c: CreateTable, stripped: &mut Vec<String>) -> CreateTable {
    for col in &mut c.columns {
        col.type_name = types::ddl_type_for(&col.type_name, false);
        col.type_args = vec![];
        if let Some(default) = &col.default {
            if is_gen_random_uuid_call(default) {
                stripped.push(col.name.value.clone());
                col.default = None;
                continue;
            }
        }
        col.default = col.default.take().map(rewrite_expr);
        col.check = col.check.take().map(rewrite_expr);
    }
    c
}

fn is_gen_random_uuid_call(expr: &Expr) -> bool {
    matches!(expr, Expr::Function(f) if f.name.last().eq_ci("gen_random_uuid") && f.args.is_empty())
}

/// Rewrites a single expression node per spec.md §4.2. Recurses
/// bottom-up so nested casts/functions/JSON paths are all normalized.
fn rewrite_expr(expr: Expr) -> Expr {
    match expr {
        Expr::Cast { expr, type_name, was_double_colon, pos } => {
            let inner = rewrite_expr(*expr);
            if types::cast_is_droppable(&type_name) {
                inner
            } else {
                Expr::Cast { expr: Box::new(inner), type_name, was_double_colon, pos }
            }
        }
        Expr::Literal(Literal::Bool(b)) => Expr::Literal(Literal::Number(if b { "1".to_string() } else { "0".to_string() })),
        Expr::Binary { op, left, right, pos } => {
            let left = rewrite_expr(*left);
            let right = rewrite_expr(*right);
            match op {
                BinaryOp::JsonArrow => json_extract_call(left, right, pos),
                BinaryOp::JsonArrowText => Expr::Cast {
                    expr: Box::new(json_extract_call(left, right, pos)),
                    type_name: "TEXT".to_string(),
                    was_double_colon: false,
                    pos,
                },
                _ => Expr::Binary { op, left: Box::new(left), right: Box::new(right), pos },
            }
        }
        Expr::JsonAccess { expr, path, as_text, pos } => {
            let extracted = json_extract_call(rewrite_expr(*expr), rewrite_expr(*path), pos);
            if as_text {
                Expr::Cast { expr: Box::new(extracted), type_name: "TEXT".to_string(), was_double_colon: false, pos }
            } else {
                extracted
            }
        }
        Expr::Function(call) => rewrite_function(call),
        Expr::Ident(ref id) if id.eq_ci("current_timestamp") => {
            simple_call("datetime", vec![Expr::Literal(Literal::String("now".to_string()))], id.pos)
        }
        Expr::Ident(ref id) if id.eq_ci("current_date") => {
            simple_call("date", vec![Expr::Literal(Literal::String("now".to_string()))], id.pos)
        }
        Expr::Unary { op, expr, pos } => Expr::Unary { op, expr: Box::new(rewrite_expr(*expr)), pos },
        Expr::Case { operand, whens, else_result, pos } => Expr::Case {
            operand: operand.map(|o| Box::new(rewrite_expr(*o))),
            whens: whens
                .into_iter()
                .map(|w| CaseWhen { condition: Box::new(rewrite_expr(*w.condition)), result: Box::new(rewrite_expr(*w.result)) })
                .collect(),
            else_result: else_result.map(|e| Box::new(rewrite_expr(*e))),
            pos,
        },
        Expr::Between { expr, negated, low, high, pos } => Expr::Between {
            expr: Box::new(rewrite_expr(*expr)),
            negated,
            low: Box::new(rewrite_expr(*low)),
            high: Box::new(rewrite_expr(*high)),
            pos,
        },
        Expr::InList { expr, negated, list, pos } => Expr::InList {
            expr: Box::new(rewrite_expr(*expr)),
            negated,
            list: list.into_iter().map(rewrite_expr).collect(),
            pos,
        },
        Expr::InSubquery { expr, negated, subquery, pos } => {
            Expr::InSubquery { expr: Box::new(rewrite_expr(*expr)), negated, subquery: Box::new(rewrite_select(*subquery)), pos }
        }
        Expr::IsNull { expr, negated, pos } => Expr::IsNull { expr: Box::new(rewrite_expr(*expr)), negated, pos },
        Expr::IsBool { expr, value, negated, pos } => Expr::IsBool { expr: Box::new(rewrite_expr(*expr)), value, negated, pos },
        Expr::Exists { negated, subquery, pos } => Expr::Exists { negated, subquery: Box::new(rewrite_select(*subquery)), pos },
        Expr::Extract { field, expr, pos } => {
            let inner = rewrite_expr(*expr);
            match types::extract_field_to_strftime(&field) {
                Some(fmt) => Expr::Cast {
                    expr: Box::new(Expr::Function(FunctionCall {
                        name: ObjectName::single("strftime"),
                        args: vec![Expr::Literal(Literal::String(fmt.to_string())), inner],
                        distinct: false,
                        star: false,
                        order_by: vec![],
                        pos,
                    })),
                    type_name: "INTEGER".to_string(),
                    was_double_colon: false,
                    pos,
                },
                None => Expr::Extract { field, expr: Box::new(inner), pos },
            }
        }
        Expr::ArrayLiteral { elements, pos } => Expr::ArrayLiteral { elements: elements.into_iter().map(rewrite_expr).collect(), pos },
        Expr::ArraySubscript { expr, index, pos } => {
            Expr::ArraySubscript { expr: Box::new(rewrite_expr(*expr)), index: Box::new(rewrite_expr(*index)), pos }
        }
        Expr::Subquery(s) => Expr::Subquery(Box::new(rewrite_select(*s))),
        Expr::Paren(e) => Expr::Paren(Box::new(rewrite_expr(*e))),
        other @ (Expr::Ident(_)
        | Expr::CompoundIdent(_)
        | Expr::Literal(_)
        | Expr::Interval { .. }
        | Expr::Wildcard
        | Expr::QualifiedWildcard(_)
        | Expr::Placeholder(_)
        | Expr::Raw(_)) => other,
    }
}

fn json_extract_call(target: Expr, key: Expr, pos: usize) -> Expr {
    let path = json_path_literal(&key);
    Expr::Function(FunctionCall {
        name: ObjectName::single("json_extract"),
        args: vec![target, path],
        distinct: false,
        star: false,
        order_by: vec![],
        pos,
    })
}

/// `'k'` becomes `'$.k'`; a numeric key becomes `'$[n]'` (spec.md §4.2).
fn json_path_literal(key: &Expr) -> Expr {
    match key {
        Expr::Literal(Literal::String(s)) => Expr::Literal(Literal::String(format!("$.{s}"))),
        Expr::Literal(Literal::Number(n)) => Expr::Literal(Literal::String(format!("$[{n}]"))),
        other => other.clone(),
    }
}

fn rewrite_function(mut call: FunctionCall) -> Expr {
    call.args = call.args.into_iter().map(rewrite_expr).collect();
    let name = call.name.last().value.to_ascii_lowercase();
    let pos = call.pos;
    match name.as_str() {
        "now" => Expr::Function(FunctionCall { name: ObjectName::single("datetime"), args: vec![Expr::Literal(Literal::String("now".to_string()))], ..call }),
        "gen_random_uuid" => Expr::Paren(Box::new(Expr::Raw(RawSql { text: uuid_gen::v4_uuid_sql(), pos }))),
        "left" if call.args.len() == 2 => {
            let mut args = call.args;
            let n = args.pop().unwrap();
            let x = args.pop().unwrap();
            simple_call("SUBSTR", vec![x, Expr::Literal(Literal::Number("1".to_string())), n], pos)
        }
        "right" if call.args.len() == 2 => {
            let mut args = call.args;
            let n = args.pop().unwrap();
            let x = args.pop().unwrap();
            let neg_n = Expr::Unary { op: UnaryOp::Neg, expr: Box::new(n), pos };
            simple_call("SUBSTR", vec![x, neg_n], pos)
        }
        "position" if call.args.len() == 2 => {
            let mut args = call.args;
            let b = args.pop().unwrap();
            let a = args.pop().unwrap();
            simple_call("INSTR", vec![b, a], pos)
        }
        _ => Expr::Function(call),
    }
}

fn simple_call(name: &str, args: Vec<Expr>, pos: usize) -> Expr {
    Expr::Function(FunctionCall { name: ObjectName::single(name), args, distinct: false, star: false, order_by: vec![], pos })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn translate_sql(sql: &str) -> (Stmt, bool) {
        let (mut stmts, warnings) = parse(sql).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        let t = translate_with_fallback(stmts.remove(0));
        (t.stmt, t.translated)
    }

    #[test]
    fn drops_droppable_cast() {
        let (stmt, ok) = translate_sql("SELECT id::text FROM users");
        assert!(ok);
        let Stmt::Select(s) = stmt else { panic!() };
        assert!(matches!(s.columns[0].expr, Expr::Ident(_)));
    }

    #[test]
    fn keeps_unknown_cast() {
        let (stmt, ok) = translate_sql("SELECT id::inet FROM users");
        assert!(ok);
        let Stmt::Select(s) = stmt else { panic!() };
        assert!(matches!(s.columns[0].expr, Expr::Cast { .. }));
    }

    #[test]
    fn rewrites_now_to_datetime() {
        let (stmt, ok) = translate_sql("SELECT NOW()");
        assert!(ok);
        let Stmt::Select(s) = stmt else { panic!() };
        match &s.columns[0].expr {
            Expr::Function(f) => assert_eq!(f.name.last().value, "datetime"),
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn seed_scenario_1_matches_exact_expected_sql() {
        let (stmt, ok) = translate_sql("SELECT id::text, LEFT(name,10), created_at FROM users WHERE updated_at > NOW()");
        assert!(ok);
        let sql = crate::ast::gen::generate(&stmt, crate::ast::Dialect::Sqlite);
        assert_eq!(sql, "SELECT id, SUBSTR(name, 1, 10), created_at FROM users WHERE updated_at > datetime('now')");
    }

    #[test]
    fn rewrites_json_arrow_to_json_extract() {
        let (stmt, ok) = translate_sql("SELECT addr->'postcode' FROM users");
        assert!(ok);
        let Stmt::Select(s) = stmt else { panic!() };
        match &s.columns[0].expr {
            Expr::Function(f) => {
                assert_eq!(f.name.last().value, "json_extract");
                assert!(matches!(&f.args[1], Expr::Literal(Literal::String(p)) if p == "$.postcode"));
            }
            _ => panic!("expected json_extract call"),
        }
    }

    #[test]
    fn strips_uuid_default_and_records_column() {
        let (mut stmts, warnings) = parse("CREATE TABLE t (id UUID PRIMARY KEY DEFAULT gen_random_uuid())").unwrap();
        assert!(warnings.is_empty());
        let t = translate_with_fallback(stmts.remove(0));
        assert!(t.translated);
        assert_eq!(t.stripped_uuid_defaults, vec!["id".to_string()]);
        let Stmt::CreateTable(c) = t.stmt else { panic!() };
        assert!(c.columns[0].default.is_none());
        assert_eq!(c.columns[0].type_name, "TEXT");
    }

    #[test]
    fn blocks_contains_operator() {
        let (mut stmts, warnings) = parse("SELECT * FROM t WHERE tags @> ARRAY['a']").unwrap();
        assert!(warnings.is_empty());
        let t = translate_with_fallback(stmts.remove(0));
        assert!(!t.translated);
        assert!(t.blocker_reason.is_some());
    }
}
