//! The generator half of C1: traverses the AST and emits SQL text under
//! a dialect parameter. Dialect-specific *rewriting* (type casts dropped,
//! `NOW()` → `datetime('now')`, etc.) happens earlier, in `translate`;
//! this module only controls surface syntax that differs even for an
//! already-dialect-appropriate AST (quoting style, `CAST` spelling).

use crate::ast::*;
use std::fmt::Write;

pub fn generate(stmt: &Stmt, dialect: Dialect) -> String {
    let mut out = String::new();
    write_stmt(&mut out, stmt, dialect);
    out
}

pub fn generate_expr(expr: &Expr, dialect: Dialect) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr, dialect);
    out
}

fn quote_ident(out: &mut String, ident: &Ident) {
    if ident.quoted {
        let _ = write!(out, "\"{}\"", ident.value.replace('"', "\"\""));
    } else {
        out.push_str(&ident.value);
    }
}

fn write_object_name(out: &mut String, name: &ObjectName) {
    for (i, part) in name.0.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        quote_ident(out, part);
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, dialect: Dialect) {
    match stmt {
        Stmt::Select(s) => write_select(out, s, dialect),
        Stmt::Insert(i) => write_insert(out, i, dialect),
        Stmt::Update(u) => write_update(out, u, dialect),
        Stmt::Delete(d) => write_delete(out, d, dialect),
        Stmt::CreateTable(c) => write_create_table(out, c, dialect),
        Stmt::CreateFunction(f) => write_create_function(out, f),
        Stmt::Drop(d) => write_drop(out, d),
        Stmt::Raw(r) => out.push_str(&r.text),
    }
}

fn write_select(out: &mut String, s: &Select, dialect: Dialect) {
    if let Some(with) = &s.with {
        out.push_str("WITH ");
        if with.recursive {
            out.push_str("RECURSIVE ");
        }
        for (i, cte) in with.ctes.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            quote_ident(out, &cte.name);
            if !cte.columns.is_empty() {
                out.push('(');
                for (j, c) in cte.columns.iter().enumerate() {
                    if j > 0 {
                        out.push_str(", ");
                    }
                    quote_ident(out, c);
                }
                out.push(')');
            }
            out.push_str(" AS (");
            write_select(out, &cte.query, dialect);
            out.push(')');
        }
        out.push(' ');
    }

    out.push_str("SELECT ");
    if s.distinct {
        out.push_str("DISTINCT ");
    }
    for (i, item) in s.columns.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, &item.expr, dialect);
        if let Some(alias) = &item.alias {
            out.push_str(" AS ");
            quote_ident(out, alias);
        }
    }

    if !s.from.is_empty() {
        out.push_str(" FROM ");
        for (i, from) in s.from.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_table_ref(out, &from.table, dialect);
            for join in &from.joins {
                out.push(' ');
                out.push_str(match join.kind {
                    JoinKind::Inner => "JOIN",
                    JoinKind::Left => "LEFT JOIN",
                    JoinKind::Right => "RIGHT JOIN",
                    JoinKind::Full => "FULL JOIN",
                    JoinKind::Cross => "CROSS JOIN",
                });
                out.push(' ');
                write_table_ref(out, &join.table, dialect);
                if let Some(on) = &join.on {
                    out.push_str(" ON ");
                    write_expr(out, on, dialect);
                }
            }
        }
    }

    if let Some(filter) = &s.filter {
        out.push_str(" WHERE ");
        write_expr(out, filter, dialect);
    }

    if !s.group_by.is_empty() {
        out.push_str(" GROUP BY ");
        for (i, e) in s.group_by.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_expr(out, e, dialect);
        }
    }

    if let Some(having) = &s.having {
        out.push_str(" HAVING ");
        write_expr(out, having, dialect);
    }

    if !s.order_by.is_empty() {
        out.push_str(" ORDER BY ");
        write_order_by(out, &s.order_by, dialect);
    }

    if let Some(limit) = &s.limit {
        out.push_str(" LIMIT ");
        write_expr(out, limit, dialect);
    }
    if let Some(offset) = &s.offset {
        out.push_str(" OFFSET ");
        write_expr(out, offset, dialect);
    }

    if let Some((op, rest)) = &s.union {
        out.push(' ');
        out.push_str(match op {
            SetOp::Union { all: true } => "UNION ALL",
            SetOp::Union { all: false } => "UNION",
            SetOp::Intersect => "INTERSECT",
            SetOp::Except => "EXCEPT",
        });
        out.push(' ');
        write_select(out, rest, dialect);
    }
}

fn write_order_by(out: &mut String, items: &[OrderByExpr], dialect: Dialect) {
    for (i, ob) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, &ob.expr, dialect);
        match ob.asc {
            Some(true) => out.push_str(" ASC"),
            Some(false) => out.push_str(" DESC"),
            None => {}
        }
        match ob.nulls_first {
            Some(true) => out.push_str(" NULLS FIRST"),
            Some(false) => out.push_str(" NULLS LAST"),
            None => {}
        }
    }
}

fn write_table_ref(out: &mut String, t: &TableRef, dialect: Dialect) {
    match t {
        TableRef::Named { name, alias } => {
            write_object_name(out, name);
            if let Some(a) = alias {
                out.push_str(" AS ");
                quote_ident(out, a);
            }
        }
        TableRef::Derived { subquery, alias } => {
            out.push('(');
            write_select(out, subquery, dialect);
            out.push_str(") AS ");
            quote_ident(out, alias);
        }
        TableRef::Raw(r) => out.push_str(&r.text),
    }
}

fn write_insert(out: &mut String, i: &Insert, dialect: Dialect) {
    out.push_str("INSERT INTO ");
    write_object_name(out, &i.table);
    if !i.columns.is_empty() {
        out.push_str(" (");
        for (idx, c) in i.columns.iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            quote_ident(out, c);
        }
        out.push(')');
    }
    match &i.source {
        InsertSource::Values(rows) => {
            out.push_str(" VALUES ");
            for (r, row) in rows.iter().enumerate() {
                if r > 0 {
                    out.push_str(", ");
                }
                out.push('(');
                for (c, expr) in row.iter().enumerate() {
                    if c > 0 {
                        out.push_str(", ");
                    }
                    write_expr(out, expr, dialect);
                }
                out.push(')');
            }
        }
        InsertSource::Select(sel) => {
            out.push(' ');
            write_select(out, sel, dialect);
        }
    }
    if let Some(oc) = &i.on_conflict {
        write_on_conflict(out, oc, dialect);
    }
    write_returning(out, &i.returning, dialect);
}

fn write_on_conflict(out: &mut String, oc: &OnConflict, dialect: Dialect) {
    out.push_str(" ON CONFLICT");
    let target = match oc {
        OnConflict::DoNothing { target } => target,
        OnConflict::DoUpdate { target, .. } => target,
    };
    match target {
        Some(ConflictTarget::Columns(cols)) => {
            out.push_str(" (");
            for (i, c) in cols.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                quote_ident(out, c);
            }
            out.push(')');
        }
        Some(ConflictTarget::Constraint(name)) => {
            out.push_str(" ON CONSTRAINT ");
            quote_ident(out, name);
        }
        None => {}
    }
    match oc {
        OnConflict::DoNothing { .. } => out.push_str(" DO NOTHING"),
        OnConflict::DoUpdate { assignments, filter, .. } => {
            out.push_str(" DO UPDATE SET ");
            for (i, a) in assignments.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                quote_ident(out, &a.column);
                out.push_str(" = ");
                write_expr(out, &a.value, dialect);
            }
            if let Some(f) = filter {
                out.push_str(" WHERE ");
                write_expr(out, f, dialect);
            }
        }
    }
}

fn write_returning(out: &mut String, returning: &[SelectItem], dialect: Dialect) {
    if returning.is_empty() {
        return;
    }
    out.push_str(" RETURNING ");
    for (i, item) in returning.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, &item.expr, dialect);
        if let Some(alias) = &item.alias {
            out.push_str(" AS ");
            quote_ident(out, alias);
        }
    }
}

fn write_update(out: &mut String, u: &Update, dialect: Dialect) {
    out.push_str("UPDATE ");
    write_object_name(out, &u.table);
    out.push_str(" SET ");
    for (i, a) in u.assignments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        quote_ident(out, &a.column);
        out.push_str(" = ");
        write_expr(out, &a.value, dialect);
    }
    if let Some(f) = &u.filter {
        out.push_str(" WHERE ");
        write_expr(out, f, dialect);
    }
    write_returning(out, &u.returning, dialect);
}

fn write_delete(out: &mut String, d: &Delete, dialect: Dialect) {
    out.push_str("DELETE FROM ");
    write_object_name(out, &d.table);
    if let Some(f) = &d.filter {
        out.push_str(" WHERE ");
        write_expr(out, f, dialect);
    }
    write_returning(out, &d.returning, dialect);
}

fn write_create_table(out: &mut String, c: &CreateTable, dialect: Dialect) {
    out.push_str("CREATE TABLE ");
    if c.if_not_exists {
        out.push_str("IF NOT EXISTS ");
    }
    write_object_name(out, &c.name);
    out.push_str(" (");
    let mut first = true;
    for col in &c.columns {
        if !first {
            out.push_str(", ");
        }
        first = false;
        quote_ident(out, &col.name);
        out.push(' ');
        out.push_str(&col.type_name);
        if !col.type_args.is_empty() {
            out.push('(');
            out.push_str(&col.type_args.join(", "));
            out.push(')');
        }
        if col.primary_key {
            out.push_str(" PRIMARY KEY");
        }
        if !col.nullable {
            out.push_str(" NOT NULL");
        }
        if col.unique {
            out.push_str(" UNIQUE");
        }
        if let Some(default) = &col.default {
            out.push_str(" DEFAULT ");
            write_expr(out, default, dialect);
        }
        if let Some(check) = &col.check {
            out.push_str(" CHECK (");
            write_expr(out, check, dialect);
            out.push(')');
        }
        if let Some(generated) = &col.generated_identity {
            let _ = write!(out, " GENERATED {} AS IDENTITY", generated);
        }
        if let Some((ref_table, ref_col)) = &col.references {
            out.push_str(" REFERENCES ");
            write_object_name(out, ref_table);
            if let Some(rc) = ref_col {
                out.push('(');
                quote_ident(out, rc);
                out.push(')');
            }
        }
    }
    for constraint in &c.constraints {
        if !first {
            out.push_str(", ");
        }
        first = false;
        write_table_constraint(out, constraint, dialect);
    }
    out.push(')');
}

fn write_table_constraint(out: &mut String, tc: &TableConstraint, dialect: Dialect) {
    match tc {
        TableConstraint::PrimaryKey { name, columns } => {
            write_constraint_name(out, name);
            out.push_str("PRIMARY KEY (");
            write_idents(out, columns);
            out.push(')');
        }
        TableConstraint::Unique { name, columns } => {
            write_constraint_name(out, name);
            out.push_str("UNIQUE (");
            write_idents(out, columns);
            out.push(')');
        }
        TableConstraint::ForeignKey { name, columns, foreign_table, foreign_columns, on_delete, on_update } => {
            write_constraint_name(out, name);
            out.push_str("FOREIGN KEY (");
            write_idents(out, columns);
            out.push_str(") REFERENCES ");
            write_object_name(out, foreign_table);
            out.push('(');
            write_idents(out, foreign_columns);
            out.push(')');
            if let Some(od) = on_delete {
                let _ = write!(out, " ON DELETE {}", od);
            }
            if let Some(ou) = on_update {
                let _ = write!(out, " ON UPDATE {}", ou);
            }
        }
        TableConstraint::Check { name, expr } => {
            write_constraint_name(out, name);
            out.push_str("CHECK (");
            write_expr(out, expr, dialect);
            out.push(')');
        }
    }
}

fn write_constraint_name(out: &mut String, name: &Option<Ident>) {
    if let Some(n) = name {
        out.push_str("CONSTRAINT ");
        quote_ident(out, n);
        out.push(' ');
    }
}

fn write_idents(out: &mut String, idents: &[Ident]) {
    for (i, id) in idents.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        quote_ident(out, id);
    }
}

fn write_create_function(out: &mut String, f: &CreateFunction) {
    out.push_str("CREATE ");
    if f.or_replace {
        out.push_str("OR REPLACE ");
    }
    out.push_str("FUNCTION ");
    write_object_name(out, &f.name);
    out.push('(');
    for (i, arg) in f.args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} {}", arg.name, arg.type_name);
        if let Some(d) = &arg.default {
            out.push_str(" DEFAULT ");
            write_expr(out, d, Dialect::Postgres);
        }
    }
    out.push(')');
    match &f.returns {
        ReturnType::Scalar(t) => {
            let _ = write!(out, " RETURNS {}", t);
        }
        ReturnType::SetOf(t) => {
            let _ = write!(out, " RETURNS SETOF {}", t);
        }
        ReturnType::Table(cols) => {
            out.push_str(" RETURNS TABLE(");
            for (i, (n, t)) in cols.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{} {}", n.value, t);
            }
            out.push(')');
        }
    }
    let _ = write!(out, " LANGUAGE {}", f.language);
    out.push_str(match f.volatility {
        Volatility::Volatile => " VOLATILE",
        Volatility::Stable => " STABLE",
        Volatility::Immutable => " IMMUTABLE",
    });
    out.push_str(match f.security {
        Security::Invoker => " SECURITY INVOKER",
        Security::Definer => " SECURITY DEFINER",
    });
    out.push_str(" AS $$");
    out.push_str(&f.body.text);
    out.push_str("$$");
}

fn write_drop(out: &mut String, d: &Drop) {
    out.push_str("DROP ");
    out.push_str(match d.kind {
        DropKind::Table => "TABLE",
        DropKind::Function => "FUNCTION",
        DropKind::Index => "INDEX",
        DropKind::View => "VIEW",
    });
    out.push(' ');
    if d.if_exists {
        out.push_str("IF EXISTS ");
    }
    for (i, name) in d.names.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_object_name(out, name);
    }
    if d.cascade {
        out.push_str(" CASCADE");
    }
}

fn write_expr(out: &mut String, expr: &Expr, dialect: Dialect) {
    match expr {
        Expr::Ident(id) => quote_ident(out, id),
        Expr::CompoundIdent(parts) => {
            for (i, p) in parts.iter().enumerate() {
                if i > 0 {
                    out.push('.');
                }
                quote_ident(out, p);
            }
        }
        Expr::Literal(lit) => write_literal(out, lit),
        Expr::Unary { op, expr, .. } => {
            match op {
                UnaryOp::Not => out.push_str("NOT "),
                UnaryOp::Neg => out.push('-'),
                UnaryOp::Plus => out.push('+'),
            }
            write_expr(out, expr, dialect);
        }
        Expr::Binary { op, left, right, .. } if dialect == Dialect::Sqlite && matches!(op, BinaryOp::RegexMatchCI | BinaryOp::RegexNotMatchCI) => {
            if matches!(op, BinaryOp::RegexNotMatchCI) {
                out.push_str("NOT ");
            }
            out.push_str("iregexp(");
            write_expr(out, right, dialect);
            out.push_str(", ");
            write_expr(out, left, dialect);
            out.push(')');
        }
        Expr::Binary { op, left, right, .. } => {
            write_expr(out, left, dialect);
            out.push(' ');
            out.push_str(binary_op_str(*op, dialect));
            out.push(' ');
            write_expr(out, right, dialect);
        }
        Expr::Function(call) => write_function(out, call, dialect),
        Expr::Cast { expr, type_name, was_double_colon, .. } => {
            if *was_double_colon && dialect == Dialect::Postgres {
                write_expr(out, expr, dialect);
                let _ = write!(out, "::{}", type_name);
            } else {
                out.push_str("CAST(");
                write_expr(out, expr, dialect);
                let _ = write!(out, " AS {})", type_name);
            }
        }
        Expr::JsonAccess { expr, path, as_text, .. } => {
            write_expr(out, expr, dialect);
            out.push_str(if *as_text { " ->> " } else { " -> " });
            write_expr(out, path, dialect);
        }
        Expr::Case { operand, whens, else_result, .. } => {
            out.push_str("CASE");
            if let Some(op) = operand {
                out.push(' ');
                write_expr(out, op, dialect);
            }
            for w in whens {
                out.push_str(" WHEN ");
                write_expr(out, &w.condition, dialect);
                out.push_str(" THEN ");
                write_expr(out, &w.result, dialect);
            }
            if let Some(e) = else_result {
                out.push_str(" ELSE ");
                write_expr(out, e, dialect);
            }
            out.push_str(" END");
        }
        Expr::Between { expr, negated, low, high, .. } => {
            write_expr(out, expr, dialect);
            if *negated {
                out.push_str(" NOT");
            }
            out.push_str(" BETWEEN ");
            write_expr(out, low, dialect);
            out.push_str(" AND ");
            write_expr(out, high, dialect);
        }
        Expr::InList { expr, negated, list, .. } => {
            write_expr(out, expr, dialect);
            if *negated {
                out.push_str(" NOT");
            }
            out.push_str(" IN (");
            for (i, e) in list.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(out, e, dialect);
            }
            out.push(')');
        }
        Expr::InSubquery { expr, negated, subquery, .. } => {
            write_expr(out, expr, dialect);
            if *negated {
                out.push_str(" NOT");
            }
            out.push_str(" IN (");
            write_select(out, subquery, dialect);
            out.push(')');
        }
        Expr::IsNull { expr, negated, .. } => {
            write_expr(out, expr, dialect);
            out.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
        }
        Expr::IsBool { expr, value, negated, .. } => {
            write_expr(out, expr, dialect);
            out.push_str(" IS ");
            if *negated {
                out.push_str("NOT ");
            }
            out.push_str(if *value { "TRUE" } else { "FALSE" });
        }
        Expr::Exists { negated, subquery, .. } => {
            if *negated {
                out.push_str("NOT ");
            }
            out.push_str("EXISTS (");
            write_select(out, subquery, dialect);
            out.push(')');
        }
        Expr::Extract { field, expr, .. } => {
            let _ = write!(out, "EXTRACT({} FROM ", field);
            write_expr(out, expr, dialect);
            out.push(')');
        }
        Expr::Interval { value, unit, .. } => {
            let _ = write!(out, "INTERVAL '{}'", value);
            if let Some(u) = unit {
                out.push(' ');
                out.push_str(u);
            }
        }
        Expr::ArrayLiteral { elements, .. } => {
            out.push_str("ARRAY[");
            for (i, e) in elements.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(out, e, dialect);
            }
            out.push(']');
        }
        Expr::ArraySubscript { expr, index, .. } => {
            write_expr(out, expr, dialect);
            out.push('[');
            write_expr(out, index, dialect);
            out.push(']');
        }
        Expr::Subquery(s) => {
            out.push('(');
            write_select(out, s, dialect);
            out.push(')');
        }
        Expr::Paren(e) => {
            out.push('(');
            write_expr(out, e, dialect);
            out.push(')');
        }
        Expr::Wildcard => out.push('*'),
        Expr::QualifiedWildcard(parts) => {
            for p in parts {
                quote_ident(out, p);
                out.push('.');
            }
            out.push('*');
        }
        Expr::Placeholder(name) => {
            let _ = write!(out, ":{}", name);
        }
        Expr::Raw(r) => out.push_str(&r.text),
    }
}

fn write_function(out: &mut String, call: &FunctionCall, dialect: Dialect) {
    for (i, part) in call.name.0.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(&part.value);
    }
    out.push('(');
    if call.distinct {
        out.push_str("DISTINCT ");
    }
    if call.star {
        out.push('*');
    } else {
        for (i, arg) in call.args.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            write_expr(out, arg, dialect);
        }
    }
    if !call.order_by.is_empty() {
        out.push_str(" ORDER BY ");
        write_order_by(out, &call.order_by, dialect);
    }
    out.push(')');
}

fn write_literal(out: &mut String, lit: &Literal) {
    match lit {
        Literal::Number(n) => out.push_str(n),
        Literal::String(s) => {
            let _ = write!(out, "'{}'", s.replace('\'', "''"));
        }
        Literal::DollarQuoted { tag, body } => {
            let _ = write!(out, "${tag}${body}${tag}$");
        }
        Literal::Bool(b) => out.push_str(if *b { "TRUE" } else { "FALSE" }),
        Literal::Null => out.push_str("NULL"),
    }
}

fn binary_op_str(op: BinaryOp, dialect: Dialect) -> &'static str {
    use BinaryOp::*;
    match op {
        Plus => "+",
        Minus => "-",
        Multiply => "*",
        Divide => "/",
        Modulo => "%",
        Concat => "||",
        Eq => "=",
        NotEq => "<>",
        Lt => "<",
        LtEq => "<=",
        Gt => ">",
        GtEq => ">=",
        And => "AND",
        Or => "OR",
        Like => "LIKE",
        ILike => "ILIKE",
        JsonArrow => "->",
        JsonArrowText => "->>",
        Contains => "@>",
        ContainedBy => "<@",
        Overlap => "&&",
        // SQLite has no `~`/`!~` operators (`~` is unary bitwise-NOT);
        // `REGEXP`/`NOT REGEXP` dispatch to the `regexp` scalar function
        // registered in `runtime.rs`. `~*`/`!~*` (case-insensitive) have
        // no operator form at all and are handled as `iregexp(...)` calls
        // above, before this function is reached.
        RegexMatch => if dialect == Dialect::Sqlite { "REGEXP" } else { "~" },
        RegexNotMatch => if dialect == Dialect::Sqlite { "NOT REGEXP" } else { "!~" },
        RegexMatchCI => "~*",
        RegexNotMatchCI => "!~*",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn roundtrip(sql: &str) -> String {
        let (stmts, warnings) = parse(sql).expect("parse failed");
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
        generate(&stmts[0], Dialect::Postgres)
    }

    #[test]
    fn roundtrips_simple_select() {
        let out = roundtrip("SELECT id, name FROM users WHERE id = 1");
        assert_eq!(out, "SELECT id, name FROM users WHERE id = 1");
    }

    #[test]
    fn roundtrips_cast_with_double_colon() {
        let out = roundtrip("SELECT id::text FROM users");
        assert_eq!(out, "SELECT id::text FROM users");
    }
}
