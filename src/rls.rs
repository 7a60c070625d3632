//! C5: row-level security. Stores per-table policies and composes them
//! into a `WHERE`/`CHECK` predicate at query-compile time. Never lets a
//! policy's `auth.*()` calls reach executed SQL as function calls —
//! they are rewritten into bound literals at plan time.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::ast::{BinaryOp, Expr, FunctionCall, Literal};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl Command {
    fn matches(self, op: Command) -> bool {
        self == Command::All || self == op
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub command: Command,
    pub roles: Vec<String>,
    pub using: Option<Expr>,
    pub check: Option<Expr>,
}

#[derive(Debug, Clone, Default)]
pub struct TableRls {
    pub enabled: bool,
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Default)]
pub struct RlsRegistry {
    tables: HashMap<String, TableRls>,
}

/// Decoded JWT claims bound into policy expressions.
#[derive(Debug, Clone)]
pub struct Claims {
    pub sub: Option<String>,
    pub role: String,
    pub email: Option<String>,
    pub raw: JsonValue,
}

impl Claims {
    pub fn anonymous() -> Self {
        Self { sub: None, role: "anon".to_string(), email: None, raw: JsonValue::Object(Default::default()) }
    }
}

/// Per-request identity: claims plus the service-role bypass flag.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: Claims,
    /// `true` for the `service_role` key — skips the RLS hook entirely.
    pub bypass_rls: bool,
}

impl AuthContext {
    pub fn service_role() -> Self {
        Self { claims: Claims { sub: None, role: "service_role".to_string(), email: None, raw: JsonValue::Null }, bypass_rls: true }
    }

    pub fn anonymous() -> Self {
        Self { claims: Claims::anonymous(), bypass_rls: false }
    }
}

impl RlsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&mut self, table: &str, enabled: bool) {
        self.tables.entry(table.to_string()).or_default().enabled = enabled;
    }

    pub fn add_policy(&mut self, table: &str, policy: Policy) {
        self.tables.entry(table.to_string()).or_default().policies.push(policy);
    }

    pub fn is_enabled(&self, table: &str) -> bool {
        self.tables.get(table).map(|t| t.enabled).unwrap_or(false)
    }

    fn matching_policies(&self, table: &str, op: Command, role: &str) -> Vec<&Policy> {
        self.tables
            .get(table)
            .map(|t| {
                t.policies
                    .iter()
                    .filter(|p| p.command.matches(op) && (p.roles.is_empty() || p.roles.iter().any(|r| r == role)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Composes the `USING` predicate for SELECT/UPDATE/DELETE. Returns
    /// `None` when RLS is bypassed or disabled for `table` (no predicate
    /// to inject); `Some(FALSE)` when enabled but no policy matches
    /// (deny-by-default).
    pub fn using_predicate(&self, table: &str, op: Command, auth: &AuthContext) -> Option<Expr> {
        if auth.bypass_rls || !self.is_enabled(table) {
            return None;
        }
        let policies = self.matching_policies(table, op, &auth.claims.role);
        let usings: Vec<Expr> = policies.iter().filter_map(|p| p.using.clone()).map(|e| bind_auth_functions(e, &auth.claims)).collect();
        Some(or_all(usings))
    }

    /// Composes the `CHECK` predicate for INSERT/UPDATE row validation.
    /// A policy that omits `WITH CHECK` falls back to its own `USING`
    /// clause (standard Postgres RLS semantics: `WITH CHECK` defaults to
    /// `USING` when not given), so a policy with only a `using` clause
    /// restricts both which rows are affected *and* what values they can
    /// be written with, rather than silently denying every write.
    pub fn check_predicate(&self, table: &str, op: Command, auth: &AuthContext) -> Option<Expr> {
        if auth.bypass_rls || !self.is_enabled(table) {
            return None;
        }
        let policies = self.matching_policies(table, op, &auth.claims.role);
        let checks: Vec<Expr> = policies
            .iter()
            .filter_map(|p| p.check.clone().or_else(|| p.using.clone()))
            .map(|e| bind_auth_functions(e, &auth.claims))
            .collect();
        Some(or_all(checks))
    }

    /// Evaluates a bound `check_predicate` against a candidate row's
    /// literal column values by substituting idents, then delegates to
    /// the caller to run the resulting boolean expression through SQL
    /// (`SELECT <expr>`) — policy evaluation itself always happens in
    /// the database, never in Rust, per spec.md §4.4's "never appear in
    /// executed SQL as function calls" contract for `auth.*()` only.
    pub fn check_expr_for_row(expr: &Expr, row: &HashMap<String, Expr>) -> Expr {
        substitute_idents(expr.clone(), row)
    }
}

fn or_all(exprs: Vec<Expr>) -> Expr {
    if exprs.is_empty() {
        return Expr::Literal(Literal::Bool(false));
    }
    let mut iter = exprs.into_iter();
    let mut acc = iter.next().unwrap();
    for e in iter {
        acc = Expr::Binary { op: BinaryOp::Or, left: Box::new(acc), right: Box::new(e), pos: 0 };
    }
    acc
}

fn substitute_idents(expr: Expr, row: &HashMap<String, Expr>) -> Expr {
    match expr {
        Expr::Ident(id) => row.get(&id.value).cloned().unwrap_or(Expr::Ident(id)),
        Expr::Binary { op, left, right, pos } => Expr::Binary {
            op,
            left: Box::new(substitute_idents(*left, row)),
            right: Box::new(substitute_idents(*right, row)),
            pos,
        },
        Expr::Unary { op, expr, pos } => Expr::Unary { op, expr: Box::new(substitute_idents(*expr, row)), pos },
        Expr::Paren(e) => Expr::Paren(Box::new(substitute_idents(*e, row))),
        other => other,
    }
}

/// Rewrites `auth.uid()`/`auth.role()`/`auth.email()`/`auth.jwt()` into
/// bound literals, recursively. Missing claims yield SQL `NULL`.
fn bind_auth_functions(expr: Expr, claims: &Claims) -> Expr {
    match expr {
        Expr::Function(call) if is_auth_call(&call, "uid") => opt_string_literal(claims.sub.clone()),
        Expr::Function(call) if is_auth_call(&call, "role") => Expr::Literal(Literal::String(claims.role.clone())),
        Expr::Function(call) if is_auth_call(&call, "email") => opt_string_literal(claims.email.clone()),
        Expr::Function(call) if is_auth_call(&call, "jwt") => Expr::Function(FunctionCall {
            name: crate::ast::ObjectName::single("json"),
            args: vec![Expr::Literal(Literal::String(claims.raw.to_string()))],
            distinct: false,
            star: false,
            order_by: vec![],
            pos: 0,
        }),
        Expr::Function(mut call) => {
            call.args = call.args.into_iter().map(|a| bind_auth_functions(a, claims)).collect();
            Expr::Function(call)
        }
        Expr::Binary { op, left, right, pos } => Expr::Binary {
            op,
            left: Box::new(bind_auth_functions(*left, claims)),
            right: Box::new(bind_auth_functions(*right, claims)),
            pos,
        },
        Expr::Unary { op, expr, pos } => Expr::Unary { op, expr: Box::new(bind_auth_functions(*expr, claims)), pos },
        Expr::Paren(e) => Expr::Paren(Box::new(bind_auth_functions(*e, claims))),
        Expr::Case { operand, whens, else_result, pos } => Expr::Case {
            operand: operand.map(|o| Box::new(bind_auth_functions(*o, claims))),
            whens: whens
                .into_iter()
                .map(|w| crate::ast::CaseWhen {
                    condition: Box::new(bind_auth_functions(*w.condition, claims)),
                    result: Box::new(bind_auth_functions(*w.result, claims)),
                })
                .collect(),
            else_result: else_result.map(|e| Box::new(bind_auth_functions(*e, claims))),
            pos,
        },
        Expr::IsNull { expr, negated, pos } => Expr::IsNull { expr: Box::new(bind_auth_functions(*expr, claims)), negated, pos },
        other => other,
    }
}

fn is_auth_call(call: &FunctionCall, fn_name: &str) -> bool {
    call.args.is_empty()
        && match call.name.0.as_slice() {
            [schema, name] => schema.eq_ci("auth") && name.eq_ci(fn_name),
            _ => false,
        }
}

fn opt_string_literal(value: Option<String>) -> Expr {
    match value {
        Some(v) => Expr::Literal(Literal::String(v)),
        None => Expr::Literal(Literal::Null),
    }
}

/// Surfaces as `PGRST500`: a policy expression failed to evaluate.
pub fn evaluation_error(table: &str, detail: impl Into<String>) -> AppError {
    AppError::pgrst("PGRST500", format!("RLS policy evaluation failed for {table}: {}", detail.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ident;

    fn uid_eq_owner() -> Expr {
        // owner_id = auth.uid()
        Expr::Binary {
            op: BinaryOp::Eq,
            left: Box::new(Expr::Ident(Ident::new("owner_id"))),
            right: Box::new(Expr::Function(FunctionCall {
                name: crate::ast::ObjectName(vec![Ident::new("auth"), Ident::new("uid")]),
                args: vec![],
                distinct: false,
                star: false,
                order_by: vec![],
                pos: 0,
            })),
            pos: 0,
        }
    }

    #[test]
    fn deny_by_default_when_no_policy_matches() {
        let mut reg = RlsRegistry::new();
        reg.set_enabled("notes", true);
        let auth = AuthContext::anonymous();
        let pred = reg.using_predicate("notes", Command::Select, &auth).unwrap();
        assert!(matches!(pred, Expr::Literal(Literal::Bool(false))));
    }

    #[test]
    fn bypass_skips_predicate_entirely() {
        let mut reg = RlsRegistry::new();
        reg.set_enabled("notes", true);
        reg.add_policy(
            "notes",
            Policy { name: "own_rows".to_string(), command: Command::Select, roles: vec![], using: Some(uid_eq_owner()), check: None },
        );
        let auth = AuthContext::service_role();
        assert!(reg.using_predicate("notes", Command::Select, &auth).is_none());
    }

    #[test]
    fn binds_auth_uid_to_claim() {
        let mut reg = RlsRegistry::new();
        reg.set_enabled("notes", true);
        reg.add_policy(
            "notes",
            Policy { name: "own_rows".to_string(), command: Command::Select, roles: vec![], using: Some(uid_eq_owner()), check: None },
        );
        let mut auth = AuthContext::anonymous();
        auth.claims.sub = Some("user-123".to_string());
        let pred = reg.using_predicate("notes", Command::Select, &auth).unwrap();
        match pred {
            Expr::Binary { right, .. } => {
                assert!(matches!(*right, Expr::Literal(Literal::String(s)) if s == "user-123"));
            }
            _ => panic!("expected binary eq"),
        }
    }

    #[test]
    fn check_predicate_falls_back_to_using_when_check_omitted() {
        let mut reg = RlsRegistry::new();
        reg.set_enabled("notes", true);
        reg.add_policy(
            "notes",
            Policy { name: "own_rows".to_string(), command: Command::Update, roles: vec![], using: Some(uid_eq_owner()), check: None },
        );
        let mut auth = AuthContext::anonymous();
        auth.claims.sub = Some("user-123".to_string());
        let pred = reg.check_predicate("notes", Command::Update, &auth).unwrap();
        assert!(!matches!(pred, Expr::Literal(Literal::Bool(false))), "a using-only policy must not deny every write");
    }

    #[test]
    fn missing_claim_binds_to_null() {
        let mut reg = RlsRegistry::new();
        reg.set_enabled("notes", true);
        reg.add_policy(
            "notes",
            Policy { name: "own_rows".to_string(), command: Command::Select, roles: vec![], using: Some(uid_eq_owner()), check: None },
        );
        let auth = AuthContext::anonymous();
        let pred = reg.using_predicate("notes", Command::Select, &auth).unwrap();
        match pred {
            Expr::Binary { right, .. } => assert!(matches!(*right, Expr::Literal(Literal::Null))),
            _ => panic!(),
        }
    }
}
