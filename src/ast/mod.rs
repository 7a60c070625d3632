//! The language-neutral SQL AST (C1): a tagged sum of expression and
//! statement variants that the lexer/parser (C2) builds, the dialect
//! translator (C3) rewrites in place, and the generator (below) prints
//! back out under either dialect.
//!
//! Every node records its source position so parse warnings and
//! translation diagnostics can point back at the original text.

pub mod gen;

use serde::{Deserialize, Serialize};

/// Byte offset into the original source text. `0` for synthesized nodes
/// (e.g. ones the translator builds fresh, like an injected UUID default).
pub type Pos = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ident {
    pub value: String,
    pub quoted: bool,
    pub pos: Pos,
}

impl Ident {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), quoted: false, pos: 0 }
    }

    pub fn quoted(value: impl Into<String>) -> Self {
        Self { value: value.into(), quoted: true, pos: 0 }
    }

    /// Identifiers compare case-insensitively per the invariant in spec.md §3,
    /// but print with their original case and quoting.
    pub fn eq_ci(&self, other: &str) -> bool {
        self.value.eq_ignore_ascii_case(other)
    }
}

/// A possibly schema-qualified name: `schema.table` or just `table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectName(pub Vec<Ident>);

impl ObjectName {
    pub fn single(name: impl Into<String>) -> Self {
        Self(vec![Ident::new(name)])
    }

    pub fn last(&self) -> &Ident {
        self.0.last().expect("ObjectName must have at least one part")
    }

    /// `(schema, name)`, defaulting the schema to `public` the way PostgREST does.
    pub fn schema_and_name(&self) -> (String, String) {
        match self.0.as_slice() {
            [schema, name] => (schema.value.clone(), name.value.clone()),
            [name] => ("public".to_string(), name.value.clone()),
            parts => {
                let name = parts.last().unwrap().value.clone();
                let schema = parts[parts.len() - 2].value.clone();
                (schema, name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Number(String),
    String(String),
    /// `$tag$...$tag$` — the tag (possibly empty) is kept for round-tripping.
    DollarQuoted { tag: String, body: String },
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
    ILike,
    JsonArrow,    // ->
    JsonArrowText, // ->>
    Contains,     // @>
    ContainedBy,  // <@
    Overlap,      // &&
    RegexMatch,   // ~
    RegexNotMatch, // !~
    RegexMatchCI, // ~*
    RegexNotMatchCI, // !~*
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseWhen {
    pub condition: Box<Expr>,
    pub result: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: ObjectName,
    pub args: Vec<Expr>,
    pub distinct: bool,
    pub star: bool,
    pub order_by: Vec<OrderByExpr>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByExpr {
    pub expr: Expr,
    pub asc: Option<bool>,
    pub nulls_first: Option<bool>,
}

/// A single statement/expression that could not be parsed: carried
/// verbatim as the terminal fallback so the system degrades gracefully
/// rather than rejecting the whole request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSql {
    pub text: String,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Ident(Ident),
    /// `table.column` or `schema.table.column`.
    CompoundIdent(Vec<Ident>),
    Literal(Literal),
    Unary { op: UnaryOp, expr: Box<Expr>, pos: Pos },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr>, pos: Pos },
    Function(FunctionCall),
    /// `expr::type` or `CAST(expr AS type)`; `was_double_colon` preserves
    /// which surface syntax the source used, for round-tripping under PG dialect.
    Cast { expr: Box<Expr>, type_name: String, was_double_colon: bool, pos: Pos },
    /// `expr -> 'k'` / `expr ->> 'k'` already folded into a typed node
    /// for JSON-specific translation, in addition to the generic Binary form.
    JsonAccess { expr: Box<Expr>, path: Box<Expr>, as_text: bool, pos: Pos },
    Case { operand: Option<Box<Expr>>, whens: Vec<CaseWhen>, else_result: Option<Box<Expr>>, pos: Pos },
    Between { expr: Box<Expr>, negated: bool, low: Box<Expr>, high: Box<Expr>, pos: Pos },
    InList { expr: Box<Expr>, negated: bool, list: Vec<Expr>, pos: Pos },
    InSubquery { expr: Box<Expr>, negated: bool, subquery: Box<Select>, pos: Pos },
    IsNull { expr: Box<Expr>, negated: bool, pos: Pos },
    IsBool { expr: Box<Expr>, value: bool, negated: bool, pos: Pos },
    Exists { negated: bool, subquery: Box<Select>, pos: Pos },
    Extract { field: String, expr: Box<Expr>, pos: Pos },
    Interval { value: String, unit: Option<String>, pos: Pos },
    ArrayLiteral { elements: Vec<Expr>, pos: Pos },
    ArraySubscript { expr: Box<Expr>, index: Box<Expr>, pos: Pos },
    Subquery(Box<Select>),
    Paren(Box<Expr>),
    Wildcard,
    QualifiedWildcard(Vec<Ident>),
    /// Bound placeholder: `:name` for RPC/RLS parameter binding, or `?`/`$n`.
    Placeholder(String),
    Raw(RawSql),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<Ident>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableRef {
    Named { name: ObjectName, alias: Option<Ident> },
    Derived { subquery: Box<Select>, alias: Ident },
    /// A correlated subquery expressed as a table-valued function, used
    /// by the PostgREST compiler's embed lowering (`json_group_array(...)`).
    Raw(RawSql),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct From {
    pub table: TableRef,
    pub joins: Vec<Join>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonTableExpr {
    pub name: Ident,
    pub columns: Vec<Ident>,
    pub query: Box<Select>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithClause {
    pub recursive: bool,
    pub ctes: Vec<CommonTableExpr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetOp {
    Union { all: bool },
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub with: Option<WithClause>,
    pub distinct: bool,
    pub columns: Vec<SelectItem>,
    pub from: Vec<From>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
    pub union: Option<(SetOp, Box<Select>)>,
    pub pos: Pos,
}

impl Select {
    pub fn empty() -> Self {
        Self {
            with: None,
            distinct: false,
            columns: vec![SelectItem { expr: Expr::Wildcard, alias: None }],
            from: vec![],
            filter: None,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
            offset: None,
            union: None,
            pos: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictTarget {
    Columns(Vec<Ident>),
    Constraint(Ident),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OnConflict {
    DoNothing { target: Option<ConflictTarget> },
    DoUpdate { target: Option<ConflictTarget>, assignments: Vec<Assignment>, filter: Option<Expr> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: Ident,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InsertSource {
    Values(Vec<Vec<Expr>>),
    Select(Box<Select>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    pub table: ObjectName,
    pub columns: Vec<Ident>,
    pub source: InsertSource,
    pub on_conflict: Option<OnConflict>,
    pub returning: Vec<SelectItem>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub table: ObjectName,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Expr>,
    pub returning: Vec<SelectItem>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub table: ObjectName,
    pub filter: Option<Expr>,
    pub returning: Vec<SelectItem>,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: Ident,
    pub type_name: String,
    pub type_args: Vec<String>,
    pub nullable: bool,
    pub default: Option<Expr>,
    pub primary_key: bool,
    pub unique: bool,
    pub references: Option<(ObjectName, Option<Ident>)>,
    pub check: Option<Expr>,
    pub collation: Option<String>,
    pub generated_identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableConstraint {
    PrimaryKey { name: Option<Ident>, columns: Vec<Ident> },
    Unique { name: Option<Ident>, columns: Vec<Ident> },
    ForeignKey {
        name: Option<Ident>,
        columns: Vec<Ident>,
        foreign_table: ObjectName,
        foreign_columns: Vec<Ident>,
        on_delete: Option<String>,
        on_update: Option<String>,
    },
    Check { name: Option<Ident>, expr: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTable {
    pub name: ObjectName,
    pub if_not_exists: bool,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
    pub pos: Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Volatility {
    Volatile,
    Stable,
    Immutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Security {
    Invoker,
    Definer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnType {
    Scalar(String),
    SetOf(String),
    Table(Vec<(Ident, String)>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateFunctionArg {
    pub name: String,
    pub type_name: String,
    pub default: Option<Expr>,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateFunction {
    pub or_replace: bool,
    pub name: ObjectName,
    pub args: Vec<CreateFunctionArg>,
    pub returns: ReturnType,
    pub language: String,
    pub volatility: Volatility,
    pub security: Security,
    pub body: RawSql,
    pub pos: Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropKind {
    Table,
    Function,
    Index,
    View,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drop {
    pub kind: DropKind,
    pub names: Vec<ObjectName>,
    pub if_exists: bool,
    pub cascade: bool,
    pub pos: Pos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    CreateTable(CreateTable),
    CreateFunction(CreateFunction),
    Drop(Drop),
    Raw(RawSql),
}

/// A parse warning: unparsed tail text plus the offending position,
/// returned alongside a best-effort `RawSql` fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub message: String,
    pub pos: Pos,
    pub tail: String,
}
