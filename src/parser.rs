//! C2 parser: recursive descent over the C2 lexer's tokens with
//! Pratt-style expression precedence, building the C1 AST. Never
//! panics on well-formed-but-unsupported input — unparsable statements
//! degrade to a `RawSql` fallback plus a `ParseWarning`.

use crate::ast::*;
use crate::lexer::{tokenize, Token, TokenKind};

type PResult<T> = Result<T, String>;

pub struct Parser {
    tokens: Vec<Token>,
    chars: Vec<char>,
    pos: usize,
}

/// Parses `text` into zero or more statements, with a warning for every
/// statement that could not be parsed (its `RawSql` is substituted).
/// Contract: `parse(text) -> (stmts, warnings)`, never panics.
pub fn parse(sql: &str) -> PResult<(Vec<Stmt>, Vec<ParseWarning>)> {
    let tokens = tokenize(sql);
    let chars: Vec<char> = sql.chars().collect();
    let mut parser = Parser { tokens, chars, pos: 0 };
    Ok(parser.parse_program())
}

/// Parses a single standalone expression (used by the PostgREST filter
/// compiler and RLS policy expression validation).
pub fn parse_expr_standalone(text: &str) -> PResult<Expr> {
    let tokens = tokenize(text);
    let chars: Vec<char> = text.chars().collect();
    let mut parser = Parser { tokens, chars, pos: 0 };
    let expr = parser.parse_expr(0)?;
    Ok(expr)
}

impl Parser {
    fn parse_program(&mut self) -> (Vec<Stmt>, Vec<ParseWarning>) {
        let mut stmts = Vec::new();
        let mut warnings = Vec::new();
        loop {
            while self.cur_kind() == &TokenKind::Semicolon {
                self.pos += 1;
            }
            if self.cur_kind() == &TokenKind::Eof {
                break;
            }
            let start_pos = self.pos;
            let start_checkpoint = self.pos;
            match self.parse_statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(message) => {
                    self.pos = start_checkpoint;
                    let (raw, tail_pos) = self.consume_raw_statement();
                    warnings.push(ParseWarning { message, pos: tail_pos, tail: raw.clone() });
                    stmts.push(Stmt::Raw(RawSql { text: raw, pos: start_pos }));
                }
            }
            // Ensure forward progress even on a zero-length parse.
            if self.pos == start_pos && self.cur_kind() != &TokenKind::Eof {
                let (raw, tail_pos) = self.consume_raw_statement();
                warnings.push(ParseWarning {
                    message: "unparsable statement".to_string(),
                    pos: tail_pos,
                    tail: raw.clone(),
                });
                stmts.push(Stmt::Raw(RawSql { text: raw, pos: start_pos }));
            }
        }
        (stmts, warnings)
    }

    /// Consumes tokens up to (and including) the next top-level semicolon
    /// or EOF, returning the verbatim source text.
    fn consume_raw_statement(&mut self) -> (String, usize) {
        let start_char = self.cur_token().pos;
        let start_pos = self.pos;
        while self.cur_kind() != &TokenKind::Semicolon && self.cur_kind() != &TokenKind::Eof {
            self.pos += 1;
        }
        let end_char = self.cur_token().pos;
        let text: String = self.chars[start_char..end_char.max(start_char)].iter().collect();
        if self.cur_kind() == &TokenKind::Semicolon {
            self.pos += 1;
        }
        (text.trim().to_string(), start_pos)
    }

    fn cur_token(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn cur_kind(&self) -> &TokenKind {
        &self.cur_token().kind
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn bump(&mut self) -> Token {
        let t = self.cur_token().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.cur_kind(), TokenKind::Keyword(k) if k == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(format!("expected keyword {}, found {:?}", kw, self.cur_kind()))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.cur_kind() == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<()> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", kind, self.cur_kind()))
        }
    }

    fn parse_ident(&mut self) -> PResult<Ident> {
        let pos = self.cur_token().pos;
        match self.cur_kind().clone() {
            TokenKind::Ident(s) => {
                self.bump();
                Ok(Ident { value: s, quoted: false, pos })
            }
            TokenKind::QuotedIdent(s) => {
                self.bump();
                Ok(Ident { value: s, quoted: true, pos })
            }
            TokenKind::Keyword(k) => {
                // Keywords are allowed as identifiers in a handful of
                // contexts (e.g. column named `language`); be permissive.
                self.bump();
                Ok(Ident { value: k, quoted: false, pos })
            }
            other => Err(format!("expected identifier, found {:?}", other)),
        }
    }

    fn parse_object_name(&mut self) -> PResult<ObjectName> {
        let mut parts = vec![self.parse_ident()?];
        while self.eat(&TokenKind::Dot) {
            parts.push(self.parse_ident()?);
        }
        Ok(ObjectName(parts))
    }

    // ---------------------------------------------------------------
    // Statement dispatch
    // ---------------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<Stmt> {
        match self.cur_kind().clone() {
            TokenKind::Keyword(k) if k == "SELECT" || k == "WITH" => {
                Ok(Stmt::Select(self.parse_select()?))
            }
            TokenKind::Keyword(k) if k == "INSERT" => Ok(Stmt::Insert(self.parse_insert()?)),
            TokenKind::Keyword(k) if k == "UPDATE" => Ok(Stmt::Update(self.parse_update()?)),
            TokenKind::Keyword(k) if k == "DELETE" => Ok(Stmt::Delete(self.parse_delete()?)),
            TokenKind::Keyword(k) if k == "CREATE" => self.parse_create(),
            TokenKind::Keyword(k) if k == "DROP" => Ok(Stmt::Drop(self.parse_drop()?)),
            other => Err(format!("unsupported statement start {:?}", other)),
        }
    }

    fn parse_create(&mut self) -> PResult<Stmt> {
        self.expect_kw("CREATE")?;
        let or_replace = self.eat_kw("OR") && self.expect_kw("REPLACE").is_ok();
        if self.eat_kw("TABLE") {
            Ok(Stmt::CreateTable(self.parse_create_table_body()?))
        } else if self.eat_kw("FUNCTION") {
            Ok(Stmt::CreateFunction(self.parse_create_function_body(or_replace)?))
        } else {
            Err("unsupported CREATE variant".to_string())
        }
    }

    fn parse_create_table_body(&mut self) -> PResult<CreateTable> {
        let pos = self.cur_token().pos;
        let if_not_exists = self.eat_kw("IF") && {
            self.expect_kw("NOT")?;
            self.expect_kw("EXISTS")?;
            true
        };
        let name = self.parse_object_name()?;
        self.expect(TokenKind::LParen)?;
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            if self.is_table_constraint_start() {
                constraints.push(self.parse_table_constraint()?);
            } else {
                columns.push(self.parse_column_def()?);
            }
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(CreateTable { name, if_not_exists, columns, constraints, pos })
    }

    fn is_table_constraint_start(&self) -> bool {
        self.is_kw("CONSTRAINT") || self.is_kw("PRIMARY") || self.is_kw("FOREIGN")
            || self.is_kw("UNIQUE") || self.is_kw("CHECK")
    }

    fn parse_table_constraint(&mut self) -> PResult<TableConstraint> {
        let name = if self.eat_kw("CONSTRAINT") { Some(self.parse_ident()?) } else { None };
        if self.eat_kw("PRIMARY") {
            self.expect_kw("KEY")?;
            Ok(TableConstraint::PrimaryKey { name, columns: self.parse_ident_list_paren()? })
        } else if self.eat_kw("UNIQUE") {
            Ok(TableConstraint::Unique { name, columns: self.parse_ident_list_paren()? })
        } else if self.eat_kw("FOREIGN") {
            self.expect_kw("KEY")?;
            let columns = self.parse_ident_list_paren()?;
            self.expect_kw("REFERENCES")?;
            let foreign_table = self.parse_object_name()?;
            let foreign_columns = if self.cur_kind() == &TokenKind::LParen {
                self.parse_ident_list_paren()?
            } else {
                vec![]
            };
            let mut on_delete = None;
            let mut on_update = None;
            loop {
                if self.eat_kw("ON") {
                    if self.eat_kw("DELETE") {
                        on_delete = Some(self.parse_ref_action()?);
                    } else if self.eat_kw("UPDATE") {
                        on_update = Some(self.parse_ref_action()?);
                    }
                } else {
                    break;
                }
            }
            Ok(TableConstraint::ForeignKey { name, columns, foreign_table, foreign_columns, on_delete, on_update })
        } else if self.eat_kw("CHECK") {
            self.expect(TokenKind::LParen)?;
            let expr = self.parse_expr(0)?;
            self.expect(TokenKind::RParen)?;
            Ok(TableConstraint::Check { name, expr })
        } else {
            Err("expected table constraint".to_string())
        }
    }

    fn parse_ref_action(&mut self) -> PResult<String> {
        if self.eat_kw("CASCADE") {
            Ok("CASCADE".to_string())
        } else if self.eat_kw("RESTRICT") {
            Ok("RESTRICT".to_string())
        } else if self.eat_kw("NOT") {
            self.expect_kw("ACTION").ok();
            Ok("NO ACTION".to_string())
        } else if self.eat_kw("SET") {
            if self.eat_kw("NULL") {
                Ok("SET NULL".to_string())
            } else {
                self.eat_kw("DEFAULT");
                Ok("SET DEFAULT".to_string())
            }
        } else {
            Ok("NO ACTION".to_string())
        }
    }

    fn parse_ident_list_paren(&mut self) -> PResult<Vec<Ident>> {
        self.expect(TokenKind::LParen)?;
        let mut idents = vec![self.parse_ident()?];
        while self.eat(&TokenKind::Comma) {
            idents.push(self.parse_ident()?);
        }
        self.expect(TokenKind::RParen)?;
        Ok(idents)
    }

    fn parse_column_def(&mut self) -> PResult<ColumnDef> {
        let name = self.parse_ident()?;
        let type_name = self.parse_type_name()?;
        let mut type_args = Vec::new();
        if self.eat(&TokenKind::LParen) {
            loop {
                match self.cur_kind().clone() {
                    TokenKind::Number(n) => {
                        self.bump();
                        type_args.push(n);
                    }
                    _ => break,
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }

        let mut col = ColumnDef {
            name,
            type_name,
            type_args,
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
            references: None,
            check: None,
            collation: None,
            generated_identity: None,
        };

        loop {
            if self.eat_kw("NOT") {
                self.expect_kw("NULL")?;
                col.nullable = false;
            } else if self.eat_kw("NULL") {
                col.nullable = true;
            } else if self.eat_kw("PRIMARY") {
                self.expect_kw("KEY")?;
                col.primary_key = true;
            } else if self.eat_kw("UNIQUE") {
                col.unique = true;
            } else if self.eat_kw("DEFAULT") {
                col.default = Some(self.parse_expr(100)?);
            } else if self.eat_kw("CHECK") {
                self.expect(TokenKind::LParen)?;
                col.check = Some(self.parse_expr(0)?);
                self.expect(TokenKind::RParen)?;
            } else if self.eat_kw("COLLATE") {
                let ident = self.parse_ident()?;
                col.collation = Some(if ident.quoted { format!("\"{}\"", ident.value) } else { ident.value });
            } else if self.eat_kw("REFERENCES") {
                let table = self.parse_object_name()?;
                let rcol = if self.cur_kind() == &TokenKind::LParen {
                    self.expect(TokenKind::LParen)?;
                    let c = self.parse_ident()?;
                    self.expect(TokenKind::RParen)?;
                    Some(c)
                } else {
                    None
                };
                col.references = Some((table, rcol));
            } else if self.eat_kw("GENERATED") {
                let mode = if self.eat_kw("ALWAYS") {
                    "ALWAYS"
                } else {
                    self.expect_kw("BY")?;
                    self.expect_kw("DEFAULT")?;
                    "BY DEFAULT"
                };
                self.expect_kw("AS")?;
                self.expect_kw("IDENTITY")?;
                col.generated_identity = Some(mode.to_string());
            } else {
                break;
            }
        }

        Ok(col)
    }

    /// Matches the next token as either a `Keyword` or bare `Ident` with
    /// the given case-insensitive spelling, consuming it on success.
    /// Several multi-word type fragments (`precision`, `zone`, `without`,
    /// `varying`) are not in the keyword table, so they tokenize as
    /// plain identifiers.
    fn eat_word(&mut self, word: &str) -> bool {
        let matches_word = match self.cur_kind() {
            TokenKind::Keyword(k) => k.eq_ignore_ascii_case(word),
            TokenKind::Ident(s) => s.eq_ignore_ascii_case(word),
            _ => false,
        };
        if matches_word {
            self.bump();
        }
        matches_word
    }

    fn parse_type_name(&mut self) -> PResult<String> {
        let mut name = self.parse_ident()?.value;
        // Multi-word types: `double precision`, `timestamp with time zone`, etc.
        loop {
            if self.eat_word("precision") {
                name.push_str(" precision");
            } else if self.eat_kw("WITH") {
                self.eat_word("time");
                self.eat_word("zone");
                name.push_str(" with time zone");
            } else if self.eat_word("without") {
                self.eat_word("time");
                self.eat_word("zone");
                name.push_str(" without time zone");
            } else if self.eat_word("varying") {
                name.push_str(" varying");
            } else {
                break;
            }
        }
        Ok(name)
    }

    fn parse_create_function_body(&mut self, or_replace: bool) -> PResult<CreateFunction> {
        let pos = self.cur_token().pos;
        let name = self.parse_object_name()?;
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if self.cur_kind() != &TokenKind::RParen {
            loop {
                let arg_name = self.parse_ident()?.value;
                let arg_type = self.parse_type_name()?;
                let default = if self.eat_kw("DEFAULT") { Some(self.parse_expr(100)?) } else { None };
                let position = args.len();
                args.push(CreateFunctionArg { name: arg_name, type_name: arg_type, default, position });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect_kw("RETURNS")?;
        let returns = if self.eat_kw("SETOF") {
            ReturnType::SetOf(self.parse_type_name()?)
        } else if self.eat_kw("TABLE") {
            self.expect(TokenKind::LParen)?;
            let mut cols = Vec::new();
            loop {
                let n = self.parse_ident()?;
                let t = self.parse_type_name()?;
                cols.push((n, t));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
            ReturnType::Table(cols)
        } else {
            ReturnType::Scalar(self.parse_type_name()?)
        };

        let mut language = "sql".to_string();
        let mut volatility = Volatility::Volatile;
        let mut security = Security::Invoker;
        let mut body: Option<RawSql> = None;

        loop {
            if self.eat_kw("LANGUAGE") {
                language = self.parse_ident()?.value.to_ascii_lowercase();
            } else if self.eat_kw("VOLATILE") {
                volatility = Volatility::Volatile;
            } else if self.eat_kw("STABLE") {
                volatility = Volatility::Stable;
            } else if self.eat_kw("IMMUTABLE") {
                volatility = Volatility::Immutable;
            } else if self.eat_kw("SECURITY") {
                if self.eat_kw("DEFINER") {
                    security = Security::Definer;
                } else {
                    self.expect_kw("INVOKER")?;
                    security = Security::Invoker;
                }
            } else if self.eat_kw("AS") {
                let bpos = self.cur_token().pos;
                match self.cur_kind().clone() {
                    TokenKind::DollarQuoted { tag: _, body: b } => {
                        self.bump();
                        body = Some(RawSql { text: b, pos: bpos });
                    }
                    TokenKind::String(s) => {
                        self.bump();
                        body = Some(RawSql { text: s, pos: bpos });
                    }
                    other => return Err(format!("expected function body, found {:?}", other)),
                }
            } else {
                break;
            }
        }

        let body = body.ok_or_else(|| "CREATE FUNCTION missing body".to_string())?;
        if language != "sql" {
            return Err(format!("unsupported function language: {}", language));
        }

        Ok(CreateFunction { or_replace, name, args, returns, language, volatility, security, body, pos })
    }

    fn parse_drop(&mut self) -> PResult<Drop> {
        let pos = self.cur_token().pos;
        self.expect_kw("DROP")?;
        let kind = if self.eat_kw("TABLE") {
            DropKind::Table
        } else if self.eat_kw("FUNCTION") {
            DropKind::Function
        } else if self.eat_kw("INDEX") {
            DropKind::Index
        } else if self.eat_kw("VIEW") {
            DropKind::View
        } else {
            return Err("unsupported DROP target".to_string());
        };
        let if_exists = self.eat_kw("IF") && self.expect_kw("EXISTS").is_ok();
        let mut names = vec![self.parse_object_name()?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.parse_object_name()?);
        }
        let cascade = self.eat_kw("CASCADE");
        Ok(Drop { kind, names, if_exists, cascade, pos })
    }

    // ---------------------------------------------------------------
    // SELECT
    // ---------------------------------------------------------------

    fn parse_select(&mut self) -> PResult<Select> {
        let pos = self.cur_token().pos;
        let with = if self.eat_kw("WITH") {
            let recursive = self.eat_kw("RECURSIVE");
            let mut ctes = Vec::new();
            loop {
                let name = self.parse_ident()?;
                let columns = if self.cur_kind() == &TokenKind::LParen {
                    self.parse_ident_list_paren()?
                } else {
                    vec![]
                };
                self.expect_kw("AS")?;
                self.expect(TokenKind::LParen)?;
                let query = self.parse_select()?;
                self.expect(TokenKind::RParen)?;
                ctes.push(CommonTableExpr { name, columns, query: Box::new(query) });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            Some(WithClause { recursive, ctes })
        } else {
            None
        };

        self.expect_kw("SELECT")?;
        let distinct = self.eat_kw("DISTINCT");

        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_select_item()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        let mut from = Vec::new();
        if self.eat_kw("FROM") {
            loop {
                from.push(self.parse_from_item()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let filter = if self.eat_kw("WHERE") { Some(self.parse_expr(0)?) } else { None };

        let mut group_by = Vec::new();
        if self.eat_kw("GROUP") {
            self.expect_kw("BY")?;
            loop {
                group_by.push(self.parse_expr(100)?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let having = if self.eat_kw("HAVING") { Some(self.parse_expr(0)?) } else { None };

        let mut order_by = Vec::new();
        if self.eat_kw("ORDER") {
            self.expect_kw("BY")?;
            order_by = self.parse_order_by_list()?;
        }

        let limit = if self.eat_kw("LIMIT") { Some(self.parse_expr(100)?) } else { None };
        let offset = if self.eat_kw("OFFSET") { Some(self.parse_expr(100)?) } else { None };

        let union = if self.eat_kw("UNION") {
            let all = self.eat_kw("ALL");
            Some((SetOp::Union { all }, Box::new(self.parse_select()?)))
        } else if self.eat_kw("INTERSECT") {
            Some((SetOp::Intersect, Box::new(self.parse_select()?)))
        } else if self.eat_kw("EXCEPT") {
            Some((SetOp::Except, Box::new(self.parse_select()?)))
        } else {
            None
        };

        Ok(Select { with, distinct, columns, from, filter, group_by, having, order_by, limit, offset, union, pos })
    }

    fn parse_order_by_list(&mut self) -> PResult<Vec<OrderByExpr>> {
        let mut items = Vec::new();
        loop {
            let expr = self.parse_expr(100)?;
            let asc = if self.eat_kw("ASC") {
                Some(true)
            } else if self.eat_kw("DESC") {
                Some(false)
            } else {
                None
            };
            let nulls_first = if self.eat_kw("NULLS") {
                if self.eat_kw("FIRST") {
                    Some(true)
                } else {
                    self.expect_kw("LAST")?;
                    Some(false)
                }
            } else {
                None
            };
            items.push(OrderByExpr { expr, asc, nulls_first });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> PResult<SelectItem> {
        if self.cur_kind() == &TokenKind::Star {
            self.bump();
            return Ok(SelectItem { expr: Expr::Wildcard, alias: None });
        }
        let expr = self.parse_expr(0)?;
        let alias = if self.eat_kw("AS") {
            Some(self.parse_ident()?)
        } else if matches!(self.cur_kind(), TokenKind::Ident(_) | TokenKind::QuotedIdent(_)) {
            Some(self.parse_ident()?)
        } else {
            None
        };
        Ok(SelectItem { expr, alias })
    }

    fn parse_from_item(&mut self) -> PResult<From> {
        let table = self.parse_table_ref()?;
        let mut joins = Vec::new();
        loop {
            let kind = if self.eat_kw("LEFT") {
                self.eat_kw("OUTER");
                self.expect_kw("JOIN")?;
                JoinKind::Left
            } else if self.eat_kw("RIGHT") {
                self.eat_kw("OUTER");
                self.expect_kw("JOIN")?;
                JoinKind::Right
            } else if self.eat_kw("FULL") {
                self.eat_kw("OUTER");
                self.expect_kw("JOIN")?;
                JoinKind::Full
            } else if self.eat_kw("INNER") {
                self.expect_kw("JOIN")?;
                JoinKind::Inner
            } else if self.eat_kw("CROSS") {
                self.expect_kw("JOIN")?;
                JoinKind::Cross
            } else if self.eat_kw("JOIN") {
                JoinKind::Inner
            } else {
                break;
            };
            let jtable = self.parse_table_ref()?;
            let on = if kind != JoinKind::Cross && self.eat_kw("ON") {
                Some(self.parse_expr(0)?)
            } else {
                None
            };
            joins.push(Join { kind, table: jtable, on });
        }
        Ok(From { table, joins })
    }

    fn parse_table_ref(&mut self) -> PResult<TableRef> {
        if self.cur_kind() == &TokenKind::LParen {
            self.bump();
            let subquery = self.parse_select()?;
            self.expect(TokenKind::RParen)?;
            self.eat_kw("AS");
            let alias = self.parse_ident()?;
            Ok(TableRef::Derived { subquery: Box::new(subquery), alias })
        } else {
            let name = self.parse_object_name()?;
            let alias = if self.eat_kw("AS") {
                Some(self.parse_ident()?)
            } else if matches!(self.cur_kind(), TokenKind::Ident(_) | TokenKind::QuotedIdent(_)) {
                Some(self.parse_ident()?)
            } else {
                None
            };
            Ok(TableRef::Named { name, alias })
        }
    }

    // ---------------------------------------------------------------
    // INSERT / UPDATE / DELETE
    // ---------------------------------------------------------------

    fn parse_insert(&mut self) -> PResult<Insert> {
        let pos = self.cur_token().pos;
        self.expect_kw("INSERT")?;
        self.expect_kw("INTO")?;
        let table = self.parse_object_name()?;
        let columns = if self.cur_kind() == &TokenKind::LParen {
            self.parse_ident_list_paren()?
        } else {
            vec![]
        };
        let source = if self.eat_kw("VALUES") {
            let mut rows = Vec::new();
            loop {
                self.expect(TokenKind::LParen)?;
                let mut row = Vec::new();
                if self.cur_kind() != &TokenKind::RParen {
                    loop {
                        row.push(self.parse_expr(100)?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RParen)?;
                rows.push(row);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            InsertSource::Values(rows)
        } else {
            InsertSource::Select(Box::new(self.parse_select()?))
        };

        let on_conflict = if self.eat_kw("ON") {
            self.expect_kw("CONFLICT")?;
            let target = if self.cur_kind() == &TokenKind::LParen {
                Some(ConflictTarget::Columns(self.parse_ident_list_paren()?))
            } else if self.eat_kw("ON") {
                self.expect_kw("CONSTRAINT")?;
                Some(ConflictTarget::Constraint(self.parse_ident()?))
            } else {
                None
            };
            self.expect_kw("DO")?;
            if self.eat_kw("NOTHING") {
                Some(OnConflict::DoNothing { target })
            } else {
                self.expect_kw("UPDATE")?;
                self.expect_kw("SET")?;
                let assignments = self.parse_assignment_list()?;
                let filter = if self.eat_kw("WHERE") { Some(self.parse_expr(0)?) } else { None };
                Some(OnConflict::DoUpdate { target, assignments, filter })
            }
        } else {
            None
        };

        let returning = self.parse_returning_opt()?;

        Ok(Insert { table, columns, source, on_conflict, returning, pos })
    }

    fn parse_assignment_list(&mut self) -> PResult<Vec<Assignment>> {
        let mut out = Vec::new();
        loop {
            let column = self.parse_ident()?;
            self.expect(TokenKind::Eq)?;
            let value = if self.is_kw("DEFAULT") {
                self.bump();
                Expr::Raw(RawSql { text: "DEFAULT".to_string(), pos: 0 })
            } else {
                self.parse_expr(100)?
            };
            out.push(Assignment { column, value });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(out)
    }

    fn parse_returning_opt(&mut self) -> PResult<Vec<SelectItem>> {
        if self.eat_kw("RETURNING") {
            let mut items = Vec::new();
            loop {
                items.push(self.parse_select_item()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            Ok(items)
        } else {
            Ok(vec![])
        }
    }

    fn parse_update(&mut self) -> PResult<Update> {
        let pos = self.cur_token().pos;
        self.expect_kw("UPDATE")?;
        let table = self.parse_object_name()?;
        self.expect_kw("SET")?;
        let assignments = self.parse_assignment_list()?;
        let filter = if self.eat_kw("WHERE") { Some(self.parse_expr(0)?) } else { None };
        let returning = self.parse_returning_opt()?;
        Ok(Update { table, assignments, filter, returning, pos })
    }

    fn parse_delete(&mut self) -> PResult<Delete> {
        let pos = self.cur_token().pos;
        self.expect_kw("DELETE")?;
        self.expect_kw("FROM")?;
        let table = self.parse_object_name()?;
        let filter = if self.eat_kw("WHERE") { Some(self.parse_expr(0)?) } else { None };
        let returning = self.parse_returning_opt()?;
        Ok(Delete { table, filter, returning, pos })
    }

    // ---------------------------------------------------------------
    // Expressions — Pratt precedence climbing.
    // Precedence (low to high): OR < AND < NOT < IS/BETWEEN/LIKE/IN <
    // comparison < concat < additive < multiplicative < unary
    // ---------------------------------------------------------------

    fn parse_expr(&mut self, min_bp: u8) -> PResult<Expr> {
        let mut lhs = self.parse_prefix()?;
        loop {
            let bp = self.infix_binding_power();
            let Some((lbp, rbp, op)) = bp else { break };
            if lbp < min_bp {
                break;
            }
            lhs = self.parse_infix(lhs, rbp, op)?;
        }
        Ok(lhs)
    }

    fn infix_binding_power(&self) -> Option<(u8, u8, InfixOp)> {
        let op = match self.cur_kind() {
            TokenKind::Keyword(k) if k == "OR" => InfixOp::Or,
            TokenKind::Keyword(k) if k == "AND" => InfixOp::And,
            TokenKind::Keyword(k) if k == "IS" => InfixOp::Is,
            TokenKind::Keyword(k) if k == "BETWEEN" => InfixOp::Between,
            TokenKind::Keyword(k) if k == "LIKE" => InfixOp::Like,
            TokenKind::Keyword(k) if k == "ILIKE" => InfixOp::ILike,
            TokenKind::Keyword(k) if k == "IN" => InfixOp::In,
            TokenKind::Keyword(k) if k == "NOT" => InfixOp::NotPrefix,
            TokenKind::Eq => InfixOp::Bin(BinaryOp::Eq),
            TokenKind::NotEq => InfixOp::Bin(BinaryOp::NotEq),
            TokenKind::Lt => InfixOp::Bin(BinaryOp::Lt),
            TokenKind::LtEq => InfixOp::Bin(BinaryOp::LtEq),
            TokenKind::Gt => InfixOp::Bin(BinaryOp::Gt),
            TokenKind::GtEq => InfixOp::Bin(BinaryOp::GtEq),
            TokenKind::Concat => InfixOp::Bin(BinaryOp::Concat),
            TokenKind::Plus => InfixOp::Bin(BinaryOp::Plus),
            TokenKind::Minus => InfixOp::Bin(BinaryOp::Minus),
            TokenKind::Star => InfixOp::Bin(BinaryOp::Multiply),
            TokenKind::Slash => InfixOp::Bin(BinaryOp::Divide),
            TokenKind::Percent => InfixOp::Bin(BinaryOp::Modulo),
            TokenKind::Arrow => InfixOp::Bin(BinaryOp::JsonArrow),
            TokenKind::ArrowText => InfixOp::Bin(BinaryOp::JsonArrowText),
            TokenKind::Contains => InfixOp::Bin(BinaryOp::Contains),
            TokenKind::ContainedBy => InfixOp::Bin(BinaryOp::ContainedBy),
            TokenKind::Overlap => InfixOp::Bin(BinaryOp::Overlap),
            TokenKind::RegexMatch => InfixOp::Bin(BinaryOp::RegexMatch),
            TokenKind::RegexNotMatch => InfixOp::Bin(BinaryOp::RegexNotMatch),
            TokenKind::RegexMatchCI => InfixOp::Bin(BinaryOp::RegexMatchCI),
            TokenKind::RegexNotMatchCI => InfixOp::Bin(BinaryOp::RegexNotMatchCI),
            TokenKind::DoubleColon => InfixOp::Cast,
            _ => return None,
        };
        let (lbp, rbp) = match op {
            InfixOp::Or => (1, 2),
            InfixOp::And => (3, 4),
            InfixOp::NotPrefix => (5, 6), // NOT BETWEEN / NOT IN / NOT LIKE
            InfixOp::Is | InfixOp::Between | InfixOp::Like | InfixOp::ILike | InfixOp::In => (5, 6),
            InfixOp::Bin(BinaryOp::Eq)
            | InfixOp::Bin(BinaryOp::NotEq)
            | InfixOp::Bin(BinaryOp::Lt)
            | InfixOp::Bin(BinaryOp::LtEq)
            | InfixOp::Bin(BinaryOp::Gt)
            | InfixOp::Bin(BinaryOp::GtEq)
            | InfixOp::Bin(BinaryOp::RegexMatch)
            | InfixOp::Bin(BinaryOp::RegexNotMatch)
            | InfixOp::Bin(BinaryOp::RegexMatchCI)
            | InfixOp::Bin(BinaryOp::RegexNotMatchCI)
            | InfixOp::Bin(BinaryOp::Contains)
            | InfixOp::Bin(BinaryOp::ContainedBy)
            | InfixOp::Bin(BinaryOp::Overlap) => (7, 8),
            InfixOp::Bin(BinaryOp::Concat) => (9, 10),
            InfixOp::Bin(BinaryOp::JsonArrow) | InfixOp::Bin(BinaryOp::JsonArrowText) => (15, 16),
            InfixOp::Bin(BinaryOp::Plus) | InfixOp::Bin(BinaryOp::Minus) => (11, 12),
            InfixOp::Bin(BinaryOp::Multiply) | InfixOp::Bin(BinaryOp::Divide) | InfixOp::Bin(BinaryOp::Modulo) => (13, 14),
            InfixOp::Cast => (17, 18),
        };
        Some((lbp, rbp, op))
    }

    fn parse_infix(&mut self, lhs: Expr, rbp: u8, op: InfixOp) -> PResult<Expr> {
        let pos = self.cur_token().pos;
        match op {
            InfixOp::Or => {
                self.bump();
                let rhs = self.parse_expr(rbp)?;
                Ok(Expr::Binary { op: BinaryOp::Or, left: Box::new(lhs), right: Box::new(rhs), pos })
            }
            InfixOp::And => {
                self.bump();
                let rhs = self.parse_expr(rbp)?;
                Ok(Expr::Binary { op: BinaryOp::And, left: Box::new(lhs), right: Box::new(rhs), pos })
            }
            InfixOp::Bin(bop) => {
                self.bump();
                let rhs = self.parse_expr(rbp)?;
                Ok(Expr::Binary { op: bop, left: Box::new(lhs), right: Box::new(rhs), pos })
            }
            InfixOp::Is => {
                self.bump();
                let negated = self.eat_kw("NOT");
                if self.eat_kw("NULL") {
                    Ok(Expr::IsNull { expr: Box::new(lhs), negated, pos })
                } else if self.eat_kw("TRUE") {
                    Ok(Expr::IsBool { expr: Box::new(lhs), value: true, negated, pos })
                } else if self.eat_kw("FALSE") {
                    Ok(Expr::IsBool { expr: Box::new(lhs), value: false, negated, pos })
                } else {
                    Err("expected NULL/TRUE/FALSE after IS".to_string())
                }
            }
            InfixOp::Between => {
                self.bump();
                let low = self.parse_expr(9)?;
                self.expect_kw("AND")?;
                let high = self.parse_expr(9)?;
                Ok(Expr::Between { expr: Box::new(lhs), negated: false, low: Box::new(low), high: Box::new(high), pos })
            }
            InfixOp::Like => {
                self.bump();
                let rhs = self.parse_expr(rbp)?;
                Ok(Expr::Binary { op: BinaryOp::Like, left: Box::new(lhs), right: Box::new(rhs), pos })
            }
            InfixOp::ILike => {
                self.bump();
                let rhs = self.parse_expr(rbp)?;
                Ok(Expr::Binary { op: BinaryOp::ILike, left: Box::new(lhs), right: Box::new(rhs), pos })
            }
            InfixOp::In => {
                self.bump();
                self.parse_in_tail(lhs, false, pos)
            }
            InfixOp::NotPrefix => {
                self.bump();
                if self.eat_kw("IN") {
                    self.parse_in_tail(lhs, true, pos)
                } else if self.eat_kw("BETWEEN") {
                    let low = self.parse_expr(9)?;
                    self.expect_kw("AND")?;
                    let high = self.parse_expr(9)?;
                    Ok(Expr::Between { expr: Box::new(lhs), negated: true, low: Box::new(low), high: Box::new(high), pos })
                } else if self.eat_kw("LIKE") {
                    let rhs = self.parse_expr(rbp)?;
                    Ok(Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(Expr::Binary { op: BinaryOp::Like, left: Box::new(lhs), right: Box::new(rhs), pos }),
                        pos,
                    })
                } else if self.eat_kw("ILIKE") {
                    let rhs = self.parse_expr(rbp)?;
                    Ok(Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(Expr::Binary { op: BinaryOp::ILike, left: Box::new(lhs), right: Box::new(rhs), pos }),
                        pos,
                    })
                } else {
                    Err("expected IN/BETWEEN/LIKE/ILIKE after NOT".to_string())
                }
            }
            InfixOp::Cast => {
                self.bump();
                let type_name = self.parse_type_name()?;
                Ok(Expr::Cast { expr: Box::new(lhs), type_name, was_double_colon: true, pos })
            }
        }
    }

    fn parse_in_tail(&mut self, lhs: Expr, negated: bool, pos: usize) -> PResult<Expr> {
        self.expect(TokenKind::LParen)?;
        if self.is_kw("SELECT") || self.is_kw("WITH") {
            let subquery = self.parse_select()?;
            self.expect(TokenKind::RParen)?;
            Ok(Expr::InSubquery { expr: Box::new(lhs), negated, subquery: Box::new(subquery), pos })
        } else {
            let mut list = Vec::new();
            if self.cur_kind() != &TokenKind::RParen {
                loop {
                    list.push(self.parse_expr(100)?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
            Ok(Expr::InList { expr: Box::new(lhs), negated, list, pos })
        }
    }

    fn parse_prefix(&mut self) -> PResult<Expr> {
        let pos = self.cur_token().pos;
        match self.cur_kind().clone() {
            TokenKind::Keyword(k) if k == "NOT" => {
                self.bump();
                let expr = self.parse_expr(5)?;
                Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(expr), pos })
            }
            TokenKind::Minus => {
                self.bump();
                let expr = self.parse_expr(15)?;
                Ok(Expr::Unary { op: UnaryOp::Neg, expr: Box::new(expr), pos })
            }
            TokenKind::Plus => {
                self.bump();
                let expr = self.parse_expr(15)?;
                Ok(Expr::Unary { op: UnaryOp::Plus, expr: Box::new(expr), pos })
            }
            TokenKind::Keyword(k) if k == "EXISTS" => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let subquery = self.parse_select()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Exists { negated: false, subquery: Box::new(subquery), pos })
            }
            TokenKind::Keyword(k) if k == "CASE" => self.parse_case(),
            TokenKind::Keyword(k) if k == "CAST" => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let expr = self.parse_expr(0)?;
                self.expect_kw("AS")?;
                let type_name = self.parse_type_name()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Cast { expr: Box::new(expr), type_name, was_double_colon: false, pos })
            }
            TokenKind::Keyword(k) if k == "EXTRACT" => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let field = self.parse_ident()?.value.to_ascii_lowercase();
                self.expect_kw("FROM")?;
                let expr = self.parse_expr(0)?;
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Extract { field, expr: Box::new(expr), pos })
            }
            TokenKind::Keyword(k) if k == "INTERVAL" => {
                self.bump();
                let value = match self.cur_kind().clone() {
                    TokenKind::String(s) => {
                        self.bump();
                        s
                    }
                    _ => return Err("expected interval literal string".to_string()),
                };
                let unit = if let TokenKind::Ident(_) = self.cur_kind() {
                    Some(self.parse_ident()?.value)
                } else {
                    None
                };
                Ok(Expr::Interval { value, unit, pos })
            }
            TokenKind::Keyword(k) if k == "ARRAY" => {
                self.bump();
                self.expect(TokenKind::LBracket)?;
                let mut elements = Vec::new();
                if self.cur_kind() != &TokenKind::RBracket {
                    loop {
                        elements.push(self.parse_expr(100)?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::ArrayLiteral { elements, pos })
            }
            TokenKind::Keyword(k) if k == "TRUE" => {
                self.bump();
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            TokenKind::Keyword(k) if k == "FALSE" => {
                self.bump();
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            TokenKind::Keyword(k) if k == "NULL" => {
                self.bump();
                Ok(Expr::Literal(Literal::Null))
            }
            TokenKind::Number(n) => {
                self.bump();
                Ok(Expr::Literal(Literal::Number(n)))
            }
            TokenKind::String(s) => {
                self.bump();
                Ok(Expr::Literal(Literal::String(s)))
            }
            TokenKind::DollarQuoted { tag, body } => {
                self.bump();
                Ok(Expr::Literal(Literal::DollarQuoted { tag, body }))
            }
            TokenKind::Placeholder(n) => {
                self.bump();
                Ok(Expr::Placeholder(format!("${}", n)))
            }
            TokenKind::Star => {
                self.bump();
                Ok(Expr::Wildcard)
            }
            TokenKind::LParen => {
                self.bump();
                if self.is_kw("SELECT") || self.is_kw("WITH") {
                    let sel = self.parse_select()?;
                    self.expect(TokenKind::RParen)?;
                    Ok(Expr::Subquery(Box::new(sel)))
                } else {
                    let e = self.parse_expr(0)?;
                    self.expect(TokenKind::RParen)?;
                    Ok(Expr::Paren(Box::new(e)))
                }
            }
            TokenKind::Ident(_) | TokenKind::QuotedIdent(_) | TokenKind::Keyword(_) => self.parse_ident_or_call(pos),
            other => Err(format!("unexpected token in expression: {:?}", other)),
        }
    }

    fn parse_case(&mut self) -> PResult<Expr> {
        let pos = self.cur_token().pos;
        self.expect_kw("CASE")?;
        let operand = if !self.is_kw("WHEN") { Some(Box::new(self.parse_expr(100)?)) } else { None };
        let mut whens = Vec::new();
        while self.eat_kw("WHEN") {
            let condition = self.parse_expr(0)?;
            self.expect_kw("THEN")?;
            let result = self.parse_expr(0)?;
            whens.push(CaseWhen { condition: Box::new(condition), result: Box::new(result) });
        }
        let else_result = if self.eat_kw("ELSE") { Some(Box::new(self.parse_expr(0)?)) } else { None };
        self.expect_kw("END")?;
        Ok(Expr::Case { operand, whens, else_result, pos })
    }

    /// Disambiguates a bare/qualified identifier from a function call,
    /// and handles `a.b.c` / `a.*` qualified references.
    fn parse_ident_or_call(&mut self, pos: usize) -> PResult<Expr> {
        let first = self.parse_ident()?;
        if self.cur_kind() == &TokenKind::LParen {
            self.bump();
            let distinct = self.eat_kw("DISTINCT");
            let mut star = false;
            let mut args = Vec::new();
            if self.cur_kind() == &TokenKind::Star {
                self.bump();
                star = true;
            } else if self.cur_kind() != &TokenKind::RParen {
                loop {
                    args.push(self.parse_expr(100)?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            let order_by = if self.eat_kw("ORDER") {
                self.expect_kw("BY")?;
                self.parse_order_by_list()?
            } else {
                vec![]
            };
            self.expect(TokenKind::RParen)?;
            return Ok(Expr::Function(FunctionCall {
                name: ObjectName(vec![first]),
                args,
                distinct,
                star,
                order_by,
                pos,
            }));
        }

        let mut parts = vec![first];
        while self.cur_kind() == &TokenKind::Dot {
            self.bump();
            if self.cur_kind() == &TokenKind::Star {
                self.bump();
                return Ok(Expr::QualifiedWildcard(parts));
            }
            parts.push(self.parse_ident()?);
        }
        if parts.len() == 1 {
            Ok(Expr::Ident(parts.into_iter().next().unwrap()))
        } else {
            Ok(Expr::CompoundIdent(parts))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum InfixOp {
    Or,
    And,
    Is,
    Between,
    Like,
    ILike,
    In,
    NotPrefix,
    Cast,
    Bin(BinaryOp),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_select() {
        let (stmts, warnings) = parse("SELECT a, b FROM t WHERE a = 1 AND b > 2").unwrap();
        assert!(warnings.is_empty());
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            Stmt::Select(s) => {
                assert_eq!(s.columns.len(), 2);
                assert!(s.filter.is_some());
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn falls_back_to_raw_on_garbage() {
        let (stmts, warnings) = parse("SELEC BOGUS FROM").unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(!warnings.is_empty());
        assert!(matches!(stmts[0], Stmt::Raw(_)));
    }

    #[test]
    fn parses_insert_with_on_conflict() {
        let (stmts, warnings) = parse(
            "INSERT INTO t (id, name) VALUES (1, 'a') ON CONFLICT (id) DO UPDATE SET name = excluded.name",
        )
        .unwrap();
        assert!(warnings.is_empty());
        match &stmts[0] {
            Stmt::Insert(i) => assert!(i.on_conflict.is_some()),
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn parses_create_table_with_uuid_default() {
        let (stmts, warnings) =
            parse("CREATE TABLE t (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), name TEXT)").unwrap();
        assert!(warnings.is_empty());
        match &stmts[0] {
            Stmt::CreateTable(c) => {
                assert_eq!(c.columns.len(), 2);
                assert!(c.columns[0].primary_key);
                assert!(c.columns[0].default.is_some());
            }
            _ => panic!("expected create table"),
        }
    }

    #[test]
    fn parses_create_function() {
        let (stmts, warnings) =
            parse("CREATE FUNCTION cnt() RETURNS integer LANGUAGE sql AS $$ SELECT count(*) FROM users $$")
                .unwrap();
        assert!(warnings.is_empty());
        match &stmts[0] {
            Stmt::CreateFunction(f) => {
                assert_eq!(f.language, "sql");
                assert!(f.body.text.contains("count(*)"));
            }
            _ => panic!("expected create function"),
        }
    }

    #[test]
    fn parses_json_arrow_chain() {
        let expr = parse_expr_standalone("addr->'postcode'").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::JsonArrow, .. }));
    }
}
