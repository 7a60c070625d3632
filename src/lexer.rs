//! C2 lexer: tokenizes PostgreSQL-flavored SQL text, tracking line/column
//! for diagnostics. Recognizes dollar-quoted strings, `::` casts, the
//! JSON arrows, and the full PostgREST-relevant operator set.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    QuotedIdent(String),
    Number(String),
    String(String),
    DollarQuoted { tag: String, body: String },
    Keyword(String),
    // Operators / punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Concat,     // ||
    Eq,
    NotEq,      // <> or !=
    Lt,
    LtEq,
    Gt,
    GtEq,
    DoubleColon, // ::
    Arrow,       // ->
    ArrowText,   // ->>
    Contains,    // @>
    ContainedBy, // <@
    Overlap,     // &&
    RegexMatch,
    RegexNotMatch,
    RegexMatchCI,
    RegexNotMatchCI,
    Comma,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Colon,
    Placeholder(String), // $1, $2, ...
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
    pub line: usize,
    pub col: usize,
}

const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "BY", "HAVING", "ORDER", "LIMIT", "OFFSET", "AS", "AND",
    "OR", "NOT", "NULL", "TRUE", "FALSE", "IS", "IN", "BETWEEN", "LIKE", "ILIKE", "EXISTS",
    "CASE", "WHEN", "THEN", "ELSE", "END", "DISTINCT", "INSERT", "INTO", "VALUES", "UPDATE",
    "SET", "DELETE", "RETURNING", "ON", "CONFLICT", "DO", "NOTHING", "CONSTRAINT", "CREATE",
    "TABLE", "FUNCTION", "REPLACE", "OR", "DROP", "IF", "EXISTS", "CASCADE", "PRIMARY", "KEY",
    "FOREIGN", "REFERENCES", "UNIQUE", "CHECK", "DEFAULT", "COLLATE", "GENERATED", "ALWAYS",
    "IDENTITY", "RETURNS", "SETOF", "LANGUAGE", "VOLATILE", "STABLE", "IMMUTABLE", "SECURITY",
    "INVOKER", "DEFINER", "JOIN", "LEFT", "RIGHT", "FULL", "INNER", "CROSS", "WITH", "RECURSIVE",
    "UNION", "ALL", "INTERSECT", "EXCEPT", "CAST", "EXTRACT", "INTERVAL", "ARRAY", "ASC", "DESC",
    "NULLS", "FIRST", "LAST",
];

pub struct Lexer<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, chars: src.chars().collect(), pos: 0, line: 1, col: 1 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.peek_at(1) == Some('-') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.advance();
                    self.advance();
                    while let Some(c) = self.peek() {
                        if c == '*' && self.peek_at(1) == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Tokenizes the whole input. Never panics: an unrecognized byte is
    /// surfaced to the caller as a lone `Ident` of one character so the
    /// parser can fail gracefully into a `RawSql` fallback.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let start = self.pos;
            let line = self.line;
            let col = self.col;
            let Some(c) = self.peek() else {
                tokens.push(Token { kind: TokenKind::Eof, pos: start, line, col });
                break;
            };

            let kind = if c == '"' {
                self.lex_quoted_ident()
            } else if c == '\'' {
                self.lex_string(false)
            } else if (c == 'e' || c == 'E') && self.peek_at(1) == Some('\'') {
                self.advance();
                self.lex_string(true)
            } else if c == '$' && (self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false)) {
                self.lex_placeholder()
            } else if c == '$' {
                self.lex_dollar_quoted()
            } else if c.is_ascii_digit() || (c == '.' && self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false)) {
                self.lex_number()
            } else if is_ident_start(c) {
                self.lex_ident()
            } else {
                self.lex_operator()
            };

            tokens.push(Token { kind, pos: start, line, col });
        }
        tokens
    }

    fn lex_quoted_ident(&mut self) -> TokenKind {
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.advance() {
                Some('"') => {
                    if self.peek() == Some('"') {
                        self.advance();
                        s.push('"');
                    } else {
                        break;
                    }
                }
                Some(c) => s.push(c),
                None => break,
            }
        }
        TokenKind::QuotedIdent(s)
    }

    fn lex_string(&mut self, _is_e_string: bool) -> TokenKind {
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.advance() {
                Some('\'') => {
                    if self.peek() == Some('\'') {
                        self.advance();
                        s.push('\'');
                    } else {
                        break;
                    }
                }
                Some('\\') if _is_e_string => {
                    match self.advance() {
                        Some('n') => s.push('\n'),
                        Some('t') => s.push('\t'),
                        Some('r') => s.push('\r'),
                        Some('\\') => s.push('\\'),
                        Some(c) => s.push(c),
                        None => {}
                    }
                }
                Some(c) => s.push(c),
                None => break,
            }
        }
        TokenKind::String(s)
    }

    fn lex_placeholder(&mut self) -> TokenKind {
        self.advance(); // $
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.advance();
            } else {
                break;
            }
        }
        TokenKind::Placeholder(digits)
    }

    fn lex_dollar_quoted(&mut self) -> TokenKind {
        self.advance(); // opening $
        let mut tag = String::new();
        while let Some(c) = self.peek() {
            if c == '$' {
                self.advance();
                break;
            }
            tag.push(c);
            self.advance();
        }
        let close = format!("${}$", tag);
        let close_chars: Vec<char> = close.chars().collect();
        let mut body = String::new();
        loop {
            if self.pos + close_chars.len() <= self.chars.len()
                && self.chars[self.pos..self.pos + close_chars.len()] == close_chars[..]
            {
                for _ in 0..close_chars.len() {
                    self.advance();
                }
                break;
            }
            match self.advance() {
                Some(c) => body.push(c),
                None => break,
            }
        }
        TokenKind::DollarQuoted { tag, body }
    }

    fn lex_number(&mut self) -> TokenKind {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(true) {
            s.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    s.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let save = self.pos;
            let mut exp = String::new();
            exp.push(self.advance().unwrap());
            if matches!(self.peek(), Some('+') | Some('-')) {
                exp.push(self.advance().unwrap());
            }
            if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        exp.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
                s.push_str(&exp);
            } else {
                self.pos = save;
            }
        }
        TokenKind::Number(s)
    }

    fn lex_ident(&mut self) -> TokenKind {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let upper = s.to_ascii_uppercase();
        if KEYWORDS.contains(&upper.as_str()) {
            TokenKind::Keyword(upper)
        } else {
            TokenKind::Ident(s)
        }
    }

    fn lex_operator(&mut self) -> TokenKind {
        let c = self.advance().unwrap();
        match c {
            '+' => TokenKind::Plus,
            '-' => {
                if self.peek() == Some('>') {
                    self.advance();
                    if self.peek() == Some('>') {
                        self.advance();
                        TokenKind::ArrowText
                    } else {
                        TokenKind::Arrow
                    }
                } else {
                    TokenKind::Minus
                }
            }
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '|' => {
                if self.peek() == Some('|') {
                    self.advance();
                    TokenKind::Concat
                } else {
                    TokenKind::Ident("|".to_string())
                }
            }
            '=' => TokenKind::Eq,
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::NotEq
                } else if self.peek() == Some('~') {
                    self.advance();
                    if self.peek() == Some('*') {
                        self.advance();
                        TokenKind::RegexNotMatchCI
                    } else {
                        TokenKind::RegexNotMatch
                    }
                } else {
                    TokenKind::Ident("!".to_string())
                }
            }
            '<' => {
                if self.peek() == Some('>') {
                    self.advance();
                    TokenKind::NotEq
                } else if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::LtEq
                } else if self.peek() == Some('@') {
                    self.advance();
                    TokenKind::ContainedBy
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            ':' => {
                if self.peek() == Some(':') {
                    self.advance();
                    TokenKind::DoubleColon
                } else {
                    TokenKind::Colon
                }
            }
            '@' => {
                if self.peek() == Some('>') {
                    self.advance();
                    TokenKind::Contains
                } else {
                    TokenKind::Ident("@".to_string())
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.advance();
                    TokenKind::Overlap
                } else {
                    TokenKind::Ident("&".to_string())
                }
            }
            '~' => {
                if self.peek() == Some('*') {
                    self.advance();
                    TokenKind::RegexMatchCI
                } else {
                    TokenKind::RegexMatch
                }
            }
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '.' => TokenKind::Dot,
            other => TokenKind::Ident(other.to_string()),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

pub fn tokenize(src: &str) -> Vec<Token> {
    Lexer::new(src).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_dollar_quoted_body() {
        let toks = tokenize("$$SELECT 1$$");
        assert_eq!(
            toks[0].kind,
            TokenKind::DollarQuoted { tag: String::new(), body: "SELECT 1".to_string() }
        );
    }

    #[test]
    fn tokenizes_tagged_dollar_quote() {
        let toks = tokenize("$body$hi$body$");
        assert_eq!(
            toks[0].kind,
            TokenKind::DollarQuoted { tag: "body".to_string(), body: "hi".to_string() }
        );
    }

    #[test]
    fn tokenizes_json_arrows() {
        let toks = tokenize("a->b->>c");
        assert_eq!(toks[1].kind, TokenKind::Arrow);
        assert_eq!(toks[3].kind, TokenKind::ArrowText);
    }

    #[test]
    fn tokenizes_double_colon_cast() {
        let toks = tokenize("id::text");
        assert_eq!(toks[1].kind, TokenKind::DoubleColon);
    }

    #[test]
    fn skips_line_and_block_comments() {
        let toks = tokenize("SELECT 1 -- comment\n/* block */ , 2");
        let kinds: Vec<_> = toks.into_iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword("SELECT".to_string()),
                TokenKind::Number("1".to_string()),
                TokenKind::Comma,
                TokenKind::Number("2".to_string()),
                TokenKind::Eof,
            ]
        );
    }
}
