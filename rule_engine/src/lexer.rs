// Tokenizer for the rule language.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Var(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Colon,
    Dot,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "'{}'", s),
            Tok::Var(s) => write!(f, "'${}'", s),
            Tok::Str(s) => write!(f, "\"{}\"", s),
            Tok::Int(i) => write!(f, "{}", i),
            Tok::Float(x) => write!(f, "{}", x),
            Tok::LParen => write!(f, "'('"),
            Tok::RParen => write!(f, "')'"),
            Tok::LBrace => write!(f, "'{{'"),
            Tok::RBrace => write!(f, "'}}'"),
            Tok::Comma => write!(f, "','"),
            Tok::Semi => write!(f, "';'"),
            Tok::Colon => write!(f, "':'"),
            Tok::Dot => write!(f, "'.'"),
            Tok::Assign => write!(f, "'='"),
            Tok::Eq => write!(f, "'=='"),
            Tok::Ne => write!(f, "'!='"),
            Tok::Lt => write!(f, "'<'"),
            Tok::Le => write!(f, "'<='"),
            Tok::Gt => write!(f, "'>'"),
            Tok::Ge => write!(f, "'>='"),
            Tok::And => write!(f, "'&&'"),
            Tok::Or => write!(f, "'||'"),
            Tok::Not => write!(f, "'!'"),
            Tok::Plus => write!(f, "'+'"),
            Tok::Minus => write!(f, "'-'"),
            Tok::Star => write!(f, "'*'"),
            Tok::Slash => write!(f, "'/'"),
            Tok::Percent => write!(f, "'%'"),
            Tok::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LexError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn error(&self, line: usize, column: usize, message: impl Into<String>) -> LexError {
        LexError {
            line,
            column,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    match ahead.next() {
                        Some('/') => self.skip_line(),
                        Some('*') => {
                            let (line, column) = (self.line, self.column);
                            self.bump();
                            self.bump();
                            let mut closed = false;
                            while let Some(c) = self.bump() {
                                if c == '*' && self.peek() == Some('/') {
                                    self.bump();
                                    closed = true;
                                    break;
                                }
                            }
                            if !closed {
                                return Err(self.error(line, column, "unterminated block comment"));
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    fn ident_tail(&mut self, out: &mut String) {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
    }

    fn string(&mut self, line: usize, column: usize) -> Result<Tok, LexError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error(line, column, "unterminated string literal")),
                Some('"') => return Ok(Tok::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        return Err(self.error(
                            self.line,
                            self.column,
                            format!("unknown escape sequence '\\{}'", other),
                        ))
                    }
                    None => return Err(self.error(line, column, "unterminated string literal")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self, first: char, line: usize, column: usize) -> Result<Tok, LexError> {
        let mut text = String::from(first);
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float {
                // Only a digit after the dot makes this a float literal.
                let mut ahead = self.chars.clone();
                ahead.next();
                match ahead.next() {
                    Some(d) if d.is_ascii_digit() => {
                        is_float = true;
                        text.push('.');
                        self.bump();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|e| self.error(line, column, format!("invalid number '{}': {}", text, e)))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|e| self.error(line, column, format!("invalid number '{}': {}", text, e)))
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia()?;
        let (line, column) = (self.line, self.column);
        let Some(c) = self.bump() else {
            return Ok(Token { tok: Tok::Eof, line, column });
        };
        let tok = match c {
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            ',' => Tok::Comma,
            ';' => Tok::Semi,
            ':' => Tok::Colon,
            '.' => Tok::Dot,
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '"' => self.string(line, column)?,
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::Eq
                } else {
                    Tok::Assign
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::Ne
                } else {
                    Tok::Not
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.bump();
                    Tok::And
                } else {
                    return Err(self.error(line, column, "expected '&&'"));
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.bump();
                    Tok::Or
                } else {
                    return Err(self.error(line, column, "expected '||'"));
                }
            }
            '$' => {
                let mut name = String::new();
                self.ident_tail(&mut name);
                if name.is_empty() {
                    return Err(self.error(line, column, "expected a binding name after '$'"));
                }
                Tok::Var(name)
            }
            c if c.is_ascii_digit() => self.number(c, line, column)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::from(c);
                self.ident_tail(&mut name);
                Tok::Ident(name)
            }
            other => return Err(self.error(line, column, format!("unexpected character '{}'", other))),
        };
        Ok(Token { tok, line, column })
    }
}

/// Splits `source` into tokens, always ending with `Tok::Eof`.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer {
        chars: source.chars().peekable(),
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.tok == Tok::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_operators_and_literals() {
        assert_eq!(
            toks("$o.price >= 10.5 && x != \"a\""),
            vec![
                Tok::Var("o".into()),
                Tok::Dot,
                Tok::Ident("price".into()),
                Tok::Ge,
                Tok::Float(10.5),
                Tok::And,
                Tok::Ident("x".into()),
                Tok::Ne,
                Tok::Str("a".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped_and_lines_tracked() {
        let tokens = tokenize("// header\n# other\n/* block\n */ rule").unwrap();
        assert_eq!(tokens[0].tok, Tok::Ident("rule".into()));
        assert_eq!(tokens[0].line, 4);
    }

    #[test]
    fn test_unterminated_string_reports_position() {
        let err = tokenize("rule \"oops").unwrap_err();
        assert_eq!((err.line, err.column), (1, 6));
    }

    #[test]
    fn test_integer_followed_by_dot_is_not_float() {
        assert_eq!(toks("5.x"), vec![Tok::Int(5), Tok::Dot, Tok::Ident("x".into()), Tok::Eof]);
    }
}
