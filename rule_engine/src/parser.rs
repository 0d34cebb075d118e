// Recursive-descent parser for rule files.
//
// A syntax error inside a rule abandons that rule and resumes after its `end`
// keyword so one pass reports errors for every broken rule in the file.

use crate::ast::{Action, Assignment, BinaryOp, Expr, Pattern, Pos, RuleDecl, SourceFile, UnaryOp};
use crate::lexer::{tokenize, Tok, Token};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

type PResult<T> = Result<T, ParseError>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// Parses a whole file. Returns whatever could be parsed plus every error met.
pub(crate) fn parse(source: &str) -> (SourceFile, Vec<ParseError>) {
    let mut file = SourceFile {
        package: None,
        imports: Vec::new(),
        rules: Vec::new(),
    };
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(e) => {
            return (
                file,
                vec![ParseError {
                    line: e.line,
                    column: e.column,
                    message: e.message,
                }],
            )
        }
    };

    let mut parser = Parser { tokens, pos: 0 };
    let mut errors = Vec::new();

    if let Err(e) = parser.header(&mut file) {
        errors.push(e);
        parser.skip_to_rule();
    }

    while !parser.at_eof() {
        if !parser.at_keyword("rule") {
            let token = parser.peek().clone();
            errors.push(ParseError {
                line: token.line,
                column: token.column,
                message: format!("expected 'rule', found {}", token.tok),
            });
            parser.skip_to_rule();
            continue;
        }
        match parser.rule() {
            Ok(rule) => file.rules.push(rule),
            Err(e) => {
                errors.push(e);
                parser.skip_past_end();
            }
        }
    }

    (file, errors)
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].tok
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().tok == Tok::Eof
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.peek().tok, Tok::Ident(s) if s == keyword)
    }

    fn check(&self, tok: &Tok) -> bool {
        &self.peek().tok == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: String) -> ParseError {
        let token = self.peek();
        ParseError {
            line: token.line,
            column: token.column,
            message,
        }
    }

    fn expect(&mut self, tok: Tok, context: &str) -> PResult<Token> {
        if self.check(&tok) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!(
                "expected {} {}, found {}",
                tok,
                context,
                self.peek().tok
            )))
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> PResult<Token> {
        if self.at_keyword(keyword) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!("expected '{}', found {}", keyword, self.peek().tok)))
        }
    }

    fn ident(&mut self, context: &str) -> PResult<(String, Pos)> {
        let token = self.peek().clone();
        match token.tok {
            Tok::Ident(name) => {
                self.advance();
                Ok((name, Pos { line: token.line, column: token.column }))
            }
            other => Err(self.error_here(format!("expected {}, found {}", context, other))),
        }
    }

    fn var(&mut self, context: &str) -> PResult<(String, Pos)> {
        let token = self.peek().clone();
        match token.tok {
            Tok::Var(name) => {
                self.advance();
                Ok((name, Pos { line: token.line, column: token.column }))
            }
            other => Err(self.error_here(format!("expected {}, found {}", context, other))),
        }
    }

    fn qualified_name(&mut self, context: &str) -> PResult<String> {
        let (mut name, _) = self.ident(context)?;
        while self.check(&Tok::Dot) && matches!(self.peek_at(1), Tok::Ident(_)) {
            self.advance();
            let (segment, _) = self.ident(context)?;
            name.push('.');
            name.push_str(&segment);
        }
        Ok(name)
    }

    fn skip_to_rule(&mut self) {
        while !self.at_eof() && !self.at_keyword("rule") {
            self.advance();
        }
    }

    fn skip_past_end(&mut self) {
        while !self.at_eof() {
            if self.at_keyword("end") {
                self.advance();
                return;
            }
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn header(&mut self, file: &mut SourceFile) -> PResult<()> {
        if self.at_keyword("package") {
            self.advance();
            file.package = Some(self.qualified_name("a package name")?);
            self.eat(&Tok::Semi);
        }
        while self.at_keyword("import") {
            self.advance();
            let mut name = self.qualified_name("an import")?;
            if self.check(&Tok::Dot) && self.peek_at(1) == &Tok::Star {
                self.advance();
                self.advance();
                name.push_str(".*");
            }
            self.eat(&Tok::Semi);
            file.imports.push(name);
        }
        Ok(())
    }

    fn rule(&mut self) -> PResult<RuleDecl> {
        let start = self.expect_keyword("rule")?;
        let name = match self.advance().tok {
            Tok::Str(s) | Tok::Ident(s) => s,
            other => {
                return Err(ParseError {
                    line: start.line,
                    column: start.column,
                    message: format!("expected a rule name after 'rule', found {}", other),
                })
            }
        };
        if name.trim().is_empty() {
            return Err(ParseError {
                line: start.line,
                column: start.column,
                message: "rule name must not be empty".to_string(),
            });
        }

        let mut rule = RuleDecl {
            name,
            line: start.line,
            column: start.column,
            salience: 0,
            no_loop: false,
            patterns: Vec::new(),
            actions: Vec::new(),
        };

        self.attributes(&mut rule)?;

        self.expect_keyword("when")?;
        while !self.at_keyword("then") {
            if self.at_eof() || self.at_keyword("end") {
                return Err(self.error_here(format!(
                    "expected 'then' in rule \"{}\", found {}",
                    rule.name,
                    self.peek().tok
                )));
            }
            let pattern = self.pattern()?;
            rule.patterns.push(pattern);
        }
        self.advance();

        while !self.at_keyword("end") {
            if self.at_eof() {
                return Err(self.error_here(format!("missing 'end' for rule \"{}\"", rule.name)));
            }
            let action = self.action()?;
            rule.actions.push(action);
        }
        self.advance();
        Ok(rule)
    }

    fn attributes(&mut self, rule: &mut RuleDecl) -> PResult<()> {
        loop {
            if self.at_keyword("salience") {
                self.advance();
                let negative = self.eat(&Tok::Minus);
                match self.advance().tok {
                    Tok::Int(i) => {
                        let value = if negative { -i } else { i };
                        rule.salience = i32::try_from(value).map_err(|_| {
                            self.error_here(format!("salience {} out of range", value))
                        })?;
                    }
                    other => {
                        return Err(self.error_here(format!(
                            "expected an integer after 'salience', found {}",
                            other
                        )))
                    }
                }
            } else if self.at_keyword("no") && self.peek_at(1) == &Tok::Minus {
                self.advance();
                self.advance();
                self.expect_keyword("loop")?;
                rule.no_loop = match &self.peek().tok {
                    Tok::Ident(s) if s == "true" => {
                        self.advance();
                        true
                    }
                    Tok::Ident(s) if s == "false" => {
                        self.advance();
                        false
                    }
                    _ => true,
                };
            } else {
                return Ok(());
            }
        }
    }

    fn pattern(&mut self) -> PResult<Pattern> {
        let start = self.peek().clone();
        let negated = if self.at_keyword("not") {
            self.advance();
            true
        } else {
            false
        };

        let binding = if matches!(self.peek().tok, Tok::Var(_)) && self.peek_at(1) == &Tok::Colon {
            let (name, _) = self.var("a binding")?;
            self.advance();
            Some(name)
        } else {
            None
        };

        let type_name = self.qualified_name("a fact type")?;
        self.expect(Tok::LParen, "after the fact type")?;
        let mut constraints = Vec::new();
        if !self.check(&Tok::RParen) {
            loop {
                constraints.push(self.expr()?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "to close the pattern")?;

        Ok(Pattern {
            binding,
            type_name,
            constraints,
            negated,
            line: start.line,
            column: start.column,
        })
    }

    fn action(&mut self) -> PResult<Action> {
        let (keyword, pos) = self.ident("an action ('modify', 'insert' or 'delete')")?;
        let action = match keyword.as_str() {
            "modify" => {
                self.expect(Tok::LParen, "after 'modify'")?;
                let (binding, _) = self.var("a binding to modify")?;
                self.expect(Tok::RParen, "after the modified binding")?;
                self.expect(Tok::LBrace, "to open the modify block")?;
                let assignments = self.assignments(&Tok::RBrace)?;
                self.expect(Tok::RBrace, "to close the modify block")?;
                Action::Modify {
                    binding,
                    assignments,
                    pos,
                }
            }
            "insert" => {
                self.expect(Tok::LParen, "after 'insert'")?;
                self.expect_keyword("new")?;
                let type_name = self.qualified_name("a fact type")?;
                self.expect(Tok::LParen, "after the inserted type")?;
                let assignments = self.assignments(&Tok::RParen)?;
                self.expect(Tok::RParen, "to close the field list")?;
                self.expect(Tok::RParen, "to close 'insert'")?;
                Action::Insert {
                    type_name,
                    assignments,
                    pos,
                }
            }
            "delete" | "retract" => {
                self.expect(Tok::LParen, "after 'delete'")?;
                let (binding, _) = self.var("a binding to delete")?;
                self.expect(Tok::RParen, "after the deleted binding")?;
                Action::Delete { binding, pos }
            }
            other => {
                return Err(ParseError {
                    line: pos.line,
                    column: pos.column,
                    message: format!("unknown action '{}'", other),
                })
            }
        };
        self.eat(&Tok::Semi);
        Ok(action)
    }

    fn assignments(&mut self, close: &Tok) -> PResult<Vec<Assignment>> {
        let mut out = Vec::new();
        if self.check(close) {
            return Ok(out);
        }
        loop {
            let (field, _) = self.ident("a field name")?;
            self.expect(Tok::Assign, "after the field name")?;
            let value = self.expr()?;
            out.push(Assignment { field, value });
            if !self.eat(&Tok::Comma) {
                return Ok(out);
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expr(&mut self) -> PResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Tok::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut lhs = self.comparison()?;
        while self.eat(&Tok::And) {
            let rhs = self.comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek().tok {
            Tok::Eq => BinaryOp::Eq,
            Tok::Ne => BinaryOp::Ne,
            Tok::Lt => BinaryOp::Lt,
            Tok::Le => BinaryOp::Le,
            Tok::Gt => BinaryOp::Gt,
            Tok::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().tok {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().tok {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        if self.eat(&Tok::Not) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(&Tok::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let pos = Pos {
            line: token.line,
            column: token.column,
        };
        match token.tok {
            Tok::Int(i) => {
                self.advance();
                Ok(Expr::Literal(Value::Int(i)))
            }
            Tok::Float(f) => {
                self.advance();
                Ok(Expr::Literal(Value::Float(f)))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Value::Str(s)))
            }
            Tok::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(Tok::RParen, "to close the expression")?;
                Ok(inner)
            }
            Tok::Var(name) => {
                self.advance();
                if self.eat(&Tok::Dot) {
                    let (field, _) = self.ident("a field name after '.'")?;
                    Ok(Expr::VarField { var: name, field, pos })
                } else {
                    Ok(Expr::Var { name, pos })
                }
            }
            Tok::Ident(name) => {
                self.advance();
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    _ if self.check(&Tok::Dot) => Err(self.error_here(format!(
                        "nested field access on '{}' is not supported; bind the fact and use $binding.field",
                        name
                    ))),
                    _ => Ok(Expr::Field { name, pos }),
                }
            }
            other => Err(self.error_here(format!("expected an expression, found {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOUNT: &str = r#"
package com.example.rules;
import com.example.Order;

rule "Half price"
    salience 10
    no-loop
when
    $o : Order( originalPrice > 5, discounted == false )
    not Alert( code == "BLOCK" )
then
    modify($o) { price = $o.originalPrice * 0.5, discounted = true };
    insert(new Alert( code = "DISCOUNT" ));
end
"#;

    #[test]
    fn test_parses_full_rule() {
        let (file, errors) = parse(DISCOUNT);
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(file.package.as_deref(), Some("com.example.rules"));
        assert_eq!(file.imports, vec!["com.example.Order".to_string()]);
        let rule = &file.rules[0];
        assert_eq!(rule.name, "Half price");
        assert_eq!(rule.salience, 10);
        assert!(rule.no_loop);
        assert_eq!(rule.patterns.len(), 2);
        assert_eq!(rule.patterns[0].binding.as_deref(), Some("o"));
        assert_eq!(rule.patterns[0].constraints.len(), 2);
        assert!(rule.patterns[1].negated);
        assert_eq!(rule.actions.len(), 2);
    }

    #[test]
    fn test_operator_precedence() {
        let (file, errors) = parse("rule r when T( a + 2 * 3 > 4 || b ) then end");
        assert!(errors.is_empty());
        let constraint = &file.rules[0].patterns[0].constraints[0];
        match constraint {
            Expr::Binary(BinaryOp::Or, lhs, _) => match lhs.as_ref() {
                Expr::Binary(BinaryOp::Gt, sum, _) => {
                    assert!(matches!(sum.as_ref(), Expr::Binary(BinaryOp::Add, _, _)))
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_recovers_after_broken_rule() {
        let src = r#"
rule "broken" when Order( price > ) then end
rule "fine" when Order( price > 1 ) then end
"#;
        let (file, errors) = parse(src);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 2);
        assert_eq!(file.rules.len(), 1);
        assert_eq!(file.rules[0].name, "fine");
    }

    #[test]
    fn test_missing_end_is_reported() {
        let (_, errors) = parse("rule \"x\" when Order() then delete($o)");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("missing 'end'"));
    }

    #[test]
    fn test_garbage_is_not_a_rule() {
        let (file, errors) = parse("this is not a rule");
        assert!(file.rules.is_empty());
        assert!(errors[0].message.contains("expected 'rule'"));
    }
}
