//! Recursive-descent parser for the `when` language.
//!
//! Precedence, loosest first: `||`, `&&`, `== !=`, `< <= > >=`, unary
//! `! -`, then postfix `.field` / `[index]`.

use crate::lexer::{tokenize, Token};

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String literal.
    Str(String),
    /// Number literal.
    Num(f64),
    /// Boolean literal.
    Bool(bool),
    /// `null` literal.
    Null,
    /// Root identifier resolved against the normalized event.
    Ident(String),
    /// `base.field`
    Field(Box<Expr>, String),
    /// `base[index]`
    Index(Box<Expr>, usize),
    /// `!expr`
    Not(Box<Expr>),
    /// `-expr`
    Neg(Box<Expr>),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
}

pub(crate) fn parse(src: &str) -> Result<Expr, String> {
    if src.trim().is_empty() {
        return Err("empty expression".to_string());
    }
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if let Some(tok) = parser.peek() {
        return Err(format!("unexpected trailing token '{tok}'"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.equality()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, String> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                    other => {
                        return Err(match other {
                            Some(tok) => format!("expected field name after '.', found '{tok}'"),
                            None => "expected field name after '.'".to_string(),
                        });
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = match self.next() {
                    Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                    other => {
                        return Err(match other {
                            Some(tok) => format!("expected array index, found '{tok}'"),
                            None => "expected array index".to_string(),
                        });
                    }
                };
                if !self.eat(&Token::RBracket) {
                    return Err("expected ']' after array index".to_string());
                }
                expr = Expr::Index(Box::new(expr), index);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let expr = self.or_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err("expected ')'".to_string());
                }
                Ok(expr)
            }
            Some(tok) => Err(format!("unexpected token '{tok}'")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_field_access() {
        let expr = parse("check_suite.head_commit.id != \"\"").unwrap();
        match expr {
            Expr::Binary { op: BinOp::Ne, lhs, .. } => match *lhs {
                Expr::Field(inner, ref id) => {
                    assert_eq!(id, "id");
                    assert!(matches!(*inner, Expr::Field(_, _)));
                }
                other => panic!("unexpected lhs: {other:?}"),
            },
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn precedence_and_over_or() {
        // a || b && c parses as a || (b && c)
        let expr = parse("a || b && c").unwrap();
        match expr {
            Expr::Binary { op: BinOp::Or, rhs, .. } => {
                assert!(matches!(*rhs, Expr::Binary { op: BinOp::And, .. }));
            }
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn parses_indexing() {
        let expr = parse("commits[1] == null").unwrap();
        match expr {
            Expr::Binary { lhs, .. } => assert!(matches!(*lhs, Expr::Index(_, 1))),
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse("").is_err());
        assert!(parse("action ==").is_err());
        assert!(parse("((a)").is_err());
        assert!(parse("a.").is_err());
        assert!(parse("a[b]").is_err());
        assert!(parse("a b").is_err());
    }
}
