//! Matcher expressions.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ( "==" | "!=" ) primary )?
//! primary := "(" expr ")" | string | ident | ident "(" expr ( "," expr )* ")"
//! ```
//!
//! Identifiers are field references (`r.sub`, `p_obj`) or the literals
//! `true`/`false`; calls name a grouping entry (`g`, `g2`, ...).

use std::collections::BTreeMap;

use crate::error::{PolicyError, Result};
use crate::model::Model;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    Eq,
    Ne,
}

/// Parsed matcher expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// String literal.
    Str(String),
    /// Boolean literal.
    Bool(bool),
    /// Field reference, normalized to `r_sub` form.
    Field(String),
    /// Logical negation.
    Not(Box<Expr>),
    /// Short-circuit conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Short-circuit disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Equality.
    Eq(Box<Expr>, Box<Expr>),
    /// Inequality.
    Ne(Box<Expr>, Box<Expr>),
    /// Role lookup through a grouping entry.
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn into_bool(self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            Value::Str(s) => Err(PolicyError::Matcher(format!(
                "expected a boolean, found string {s:?}"
            ))),
        }
    }
}

/// Field bindings for one request/rule pair.
pub(super) type Bindings<'a> = BTreeMap<&'a str, &'a str>;

impl Expr {
    /// Parse a matcher expression.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(PolicyError::Matcher(format!(
                "unexpected trailing input in {source:?}"
            )));
        }
        Ok(expr)
    }

    /// Evaluate to a boolean.
    pub(super) fn matches(&self, model: &Model, bindings: &Bindings<'_>) -> Result<bool> {
        self.eval(model, bindings)?.into_bool()
    }

    fn eval(&self, model: &Model, bindings: &Bindings<'_>) -> Result<Value> {
        Ok(match self {
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Field(name) => {
                let value = bindings
                    .get(name.as_str())
                    .ok_or_else(|| PolicyError::Matcher(format!("unknown field {name}")))?;
                Value::Str(value.to_string())
            }
            Expr::Not(inner) => Value::Bool(!inner.matches(model, bindings)?),
            Expr::And(lhs, rhs) => {
                Value::Bool(lhs.matches(model, bindings)? && rhs.matches(model, bindings)?)
            }
            Expr::Or(lhs, rhs) => {
                Value::Bool(lhs.matches(model, bindings)? || rhs.matches(model, bindings)?)
            }
            Expr::Eq(lhs, rhs) => Value::Bool(lhs.eval(model, bindings)? == rhs.eval(model, bindings)?),
            Expr::Ne(lhs, rhs) => Value::Bool(lhs.eval(model, bindings)? != rhs.eval(model, bindings)?),
            Expr::Call(ptype, args) => {
                let mut names = Vec::with_capacity(args.len());
                for arg in args {
                    match arg.eval(model, bindings)? {
                        Value::Str(s) => names.push(s),
                        Value::Bool(_) => {
                            return Err(PolicyError::Matcher(format!(
                                "{ptype}() takes string arguments"
                            )));
                        }
                    }
                }
                match names.as_slice() {
                    [name1, name2] => Value::Bool(model.has_link(ptype, name1, name2, None)),
                    [name1, name2, domain] => {
                        Value::Bool(model.has_link(ptype, name1, name2, Some(domain)))
                    }
                    _ => {
                        return Err(PolicyError::Matcher(format!(
                            "{ptype}() takes 2 or 3 arguments, got {}",
                            names.len()
                        )));
                    }
                }
            }
        })
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(PolicyError::Matcher(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while self.eat(&Token::And) {
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let lhs = self.primary()?;
        if self.eat(&Token::Eq) {
            return Ok(Expr::Eq(Box::new(lhs), Box::new(self.primary()?)));
        }
        if self.eat(&Token::Ne) {
            return Ok(Expr::Ne(Box::new(lhs), Box::new(self.primary()?)));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| PolicyError::Matcher("unexpected end of expression".into()))?;
        self.pos += 1;

        match token {
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) if self.eat(&Token::LParen) => {
                let mut args = vec![self.expr()?];
                while self.eat(&Token::Comma) {
                    args.push(self.expr()?);
                }
                self.expect(&Token::RParen)?;
                Ok(Expr::Call(name, args))
            }
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                _ => Expr::Field(name.replace('.', "_")),
            }),
            other => Err(PolicyError::Matcher(format!("unexpected token {other:?}"))),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                });
            }
            '&' | '|' | '=' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(PolicyError::Matcher(format!("expected {c}{c}")));
                }
                tokens.push(match c {
                    '&' => Token::And,
                    '|' => Token::Or,
                    _ => Token::Eq,
                });
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == c => break,
                        Some(ch) => literal.push(ch),
                        None => {
                            return Err(PolicyError::Matcher("unterminated string".into()));
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(PolicyError::Matcher(format!("unexpected character {other:?}")));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = Expr::parse("a == b || c == d && !e").expect("parse");
        let Expr::Or(_, rhs) = expr else {
            panic!("|| should bind loosest");
        };
        assert!(matches!(*rhs, Expr::And(_, _)));
    }

    #[test]
    fn test_fields_normalized() {
        let expr = Expr::parse("r.sub == p_sub").expect("parse");
        assert_eq!(
            expr,
            Expr::Eq(
                Box::new(Expr::Field("r_sub".into())),
                Box::new(Expr::Field("p_sub".into()))
            )
        );
    }

    #[test]
    fn test_call_arguments() {
        let expr = Expr::parse("g2(r.sub, p.sub, 'dom')").expect("parse");
        assert!(matches!(expr, Expr::Call(ref name, ref args) if name == "g2" && args.len() == 3));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(Expr::parse("r.sub = p.sub").is_err());
        assert!(Expr::parse("(r.sub == p.sub").is_err());
        assert!(Expr::parse("r.sub == 'open").is_err());
        assert!(Expr::parse("r.sub == p.sub )").is_err());
    }

    #[test]
    fn test_eval_equality() {
        let model = Model::default();
        let bindings: Bindings<'_> = BTreeMap::from([("r_sub", "alice"), ("p_sub", "alice")]);

        assert!(Expr::parse("r.sub == p.sub").expect("parse").matches(&model, &bindings).expect("eval"));
        assert!(!Expr::parse("r.sub != p.sub").expect("parse").matches(&model, &bindings).expect("eval"));
        assert!(Expr::parse("r.sub == 'alice' && true").expect("parse").matches(&model, &bindings).expect("eval"));
    }

    #[test]
    fn test_eval_non_boolean_is_error() {
        let model = Model::default();
        let bindings: Bindings<'_> = BTreeMap::from([("r_sub", "alice")]);
        assert!(Expr::parse("r.sub").expect("parse").matches(&model, &bindings).is_err());
    }
}
