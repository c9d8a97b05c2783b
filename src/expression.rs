//! Sandboxed amount expressions
//!
//! Grammar (no assignment, no loops, no user-defined functions):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/' | '%') unary)*
//! unary  := '-' unary | atom
//! atom   := number | path | func '(' expr (',' expr)* ')' | '(' expr ')'
//! func   := min | max | abs | round | floor | ceil
//! ```
//!
//! Paths are dotted context lookups such as `transaction.amount`.

use crate::context::{as_decimal, lookup};
use crate::error::EngineError;
use crate::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

const MAX_EXPRESSION_LEN: usize = 512;
const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Function {
    Min,
    Max,
    Abs,
    Round,
    Floor,
    Ceil,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "abs" => Some(Function::Abs),
            "round" => Some(Function::Round),
            "floor" => Some(Function::Floor),
            "ceil" => Some(Function::Ceil),
            _ => None,
        }
    }

    /// Accepted argument counts (inclusive).
    fn arity(&self) -> (usize, usize) {
        match self {
            Function::Min | Function::Max => (1, usize::MAX),
            Function::Round => (1, 2),
            Function::Abs | Function::Floor | Function::Ceil => (1, 1),
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(Decimal),
    Field(String),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

fn err(message: impl Into<String>) -> EngineError {
    EngineError::Expression(message.into())
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = Decimal::from_str(&literal)
                    .map_err(|_| err(format!("invalid number '{}'", literal)))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if ident.ends_with('.') || ident.contains("..") {
                    return Err(err(format!("invalid field reference '{}'", ident)));
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(err(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(err(format!("expected {:?}, found {:?}", expected, t))),
            None => Err(err(format!("expected {:?}, found end of input", expected))),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(err("expression nests too deeply"));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.nesting -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                self.nesting -= 1;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Field(name));
                }
                let function = Function::from_name(&name)
                    .ok_or_else(|| err(format!("unknown function '{}'", name)))?;
                self.pos += 1;
                self.enter()?;

                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                self.nesting -= 1;

                let (min, max) = function.arity();
                if args.len() < min || args.len() > max {
                    return Err(err(format!(
                        "{} takes {} argument(s), got {}",
                        name,
                        if min == max { min.to_string() } else { format!("{}+", min) },
                        args.len()
                    )));
                }
                Ok(Expr::Call(function, args))
            }
            Some(t) => Err(err(format!("unexpected token {:?}", t))),
            None => Err(err("unexpected end of expression")),
        }
    }
}

/// Parse an expression without evaluating it.
pub fn parse(source: &str) -> Result<Expr> {
    if source.len() > MAX_EXPRESSION_LEN {
        return Err(err(format!(
            "expression longer than {} characters",
            MAX_EXPRESSION_LEN
        )));
    }

    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(err("empty expression"));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    let expr = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(err(format!("unexpected trailing token {:?}", extra)));
    }
    Ok(expr)
}

impl Expr {
    pub fn eval(&self, context: &Value) -> Result<Decimal> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Field(path) => {
                let value = lookup(context, path)
                    .ok_or_else(|| err(format!("field '{}' not found in context", path)))?;
                as_decimal(value).ok_or_else(|| err(format!("field '{}' is not numeric", path)))
            }
            Expr::Neg(inner) => Ok(-inner.eval(context)?),
            Expr::Binary(op, left, right) => {
                let a = left.eval(context)?;
                let b = right.eval(context)?;
                let result = match op {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Sub => a.checked_sub(b),
                    BinaryOp::Mul => a.checked_mul(b),
                    BinaryOp::Div => {
                        if b.is_zero() {
                            return Err(err("division by zero"));
                        }
                        a.checked_div(b)
                    }
                    BinaryOp::Rem => {
                        if b.is_zero() {
                            return Err(err("division by zero"));
                        }
                        a.checked_rem(b)
                    }
                };
                result.ok_or_else(|| err("arithmetic overflow"))
            }
            Expr::Call(function, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(context))
                    .collect::<Result<Vec<_>>>()?;
                match function {
                    Function::Min => values.into_iter().min().ok_or_else(|| err("min of nothing")),
                    Function::Max => values.into_iter().max().ok_or_else(|| err("max of nothing")),
                    Function::Abs => Ok(values[0].abs()),
                    Function::Floor => Ok(values[0].floor()),
                    Function::Ceil => Ok(values[0].ceil()),
                    Function::Round => {
                        let dp = match values.get(1) {
                            Some(d) if d.is_sign_negative() || *d > Decimal::from(28) => {
                                return Err(err("round precision must be 0..=28"))
                            }
                            Some(d) => d.trunc().to_u32().unwrap_or(0),
                            None => 0,
                        };
                        Ok(values[0].round_dp(dp))
                    }
                }
            }
        }
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, context: &Value) -> Result<Decimal> {
    parse(source)?.eval(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let ctx = json!({});
        assert_eq!(evaluate("2 + 3 * 4", &ctx).unwrap(), dec("14"));
        assert_eq!(evaluate("(2 + 3) * 4", &ctx).unwrap(), dec("20"));
        assert_eq!(evaluate("-5 + 10 % 4", &ctx).unwrap(), dec("-3"));
    }

    #[test]
    fn test_field_references() {
        let ctx = json!({"transaction": {"amount": 1234.5}, "balance": "9000"});
        assert_eq!(
            evaluate("transaction.amount * 0.1", &ctx).unwrap(),
            dec("123.45")
        );
        assert_eq!(
            evaluate("min(balance - 5000, 2500)", &ctx).unwrap(),
            dec("2500")
        );
        assert!(evaluate("missing.field + 1", &ctx).is_err());
    }

    #[test]
    fn test_functions() {
        let ctx = json!({"x": 10.456});
        assert_eq!(evaluate("round(x, 2)", &ctx).unwrap(), dec("10.46"));
        assert_eq!(evaluate("floor(x)", &ctx).unwrap(), dec("10"));
        assert_eq!(evaluate("ceil(x)", &ctx).unwrap(), dec("11"));
        assert_eq!(evaluate("abs(-3)", &ctx).unwrap(), dec("3"));
        assert_eq!(evaluate("max(1, 7, 3)", &ctx).unwrap(), dec("7"));
    }

    #[test]
    fn test_rejects_anything_outside_the_grammar() {
        assert!(parse("").is_err());
        assert!(parse("system(\"rm -rf\")").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("a = 5").is_err());
        assert!(parse("abs(1, 2)").is_err());
        assert!(parse("(1 + 2").is_err());
        assert!(parse(&"(".repeat(40)).is_err());
        assert!(evaluate("1 / 0", &json!({})).is_err());
    }
}
