//! Expression text parser
//!
//! Recursive-descent parser for the condition grammar. Precedence, loosest
//! binding first: `||`, `^^`, `&&`, `!`, comparisons, additive,
//! multiplicative, unary minus. Parentheses override. Note that `!` binds
//! looser than comparisons, so `! a == b` reads as `!(a == b)`.

use super::{BinaryOp, Expr, UnaryOp};
use crate::types::{PolicyError, Result, Value};

/// Parse an expression string into an AST
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input).map_err(|reason| PolicyError::ExprParse {
        expr: input.to_string(),
        reason,
    })?;

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr().map_err(|reason| PolicyError::ExprParse {
        expr: input.to_string(),
        reason,
    })?;

    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(PolicyError::ExprParse {
            expr: input.to_string(),
            reason: format!("unexpected trailing token {:?}", tok),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    Bang,
    AndAnd,
    OrOr,
    XorXor,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '<' => {
                chars.next();
                tokens.push(take_eq(&mut chars, Token::Le, Token::Lt));
            }
            '>' => {
                chars.next();
                tokens.push(take_eq(&mut chars, Token::Ge, Token::Gt));
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::EqEq);
                } else {
                    return Err("single '=' is not an operator".to_string());
                }
            }
            '!' => {
                chars.next();
                tokens.push(take_eq(&mut chars, Token::NotEq, Token::Bang));
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err("single '&' is not an operator".to_string());
                }
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_some() {
                    tokens.push(Token::OrOr);
                } else {
                    return Err("single '|' is not an operator".to_string());
                }
            }
            '^' => {
                chars.next();
                if chars.next_if_eq(&'^').is_some() {
                    tokens.push(Token::XorXor);
                } else {
                    return Err("single '^' is not an operator".to_string());
                }
            }
            '\'' | '"' => {
                tokens.push(Token::Literal(lex_string(&mut chars, c)?));
            }
            c if c.is_ascii_digit() => {
                tokens.push(Token::Literal(lex_number(&mut chars)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match name.as_str() {
                    "true" | "True" => tokens.push(Token::Literal(Value::Boolean(true))),
                    "false" | "False" => tokens.push(Token::Literal(Value::Boolean(false))),
                    _ => tokens.push(Token::Ident(name)),
                }
            }
            c => return Err(format!("unexpected character '{}'", c)),
        }
    }

    Ok(tokens)
}

fn take_eq(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    with_eq: Token,
    without: Token,
) -> Token {
    if chars.next_if_eq(&'=').is_some() {
        with_eq
    } else {
        without
    }
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    quote: char,
) -> std::result::Result<Value, String> {
    chars.next(); // opening quote
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err("unterminated string literal".to_string()),
            Some('\\') => match chars.next() {
                None => return Err("unterminated escape".to_string()),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(c) => out.push(c),
            },
            Some(c) if c == quote => return Ok(Value::Text(out)),
            Some(c) => out.push(c),
        }
    }
}

fn lex_number(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> std::result::Result<Value, String> {
    let mut text = String::new();
    let mut is_float = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            chars.next();
        } else if c == '.' && !is_float {
            is_float = true;
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }

    if is_float {
        text.parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("bad float literal '{}': {}", text, e))
    } else {
        text.parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| format!("bad integer literal '{}': {}", text, e))
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, String>;

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

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> ParseResult {
        let mut lhs = self.xor_expr()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.xor_expr()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn xor_expr(&mut self) -> ParseResult {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::XorXor) {
            let rhs = self.and_expr()?;
            lhs = binary(BinaryOp::Xor, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> ParseResult {
        let mut lhs = self.not_expr()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.not_expr()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> ParseResult {
        if self.eat(&Token::Bang) {
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::Gt) => BinaryOp::Gt,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(binary(op, lhs, rhs))
    }

    fn additive(&mut self) -> ParseResult {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> ParseResult {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> ParseResult {
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> ParseResult {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::Ident(name)) => Ok(Expr::Signal(name)),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                if self.eat(&Token::RParen) {
                    Ok(inner)
                } else {
                    Err("expected ')'".to_string())
                }
            }
            Some(tok) => Err(format!("unexpected token {:?}", tok)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}
