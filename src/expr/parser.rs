//! Recursive-descent parser with precedence climbing.
//!
//! Produces the raw AST of [`crate::expr::ast::Node`]; comparisons stay as
//! `Compare` nodes until the compile pass rewrites them. Substitution holes
//! (`?` in operand position) are numbered left to right starting from the
//! caller-provided base, so a fragment parsed into an existing term group
//! indexes into the group's concatenated substitution table.

use crate::error::{QueryError, QueryResult};
use crate::expr::ast::{ArithOp, CmpOp, Node};
use crate::expr::token::{tokenize, Token};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_hole: usize,
}

impl Parser {
    /// Parse a complete expression; `subs_base` numbers the first hole.
    pub fn parse(source: &str, subs_base: usize) -> QueryResult<(Node, usize)> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
            next_hole: subs_base,
        };
        let node = parser.expression(0)?;
        if let Some(tok) = parser.peek() {
            return Err(QueryError::Parse(format!(
                "unexpected trailing token {tok:?}"
            )));
        }
        Ok((node, parser.next_hole - subs_base))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> QueryResult<()> {
        match self.advance() {
            Some(ref tok) if tok == expected => Ok(()),
            other => Err(QueryError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Precedence-climbing entry. Levels, loosest first: ternary, `||`,
    /// `&&`, equality, relational, additive, multiplicative.
    fn expression(&mut self, min_bp: u8) -> QueryResult<Node> {
        let mut lhs = self.prefix()?;

        loop {
            let Some(op) = self.peek().cloned() else {
                break;
            };
            let bp = match op {
                Token::Question => 1,
                Token::OrOr => 2,
                Token::AndAnd => 3,
                Token::EqEq | Token::NotEq | Token::EqEqEq | Token::NotEqEq => 4,
                Token::Lt | Token::Le | Token::Gt | Token::Ge => 5,
                Token::Plus | Token::Minus => 6,
                Token::Star | Token::Slash | Token::Percent => 7,
                _ => break,
            };
            if bp < min_bp {
                break;
            }
            self.pos += 1;

            lhs = match op {
                Token::Question => {
                    let then = self.expression(0)?;
                    self.expect(&Token::Colon)?;
                    // Right-associative: the else branch re-enters at the
                    // ternary level.
                    let otherwise = self.expression(1)?;
                    Node::Ternary(Box::new(lhs), Box::new(then), Box::new(otherwise))
                }
                Token::OrOr => Node::Or(Box::new(lhs), Box::new(self.expression(bp + 1)?)),
                Token::AndAnd => Node::And(Box::new(lhs), Box::new(self.expression(bp + 1)?)),
                Token::EqEq => self.compare(CmpOp::Eq, lhs, bp)?,
                Token::NotEq => self.compare(CmpOp::Ne, lhs, bp)?,
                Token::EqEqEq => Node::StrictEq {
                    negate: false,
                    lhs: Box::new(lhs),
                    rhs: Box::new(self.expression(bp + 1)?),
                },
                Token::NotEqEq => Node::StrictEq {
                    negate: true,
                    lhs: Box::new(lhs),
                    rhs: Box::new(self.expression(bp + 1)?),
                },
                Token::Lt => self.compare(CmpOp::Lt, lhs, bp)?,
                Token::Le => self.compare(CmpOp::Le, lhs, bp)?,
                Token::Gt => self.compare(CmpOp::Gt, lhs, bp)?,
                Token::Ge => self.compare(CmpOp::Ge, lhs, bp)?,
                Token::Plus => Node::Arith(
                    ArithOp::Add,
                    Box::new(lhs),
                    Box::new(self.expression(bp + 1)?),
                ),
                Token::Minus => Node::Arith(
                    ArithOp::Sub,
                    Box::new(lhs),
                    Box::new(self.expression(bp + 1)?),
                ),
                Token::Star => Node::Arith(
                    ArithOp::Mul,
                    Box::new(lhs),
                    Box::new(self.expression(bp + 1)?),
                ),
                Token::Slash => Node::Arith(
                    ArithOp::Div,
                    Box::new(lhs),
                    Box::new(self.expression(bp + 1)?),
                ),
                Token::Percent => Node::Arith(
                    ArithOp::Mod,
                    Box::new(lhs),
                    Box::new(self.expression(bp + 1)?),
                ),
                _ => unreachable!("binding power table covers all operators"),
            };
        }

        Ok(lhs)
    }

    fn compare(&mut self, op: CmpOp, lhs: Node, bp: u8) -> QueryResult<Node> {
        Ok(Node::Compare(
            op,
            Box::new(lhs),
            Box::new(self.expression(bp + 1)?),
        ))
    }

    fn prefix(&mut self) -> QueryResult<Node> {
        let tok = self
            .advance()
            .ok_or_else(|| QueryError::Parse("unexpected end of expression".into()))?;

        let node = match tok {
            Token::Number(n) => Node::Literal(crate::value::Value::Number(n)),
            Token::Str(s) => Node::Literal(crate::value::Value::String(s)),
            Token::True => Node::Literal(crate::value::Value::Bool(true)),
            Token::False => Node::Literal(crate::value::Value::Bool(false)),
            Token::Null => Node::Literal(crate::value::Value::Null),
            Token::This => Node::This,
            Token::Question => {
                let idx = self.next_hole;
                self.next_hole += 1;
                Node::Subs(idx)
            }
            Token::Ident(name) => {
                // `x => body` single-parameter lambda.
                if self.eat(&Token::Arrow) {
                    let body = self.expression(2)?;
                    Node::Lambda(vec![name], Box::new(body))
                } else {
                    Node::Ident(name)
                }
            }
            Token::Minus => Node::Neg(Box::new(self.unary_operand()?)),
            Token::Bang => Node::Not(Box::new(self.unary_operand()?)),
            Token::LParen => self.paren_or_lambda()?,
            Token::LBrace => self.record_literal()?,
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expression(0)?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                Node::SeqLit(items)
            }
            other => {
                return Err(QueryError::Parse(format!(
                    "unexpected token {other:?} in expression"
                )))
            }
        };

        self.postfix(node)
    }

    fn unary_operand(&mut self) -> QueryResult<Node> {
        // Unary binds tighter than any binary operator.
        let operand = self.prefix()?;
        Ok(operand)
    }

    /// After `(`: either a parenthesised expression or a lambda parameter
    /// list. A parameter list is all identifiers and is followed by `=>`.
    fn paren_or_lambda(&mut self) -> QueryResult<Node> {
        // Empty parens must be a lambda: `() => e`.
        if self.eat(&Token::RParen) {
            self.expect(&Token::Arrow)?;
            let body = self.expression(2)?;
            return Ok(Node::Lambda(vec![], Box::new(body)));
        }

        let checkpoint = self.pos;
        if let Some(params) = self.try_parameter_list() {
            let body = self.expression(2)?;
            return Ok(Node::Lambda(params, Box::new(body)));
        }
        self.pos = checkpoint;

        let inner = self.expression(0)?;
        self.expect(&Token::RParen)?;
        Ok(inner)
    }

    fn try_parameter_list(&mut self) -> Option<Vec<String>> {
        let mut params = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Ident(name)) => params.push(name),
                _ => return None,
            }
            match self.advance() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => break,
                _ => return None,
            }
        }
        if self.eat(&Token::Arrow) {
            Some(params)
        } else {
            None
        }
    }

    fn record_literal(&mut self) -> QueryResult<Node> {
        let mut fields = Vec::new();
        if !self.eat(&Token::RBrace) {
            loop {
                let key = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    Some(Token::Str(s)) => s,
                    other => {
                        return Err(QueryError::Parse(format!(
                            "expected record field name, found {other:?}"
                        )))
                    }
                };
                if self.eat(&Token::Colon) {
                    fields.push((key, self.expression(0)?));
                } else {
                    // Shorthand `{x}` binds the field to the identifier.
                    fields.push((key.clone(), Node::Ident(key)));
                }
                if self.eat(&Token::RBrace) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        Ok(Node::RecordLit(fields))
    }

    /// Member access, indexing, and calls bind tightest.
    fn postfix(&mut self, mut node: Node) -> QueryResult<Node> {
        loop {
            if self.eat(&Token::Dot) {
                let field = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    other => {
                        return Err(QueryError::Parse(format!(
                            "expected field name after '.', found {other:?}"
                        )))
                    }
                };
                node = Node::Member(Box::new(node), field);
            } else if self.eat(&Token::LBracket) {
                let idx = self.expression(0)?;
                self.expect(&Token::RBracket)?;
                node = Node::Index(Box::new(node), Box::new(idx));
            } else if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expression(0)?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                node = Node::Call(Box::new(node), args);
            } else {
                break;
            }
        }
        Ok(node)
    }
}
