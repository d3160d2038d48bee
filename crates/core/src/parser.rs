//! Recursive-descent parser for the statement language.
//!
//! Grammar, roughly:
//!
//! ```text
//! block     := statement (NEWLINE statement)* EOF
//! statement := target '=' expr | expr
//! target    := WORD ('.' WORD)*
//! expr      := or ; or := and ('or' and)* ; and := not ('and' not)*
//! not       := 'not' not | cmp
//! cmp       := atom (('=='|'!='|'<'|'<='|'>'|'>=') atom)?
//! atom      := literal | list | dict | '(' expr ')' | WORD call? ('.' WORD)*
//! ```
//!
//! A trailing `.value` path segment is accepted and normalized away — the
//! semantic parser emits it when it refers to a field's wrapped value, and
//! the interpreter's field references already evaluate to values.

use crate::ast::{CmpOp, Expr, Statement};
use crate::error::ParseError;
use crate::lexer::{lex, Spanned, Token};

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn cur(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.cur().token
    }

    fn cur_line(&self) -> u32 {
        self.cur().line
    }

    fn advance(&mut self) -> &Spanned {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> ParseError {
        ParseError::new(self.cur_line(), msg)
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ParseError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected {}, got {:?}", what, self.peek())))
        }
    }

    fn take_word(&mut self) -> Result<String, ParseError> {
        match self.peek().clone() {
            Token::Word(w) => {
                self.advance();
                Ok(w)
            }
            other => Err(self.err(format!("expected identifier, got {:?}", other))),
        }
    }

    // -- Statements ---------------------------------------------

    fn parse_block(&mut self) -> Result<Vec<Statement>, ParseError> {
        let mut stmts = Vec::new();
        loop {
            while self.peek() == &Token::Newline {
                self.advance();
            }
            if self.peek() == &Token::Eof {
                break;
            }
            stmts.push(self.parse_statement()?);
            match self.peek() {
                Token::Newline => {
                    self.advance();
                }
                Token::Eof => break,
                other => {
                    return Err(self.err(format!("expected end of statement, got {:?}", other)))
                }
            }
        }
        Ok(stmts)
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let line = self.cur_line();

        // Lookahead: WORD ('.' WORD)* '=' starts an assignment.
        if let Token::Word(_) = self.peek() {
            let save = self.pos;
            let root = self.take_word()?;
            let mut path = Vec::new();
            while self.peek() == &Token::Dot {
                self.advance();
                match self.take_word() {
                    Ok(seg) => path.push(seg),
                    Err(_) => {
                        self.pos = save;
                        let expr = self.parse_expr()?;
                        return Ok(Statement::Expr { expr, line });
                    }
                }
            }
            if self.peek() == &Token::Eq {
                self.advance();
                let expr = self.parse_expr()?;
                // `x.f.value = e` assigns the field itself
                if path.last().map(String::as_str) == Some("value") {
                    path.pop();
                }
                return Ok(if path.is_empty() {
                    Statement::Assign {
                        target: root,
                        expr,
                        line,
                    }
                } else {
                    Statement::FieldAssign {
                        root,
                        path,
                        expr,
                        line,
                    }
                });
            }
            self.pos = save;
        }

        let expr = self.parse_expr()?;
        Ok(Statement::Expr { expr, line })
    }

    // -- Expressions --------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.is_word("or") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.is_word("and") {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.is_word("not") {
            self.advance();
            let e = self.parse_not()?;
            return Ok(Expr::Not(Box::new(e)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_atom()?;
        let op = match self.peek() {
            Token::EqEq => CmpOp::Eq,
            Token::Neq => CmpOp::Neq,
            Token::Lt => CmpOp::Lt,
            Token::Lte => CmpOp::Lte,
            Token::Gt => CmpOp::Gt,
            Token::Gte => CmpOp::Gte,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_atom()?;
        Ok(Expr::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    fn is_word(&self, w: &str) -> bool {
        matches!(self.peek(), Token::Word(found) if found == w)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Int(n))
            }
            Token::Float(text) => {
                self.advance();
                Ok(Expr::Number(text))
            }
            Token::LParen => {
                self.advance();
                let e = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(e)
            }
            Token::LBracket => self.parse_list(),
            Token::LBrace => self.parse_dict(),
            Token::Word(w) => {
                self.advance();
                match w.as_str() {
                    "True" => return Ok(Expr::Bool(true)),
                    "False" => return Ok(Expr::Bool(false)),
                    "None" => return Ok(Expr::None),
                    _ => {}
                }
                if self.peek() == &Token::LParen {
                    return self.parse_call(w);
                }
                let mut path = Vec::new();
                while self.peek() == &Token::Dot {
                    self.advance();
                    path.push(self.take_word()?);
                }
                // `x.f.value` reads the field's value — same as `x.f`
                if path.last().map(String::as_str) == Some("value") {
                    path.pop();
                }
                if path.is_empty() {
                    Ok(Expr::Ident(w))
                } else {
                    Ok(Expr::FieldRef { root: w, path })
                }
            }
            other => Err(self.err(format!("expected expression, got {:?}", other))),
        }
    }

    fn parse_list(&mut self) -> Result<Expr, ParseError> {
        self.expect(&Token::LBracket, "'['")?;
        let mut items = Vec::new();
        while self.peek() != &Token::RBracket {
            items.push(self.parse_expr()?);
            if self.peek() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RBracket, "']'")?;
        Ok(Expr::List(items))
    }

    fn parse_dict(&mut self) -> Result<Expr, ParseError> {
        self.expect(&Token::LBrace, "'{'")?;
        let mut entries = Vec::new();
        while self.peek() != &Token::RBrace {
            let key = match self.peek().clone() {
                Token::Str(s) => {
                    self.advance();
                    s
                }
                Token::Word(w) => {
                    self.advance();
                    w
                }
                other => return Err(self.err(format!("expected dict key, got {:?}", other))),
            };
            self.expect(&Token::Colon, "':'")?;
            let value = self.parse_expr()?;
            entries.push((key, value));
            if self.peek() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RBrace, "'}'")?;
        Ok(Expr::Dict(entries))
    }

    fn parse_call(&mut self, func: String) -> Result<Expr, ParseError> {
        self.expect(&Token::LParen, "'('")?;
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while self.peek() != &Token::RParen {
            // Keyword argument: WORD '=' expr (but not WORD '==' ...)
            let mut parsed_kw = false;
            if let Token::Word(name) = self.peek().clone() {
                let save = self.pos;
                self.advance();
                if self.peek() == &Token::Eq {
                    self.advance();
                    let value = self.parse_expr()?;
                    kwargs.push((name, value));
                    parsed_kw = true;
                } else {
                    self.pos = save;
                }
            }
            if !parsed_kw {
                if !kwargs.is_empty() {
                    return Err(self.err("positional argument after keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if self.peek() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RParen, "')'")?;
        Ok(Expr::Call { func, args, kwargs })
    }
}

/// Parse a statement block into typed statements.
pub fn parse(src: &str) -> Result<Vec<Statement>, ParseError> {
    let tokens = lex(src)?;
    Parser::new(&tokens).parse_block()
}

/// Parse a single expression (predicate and action texts).
pub fn parse_expr(src: &str) -> Result<Expr, ParseError> {
    let tokens = lex(src)?;
    let mut p = Parser::new(&tokens);
    let e = p.parse_expr()?;
    if p.peek() != &Token::Eof {
        return Err(p.err(format!("trailing input after expression: {:?}", p.peek())));
    }
    Ok(e)
}
