//! Recursive-descent parser from tokens to statements.

use crate::ast::{BinOp, CmpOp, Expr, Stmt, StmtKind, UnaryOp};
use crate::error::Exception;
use crate::lexer::{tokenize, Tok, Token};

const KEYWORDS: &[&str] = &[
    "and", "as", "break", "continue", "elif", "else", "for", "if", "import", "in", "is", "not",
    "or", "pass", "raise", "while", "def", "class", "return", "lambda", "True", "False", "None",
];

/// Guards against stack exhaustion on pathological nesting.
const MAX_NESTING: usize = 100;

const TOO_DEEP: &str = "expression is too deeply nested";

/// Operator runs of one precedence level stay flat, however long.
fn chain(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    if rest.is_empty() {
        first
    } else {
        Expr::Chain {
            first: Box::new(first),
            rest,
        }
    }
}

pub fn parse(source: &str) -> Result<Vec<Stmt>, Exception> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        loop_depth: 0,
        nesting: 0,
    };
    let mut program = Vec::new();
    while !parser.at(&Tok::Eof) {
        program.extend(parser.statement()?);
    }
    Ok(program)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: &str) -> Exception {
        Exception::syntax(message, self.line())
    }

    /// Every recursive descent goes through here so that input depth,
    /// and with it the depth of the tree, stays bounded.
    fn enter(&mut self, what: &str) -> Result<(), Exception> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.error(what));
        }
        Ok(())
    }

    fn leave(&mut self, levels: usize) {
        self.nesting -= levels;
    }

    fn expect_op(&mut self, op: &str) -> Result<(), Exception> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", op)))
        }
    }

    fn expect_name(&mut self) -> Result<String, Exception> {
        match self.peek().clone() {
            Tok::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("invalid syntax")),
        }
    }

    // ── Statements ─────────────────────────────────────────────────────

    fn statement(&mut self) -> Result<Vec<Stmt>, Exception> {
        let line = self.line();
        if self.eat_keyword("if") {
            return Ok(vec![self.if_statement(line)?]);
        }
        if self.eat_keyword("while") {
            let cond = self.expression()?;
            let body = self.loop_body()?;
            return Ok(vec![Stmt {
                kind: StmtKind::While { cond, body },
                line,
            }]);
        }
        if self.eat_keyword("for") {
            let var = self.expect_name()?;
            if !self.eat_keyword("in") {
                return Err(self.error("expected 'in'"));
            }
            let iter = self.expression()?;
            let body = self.loop_body()?;
            return Ok(vec![Stmt {
                kind: StmtKind::For { var, iter, body },
                line,
            }]);
        }
        if matches!(self.peek(), Tok::Indent) {
            return Err(self.error("unexpected indent"));
        }
        self.simple_statements()
    }

    fn if_statement(&mut self, line: usize) -> Result<Stmt, Exception> {
        let mut branches = Vec::new();
        let cond = self.expression()?;
        branches.push((cond, self.block()?));
        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let cond = self.expression()?;
                branches.push((cond, self.block()?));
            } else if self.eat_keyword("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            kind: StmtKind::If { branches, orelse },
            line,
        })
    }

    fn loop_body(&mut self) -> Result<Vec<Stmt>, Exception> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn block(&mut self) -> Result<Vec<Stmt>, Exception> {
        self.expect_op(":")?;
        if !self.at(&Tok::Newline) {
            return self.simple_statements();
        }
        self.advance();
        if !self.at(&Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();
        self.enter("too many statically nested blocks")?;
        let mut body = Vec::new();
        while !self.at(&Tok::Dedent) && !self.at(&Tok::Eof) {
            body.extend(self.statement()?);
        }
        self.leave(1);
        self.advance();
        Ok(body)
    }

    fn simple_statements(&mut self) -> Result<Vec<Stmt>, Exception> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if self.at(&Tok::Newline) || self.at(&Tok::Eof) {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        if !self.at(&Tok::Eof) && !matches!(self.advance(), Tok::Newline) {
            return Err(self.error("invalid syntax"));
        }
        Ok(stmts)
    }

    fn simple_statement(&mut self) -> Result<Stmt, Exception> {
        let line = self.line();
        let kind = if self.eat_keyword("pass") {
            StmtKind::Pass
        } else if self.at_keyword("break") || self.at_keyword("continue") {
            let is_break = self.at_keyword("break");
            if self.loop_depth == 0 {
                let word = if is_break { "break" } else { "continue" };
                return Err(self.error(&format!("'{}' outside loop", word)));
            }
            self.advance();
            if is_break {
                StmtKind::Break
            } else {
                StmtKind::Continue
            }
        } else if self.eat_keyword("import") {
            let module = self.expect_name()?;
            let alias = if self.eat_keyword("as") {
                self.expect_name()?
            } else {
                module.clone()
            };
            StmtKind::Import { module, alias }
        } else if self.eat_keyword("raise") {
            if self.at(&Tok::Newline) || self.at(&Tok::Eof) || self.at_op(";") {
                StmtKind::Raise(None)
            } else {
                StmtKind::Raise(Some(self.expression()?))
            }
        } else {
            self.assignment_or_expression()?
        };
        Ok(Stmt { kind, line })
    }

    fn assignment_or_expression(&mut self) -> Result<StmtKind, Exception> {
        let expr = self.expression()?;
        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            _ => None,
        };

        if self.at_op("=") || aug.is_some() {
            let Expr::Name(target) = expr else {
                return Err(self.error("cannot assign to expression"));
            };
            self.advance();
            let value = self.expression()?;
            if self.at_op("=") {
                return Err(self.error("chained assignment is not supported"));
            }
            return Ok(match aug {
                Some(op) => StmtKind::AugAssign { target, op, value },
                None => StmtKind::Assign { target, value },
            });
        }
        Ok(StmtKind::Expr(expr))
    }

    // ── Expressions ────────────────────────────────────────────────────

    fn expression(&mut self) -> Result<Expr, Exception> {
        self.enter(TOO_DEEP)?;
        let expr = self.or_test()?;
        self.leave(1);
        Ok(expr)
    }

    fn or_test(&mut self) -> Result<Expr, Exception> {
        let mut operands = vec![self.and_test()?];
        while self.eat_keyword("or") {
            operands.push(self.and_test()?);
        }
        Ok(match operands.len() {
            1 => operands.remove(0),
            _ => Expr::Or(operands),
        })
    }

    fn and_test(&mut self) -> Result<Expr, Exception> {
        let mut operands = vec![self.not_test()?];
        while self.eat_keyword("and") {
            operands.push(self.not_test()?);
        }
        Ok(match operands.len() {
            1 => operands.remove(0),
            _ => Expr::And(operands),
        })
    }

    fn not_test(&mut self) -> Result<Expr, Exception> {
        if self.eat_keyword("not") {
            self.enter(TOO_DEEP)?;
            let operand = self.not_test()?;
            self.leave(1);
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, Exception> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "is" => {
                    self.advance();
                    let op = if self.eat_keyword("not") {
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    };
                    rest.push((op, self.arith()?));
                    continue;
                }
                Tok::Name(n) if n == "not" => {
                    self.advance();
                    if !self.eat_keyword("in") {
                        return Err(self.error("invalid syntax"));
                    }
                    rest.push((CmpOp::NotIn, self.arith()?));
                    continue;
                }
                _ => break,
            };
            self.advance();
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, Exception> {
        let first = self.term()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            rest.push((op, self.term()?));
        }
        Ok(chain(first, rest))
    }

    fn term(&mut self) -> Result<Expr, Exception> {
        let first = self.factor()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            rest.push((op, self.factor()?));
        }
        Ok(chain(first, rest))
    }

    fn factor(&mut self) -> Result<Expr, Exception> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.advance();
        self.enter(TOO_DEEP)?;
        let operand = self.factor()?;
        self.leave(1);
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> Result<Expr, Exception> {
        let base = self.primary()?;
        if self.eat_op("**") {
            // right associative, binds tighter than unary minus on its left
            self.enter(TOO_DEEP)?;
            let exponent = self.factor()?;
            self.leave(1);
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    /// Each trailer (call, index, attribute) wraps the expression once more,
    /// so trailers count towards the nesting limit too.
    fn primary(&mut self) -> Result<Expr, Exception> {
        let mut expr = self.atom()?;
        let mut trailers = 0;
        loop {
            if matches!(self.peek(), Tok::Op("(" | "[" | ".")) {
                self.enter(TOO_DEEP)?;
                trailers += 1;
            }
            if self.eat_op("(") {
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let index = self.expression()?;
                self.expect_op("]")?;
                expr = Expr::Index {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                self.leave(trailers);
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), Exception> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.at_op(")") {
            let is_keyword = matches!(self.peek(), Tok::Name(_))
                && matches!(
                    self.tokens.get(self.pos + 1).map(|t| &t.tok),
                    Some(Tok::Op("="))
                );
            if is_keyword {
                let name = self.expect_name()?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(&format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expression()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, Exception> {
        match self.advance() {
            Tok::Int(n) => Ok(Expr::Int(n)),
            Tok::Float(f) => Ok(Expr::Float(f)),
            Tok::Str(s) => {
                let mut s = s;
                // adjacent literals concatenate
                while let Tok::Str(next) = self.peek().clone() {
                    self.advance();
                    s.push_str(&next);
                }
                Ok(Expr::Str(s))
            }
            Tok::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::None),
                kw if KEYWORDS.contains(&kw) => Err(self.error("invalid syntax")),
                _ => Ok(Expr::Name(name)),
            },
            Tok::Op("(") => {
                let expr = self.expression()?;
                if self.at_op(",") {
                    return Err(self.error("tuples are not supported"));
                }
                self.expect_op(")")?;
                Ok(expr)
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                while !self.at_op("]") {
                    items.push(self.expression()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Newline | Tok::Eof => Err(self.error("unexpected end of statement")),
            _ => Err(self.error("invalid syntax")),
        }
    }
}
