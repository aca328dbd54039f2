//! Recursive descent parser for the payoff scripting language.
//!
//! Produces [`Stmt`]/[`Expr`] trees with spans. Type checking is left to the
//! engine; the parser only enforces syntactic shape and builtin arities
//! (including the all-or-nothing optional blocks of `fwdComp`/`fwdAvg`).

use crate::lang::ast::*;
use crate::lang::error::{ScriptError, Span};
use crate::lang::lexer::{tokenize, Token, TokenKind};

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &TokenKind) -> Result<Span, ScriptError> {
        match self.peek() {
            Some(tok) if &tok.kind == expected => {
                let span = tok.span;
                self.pos += 1;
                Ok(span)
            }
            Some(tok) => Err(ScriptError::Parse {
                message: format!("expected {expected:?}, got {:?}", tok.kind),
                span: tok.span,
            }),
            None => Err(ScriptError::Parse {
                message: format!("expected {expected:?}, got end of input"),
                span: self.eof_span(),
            }),
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), ScriptError> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Ident(name),
                span,
            }) => {
                let out = (name.clone(), *span);
                self.pos += 1;
                Ok(out)
            }
            Some(tok) => Err(ScriptError::Parse {
                message: format!("expected identifier, got {:?}", tok.kind),
                span: tok.span,
            }),
            None => Err(ScriptError::Parse {
                message: "expected identifier, got end of input".to_string(),
                span: self.eof_span(),
            }),
        }
    }

    fn current_span(&self) -> Span {
        self.peek().map_or_else(|| self.eof_span(), |t| t.span)
    }

    fn eof_span(&self) -> Span {
        let end = self.tokens.last().map_or(0, |t| t.span.end);
        Span::new(end, end)
    }
}

/// Parses script source into a statement tree.
pub fn parse(source: &str) -> Result<Stmt, ScriptError> {
    let tokens = tokenize(source)?;
    let mut p = Parser::new(tokens);
    let stmt = parse_stmt(&mut p)?;
    if let Some(tok) = p.peek() {
        return Err(ScriptError::Parse {
            message: format!("unexpected trailing input {:?}", tok.kind),
            span: tok.span,
        });
    }
    Ok(stmt)
}

fn parse_stmt(p: &mut Parser) -> Result<Stmt, ScriptError> {
    let start = p.current_span();
    match p.peek_kind() {
        Some(TokenKind::LBrace) => parse_sequence(p),
        Some(TokenKind::NumberKw) => parse_declaration(p),
        Some(TokenKind::If) => parse_if(p),
        Some(TokenKind::For) => parse_for(p),
        Some(TokenKind::Require) => {
            p.advance();
            let cond = parse_expr(p)?;
            let end = p.expect(&TokenKind::Semicolon)?;
            Ok(Stmt {
                kind: StmtKind::Require(cond),
                span: start.join(end),
            })
        }
        Some(TokenKind::Sort) => parse_sort_like(p, true),
        Some(TokenKind::Permute) => parse_sort_like(p, false),
        Some(TokenKind::Ident(_)) => parse_assignment(p),
        Some(_) => Err(ScriptError::Parse {
            message: "expected statement".to_string(),
            span: start,
        }),
        None => Err(ScriptError::Parse {
            message: "expected statement, got end of input".to_string(),
            span: p.eof_span(),
        }),
    }
}

fn parse_sequence(p: &mut Parser) -> Result<Stmt, ScriptError> {
    let start = p.expect(&TokenKind::LBrace)?;
    let mut stmts = Vec::new();
    loop {
        if p.peek_kind() == Some(&TokenKind::RBrace) {
            let end = p.expect(&TokenKind::RBrace)?;
            return Ok(Stmt {
                kind: StmtKind::Sequence(stmts),
                span: start.join(end),
            });
        }
        if p.peek().is_none() {
            return Err(ScriptError::Parse {
                message: "unterminated sequence, expected '}'".to_string(),
                span: p.eof_span(),
            });
        }
        stmts.push(parse_stmt(p)?);
    }
}

fn parse_declaration(p: &mut Parser) -> Result<Stmt, ScriptError> {
    let start = p.expect(&TokenKind::NumberKw)?;
    let mut vars = Vec::new();
    loop {
        let (name, name_span) = p.expect_ident()?;
        let array_size = if p.eat(&TokenKind::LBracket) {
            let size = parse_expr(p)?;
            p.expect(&TokenKind::RBracket)?;
            Some(size)
        } else {
            None
        };
        vars.push(DeclVar {
            name,
            array_size,
            span: name_span,
        });
        if !p.eat(&TokenKind::Comma) {
            break;
        }
    }
    let end = p.expect(&TokenKind::Semicolon)?;
    Ok(Stmt {
        kind: StmtKind::DeclareNumber(vars),
        span: start.join(end),
    })
}

fn parse_if(p: &mut Parser) -> Result<Stmt, ScriptError> {
    let start = p.expect(&TokenKind::If)?;
    let cond = parse_expr(p)?;
    p.expect(&TokenKind::Then)?;
    let then_branch = Box::new(parse_stmt(p)?);
    let else_branch = if p.eat(&TokenKind::Else) {
        Some(Box::new(parse_stmt(p)?))
    } else {
        None
    };
    let end = else_branch
        .as_ref()
        .map_or(then_branch.span, |e| e.span);
    Ok(Stmt {
        kind: StmtKind::If {
            cond,
            then_branch,
            else_branch,
        },
        span: start.join(end),
    })
}

fn parse_for(p: &mut Parser) -> Result<Stmt, ScriptError> {
    let start = p.expect(&TokenKind::For)?;
    let (var, _) = p.expect_ident()?;
    p.expect(&TokenKind::Assign)?;
    let from = parse_expr(p)?;
    p.expect(&TokenKind::To)?;
    let to = parse_expr(p)?;
    p.expect(&TokenKind::Step)?;
    let step = parse_expr(p)?;
    p.expect(&TokenKind::Do)?;
    let body = Box::new(parse_stmt(p)?);
    let end = body.span;
    Ok(Stmt {
        kind: StmtKind::For {
            var,
            from,
            to,
            step,
            body,
        },
        span: start.join(end),
    })
}

fn parse_sort_like(p: &mut Parser, is_sort: bool) -> Result<Stmt, ScriptError> {
    let keyword = if is_sort {
        TokenKind::Sort
    } else {
        TokenKind::Permute
    };
    let start = p.expect(&keyword)?;
    p.expect(&TokenKind::LParen)?;
    let (x, _) = p.expect_ident()?;
    let y = if p.eat(&TokenKind::Comma) {
        Some(p.expect_ident()?.0)
    } else {
        None
    };
    let pperm = if y.is_some() && p.eat(&TokenKind::Comma) {
        Some(p.expect_ident()?.0)
    } else {
        None
    };
    p.expect(&TokenKind::RParen)?;
    let end = p.expect(&TokenKind::Semicolon)?;
    let kind = if is_sort {
        StmtKind::Sort { x, y, p: pperm }
    } else {
        StmtKind::Permute { x, y, p: pperm }
    };
    Ok(Stmt {
        kind,
        span: start.join(end),
    })
}

fn parse_assignment(p: &mut Parser) -> Result<Stmt, ScriptError> {
    let (name, name_span) = p.expect_ident()?;
    let subscript = if p.eat(&TokenKind::LBracket) {
        let sub = parse_expr(p)?;
        p.expect(&TokenKind::RBracket)?;
        Some(Box::new(sub))
    } else {
        None
    };
    let target = VarRef {
        name,
        subscript,
        cache: ShapeCache::default(),
        span: name_span,
    };
    p.expect(&TokenKind::Assign)?;
    let value = parse_expr(p)?;
    let end = p.expect(&TokenKind::Semicolon)?;
    Ok(Stmt {
        kind: StmtKind::Assign { target, value },
        span: name_span.join(end),
    })
}

#[cfg(test)]
pub(crate) fn parse_expr_str(source: &str) -> Result<Expr, ScriptError> {
    let tokens = tokenize(source)?;
    let mut p = Parser::new(tokens);
    parse_expr(&mut p)
}

fn parse_expr(p: &mut Parser) -> Result<Expr, ScriptError> {
    parse_or(p)
}

fn parse_or(p: &mut Parser) -> Result<Expr, ScriptError> {
    let mut lhs = parse_and(p)?;
    while p.eat(&TokenKind::Or) {
        let rhs = parse_and(p)?;
        let span = lhs.span.join(rhs.span);
        lhs = Expr {
            kind: ExprKind::Or(Box::new(lhs), Box::new(rhs)),
            span,
        };
    }
    Ok(lhs)
}

fn parse_and(p: &mut Parser) -> Result<Expr, ScriptError> {
    let mut lhs = parse_not(p)?;
    while p.eat(&TokenKind::And) {
        let rhs = parse_not(p)?;
        let span = lhs.span.join(rhs.span);
        lhs = Expr {
            kind: ExprKind::And(Box::new(lhs), Box::new(rhs)),
            span,
        };
    }
    Ok(lhs)
}

fn parse_not(p: &mut Parser) -> Result<Expr, ScriptError> {
    if let Some(Token { span, .. }) = p.peek() {
        let span = *span;
        if p.eat(&TokenKind::Not) {
            let operand = parse_not(p)?;
            let full = span.join(operand.span);
            return Ok(Expr {
                kind: ExprKind::Not(Box::new(operand)),
                span: full,
            });
        }
    }
    parse_comparison(p)
}

fn parse_comparison(p: &mut Parser) -> Result<Expr, ScriptError> {
    let lhs = parse_additive(p)?;
    let op = match p.peek_kind() {
        Some(TokenKind::EqEq) => CmpOp::Eq,
        Some(TokenKind::Neq) => CmpOp::Neq,
        Some(TokenKind::Lt) => CmpOp::Lt,
        Some(TokenKind::Le) => CmpOp::Leq,
        Some(TokenKind::Gt) => CmpOp::Gt,
        Some(TokenKind::Ge) => CmpOp::Geq,
        _ => return Ok(lhs),
    };
    p.advance();
    let rhs = parse_additive(p)?;
    let span = lhs.span.join(rhs.span);
    Ok(Expr {
        kind: ExprKind::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    })
}

fn parse_additive(p: &mut Parser) -> Result<Expr, ScriptError> {
    let mut lhs = parse_multiplicative(p)?;
    loop {
        let op = match p.peek_kind() {
            Some(TokenKind::Plus) => ArithOp::Add,
            Some(TokenKind::Minus) => ArithOp::Sub,
            _ => return Ok(lhs),
        };
        p.advance();
        let rhs = parse_multiplicative(p)?;
        let span = lhs.span.join(rhs.span);
        lhs = Expr {
            kind: ExprKind::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        };
    }
}

fn parse_multiplicative(p: &mut Parser) -> Result<Expr, ScriptError> {
    let mut lhs = parse_unary(p)?;
    loop {
        let op = match p.peek_kind() {
            Some(TokenKind::Star) => ArithOp::Mul,
            Some(TokenKind::Slash) => ArithOp::Div,
            _ => return Ok(lhs),
        };
        p.advance();
        let rhs = parse_unary(p)?;
        let span = lhs.span.join(rhs.span);
        lhs = Expr {
            kind: ExprKind::Arith {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        };
    }
}

fn parse_unary(p: &mut Parser) -> Result<Expr, ScriptError> {
    if let Some(Token { span, .. }) = p.peek() {
        let span = *span;
        if p.eat(&TokenKind::Minus) {
            let operand = parse_unary(p)?;
            let full = span.join(operand.span);
            return Ok(Expr {
                kind: ExprKind::Neg(Box::new(operand)),
                span: full,
            });
        }
    }
    parse_primary(p)
}

fn parse_primary(p: &mut Parser) -> Result<Expr, ScriptError> {
    let start = p.current_span();
    match p.peek_kind().cloned() {
        Some(TokenKind::Number(value)) => {
            p.advance();
            Ok(Expr {
                kind: ExprKind::Number(value),
                span: start,
            })
        }
        Some(TokenKind::LParen) => {
            p.advance();
            let inner = parse_expr(p)?;
            let end = p.expect(&TokenKind::RParen)?;
            Ok(Expr {
                kind: inner.kind,
                span: start.join(end),
            })
        }
        Some(TokenKind::Size) => {
            p.advance();
            p.expect(&TokenKind::LParen)?;
            let (name, _) = p.expect_ident()?;
            let end = p.expect(&TokenKind::RParen)?;
            Ok(Expr {
                kind: ExprKind::Size { name },
                span: start.join(end),
            })
        }
        Some(TokenKind::DateIndex) => parse_dateindex(p, start),
        Some(TokenKind::Ident(name)) => parse_call_or_var(p, name, start),
        _ => Err(ScriptError::Parse {
            message: "expected expression".to_string(),
            span: start,
        }),
    }
}

fn parse_dateindex(p: &mut Parser, start: Span) -> Result<Expr, ScriptError> {
    p.expect(&TokenKind::DateIndex)?;
    p.expect(&TokenKind::LParen)?;
    let var = parse_var(p)?;
    p.expect(&TokenKind::Comma)?;
    let (array, _) = p.expect_ident()?;
    p.expect(&TokenKind::Comma)?;
    let (op_name, op_span) = p.expect_ident()?;
    let op = match op_name.as_str() {
        "EQ" => DateIndexOp::Eq,
        "GEQ" => DateIndexOp::Geq,
        "GT" => DateIndexOp::Gt,
        other => {
            return Err(ScriptError::Parse {
                message: format!("DATEINDEX operation '{other}' not supported, expected EQ, GEQ, GT"),
                span: op_span,
            })
        }
    };
    let end = p.expect(&TokenKind::RParen)?;
    Ok(Expr {
        kind: ExprKind::DateIndex {
            var: Box::new(var),
            array,
            op,
        },
        span: start.join(end),
    })
}

fn parse_var(p: &mut Parser) -> Result<Expr, ScriptError> {
    let (name, span) = p.expect_ident()?;
    let subscript = if p.eat(&TokenKind::LBracket) {
        let sub = parse_expr(p)?;
        p.expect(&TokenKind::RBracket)?;
        Some(Box::new(sub))
    } else {
        None
    };
    Ok(Expr {
        kind: ExprKind::Var(VarRef {
            name,
            subscript,
            cache: ShapeCache::default(),
            span,
        }),
        span,
    })
}

fn parse_args(p: &mut Parser) -> Result<(Vec<Expr>, Span), ScriptError> {
    p.expect(&TokenKind::LParen)?;
    let mut args = Vec::new();
    if p.peek_kind() != Some(&TokenKind::RParen) {
        loop {
            args.push(parse_expr(p)?);
            if !p.eat(&TokenKind::Comma) {
                break;
            }
        }
    }
    let end = p.expect(&TokenKind::RParen)?;
    Ok((args, end))
}

fn arity_error(name: &str, expected: &str, got: usize, span: Span) -> ScriptError {
    ScriptError::Parse {
        message: format!("{name} expects {expected} arguments, got {got}"),
        span,
    }
}

fn parse_call_or_var(p: &mut Parser, name: String, start: Span) -> Result<Expr, ScriptError> {
    p.advance(); // consume the identifier

    // Array subscript: plain variable access.
    if p.peek_kind() == Some(&TokenKind::LBracket) {
        p.advance();
        let sub = parse_expr(p)?;
        let end = p.expect(&TokenKind::RBracket)?;
        return Ok(Expr {
            kind: ExprKind::Var(VarRef {
                name,
                subscript: Some(Box::new(sub)),
                cache: ShapeCache::default(),
                span: start,
            }),
            span: start.join(end),
        });
    }

    if p.peek_kind() != Some(&TokenKind::LParen) {
        return Ok(Expr {
            kind: ExprKind::Var(VarRef {
                name,
                subscript: None,
                cache: ShapeCache::default(),
                span: start,
            }),
            span: start,
        });
    }

    let (mut args, end) = parse_args(p)?;
    let span = start.join(end);
    let n = args.len();
    let drain = |expr_args: &mut Vec<Expr>| expr_args.drain(..).collect::<Vec<_>>();

    let kind = match name.as_str() {
        "abs" | "exp" | "ln" | "sqrt" | "normalCdf" | "normalPdf" => {
            if n != 1 {
                return Err(arity_error(&name, "1", n, span));
            }
            let f = match name.as_str() {
                "abs" => UnaryFn::Abs,
                "exp" => UnaryFn::Exp,
                "ln" => UnaryFn::Ln,
                "sqrt" => UnaryFn::Sqrt,
                "normalCdf" => UnaryFn::NormalCdf,
                _ => UnaryFn::NormalPdf,
            };
            ExprKind::UnaryFn {
                f,
                arg: Box::new(args.remove(0)),
            }
        }
        "min" | "max" | "pow" => {
            if n != 2 {
                return Err(arity_error(&name, "2", n, span));
            }
            let f = match name.as_str() {
                "min" => BinaryFn::Min,
                "max" => BinaryFn::Max,
                _ => BinaryFn::Pow,
            };
            let rhs = args.remove(1);
            let lhs = args.remove(0);
            ExprKind::BinaryFn {
                f,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            }
        }
        "black" => {
            if n != 6 {
                return Err(arity_error(&name, "6", n, span));
            }
            let a: Vec<Expr> = drain(&mut args);
            let boxed: Box<[Expr; 6]> = Box::new(a.try_into().unwrap());
            ExprKind::Black(boxed)
        }
        "pay" | "logpay" => {
            let is_log = name == "logpay";
            let valid = if is_log {
                matches!(n, 4 | 6 | 7)
            } else {
                n == 4
            };
            if !valid {
                return Err(arity_error(
                    &name,
                    if is_log { "4, 6 or 7" } else { "4" },
                    n,
                    span,
                ));
            }
            let mut it = args.drain(..);
            let amount = it.next().unwrap();
            let obs_date = it.next().unwrap();
            let pay_date = it.next().unwrap();
            let pay_ccy = it.next().unwrap();
            let leg_no = it.next();
            let cashflow_type = match it.next() {
                None => None,
                Some(Expr {
                    kind: ExprKind::Var(v),
                    ..
                }) if v.subscript.is_none() => Some(v.name),
                Some(e) => {
                    return Err(ScriptError::Parse {
                        message: "cashflow type must be a plain variable name".to_string(),
                        span: e.span,
                    })
                }
            };
            let slot = it.next();
            drop(it);
            let pa = Box::new(PayArgs {
                amount,
                obs_date,
                pay_date,
                pay_ccy,
                leg_no,
                cashflow_type,
                slot,
            });
            if is_log {
                ExprKind::LogPay(pa)
            } else {
                ExprKind::Pay(pa)
            }
        }
        "npv" | "npvmem" => {
            let has_mem = name == "npvmem";
            let (min_args, max_args) = if has_mem { (3, 6) } else { (2, 5) };
            if n < min_args || n > max_args {
                return Err(arity_error(
                    &name,
                    if has_mem { "3 to 6" } else { "2 to 5" },
                    n,
                    span,
                ));
            }
            let mut it = args.drain(..);
            let amount = it.next().unwrap();
            let obs_date = it.next().unwrap();
            let mem_slot = if has_mem { Some(it.next().unwrap()) } else { None };
            let regression_filter = it.next();
            let add_regressor_1 = it.next();
            let add_regressor_2 = it.next();
            drop(it);
            ExprKind::Npv(Box::new(NpvArgs {
                amount,
                obs_date,
                mem_slot,
                regression_filter,
                add_regressor_1,
                add_regressor_2,
            }))
        }
        "histfixing" => {
            if n != 2 {
                return Err(arity_error(&name, "2", n, span));
            }
            let a: Vec<Expr> = drain(&mut args);
            ExprKind::HistFixing(Box::new(a.try_into().unwrap()))
        }
        "discount" => {
            if n != 3 {
                return Err(arity_error(&name, "3", n, span));
            }
            let a: Vec<Expr> = drain(&mut args);
            ExprKind::Discount(Box::new(a.try_into().unwrap()))
        }
        "dcf" | "days" => {
            if n != 3 {
                return Err(arity_error(&name, "3", n, span));
            }
            let a: Vec<Expr> = drain(&mut args);
            let boxed: Box<[Expr; 3]> = Box::new(a.try_into().unwrap());
            if name == "dcf" {
                ExprKind::Dcf(boxed)
            } else {
                ExprKind::Days(boxed)
            }
        }
        "fwdComp" | "fwdAvg" => {
            if !matches!(n, 4 | 6 | 10 | 14) {
                return Err(arity_error(&name, "4, 6, 10 or 14", n, span));
            }
            let mut it = args.drain(..);
            let fa = FwdCompAvgArgs {
                index: it.next().unwrap(),
                obs_date: it.next().unwrap(),
                start_date: it.next().unwrap(),
                end_date: it.next().unwrap(),
                spread: it.next(),
                gearing: it.next(),
                lookback: it.next(),
                rate_cutoff: it.next(),
                fixing_days: it.next(),
                include_spread: it.next(),
                cap: it.next(),
                floor: it.next(),
                naked_option: it.next(),
                local_cap_floor: it.next(),
            };
            drop(it);
            ExprKind::FwdCompAvg {
                is_avg: name == "fwdAvg",
                args: Box::new(fa),
            }
        }
        "aboveProb" | "belowProb" => {
            if n != 4 {
                return Err(arity_error(&name, "4", n, span));
            }
            let a: Vec<Expr> = drain(&mut args);
            ExprKind::BarrierProb {
                above: name == "aboveProb",
                args: Box::new(a.try_into().unwrap()),
            }
        }
        // Anything else is index evaluation: `v(obsDate[, fwdDate])`.
        _ => {
            if !matches!(n, 1 | 2) {
                return Err(arity_error(&name, "1 or 2 (index evaluation)", n, span));
            }
            let mut it = args.drain(..);
            let obs_date = it.next().unwrap();
            let fwd_date = it.next();
            drop(it);
            ExprKind::IndexEval {
                var: Box::new(Expr {
                    kind: ExprKind::Var(VarRef {
                        name,
                        subscript: None,
                        cache: ShapeCache::default(),
                        span: start,
                    }),
                    span: start,
                }),
                obs_date: Box::new(obs_date),
                fwd_date: fwd_date.map(Box::new),
            }
        }
    };

    Ok(Expr { kind, span })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sequence_of_statements() {
        let stmt = parse("{ NUMBER x, y[10]; x = 1 + 2 * 3; }").unwrap();
        match stmt.kind {
            StmtKind::Sequence(stmts) => assert_eq!(stmts.len(), 2),
            other => panic!("expected sequence, got {other:?}"),
        }
    }

    #[test]
    fn precedence_multiplication_binds_tighter() {
        let expr = parse_expr_str("1 + 2 * 3").unwrap();
        match expr.kind {
            ExprKind::Arith {
                op: ArithOp::Add,
                rhs,
                ..
            } => assert!(matches!(
                rhs.kind,
                ExprKind::Arith {
                    op: ArithOp::Mul,
                    ..
                }
            )),
            other => panic!("expected addition at top, got {other:?}"),
        }
    }

    #[test]
    fn parses_if_then_else() {
        let stmt = parse("IF x > 0 THEN y = 1; ELSE y = 2;").unwrap();
        assert!(matches!(
            stmt.kind,
            StmtKind::If {
                else_branch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn parses_for_loop() {
        let stmt = parse("FOR i = 1 TO 10 STEP 1 DO { x = x + i; }").unwrap();
        assert!(matches!(stmt.kind, StmtKind::For { .. }));
    }

    #[test]
    fn parses_pay_call() {
        let expr = parse_expr_str("pay(Notional, Obs, Pay, Ccy)").unwrap();
        assert!(matches!(expr.kind, ExprKind::Pay(_)));
    }

    #[test]
    fn rejects_bad_fwdcomp_arity() {
        let err = parse_expr_str("fwdComp(u, o, s, e, spread)").unwrap_err();
        assert!(matches!(err, ScriptError::Parse { .. }));
    }

    #[test]
    fn unknown_call_is_index_evaluation() {
        let expr = parse_expr_str("Underlying(Obs)").unwrap();
        assert!(matches!(expr.kind, ExprKind::IndexEval { .. }));
    }

    #[test]
    fn parses_sort_with_permutation_target() {
        let stmt = parse("SORT (x, y, p);").unwrap();
        match stmt.kind {
            StmtKind::Sort { x, y, p } => {
                assert_eq!(x, "x");
                assert_eq!(y.as_deref(), Some("y"));
                assert_eq!(p.as_deref(), Some("p"));
            }
            other => panic!("expected sort, got {other:?}"),
        }
    }

    #[test]
    fn reports_span_on_error() {
        let err = parse("IF x THEN").unwrap_err();
        let span = err.span();
        assert!(span.start > 0);
    }

    #[test]
    fn parses_dateindex() {
        let expr = parse_expr_str("DATEINDEX(e, Schedule, GEQ)").unwrap();
        assert!(matches!(
            expr.kind,
            ExprKind::DateIndex {
                op: DateIndexOp::Geq,
                ..
            }
        ));
    }
}
