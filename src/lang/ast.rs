//! Typed expression and statement trees produced by the parser.
//!
//! Every node carries a source [`Span`] for diagnostics. Variable references
//! carry a shape cache (scalar vs array) populated on first resolution; the
//! cache must be cleared with [`reset_stmt`] before re-evaluating the same
//! tree against a fresh context.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::lang::error::Span;

/// Cached resolution state of a variable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarShape {
    Scalar,
    Array,
}

/// Shape cache shared across evaluations of one AST; atomic so trees can be
/// handed to worker threads without interior-mutability hazards.
#[derive(Debug, Default)]
pub struct ShapeCache(AtomicU8);

const SHAPE_UNRESOLVED: u8 = 0;
const SHAPE_SCALAR: u8 = 1;
const SHAPE_ARRAY: u8 = 2;

impl ShapeCache {
    pub fn get(&self) -> Option<VarShape> {
        match self.0.load(Ordering::Relaxed) {
            SHAPE_SCALAR => Some(VarShape::Scalar),
            SHAPE_ARRAY => Some(VarShape::Array),
            _ => None,
        }
    }

    pub fn set(&self, shape: VarShape) {
        let raw = match shape {
            VarShape::Scalar => SHAPE_SCALAR,
            VarShape::Array => SHAPE_ARRAY,
        };
        self.0.store(raw, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.0.store(SHAPE_UNRESOLVED, Ordering::Relaxed);
    }
}

impl Clone for ShapeCache {
    fn clone(&self) -> Self {
        // A cloned tree starts unresolved; caches are per-evaluation state.
        Self(AtomicU8::new(SHAPE_UNRESOLVED))
    }
}

impl PartialEq for ShapeCache {
    fn eq(&self, _other: &Self) -> bool {
        true // caches never participate in structural equality
    }
}

/// Variable reference, optionally subscripted (`v` or `v[e]`, 1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub subscript: Option<Box<Expr>>,
    pub cache: ShapeCache,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Abs,
    Exp,
    Ln,
    Sqrt,
    NormalCdf,
    NormalPdf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFn {
    Min,
    Max,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateIndexOp {
    Eq,
    Geq,
    Gt,
}

/// Arguments of `pay` / `logpay`.
#[derive(Debug, Clone, PartialEq)]
pub struct PayArgs {
    pub amount: Expr,
    pub obs_date: Expr,
    pub pay_date: Expr,
    pub pay_ccy: Expr,
    /// logpay extras: leg number, cashflow type variable name, slot.
    pub leg_no: Option<Expr>,
    pub cashflow_type: Option<String>,
    pub slot: Option<Expr>,
}

/// Arguments of `npv` / `npvmem`.
#[derive(Debug, Clone, PartialEq)]
pub struct NpvArgs {
    pub amount: Expr,
    pub obs_date: Expr,
    pub mem_slot: Option<Expr>,
    pub regression_filter: Option<Expr>,
    pub add_regressor_1: Option<Expr>,
    pub add_regressor_2: Option<Expr>,
}

/// Arguments of `fwdComp` / `fwdAvg`. Optional blocks appear in full or not
/// at all, enforced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct FwdCompAvgArgs {
    pub index: Expr,
    pub obs_date: Expr,
    pub start_date: Expr,
    pub end_date: Expr,
    pub spread: Option<Expr>,
    pub gearing: Option<Expr>,
    pub lookback: Option<Expr>,
    pub rate_cutoff: Option<Expr>,
    pub fixing_days: Option<Expr>,
    pub include_spread: Option<Expr>,
    pub cap: Option<Expr>,
    pub floor: Option<Expr>,
    pub naked_option: Option<Expr>,
    pub local_cap_floor: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(f64),
    Var(VarRef),
    Neg(Box<Expr>),
    Arith {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    UnaryFn {
        f: UnaryFn,
        arg: Box<Expr>,
    },
    BinaryFn {
        f: BinaryFn,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `black(cp, obs, expiry, strike, forward, vol)`
    Black(Box<[Expr; 6]>),
    Pay(Box<PayArgs>),
    LogPay(Box<PayArgs>),
    Npv(Box<NpvArgs>),
    /// `histfixing(index, obsDate)`
    HistFixing(Box<[Expr; 2]>),
    /// `discount(obs, pay, ccy)`
    Discount(Box<[Expr; 3]>),
    FwdCompAvg {
        is_avg: bool,
        args: Box<FwdCompAvgArgs>,
    },
    /// `aboveProb`/`belowProb(index, obs1, obs2, barrier)`
    BarrierProb {
        above: bool,
        args: Box<[Expr; 4]>,
    },
    /// Index evaluation `v(obsDate[, fwdDate])`.
    IndexEval {
        var: Box<Expr>,
        obs_date: Box<Expr>,
        fwd_date: Option<Box<Expr>>,
    },
    /// `SIZE(arrayName)`
    Size {
        name: String,
    },
    /// `DATEINDEX(eventVar, arrayName, op)`
    DateIndex {
        var: Box<Expr>,
        array: String,
        op: DateIndexOp,
    },
    /// `dcf(dayCounter, d1, d2)` year fraction.
    Dcf(Box<[Expr; 3]>),
    /// `days(dayCounter, d1, d2)` day count.
    Days(Box<[Expr; 3]>),
}

/// Declared variable in a `NUMBER` statement: scalar or sized array.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclVar {
    pub name: String,
    pub array_size: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Sequence(Vec<Stmt>),
    DeclareNumber(Vec<DeclVar>),
    Assign {
        target: VarRef,
        value: Expr,
    },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    For {
        var: String,
        from: Expr,
        to: Expr,
        step: Expr,
        body: Box<Stmt>,
    },
    Require(Expr),
    Sort {
        x: String,
        y: Option<String>,
        p: Option<String>,
    },
    Permute {
        x: String,
        y: Option<String>,
        p: Option<String>,
    },
}

/// Clears all variable-shape caches below `stmt`.
pub fn reset_stmt(stmt: &Stmt) {
    match &stmt.kind {
        StmtKind::Sequence(stmts) => stmts.iter().for_each(reset_stmt),
        StmtKind::DeclareNumber(vars) => {
            for v in vars {
                if let Some(size) = &v.array_size {
                    reset_expr(size);
                }
            }
        }
        StmtKind::Assign { target, value } => {
            reset_var(target);
            reset_expr(value);
        }
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            reset_expr(cond);
            reset_stmt(then_branch);
            if let Some(e) = else_branch {
                reset_stmt(e);
            }
        }
        StmtKind::For {
            from, to, step, body, ..
        } => {
            reset_expr(from);
            reset_expr(to);
            reset_expr(step);
            reset_stmt(body);
        }
        StmtKind::Require(cond) => reset_expr(cond),
        StmtKind::Sort { .. } | StmtKind::Permute { .. } => {}
    }
}

fn reset_var(var: &VarRef) {
    var.cache.clear();
    if let Some(sub) = &var.subscript {
        reset_expr(sub);
    }
}

/// Clears all variable-shape caches below `expr`.
pub fn reset_expr(expr: &Expr) {
    match &expr.kind {
        ExprKind::Number(_) | ExprKind::Size { .. } => {}
        ExprKind::Var(v) => reset_var(v),
        ExprKind::Neg(e) | ExprKind::Not(e) | ExprKind::UnaryFn { arg: e, .. } => reset_expr(e),
        ExprKind::Arith { lhs, rhs, .. }
        | ExprKind::Compare { lhs, rhs, .. }
        | ExprKind::BinaryFn { lhs, rhs, .. }
        | ExprKind::And(lhs, rhs)
        | ExprKind::Or(lhs, rhs) => {
            reset_expr(lhs);
            reset_expr(rhs);
        }
        ExprKind::Black(args) => args.iter().for_each(reset_expr),
        ExprKind::Pay(args) | ExprKind::LogPay(args) => {
            reset_expr(&args.amount);
            reset_expr(&args.obs_date);
            reset_expr(&args.pay_date);
            reset_expr(&args.pay_ccy);
            [&args.leg_no, &args.slot]
                .into_iter()
                .flatten()
                .for_each(reset_expr);
        }
        ExprKind::Npv(args) => {
            reset_expr(&args.amount);
            reset_expr(&args.obs_date);
            [
                &args.mem_slot,
                &args.regression_filter,
                &args.add_regressor_1,
                &args.add_regressor_2,
            ]
            .into_iter()
            .flatten()
            .for_each(reset_expr);
        }
        ExprKind::HistFixing(args) => args.iter().for_each(reset_expr),
        ExprKind::Discount(args) | ExprKind::Dcf(args) | ExprKind::Days(args) => {
            args.iter().for_each(reset_expr)
        }
        ExprKind::FwdCompAvg { args, .. } => {
            reset_expr(&args.index);
            reset_expr(&args.obs_date);
            reset_expr(&args.start_date);
            reset_expr(&args.end_date);
            [
                &args.spread,
                &args.gearing,
                &args.lookback,
                &args.rate_cutoff,
                &args.fixing_days,
                &args.include_spread,
                &args.cap,
                &args.floor,
                &args.naked_option,
                &args.local_cap_floor,
            ]
            .into_iter()
            .flatten()
            .for_each(reset_expr);
        }
        ExprKind::BarrierProb { args, .. } => args.iter().for_each(reset_expr),
        ExprKind::IndexEval {
            var,
            obs_date,
            fwd_date,
        } => {
            reset_expr(var);
            reset_expr(obs_date);
            if let Some(f) = fwd_date {
                reset_expr(f);
            }
        }
        ExprKind::DateIndex { var, .. } => reset_expr(var),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_cache_resolves_and_resets() {
        let cache = ShapeCache::default();
        assert_eq!(cache.get(), None);
        cache.set(VarShape::Array);
        assert_eq!(cache.get(), Some(VarShape::Array));
        cache.clear();
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn cloned_tree_starts_unresolved() {
        let cache = ShapeCache::default();
        cache.set(VarShape::Scalar);
        let cloned = cache.clone();
        assert_eq!(cloned.get(), None);
    }

    #[test]
    fn reset_clears_nested_var_caches() {
        let var = VarRef {
            name: "x".into(),
            subscript: None,
            cache: ShapeCache::default(),
            span: Span::default(),
        };
        var.cache.set(VarShape::Scalar);
        let stmt = Stmt {
            kind: StmtKind::Assign {
                target: var,
                value: Expr {
                    kind: ExprKind::Number(1.0),
                    span: Span::default(),
                },
            },
            span: Span::default(),
        };
        reset_stmt(&stmt);
        if let StmtKind::Assign { target, .. } = &stmt.kind {
            assert_eq!(target.cache.get(), None);
        }
    }
}
