//! Tree-walking interpreter for payoff scripts.
//!
//! The runner keeps an explicit value stack of [`Value`]s and a filter stack
//! holding the active execution mask, and dispatches on node kind. Model
//! primitives pull their arguments off the value stack in reverse textual
//! order. A shared abort flag is checked at every node checkpoint; the
//! optional interactive mode prints the stacks and pauses on stdin after
//! each visited node.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use crate::lang::ast::*;
use crate::lang::error::{annotate_source, code_context, ScriptError, Span};
use crate::lang::model::{FwdCompAvgParams, Model};
use crate::lang::parser::parse;
use crate::lang::paylog::PayLog;
use crate::lang::random_variable::{conditional_result, Filter, RandomVariable};
use crate::lang::value::{Context, Value, ValueKind};

/// Run-time switches: interactive stepping and cooperative cancellation.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub interactive: bool,
    pub abort: Option<Arc<AtomicBool>>,
}

/// Script engine bound to a model and a mutable context.
pub struct ScriptEngine<'a> {
    model: &'a dyn Model,
    context: &'a mut Context,
    paylog: Option<&'a mut PayLog>,
    options: EngineOptions,
}

impl<'a> ScriptEngine<'a> {
    pub fn new(model: &'a dyn Model, context: &'a mut Context) -> Self {
        Self {
            model,
            context,
            paylog: None,
            options: EngineOptions::default(),
        }
    }

    pub fn with_paylog(mut self, paylog: &'a mut PayLog) -> Self {
        self.paylog = Some(paylog);
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Parses and evaluates `source` against the bound context.
    pub fn run(&mut self, source: &str) -> Result<(), ScriptError> {
        let ast = parse(source)?;
        self.run_ast(source, &ast)
    }

    /// Evaluates a pre-parsed script. Node caches are reset before the walk
    /// so the same AST can be reused across contexts.
    pub fn run_ast(&mut self, source: &str, ast: &Stmt) -> Result<(), ScriptError> {
        reset_stmt(ast);
        let size = self.model.size();
        let mut runner = Runner {
            model: self.model,
            context: &mut *self.context,
            paylog: self.paylog.as_deref_mut(),
            size,
            source,
            value: vec![Value::Number(RandomVariable::new(size, 0.0))],
            filter: vec![Filter::new(size, true)],
            last_span: Span::default(),
            options: &self.options,
        };
        debug!(samples = size, "script engine run starting");
        let result = runner.exec_stmt(ast);
        if let Err(err) = result {
            debug!(
                "script error at {}: {err}\n{}",
                annotate_source(source, err.span()),
                code_context(source, err.span())
            );
            return Err(err);
        }
        if runner.value.len() != 1 {
            return Err(ScriptError::Internal {
                message: format!(
                    "value stack has wrong size ({}), should be 1",
                    runner.value.len()
                ),
                span: runner.last_span,
            });
        }
        if runner.filter.len() != 1 {
            return Err(ScriptError::Internal {
                message: format!(
                    "filter stack has wrong size ({}), should be 1",
                    runner.filter.len()
                ),
                span: runner.last_span,
            });
        }
        debug!("script engine run finished");
        Ok(())
    }
}

/// Renders a script error with its line/col and offending source line, for
/// top-level reports.
pub fn render_script_error(source: &str, err: &ScriptError) -> String {
    format!(
        "{err} at {}:\n{}",
        annotate_source(source, err.span()),
        code_context(source, err.span())
    )
}

struct Runner<'a> {
    model: &'a dyn Model,
    context: &'a mut Context,
    paylog: Option<&'a mut PayLog>,
    size: usize,
    source: &'a str,
    value: Vec<Value>,
    filter: Vec<Filter>,
    last_span: Span,
    options: &'a EngineOptions,
}

impl Runner<'_> {
    fn checkpoint(&mut self, span: Span) -> Result<(), ScriptError> {
        self.last_span = span;
        if let Some(abort) = &self.options.abort {
            if abort.load(Ordering::Relaxed) {
                return Err(ScriptError::Aborted { span });
            }
        }
        Ok(())
    }

    fn trace(&self, what: &str, span: Span) {
        if !self.options.interactive {
            return;
        }
        eprintln!(
            "\nScriptEngine: {what} at {}\ncurr filter = {:?}\n{}",
            annotate_source(self.source, span),
            self.filter.last().map(|f| f.deterministic()),
            code_context(self.source, span)
        );
        let stdin = std::io::stdin();
        loop {
            eprint!("(c)ontext (q)uit ");
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                return;
            }
            match line.trim() {
                "c" => eprintln!("{}", self.context),
                _ => return,
            }
        }
    }

    fn active_filter(&self) -> Filter {
        self.filter.last().cloned().unwrap_or_else(|| Filter::new(self.size, true))
    }

    fn pop_value(&mut self, span: Span) -> Result<Value, ScriptError> {
        self.value.pop().ok_or_else(|| ScriptError::Internal {
            message: "value stack underflow".to_string(),
            span,
        })
    }

    fn expect_number(&self, v: Value, span: Span) -> Result<RandomVariable, ScriptError> {
        match v {
            Value::Number(rv) => Ok(rv),
            other => Err(type_error("NUMBER", other.kind(), span)),
        }
    }

    fn expect_filter(&self, v: Value, span: Span) -> Result<Filter, ScriptError> {
        match v {
            Value::Condition(f) => Ok(f),
            other => Err(type_error("CONDITION", other.kind(), span)),
        }
    }

    fn expect_event(&self, v: Value, span: Span) -> Result<NaiveDate, ScriptError> {
        match v {
            Value::Event(d) => Ok(d),
            other => Err(type_error("EVENT", other.kind(), span)),
        }
    }

    fn expect_currency(&self, v: Value, span: Span) -> Result<String, ScriptError> {
        match v {
            Value::Currency(s) => Ok(s),
            other => Err(type_error("CURRENCY", other.kind(), span)),
        }
    }

    fn expect_index(&self, v: Value, span: Span) -> Result<String, ScriptError> {
        match v {
            Value::Index(s) => Ok(s),
            other => Err(type_error("INDEX", other.kind(), span)),
        }
    }

    fn expect_daycounter(&self, v: Value, span: Span) -> Result<String, ScriptError> {
        match v {
            Value::DayCounter(s) => Ok(s),
            other => Err(type_error("DAYCOUNTER", other.kind(), span)),
        }
    }

    fn deterministic_integer(
        &self,
        rv: &RandomVariable,
        what: &str,
        span: Span,
    ) -> Result<i64, ScriptError> {
        if !rv.deterministic() {
            return Err(ScriptError::Type {
                message: format!("{what} must be deterministic"),
                span,
            });
        }
        Ok(rv.at(0).round() as i64)
    }

    // ---- variable access -------------------------------------------------

    /// Resolves a reference to (name, optional array index), caching the
    /// scalar/array shape on the node.
    fn resolve_slot(&mut self, var: &VarRef) -> Result<(String, Option<usize>), ScriptError> {
        self.checkpoint(var.span)?;
        let shape = match var.cache.get() {
            Some(shape) => shape,
            None => {
                let shape = if self.context.scalars.contains_key(&var.name) {
                    VarShape::Scalar
                } else if self.context.arrays.contains_key(&var.name) {
                    VarShape::Array
                } else {
                    return Err(ScriptError::Type {
                        message: format!("variable '{}' is not defined", var.name),
                        span: var.span,
                    });
                };
                var.cache.set(shape);
                shape
            }
        };
        match shape {
            VarShape::Scalar => {
                if var.subscript.is_some() {
                    return Err(ScriptError::Type {
                        message: format!("no array subscript allowed for variable '{}'", var.name),
                        span: var.span,
                    });
                }
                Ok((var.name.clone(), None))
            }
            VarShape::Array => {
                let sub = var.subscript.as_ref().ok_or_else(|| ScriptError::Type {
                    message: format!("array subscript required for variable '{}'", var.name),
                    span: var.span,
                })?;
                self.eval_expr(sub)?;
                let v = self.pop_value(sub.span)?;
                let rv = self.expect_number(v, sub.span)?;
                if !rv.deterministic() {
                    return Err(ScriptError::Type {
                        message: "array subscript must be deterministic".to_string(),
                        span: sub.span,
                    });
                }
                let il = rv.at(0).round() as i64;
                let len = self
                    .context
                    .arrays
                    .get(&var.name)
                    .map(Vec::len)
                    .unwrap_or(0);
                if il < 1 || il > len as i64 {
                    return Err(ScriptError::Bounds {
                        message: format!("array index {il} out of bounds 1...{len}"),
                        span: sub.span,
                    });
                }
                Ok((var.name.clone(), Some((il - 1) as usize)))
            }
        }
    }

    fn read_var(&mut self, var: &VarRef) -> Result<Value, ScriptError> {
        let (name, index) = self.resolve_slot(var)?;
        match index {
            None => Ok(self.context.scalars[&name].clone()),
            Some(i) => Ok(self.context.arrays[&name][i].clone()),
        }
    }

    fn write_var(&mut self, name: &str, index: Option<usize>, value: Value) {
        match index {
            None => {
                self.context.scalars.insert(name.to_string(), value);
            }
            Some(i) => {
                if let Some(array) = self.context.arrays.get_mut(name) {
                    array[i] = value;
                }
            }
        }
    }

    // ---- statements ------------------------------------------------------

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<(), ScriptError> {
        self.checkpoint(stmt.span)?;
        match &stmt.kind {
            StmtKind::Sequence(stmts) => {
                for s in stmts {
                    self.exec_stmt(s)?;
                    self.checkpoint(stmt.span)?;
                }
                Ok(())
            }
            StmtKind::DeclareNumber(vars) => self.exec_declare(vars, stmt.span),
            StmtKind::Assign { target, value } => self.exec_assign(target, value, stmt.span),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.exec_if(cond, then_branch, else_branch.as_deref(), stmt.span),
            StmtKind::For {
                var,
                from,
                to,
                step,
                body,
            } => self.exec_for(var, from, to, step, body, stmt.span),
            StmtKind::Require(cond) => self.exec_require(cond, stmt.span),
            StmtKind::Sort { x, y, p } => {
                self.exec_sort(x, y.as_deref(), p.as_deref(), stmt.span)
            }
            StmtKind::Permute { x, y, p } => {
                self.exec_permute(x, y.as_deref(), p.as_deref(), stmt.span)
            }
        }
    }

    fn exec_declare(&mut self, vars: &[DeclVar], span: Span) -> Result<(), ScriptError> {
        for decl in vars {
            self.checkpoint(decl.span)?;
            if self.context.ignore_assignments.contains(&decl.name) {
                self.trace(&format!("declare({}) ignored", decl.name), decl.span);
                continue;
            }
            if self.context.is_declared(&decl.name) {
                return Err(ScriptError::Type {
                    message: format!("variable '{}' already declared", decl.name),
                    span: decl.span,
                });
            }
            let zero = Value::Number(RandomVariable::new(self.size, 0.0));
            match &decl.array_size {
                Some(size_expr) => {
                    self.eval_expr(size_expr)?;
                    let v = self.pop_value(size_expr.span)?;
                    let rv = self.expect_number(v, size_expr.span)?;
                    if !rv.deterministic() {
                        return Err(ScriptError::Type {
                            message: "array size definition requires deterministic argument"
                                .to_string(),
                            span: size_expr.span,
                        });
                    }
                    let n = rv.at(0).round() as i64;
                    if n < 0 {
                        return Err(ScriptError::Bounds {
                            message: format!("expected non-negative array size, got {n}"),
                            span: size_expr.span,
                        });
                    }
                    self.context
                        .arrays
                        .insert(decl.name.clone(), vec![zero; n as usize]);
                    self.trace(&format!("declare({}[{n}])", decl.name), decl.span);
                }
                None => {
                    self.context.scalars.insert(decl.name.clone(), zero);
                    self.trace(&format!("declare({})", decl.name), decl.span);
                }
            }
        }
        self.checkpoint(span)
    }

    fn exec_assign(
        &mut self,
        target: &VarRef,
        value: &Expr,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.eval_expr(value)?;
        let rhs = self.pop_value(value.span)?;
        self.checkpoint(span)?;
        if self.context.ignore_assignments.contains(&target.name) {
            self.trace(&format!("assign({}) ignored", target.name), span);
            return Ok(());
        }
        if self.context.constants.contains(&target.name) {
            return Err(ScriptError::Type {
                message: format!("can not assign to const variable '{}'", target.name),
                span: target.span,
            });
        }
        let (name, index) = self.resolve_slot(target)?;
        let current = match index {
            None => self.context.scalars[&name].clone(),
            Some(i) => self.context.arrays[&name][i].clone(),
        };
        let mask = self.active_filter();
        match current.kind() {
            ValueKind::Event | ValueKind::Currency | ValueKind::Index | ValueKind::DayCounter => {
                // Type-safe assign: a non-laned value can only be replaced
                // wholesale (all-true mask) or confirmed equal under a
                // partial mask.
                if rhs.kind() != current.kind() {
                    return Err(ScriptError::Type {
                        message: format!(
                            "invalid assignment: {} <- {}",
                            current.kind(),
                            rhs.kind()
                        ),
                        span,
                    });
                }
                if mask.all_true() {
                    self.write_var(&name, index, rhs);
                } else if mask.any_true() && !current.same_constant(&rhs) {
                    return Err(ScriptError::Type {
                        message: format!(
                            "can not assign a new {} value to '{}' under a partial filter",
                            current.kind(),
                            name
                        ),
                        span,
                    });
                }
            }
            ValueKind::Number => {
                let rhs_rv = self.expect_number(rhs, value.span)?;
                let current_rv = match current {
                    Value::Number(rv) => rv,
                    _ => unreachable!("kind checked above"),
                };
                let mut updated = conditional_result(&mask, &rhs_rv, &current_rv);
                updated.set_time(None);
                updated.update_deterministic();
                self.write_var(&name, index, Value::Number(updated));
            }
            ValueKind::Condition => {
                return Err(ScriptError::Type {
                    message: format!("can not assign to condition variable '{name}'"),
                    span,
                });
            }
        }
        self.trace(&format!("assign({name})"), span);
        Ok(())
    }

    fn exec_if(
        &mut self,
        cond: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.eval_expr(cond)?;
        let v = self.pop_value(cond.span)?;
        self.checkpoint(span)?;
        let c = match v {
            Value::Condition(f) => f,
            other => {
                return Err(ScriptError::Type {
                    message: format!("IF must be followed by a condition, got {}", other.kind()),
                    span: cond.span,
                })
            }
        };
        let base = self.active_filter();

        let mut then_mask = base.and(&c);
        then_mask.update_deterministic();
        // Deterministic-false masks must skip the branch entirely.
        let run_then = !then_mask.deterministic() || then_mask.at(0);
        self.filter.push(then_mask);
        self.trace("then", span);
        if run_then {
            self.exec_stmt(then_branch)?;
            self.checkpoint(span)?;
        }
        self.filter.pop();

        if let Some(else_stmt) = else_branch {
            let mut else_mask = base.and(&c.not());
            else_mask.update_deterministic();
            let run_else = !else_mask.deterministic() || else_mask.at(0);
            self.filter.push(else_mask);
            self.trace("else", span);
            if run_else {
                self.exec_stmt(else_stmt)?;
                self.checkpoint(span)?;
            }
            self.filter.pop();
        }
        Ok(())
    }

    fn exec_for(
        &mut self,
        var: &str,
        from: &Expr,
        to: &Expr,
        step: &Expr,
        body: &Stmt,
        span: Span,
    ) -> Result<(), ScriptError> {
        if !self.context.scalars.contains_key(var) {
            return Err(ScriptError::Type {
                message: format!("loop variable '{var}' not defined or not scalar"),
                span,
            });
        }
        if self.context.constants.contains(var) {
            return Err(ScriptError::Type {
                message: format!("loop variable '{var}' is constant"),
                span,
            });
        }
        self.eval_expr(from)?;
        self.eval_expr(to)?;
        self.eval_expr(step)?;
        let step_v = self.pop_value(step.span)?;
        let to_v = self.pop_value(to.span)?;
        let from_v = self.pop_value(from.span)?;
        self.checkpoint(span)?;
        let a = self.expect_number(from_v, from.span)?;
        let b = self.expect_number(to_v, to.span)?;
        let s = self.expect_number(step_v, step.span)?;
        let al = self.deterministic_integer(&a, "first loop bound", from.span)?;
        let bl = self.deterministic_integer(&b, "second loop bound", to.span)?;
        let sl = self.deterministic_integer(&s, "loop step", step.span)?;
        if sl == 0 {
            return Err(ScriptError::Bounds {
                message: "loop step must be non-zero".to_string(),
                span: step.span,
            });
        }
        let mut cl = al;
        while (sl > 0 && cl <= bl) || (sl < 0 && cl >= bl) {
            self.trace(&format!("for({var} : {cl})"), span);
            self.context.scalars.insert(
                var.to_string(),
                Value::Number(RandomVariable::new(self.size, cl as f64)),
            );
            self.exec_stmt(body)?;
            self.checkpoint(span)?;
            let unchanged = matches!(
                self.context.scalars.get(var),
                Some(Value::Number(rv))
                    if rv.close_enough_all(&RandomVariable::new(self.size, cl as f64))
            );
            if !unchanged {
                return Err(ScriptError::Type {
                    message: format!("loop variable '{var}' was modified in body, this is illegal"),
                    span,
                });
            }
            cl += sl;
        }
        Ok(())
    }

    fn exec_require(&mut self, cond: &Expr, span: Span) -> Result<(), ScriptError> {
        self.eval_expr(cond)?;
        let v = self.pop_value(cond.span)?;
        self.checkpoint(span)?;
        let condition = self.expect_filter(v, cond.span)?;
        // Implication: active filter true => condition true, on every lane.
        let mut c = self.active_filter().not().or(&condition);
        c.update_deterministic();
        if !(c.deterministic() && c.at(0)) {
            return Err(ScriptError::RequireFailed { span });
        }
        self.trace("require", span);
        Ok(())
    }

    /// Gathers an array of NUMBER lanes for SORT/PERMUTE, cloning out of the
    /// context so aliased operands (y = x, p = y) stay well-defined.
    fn number_array(&self, name: &str, span: Span) -> Result<Vec<RandomVariable>, ScriptError> {
        let values = self.context.arrays.get(name).ok_or_else(|| ScriptError::Type {
            message: format!("did not find array with name '{name}'"),
            span,
        })?;
        values
            .iter()
            .map(|v| match v {
                Value::Number(rv) => Ok(rv.clone()),
                other => Err(type_error("NUMBER", other.kind(), span)),
            })
            .collect()
    }

    fn store_number_array(
        &mut self,
        name: &str,
        values: Vec<RandomVariable>,
    ) {
        if let Some(slot) = self.context.arrays.get_mut(name) {
            *slot = values.into_iter().map(Value::Number).collect();
        }
    }

    fn exec_sort(
        &mut self,
        x: &str,
        y: Option<&str>,
        p: Option<&str>,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.checkpoint(span)?;
        let xs = self.number_array(x, span)?;
        let y_name = y.unwrap_or(x);
        let mut ys = self.number_array(y_name, span)?;
        let mut ps = match p {
            Some(name) => Some(self.number_array(name, span)?),
            None => None,
        };

        let len = xs.len();
        if len == 0 {
            return Err(ScriptError::Bounds {
                message: "array size must be >= 1".to_string(),
                span,
            });
        }
        check_equal_len(len, ys.len(), "y", span)?;
        if let Some(ps) = &ps {
            check_equal_len(len, ps.len(), "p", span)?;
        }
        check_lane_sizes(&xs, self.size, span)?;
        check_lane_sizes(&ys, self.size, span)?;
        if let Some(ps) = &ps {
            check_lane_sizes(ps, self.size, span)?;
        }

        let flt = self.active_filter();
        let mut scratch: Vec<(f64, usize)> = vec![(0.0, 0); len];
        for k in 0..self.size {
            if !flt.at(k) {
                continue;
            }
            for (c, xv) in xs.iter().enumerate() {
                scratch[c] = (xv.at(k), c + 1); // permutation is 1-based
            }
            scratch.sort_by(|a, b| a.0.total_cmp(&b.0));
            for (c, &(val, perm)) in scratch.iter().enumerate() {
                ys[c].set(k, val);
                if let Some(ps) = &mut ps {
                    ps[c].set(k, perm as f64);
                }
            }
        }
        for yv in &mut ys {
            yv.update_deterministic();
        }
        self.store_number_array(y_name, ys);
        if let (Some(name), Some(mut ps)) = (p, ps) {
            for pv in &mut ps {
                pv.update_deterministic();
            }
            self.store_number_array(name, ps);
        }
        self.trace("sort", span);
        Ok(())
    }

    fn exec_permute(
        &mut self,
        x: &str,
        y: Option<&str>,
        p: Option<&str>,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.checkpoint(span)?;
        // With p absent the two-argument form reads PERMUTE(x, perm),
        // permuting x in place.
        let (src_name, dst_name, perm_name) = match (y, p) {
            (Some(y_name), Some(p_name)) => (x, y_name, p_name),
            (Some(y_name), None) => (x, x, y_name),
            _ => {
                return Err(ScriptError::Type {
                    message: "PERMUTE requires at least a source and a permutation array"
                        .to_string(),
                    span,
                })
            }
        };
        let xs = self.number_array(src_name, span)?;
        let mut ys = self.number_array(dst_name, span)?;
        let ps = self.number_array(perm_name, span)?;

        let len = xs.len();
        if len == 0 {
            return Err(ScriptError::Bounds {
                message: "array size must be >= 1".to_string(),
                span,
            });
        }
        check_equal_len(len, ys.len(), "y", span)?;
        check_equal_len(len, ps.len(), "p", span)?;
        check_lane_sizes(&xs, self.size, span)?;
        check_lane_sizes(&ys, self.size, span)?;
        check_lane_sizes(&ps, self.size, span)?;

        let flt = self.active_filter();
        let mut val = vec![0.0; len];
        for k in 0..self.size {
            if !flt.at(k) {
                continue;
            }
            for c in 0..len {
                let permuted = ps[c].at(k).round() as i64;
                if permuted < 1 || permuted > len as i64 {
                    return Err(ScriptError::Bounds {
                        message: format!(
                            "permuted index p[{c}] = {permuted} out of bounds 1...{len} at component {k}"
                        ),
                        span,
                    });
                }
                val[c] = xs[(permuted - 1) as usize].at(k);
            }
            for c in 0..len {
                ys[c].set(k, val[c]);
            }
        }
        for yv in &mut ys {
            yv.update_deterministic();
        }
        self.store_number_array(dst_name, ys);
        self.trace("permute", span);
        Ok(())
    }

    // ---- expressions -----------------------------------------------------

    fn eval_expr(&mut self, expr: &Expr) -> Result<(), ScriptError> {
        self.checkpoint(expr.span)?;
        match &expr.kind {
            ExprKind::Number(v) => {
                self.value
                    .push(Value::Number(RandomVariable::new(self.size, *v)));
                Ok(())
            }
            ExprKind::Var(var) => {
                let v = self.read_var(var)?;
                self.value.push(v);
                Ok(())
            }
            ExprKind::Neg(inner) => {
                self.eval_expr(inner)?;
                let v = self.pop_value(inner.span)?;
                let rv = self.expect_number(v, inner.span)?;
                self.value.push(Value::Number(-&rv));
                Ok(())
            }
            ExprKind::Arith { op, lhs, rhs } => self.eval_arith(*op, lhs, rhs, expr.span),
            ExprKind::Compare { op, lhs, rhs } => self.eval_compare(*op, lhs, rhs, expr.span),
            ExprKind::And(lhs, rhs) => self.eval_and(lhs, rhs, expr.span),
            ExprKind::Or(lhs, rhs) => self.eval_or(lhs, rhs, expr.span),
            ExprKind::Not(inner) => {
                self.eval_expr(inner)?;
                let v = self.pop_value(inner.span)?;
                let f = self.expect_filter(v, inner.span)?;
                self.value.push(Value::Condition(f.not()));
                Ok(())
            }
            ExprKind::UnaryFn { f, arg } => {
                self.eval_expr(arg)?;
                let v = self.pop_value(arg.span)?;
                let rv = self.expect_number(v, arg.span)?;
                let out = match f {
                    UnaryFn::Abs => rv.abs(),
                    UnaryFn::Exp => rv.exp(),
                    UnaryFn::Ln => rv.ln(),
                    UnaryFn::Sqrt => rv.sqrt(),
                    UnaryFn::NormalCdf => rv.normal_cdf(),
                    UnaryFn::NormalPdf => rv.normal_pdf(),
                };
                self.value.push(Value::Number(out));
                Ok(())
            }
            ExprKind::BinaryFn { f, lhs, rhs } => {
                self.eval_expr(lhs)?;
                self.eval_expr(rhs)?;
                self.checkpoint(expr.span)?;
                let right = self.pop_value(rhs.span)?;
                let left = self.pop_value(lhs.span)?;
                let a = self.expect_number(left, lhs.span)?;
                let b = self.expect_number(right, rhs.span)?;
                let out = match f {
                    BinaryFn::Min => a.min(&b),
                    BinaryFn::Max => a.max(&b),
                    BinaryFn::Pow => a.pow(&b),
                };
                self.value.push(Value::Number(out));
                Ok(())
            }
            ExprKind::Black(args) => self.eval_black(args, expr.span),
            ExprKind::Pay(args) => self.eval_pay(args, false, expr.span),
            ExprKind::LogPay(args) => self.eval_pay(args, true, expr.span),
            ExprKind::Npv(args) => self.eval_npv(args, expr.span),
            ExprKind::HistFixing(args) => self.eval_histfixing(args, expr.span),
            ExprKind::Discount(args) => self.eval_discount(args, expr.span),
            ExprKind::FwdCompAvg { is_avg, args } => {
                self.eval_fwd_comp_avg(*is_avg, args, expr.span)
            }
            ExprKind::BarrierProb { above, args } => {
                self.eval_barrier_prob(*above, args, expr.span)
            }
            ExprKind::IndexEval {
                var,
                obs_date,
                fwd_date,
            } => self.eval_index_eval(var, obs_date, fwd_date.as_deref(), expr.span),
            ExprKind::Size { name } => self.eval_size(name, expr.span),
            ExprKind::DateIndex { var, array, op } => {
                self.eval_dateindex(var, array, *op, expr.span)
            }
            ExprKind::Dcf(args) => self.eval_daycount_fn(args, true, expr.span),
            ExprKind::Days(args) => self.eval_daycount_fn(args, false, expr.span),
        }
    }

    fn eval_arith(
        &mut self,
        op: ArithOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.eval_expr(lhs)?;
        self.eval_expr(rhs)?;
        self.checkpoint(span)?;
        let right = self.pop_value(rhs.span)?;
        let left = self.pop_value(lhs.span)?;
        let a = self.expect_number(left, lhs.span)?;
        let b = self.expect_number(right, rhs.span)?;
        let out = match op {
            ArithOp::Add => &a + &b,
            ArithOp::Sub => &a - &b,
            ArithOp::Mul => &a * &b,
            ArithOp::Div => &a / &b,
        };
        self.value.push(Value::Number(out));
        Ok(())
    }

    fn eval_compare(
        &mut self,
        op: CmpOp,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.eval_expr(lhs)?;
        self.eval_expr(rhs)?;
        self.checkpoint(span)?;
        let right = self.pop_value(rhs.span)?;
        let left = self.pop_value(lhs.span)?;
        let out = match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => match op {
                CmpOp::Eq => a.eq(b),
                CmpOp::Neq => a.neq(b),
                CmpOp::Lt => a.lt(b),
                CmpOp::Leq => a.leq(b),
                CmpOp::Gt => a.gt(b),
                CmpOp::Geq => a.geq(b),
            },
            (Value::Event(a), Value::Event(b)) => {
                let result = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Neq => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Leq => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Geq => a >= b,
                };
                Filter::new(self.size, result)
            }
            _ if left.kind() == right.kind() && matches!(op, CmpOp::Eq | CmpOp::Neq) => {
                let same = left.same_constant(&right);
                Filter::new(self.size, if op == CmpOp::Eq { same } else { !same })
            }
            _ => {
                return Err(ScriptError::Type {
                    message: format!(
                        "can not compare {} and {} with this operator",
                        left.kind(),
                        right.kind()
                    ),
                    span,
                })
            }
        };
        self.value.push(Value::Condition(out));
        Ok(())
    }

    fn eval_and(&mut self, lhs: &Expr, rhs: &Expr, span: Span) -> Result<(), ScriptError> {
        self.eval_expr(lhs)?;
        let left = self.pop_value(lhs.span)?;
        self.checkpoint(span)?;
        let l = self.expect_filter(left, lhs.span)?;
        // Short cut if the first operand is already deterministically false.
        if l.deterministic() && !l.at(0) {
            self.value
                .push(Value::Condition(Filter::new(l.size(), false)));
            return Ok(());
        }
        self.eval_expr(rhs)?;
        let right = self.pop_value(rhs.span)?;
        self.checkpoint(span)?;
        let r = self.expect_filter(right, rhs.span)?;
        self.value.push(Value::Condition(l.and(&r)));
        Ok(())
    }

    fn eval_or(&mut self, lhs: &Expr, rhs: &Expr, span: Span) -> Result<(), ScriptError> {
        self.eval_expr(lhs)?;
        let left = self.pop_value(lhs.span)?;
        self.checkpoint(span)?;
        let l = self.expect_filter(left, lhs.span)?;
        // Short cut if the first operand is already deterministically true.
        if l.deterministic() && l.at(0) {
            self.value
                .push(Value::Condition(Filter::new(l.size(), true)));
            return Ok(());
        }
        self.eval_expr(rhs)?;
        let right = self.pop_value(rhs.span)?;
        self.checkpoint(span)?;
        let r = self.expect_filter(right, rhs.span)?;
        self.value.push(Value::Condition(l.or(&r)));
        Ok(())
    }

    fn eval_black(&mut self, args: &[Expr; 6], span: Span) -> Result<(), ScriptError> {
        for arg in args.iter() {
            self.eval_expr(arg)?;
        }
        self.checkpoint(span)?;
        let impliedvol = self.pop_value(args[5].span)?;
        let forward = self.pop_value(args[4].span)?;
        let strike = self.pop_value(args[3].span)?;
        let expirydate = self.pop_value(args[2].span)?;
        let obsdate = self.pop_value(args[1].span)?;
        let callput = self.pop_value(args[0].span)?;

        let omega = self.expect_number(callput, args[0].span)?;
        let obs = self.expect_event(obsdate, args[1].span)?;
        let expiry = self.expect_event(expirydate, args[2].span)?;
        let k = self.expect_number(strike, args[3].span)?;
        let f = self.expect_number(forward, args[4].span)?;
        let v = self.expect_number(impliedvol, args[5].span)?;

        if obs > expiry {
            return Err(ScriptError::Model {
                message: format!("obsdate ({obs}) must be <= expirydate ({expiry})"),
                span,
            });
        }
        let t = RandomVariable::new(self.size, self.model.dt(obs, expiry));
        self.value
            .push(Value::Number(RandomVariable::black(&omega, &t, &k, &f, &v)));
        self.trace("black", span);
        Ok(())
    }

    fn eval_pay(&mut self, args: &PayArgs, log: bool, span: Span) -> Result<(), ScriptError> {
        self.eval_expr(&args.pay_date)?;
        let paydate = self.pop_value(args.pay_date.span)?;
        self.checkpoint(span)?;
        let pay = self.expect_event(paydate, args.pay_date.span)?;
        // Past payments short-circuit: the remaining arguments may reference
        // fixings that no longer exist, so they are not evaluated (unless a
        // log entry is required).
        if pay <= self.model.reference_date() && !log {
            self.value
                .push(Value::Number(RandomVariable::new(self.size, 0.0)));
            self.trace("pay() = 0 (past payment)", span);
            return Ok(());
        }
        self.eval_expr(&args.amount)?;
        self.eval_expr(&args.obs_date)?;
        self.eval_expr(&args.pay_ccy)?;
        let paycurr = self.pop_value(args.pay_ccy.span)?;
        let obsdate = self.pop_value(args.obs_date.span)?;
        let amount = self.pop_value(args.amount.span)?;
        self.checkpoint(span)?;
        let amount = self.expect_number(amount, args.amount.span)?;
        let obs = self.expect_event(obsdate, args.obs_date.span)?;
        let ccy = self.expect_currency(paycurr, args.pay_ccy.span)?;
        if obs > pay {
            return Err(ScriptError::Model {
                message: format!("observation date ({obs}) <= payment date ({pay}) required"),
                span,
            });
        }
        let result = if pay <= self.model.reference_date() {
            RandomVariable::new(self.size, 0.0)
        } else {
            self.model
                .pay(&amount, obs, pay, &ccy)
                .map_err(|message| ScriptError::Model { message, span })?
        };
        if log {
            // Past payments are logged with the raw amount.
            let cashflow = if pay <= self.model.reference_date() {
                amount.clone()
            } else {
                result.clone()
            };
            let leg_no = match &args.leg_no {
                Some(e) => {
                    self.eval_expr(e)?;
                    let v = self.pop_value(e.span)?;
                    let rv = self.expect_number(v, e.span)?;
                    let legno = self.deterministic_integer(&rv, "legno", e.span)?;
                    if legno < 0 {
                        return Err(ScriptError::Bounds {
                            message: "legNo must be >= 0".to_string(),
                            span: e.span,
                        });
                    }
                    legno as usize
                }
                None => 0,
            };
            let cashflow_type = args
                .cashflow_type
                .clone()
                .unwrap_or_else(|| "Unspecified".to_string());
            let slot = match &args.slot {
                Some(e) => {
                    self.eval_expr(e)?;
                    let v = self.pop_value(e.span)?;
                    let rv = self.expect_number(v, e.span)?;
                    let slot = self.deterministic_integer(&rv, "slot", e.span)?;
                    if slot < 1 {
                        return Err(ScriptError::Bounds {
                            message: "slot must be >= 1".to_string(),
                            span: e.span,
                        });
                    }
                    slot as usize
                }
                None => 0,
            };
            let filter = self.active_filter();
            if let Some(paylog) = self.paylog.as_deref_mut() {
                paylog.write(cashflow, filter, obs, pay, ccy, leg_no, cashflow_type, slot);
            }
            self.trace("logpay", span);
        } else {
            self.trace("pay", span);
        }
        self.value.push(Value::Number(result));
        Ok(())
    }

    fn eval_npv(&mut self, args: &NpvArgs, span: Span) -> Result<(), ScriptError> {
        self.eval_expr(&args.amount)?;
        self.eval_expr(&args.obs_date)?;
        let mem_slot = match &args.mem_slot {
            Some(e) => {
                self.eval_expr(e)?;
                let v = self.pop_value(e.span)?;
                let rv = self.expect_number(v, e.span)?;
                Some(self.deterministic_integer(&rv, "memory slot", e.span)?)
            }
            None => None,
        };
        let obsdate = self.pop_value(args.obs_date.span)?;
        let amount = self.pop_value(args.amount.span)?;
        self.checkpoint(span)?;
        let regression_filter = match &args.regression_filter {
            Some(e) => {
                self.eval_expr(e)?;
                let v = self.pop_value(e.span)?;
                Some(self.expect_filter(v, e.span)?)
            }
            None => None,
        };
        let reg1 = match &args.add_regressor_1 {
            Some(e) => {
                self.eval_expr(e)?;
                let v = self.pop_value(e.span)?;
                Some(self.expect_number(v, e.span)?)
            }
            None => None,
        };
        let reg2 = match &args.add_regressor_2 {
            Some(e) => {
                self.eval_expr(e)?;
                let v = self.pop_value(e.span)?;
                Some(self.expect_number(v, e.span)?)
            }
            None => None,
        };
        let amount = self.expect_number(amount, args.amount.span)?;
        let obs = self.expect_event(obsdate, args.obs_date.span)?;
        // Roll back to past dates is treated as roll back to today.
        let obs = obs.max(self.model.reference_date());
        let result = self
            .model
            .npv(
                &amount,
                obs,
                regression_filter.as_ref(),
                mem_slot,
                reg1.as_ref(),
                reg2.as_ref(),
            )
            .map_err(|message| ScriptError::Model { message, span })?;
        self.value.push(Value::Number(result));
        self.trace("npv", span);
        Ok(())
    }

    fn eval_histfixing(&mut self, args: &[Expr; 2], span: Span) -> Result<(), ScriptError> {
        self.eval_expr(&args[0])?;
        self.eval_expr(&args[1])?;
        let obsdate = self.pop_value(args[1].span)?;
        let underlying = self.pop_value(args[0].span)?;
        self.checkpoint(span)?;
        let index = self.expect_index(underlying, args[0].span)?;
        let obs = self.expect_event(obsdate, args[1].span)?;
        let result = if obs > self.model.reference_date() {
            0.0
        } else if self.model.fixing_store().has(&index, obs) {
            1.0
        } else {
            0.0
        };
        self.value
            .push(Value::Number(RandomVariable::new(self.size, result)));
        self.trace("histfixing", span);
        Ok(())
    }

    fn eval_discount(&mut self, args: &[Expr; 3], span: Span) -> Result<(), ScriptError> {
        for arg in args.iter() {
            self.eval_expr(arg)?;
        }
        let paycurr = self.pop_value(args[2].span)?;
        let paydate = self.pop_value(args[1].span)?;
        let obsdate = self.pop_value(args[0].span)?;
        self.checkpoint(span)?;
        let obs = self.expect_event(obsdate, args[0].span)?;
        let pay = self.expect_event(paydate, args[1].span)?;
        let ccy = self.expect_currency(paycurr, args[2].span)?;
        if obs < self.model.reference_date() {
            return Err(ScriptError::Model {
                message: format!(
                    "observation date ({obs}) >= reference date ({}) required",
                    self.model.reference_date()
                ),
                span,
            });
        }
        if obs > pay {
            return Err(ScriptError::Model {
                message: format!("observation date ({obs}) <= payment date ({pay}) required"),
                span,
            });
        }
        let result = self
            .model
            .discount(obs, pay, &ccy)
            .map_err(|message| ScriptError::Model { message, span })?;
        self.value.push(Value::Number(result));
        self.trace("discount", span);
        Ok(())
    }

    fn pop_deterministic(
        &mut self,
        expr: &Expr,
        what: &str,
    ) -> Result<f64, ScriptError> {
        self.eval_expr(expr)?;
        let v = self.pop_value(expr.span)?;
        let rv = self.expect_number(v, expr.span)?;
        if !rv.deterministic() {
            return Err(ScriptError::Type {
                message: format!("{what} must be deterministic"),
                span: expr.span,
            });
        }
        Ok(rv.at(0))
    }

    fn pop_signed_bool(&mut self, expr: &Expr, what: &str) -> Result<bool, ScriptError> {
        let v = self.pop_deterministic(expr, what)?;
        if (v - 1.0).abs() < 1.0e-10 {
            Ok(true)
        } else if (v + 1.0).abs() < 1.0e-10 {
            Ok(false)
        } else {
            Err(ScriptError::Type {
                message: format!("{what} must be deterministic and +1 or -1"),
                span: expr.span,
            })
        }
    }

    fn eval_fwd_comp_avg(
        &mut self,
        is_avg: bool,
        args: &FwdCompAvgArgs,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.eval_expr(&args.index)?;
        self.eval_expr(&args.obs_date)?;
        self.eval_expr(&args.start_date)?;
        self.eval_expr(&args.end_date)?;
        let enddate = self.pop_value(args.end_date.span)?;
        let startdate = self.pop_value(args.start_date.span)?;
        let obsdate = self.pop_value(args.obs_date.span)?;
        let underlying = self.pop_value(args.index.span)?;
        self.checkpoint(span)?;
        let index = self.expect_index(underlying, args.index.span)?;
        let obs = self.expect_event(obsdate, args.obs_date.span)?;
        let start = self.expect_event(startdate, args.start_date.span)?;
        let end = self.expect_event(enddate, args.end_date.span)?;
        if obs > start {
            return Err(ScriptError::Model {
                message: format!("observation date ({obs}) must be <= start date ({start})"),
                span,
            });
        }
        if start >= end {
            return Err(ScriptError::Model {
                message: format!("start date ({start}) must be < end date ({end})"),
                span,
            });
        }
        let mut params = FwdCompAvgParams::default();
        if let (Some(spread), Some(gearing)) = (&args.spread, &args.gearing) {
            params.spread = self.pop_deterministic(spread, "spread")?;
            params.gearing = self.pop_deterministic(gearing, "gearing")?;
        }
        if let (Some(lookback), Some(rate_cutoff), Some(fixing_days), Some(include_spread)) = (
            &args.lookback,
            &args.rate_cutoff,
            &args.fixing_days,
            &args.include_spread,
        ) {
            params.lookback = self.pop_deterministic(lookback, "lookback")? as i64;
            params.rate_cutoff = self.pop_deterministic(rate_cutoff, "rateCutoff")? as u32;
            params.fixing_days = self.pop_deterministic(fixing_days, "fixingDays")? as u32;
            params.include_spread = self.pop_signed_bool(include_spread, "includeSpread")?;
        }
        if let (Some(cap), Some(floor), Some(naked), Some(local)) = (
            &args.cap,
            &args.floor,
            &args.naked_option,
            &args.local_cap_floor,
        ) {
            params.cap = self.pop_deterministic(cap, "cap")?;
            params.floor = self.pop_deterministic(floor, "floor")?;
            params.naked_option = self.pop_signed_bool(naked, "nakedOption")?;
            params.local_cap_floor = self.pop_signed_bool(local, "localCapFloor")?;
        }
        let result = self
            .model
            .fwd_comp_avg(is_avg, &index, obs, start, end, &params)
            .map_err(|message| ScriptError::Model { message, span })?;
        self.value.push(Value::Number(result));
        self.trace("fwdCompAvg", span);
        Ok(())
    }

    fn eval_barrier_prob(
        &mut self,
        above: bool,
        args: &[Expr; 4],
        span: Span,
    ) -> Result<(), ScriptError> {
        for arg in args.iter() {
            self.eval_expr(arg)?;
        }
        let barrier = self.pop_value(args[3].span)?;
        let obsdate2 = self.pop_value(args[2].span)?;
        let obsdate1 = self.pop_value(args[1].span)?;
        let underlying = self.pop_value(args[0].span)?;
        self.checkpoint(span)?;
        let index = self.expect_index(underlying, args[0].span)?;
        let obs1 = self.expect_event(obsdate1, args[1].span)?;
        let obs2 = self.expect_event(obsdate2, args[2].span)?;
        let barrier = self.expect_number(barrier, args[3].span)?;
        let result = if obs1 > obs2 {
            RandomVariable::new(self.size, 0.0)
        } else {
            self.model
                .barrier_probability(&index, obs1, obs2, &barrier, above)
                .map_err(|message| ScriptError::Model { message, span })?
        };
        self.value.push(Value::Number(result));
        self.trace(if above { "aboveProb" } else { "belowProb" }, span);
        Ok(())
    }

    fn eval_index_eval(
        &mut self,
        var: &Expr,
        obs_date: &Expr,
        fwd_date: Option<&Expr>,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.eval_expr(var)?;
        self.eval_expr(obs_date)?;
        let right = self.pop_value(obs_date.span)?;
        let left = self.pop_value(var.span)?;
        self.checkpoint(span)?;
        let index = match left {
            Value::Index(s) => s,
            other => {
                return Err(ScriptError::Type {
                    message: format!(
                        "evaluation operator () can only be applied to an INDEX, got {}",
                        other.kind()
                    ),
                    span: var.span,
                })
            }
        };
        let obs = self.expect_event(right, obs_date.span)?;
        let fwd = match fwd_date {
            Some(e) => {
                self.eval_expr(e)?;
                let v = self.pop_value(e.span)?;
                let fwd = self.expect_event(v, e.span)?;
                if fwd == obs {
                    None
                } else if obs > fwd {
                    return Err(ScriptError::Model {
                        message: format!(
                            "evaluation operator () requires obsDate ({obs}) < fwdDate ({fwd})"
                        ),
                        span,
                    });
                } else {
                    Some(fwd)
                }
            }
            None => None,
        };
        let result = self
            .model
            .eval(&index, obs, fwd)
            .map_err(|message| ScriptError::Model { message, span })?;
        self.value.push(Value::Number(result));
        self.trace("indexEval", span);
        Ok(())
    }

    fn eval_size(&mut self, name: &str, span: Span) -> Result<(), ScriptError> {
        self.checkpoint(span)?;
        match self.context.arrays.get(name) {
            Some(array) => {
                self.value.push(Value::Number(RandomVariable::new(
                    self.size,
                    array.len() as f64,
                )));
                Ok(())
            }
            None if self.context.scalars.contains_key(name) => Err(ScriptError::Type {
                message: format!("SIZE can only be applied to an array, '{name}' is a scalar"),
                span,
            }),
            None => Err(ScriptError::Type {
                message: format!("variable '{name}' is not defined"),
                span,
            }),
        }
    }

    fn eval_dateindex(
        &mut self,
        var: &Expr,
        array: &str,
        op: DateIndexOp,
        span: Span,
    ) -> Result<(), ScriptError> {
        self.eval_expr(var)?;
        let needle = self.pop_value(var.span)?;
        self.checkpoint(span)?;
        let needle = self.expect_event(needle, var.span)?;
        let values = self
            .context
            .arrays
            .get(array)
            .ok_or_else(|| ScriptError::Type {
                message: format!("DATEINDEX: event array '{array}' not found"),
                span,
            })?;
        let dates: Vec<NaiveDate> = values
            .iter()
            .map(|v| match v {
                Value::Event(d) => Ok(*d),
                other => Err(type_error("EVENT", other.kind(), span)),
            })
            .collect::<Result<_, _>>()?;
        // GEQ/GT rely on the array being ordered by date.
        let pos = match op {
            DateIndexOp::Eq => dates
                .iter()
                .position(|&d| d == needle)
                .map_or(0, |p| p + 1),
            DateIndexOp::Geq => dates.partition_point(|&d| d < needle) + 1,
            DateIndexOp::Gt => dates.partition_point(|&d| d <= needle) + 1,
        };
        self.value
            .push(Value::Number(RandomVariable::new(self.size, pos as f64)));
        self.trace("dateindex", span);
        Ok(())
    }

    fn eval_daycount_fn(
        &mut self,
        args: &[Expr; 3],
        year_frac: bool,
        span: Span,
    ) -> Result<(), ScriptError> {
        for arg in args.iter() {
            self.eval_expr(arg)?;
        }
        let d2 = self.pop_value(args[2].span)?;
        let d1 = self.pop_value(args[1].span)?;
        let dc = self.pop_value(args[0].span)?;
        self.checkpoint(span)?;
        let dc = self.expect_daycounter(dc, args[0].span)?;
        let date1 = self.expect_event(d1, args[1].span)?;
        let date2 = self.expect_event(d2, args[2].span)?;
        let convention = crate::market::parse_day_counter(&dc)
            .map_err(|message| ScriptError::Model { message, span })?;
        let result = if year_frac {
            crate::market::year_fraction(date1, date2, convention)
        } else {
            crate::market::day_count(date1, date2, convention) as f64
        };
        self.value
            .push(Value::Number(RandomVariable::new(self.size, result)));
        self.trace(if year_frac { "dcf" } else { "days" }, span);
        Ok(())
    }
}

fn type_error(expected: &str, got: ValueKind, span: Span) -> ScriptError {
    ScriptError::Type {
        message: format!("expected {expected}, got {got}"),
        span,
    }
}

fn check_equal_len(
    expected: usize,
    got: usize,
    what: &str,
    span: Span,
) -> Result<(), ScriptError> {
    if expected != got {
        return Err(ScriptError::Bounds {
            message: format!("{what} array size ({got}) must match x array size ({expected})"),
            span,
        });
    }
    Ok(())
}

fn check_lane_sizes(
    arrays: &[RandomVariable],
    size: usize,
    span: Span,
) -> Result<(), ScriptError> {
    for (c, rv) in arrays.iter().enumerate() {
        if rv.size() != size {
            return Err(ScriptError::Bounds {
                message: format!(
                    "x[{c}] lane size ({}) must match the sample count ({size})",
                    rv.size()
                ),
                span,
            });
        }
    }
    Ok(())
}
