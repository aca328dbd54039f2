//! Scripted payoff engine.
//!
//! A typed expression-tree interpreter that evaluates a trade's payoff
//! script over an entire Monte-Carlo simulation in a vectorized, path-wise
//! manner. The pipeline is
//!
//! ```text
//! script text ──→ Lexer ──→ Parser ──→ AST ──→ ScriptEngine ──→ Context / PayLog
//!                                                  ↑
//!                                            Model (pay, npv,
//!                                            discount, eval, ...)
//! ```
//!
//! Values are [`value::Value`] variants over vectorized
//! [`random_variable::RandomVariable`] lanes; the interpreter maintains a
//! value stack and a filter stack holding the active execution mask. The
//! deterministic-collapse representation of lanes is a correctness
//! invariant: branch skipping under deterministic-false masks and the
//! short-circuit `AND`/`OR` contract both rely on it.
//!
//! # Quick start
//!
//! ```rust
//! use chrono::NaiveDate;
//! use ferroxva::lang::model::FlatForwardModel;
//! use ferroxva::lang::value::{Context, Value};
//! use ferroxva::lang::ScriptEngine;
//!
//! let asof = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
//! let model = FlatForwardModel::new(1, asof, 0.05).with_rate("USD", 0.05);
//!
//! let mut context = Context::new();
//! context.bind_constant("Today", Value::Event(asof));
//! context.bind_constant(
//!     "Maturity",
//!     Value::Event(NaiveDate::from_ymd_opt(2027, 8, 1).unwrap()),
//! );
//! context.bind_constant("Ccy", Value::Currency("USD".into()));
//!
//! let script = "{ NUMBER Npv; Npv = pay(1.0, Today, Maturity, Ccy); }";
//! ScriptEngine::new(&model, &mut context).run(script).unwrap();
//!
//! match &context.scalars["Npv"] {
//!     Value::Number(rv) => assert!((rv.at(0) - (-0.05f64).exp()).abs() < 1e-10),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

pub mod ast;
pub mod engine;
pub mod error;
pub mod lexer;
pub mod model;
pub mod parser;
pub mod paylog;
pub mod random_variable;
pub mod value;

pub use engine::{render_script_error, EngineOptions, ScriptEngine};
pub use error::{ScriptError, Span};
pub use model::{FixingStore, FlatForwardModel, Model, ModelType};
pub use paylog::PayLog;
pub use random_variable::{Filter, RandomVariable};
pub use value::{Context, Value, ValueKind};

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn asof() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
    }

    fn model(samples: usize) -> FlatForwardModel {
        FlatForwardModel::new(samples, asof(), 0.05)
            .with_rate("USD", 0.05)
            .with_index_spot("EQ-ACME", 100.0)
    }

    fn run(script: &str, samples: usize, context: &mut Context) -> Result<(), ScriptError> {
        let m = model(samples);
        ScriptEngine::new(&m, context).run(script)
    }

    fn number_at(context: &Context, name: &str, lane: usize) -> f64 {
        match &context.scalars[name] {
            Value::Number(rv) => rv.at(lane),
            other => panic!("expected NUMBER for {name}, got {other:?}"),
        }
    }

    #[test]
    fn deterministic_discount_bond() {
        let mut context = Context::new();
        context.bind_constant("Today", Value::Event(asof()));
        context.bind_constant(
            "Maturity",
            Value::Event(NaiveDate::from_ymd_opt(2027, 8, 1).unwrap()),
        );
        context.bind_constant("Ccy", Value::Currency("USD".into()));
        run(
            "{ NUMBER Npv; Npv = pay(1.0, Today, Maturity, Ccy); }",
            1,
            &mut context,
        )
        .unwrap();
        let expected = (-0.05_f64).exp();
        assert!((number_at(&context, "Npv", 0) - expected).abs() < 1e-10);
        match &context.scalars["Npv"] {
            Value::Number(rv) => assert!(rv.deterministic()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn european_call_via_black() {
        let mut context = Context::new();
        context.bind_constant("Today", Value::Event(asof()));
        let expiry = NaiveDate::from_ymd_opt(2026, 10, 31).unwrap();
        context.bind_constant("Expiry", Value::Event(expiry));
        run(
            "{ NUMBER V; V = black(1, Today, Expiry, 100, 100, 0.2) * 0.95; }",
            1,
            &mut context,
        )
        .unwrap();
        let m = model(1);
        let t = m.dt(asof(), expiry);
        let expected = crate::math::black76(1.0, t, 100.0, 100.0, 0.2) * 0.95;
        assert!((number_at(&context, "V", 0) - expected).abs() < 1e-12);
    }

    #[test]
    fn short_circuit_if_skips_then_branch() {
        // The THEN branch would raise a bounds error, but the mask is
        // deterministically false so the branch is never evaluated.
        let mut context = Context::new();
        run(
            "{ NUMBER x, v[1]; IF 1 == 2 THEN v[5] = 1; ELSE x = 1; }",
            4,
            &mut context,
        )
        .unwrap();
        assert_eq!(number_at(&context, "x", 0), 1.0);
    }

    #[test]
    fn short_circuit_and_skips_right_operand() {
        // The right operand subscripts out of bounds; the deterministic
        // false left operand must prevent its evaluation.
        let mut context = Context::new();
        run(
            "{ NUMBER x, v[1]; IF 1 == 2 AND v[5] > 0 THEN x = 2; ELSE x = 1; }",
            2,
            &mut context,
        )
        .unwrap();
        assert_eq!(number_at(&context, "x", 0), 1.0);
    }

    #[test]
    fn masked_assignment_merges_lanes() {
        let mut context = Context::new();
        context.bind_constant(
            "Spot",
            Value::Number(RandomVariable::from_lanes(vec![80.0, 120.0, 90.0])),
        );
        run(
            "{ NUMBER Payoff; IF Spot > 100 THEN Payoff = Spot - 100; ELSE Payoff = 0; }",
            3,
            &mut context,
        )
        .unwrap();
        assert_eq!(number_at(&context, "Payoff", 0), 0.0);
        assert_eq!(number_at(&context, "Payoff", 1), 20.0);
        assert_eq!(number_at(&context, "Payoff", 2), 0.0);
    }

    #[test]
    fn for_loop_accumulates() {
        let mut context = Context::new();
        run(
            "{ NUMBER i, acc; FOR i = 1 TO 10 STEP 1 DO acc = acc + i; }",
            1,
            &mut context,
        )
        .unwrap();
        assert_eq!(number_at(&context, "acc", 0), 55.0);
    }

    #[test]
    fn for_loop_zero_step_is_rejected() {
        let mut context = Context::new();
        let err = run(
            "{ NUMBER i; FOR i = 1 TO 3 STEP 0 DO i = i; }",
            1,
            &mut context,
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::Bounds { .. }));
    }

    #[test]
    fn for_loop_empty_range_runs_zero_iterations() {
        let mut context = Context::new();
        run(
            "{ NUMBER i, count; FOR i = 5 TO 3 STEP 1 DO count = count + 1; }",
            1,
            &mut context,
        )
        .unwrap();
        assert_eq!(number_at(&context, "count", 0), 0.0);
    }

    #[test]
    fn loop_variable_mutation_is_illegal() {
        let mut context = Context::new();
        let err = run(
            "{ NUMBER i; FOR i = 1 TO 3 STEP 1 DO i = i + 1; }",
            1,
            &mut context,
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::Type { .. }));
    }

    #[test]
    fn subscript_bounds_are_enforced() {
        let mut context = Context::new();
        for script in [
            "{ NUMBER v[3]; v[0] = 1; }",
            "{ NUMBER v[3]; v[4] = 1; }",
        ] {
            let err = run(script, 1, &mut Context::new()).unwrap_err();
            assert!(matches!(err, ScriptError::Bounds { .. }), "{script}");
        }
        // In-bounds write works.
        run("{ NUMBER v[3]; v[3] = 7; }", 1, &mut context).unwrap();
    }

    #[test]
    fn require_is_vacuous_under_all_false_mask() {
        let mut context = Context::new();
        run(
            "{ NUMBER x; IF 1 == 2 THEN REQUIRE 2 == 3; }",
            2,
            &mut context,
        )
        .unwrap();
    }

    #[test]
    fn require_fails_under_any_true_mask() {
        let err = run("{ REQUIRE 2 == 3; }", 2, &mut Context::new()).unwrap_err();
        assert!(matches!(err, ScriptError::RequireFailed { .. }));
    }

    #[test]
    fn declaring_twice_is_an_error() {
        let err = run("{ NUMBER x; NUMBER x; }", 1, &mut Context::new()).unwrap_err();
        assert!(matches!(err, ScriptError::Type { .. }));
    }

    #[test]
    fn assignment_to_constant_is_rejected() {
        let mut context = Context::new();
        context.bind_constant("K", Value::Number(RandomVariable::new(1, 100.0)));
        let err = run("{ K = 1; }", 1, &mut context).unwrap_err();
        assert!(matches!(err, ScriptError::Type { .. }));
    }

    #[test]
    fn ignored_names_are_silently_discarded() {
        let mut context = Context::new();
        context.ignore_assignments.insert("Skip".to_string());
        run("{ NUMBER Skip; Skip = 42; }", 1, &mut context).unwrap();
        assert!(!context.is_declared("Skip"));
    }

    #[test]
    fn sort_orders_under_active_filter() {
        let mut context = Context::new();
        context.arrays.insert(
            "x".into(),
            vec![
                Value::Number(RandomVariable::new(1, 3.0)),
                Value::Number(RandomVariable::new(1, 1.0)),
                Value::Number(RandomVariable::new(1, 2.0)),
            ],
        );
        run("{ NUMBER y[3], p[3]; SORT (x, y, p); }", 1, &mut context).unwrap();
        let y: Vec<f64> = (0..3)
            .map(|i| match &context.arrays["y"][i] {
                Value::Number(rv) => rv.at(0),
                _ => unreachable!(),
            })
            .collect();
        let p: Vec<f64> = (0..3)
            .map(|i| match &context.arrays["p"][i] {
                Value::Number(rv) => rv.at(0),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(y, vec![1.0, 2.0, 3.0]);
        // y[i] == x[p[i] - 1]
        let x = [3.0, 1.0, 2.0];
        for i in 0..3 {
            assert_eq!(y[i], x[(p[i] as usize) - 1]);
        }
    }

    #[test]
    fn permute_round_trip_recovers_input() {
        let mut context = Context::new();
        context.arrays.insert(
            "x".into(),
            vec![
                Value::Number(RandomVariable::new(1, 10.0)),
                Value::Number(RandomVariable::new(1, 20.0)),
                Value::Number(RandomVariable::new(1, 30.0)),
            ],
        );
        // p = (2, 3, 1); inverse is (3, 1, 2)
        let p = [2.0, 3.0, 1.0];
        let inv = [3.0, 1.0, 2.0];
        context.arrays.insert(
            "p".into(),
            p.iter()
                .map(|&v| Value::Number(RandomVariable::new(1, v)))
                .collect(),
        );
        context.arrays.insert(
            "pinv".into(),
            inv.iter()
                .map(|&v| Value::Number(RandomVariable::new(1, v)))
                .collect(),
        );
        run(
            "{ NUMBER y[3], z[3]; PERMUTE (x, y, p); PERMUTE (y, z, pinv); }",
            1,
            &mut context,
        )
        .unwrap();
        for (i, expected) in [10.0, 20.0, 30.0].iter().enumerate() {
            match &context.arrays["z"][i] {
                Value::Number(rv) => assert_eq!(rv.at(0), *expected),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn dateindex_lookups() {
        let mut context = Context::new();
        let dates: Vec<Value> = [(2026, 9, 1), (2026, 12, 1), (2027, 3, 1)]
            .iter()
            .map(|&(y, m, d)| Value::Event(NaiveDate::from_ymd_opt(y, m, d).unwrap()))
            .collect();
        context.bind_constant_array("Schedule", dates);
        context.bind_constant(
            "Obs",
            Value::Event(NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()),
        );
        context.bind_constant(
            "Missing",
            Value::Event(NaiveDate::from_ymd_opt(2026, 10, 1).unwrap()),
        );
        run(
            "{ NUMBER a, b, c, d; \
               a = DATEINDEX(Obs, Schedule, EQ); \
               b = DATEINDEX(Missing, Schedule, EQ); \
               c = DATEINDEX(Missing, Schedule, GEQ); \
               d = DATEINDEX(Obs, Schedule, GT); }",
            1,
            &mut context,
        )
        .unwrap();
        assert_eq!(number_at(&context, "a", 0), 2.0);
        assert_eq!(number_at(&context, "b", 0), 0.0);
        assert_eq!(number_at(&context, "c", 0), 2.0);
        assert_eq!(number_at(&context, "d", 0), 3.0);
    }

    #[test]
    fn logpay_records_cashflows_with_mask() {
        let m = model(2);
        let mut context = Context::new();
        context.bind_constant("Today", Value::Event(asof()));
        context.bind_constant(
            "PayDate",
            Value::Event(NaiveDate::from_ymd_opt(2027, 2, 1).unwrap()),
        );
        context.bind_constant("Ccy", Value::Currency("USD".into()));
        let mut paylog = PayLog::new();
        ScriptEngine::new(&m, &mut context)
            .with_paylog(&mut paylog)
            .run("{ NUMBER V; V = logpay(100, Today, PayDate, Ccy, 1, Interest, 1); }")
            .unwrap();
        assert_eq!(paylog.len(), 1);
        let entry = &paylog.entries()[0];
        assert_eq!(entry.leg_no, 1);
        assert_eq!(entry.cashflow_type, "Interest");
        assert_eq!(entry.slot, 1);
    }

    #[test]
    fn histfixing_reads_fixing_store() {
        let fix_date = NaiveDate::from_ymd_opt(2026, 7, 15).unwrap();
        let m = model(1).with_fixing("EQ-ACME", fix_date, 99.0);
        let mut context = Context::new();
        context.bind_constant("Underlying", Value::Index("EQ-ACME".into()));
        context.bind_constant("FixDate", Value::Event(fix_date));
        context.bind_constant(
            "FutureDate",
            Value::Event(NaiveDate::from_ymd_opt(2026, 9, 15).unwrap()),
        );
        ScriptEngine::new(&m, &mut context)
            .run(
                "{ NUMBER a, b; a = histfixing(Underlying, FixDate); \
                   b = histfixing(Underlying, FutureDate); }",
            )
            .unwrap();
        assert_eq!(number_at(&context, "a", 0), 1.0);
        assert_eq!(number_at(&context, "b", 0), 0.0);
    }

    #[test]
    fn index_evaluation_with_forward_date() {
        let mut context = Context::new();
        context.bind_constant("Underlying", Value::Index("EQ-ACME".into()));
        context.bind_constant("Obs", Value::Event(asof()));
        context.bind_constant(
            "Fwd",
            Value::Event(NaiveDate::from_ymd_opt(2027, 8, 1).unwrap()),
        );
        run(
            "{ NUMBER s, f; s = Underlying(Obs); f = Underlying(Obs, Fwd); }",
            1,
            &mut context,
        )
        .unwrap();
        assert!((number_at(&context, "s", 0) - 100.0).abs() < 1e-10);
        assert!((number_at(&context, "f", 0) - 100.0 * (0.05_f64).exp()).abs() < 1e-8);
    }

    #[test]
    fn aborted_evaluation_surfaces_location() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let m = model(1);
        let mut context = Context::new();
        let abort = Arc::new(AtomicBool::new(true));
        let err = ScriptEngine::new(&m, &mut context)
            .with_options(EngineOptions {
                interactive: false,
                abort: Some(abort),
            })
            .run("{ NUMBER x; x = 1; }")
            .unwrap_err();
        assert!(matches!(err, ScriptError::Aborted { .. }));
    }

    #[test]
    fn error_report_carries_code_context() {
        let err = run("{ NUMBER x; x = undeclared; }", 1, &mut Context::new()).unwrap_err();
        let rendered = render_script_error("{ NUMBER x; x = undeclared; }", &err);
        assert!(rendered.contains("undeclared"));
        assert!(rendered.contains("line 1"));
    }
}
