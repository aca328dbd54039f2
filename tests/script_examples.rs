//! End-to-end scenarios: payoff scripts through the engine and the full
//! simulate-then-aggregate pipeline.

use std::collections::BTreeMap;

use approx::assert_relative_eq;
use chrono::NaiveDate;

use ferroxva::aggregation::{AllocationMethod, PostProcess, PostProcessConfig};
use ferroxva::cube::{AggregationScenarioData, NpvCube};
use ferroxva::lang::model::FlatForwardModel;
use ferroxva::lang::value::{Context, Value};
use ferroxva::lang::{Model, ScriptEngine};
use ferroxva::market::{Market, SurvivalCurve, YieldCurve};
use ferroxva::math::black76;
use ferroxva::portfolio::{
    Binding, NettingSetDefinition, NettingSetManager, Portfolio, PortfolioPayload, TradePayload,
};
use ferroxva::simulation::{
    monthly_grid, DeterministicSimMarket, NpvCalculator, ValuationCalculator, ValuationEngine,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn asof() -> NaiveDate {
    date(2026, 8, 1)
}

fn number(context: &Context, name: &str) -> f64 {
    match &context.scalars[name] {
        Value::Number(rv) => rv.at(0),
        other => panic!("expected NUMBER, got {other:?}"),
    }
}

/// Scenario: deterministic discount bond. `pay(1.0, today, T, "USD")` on a
/// flat 5% curve with T = 1Y and N = 1 values to exp(-0.05) and stays in
/// the compact deterministic representation.
#[test]
fn deterministic_discount_bond() {
    let model = FlatForwardModel::new(1, asof(), 0.05).with_rate("USD", 0.05);
    let mut context = Context::new();
    context.bind_constant("Today", Value::Event(asof()));
    context.bind_constant("Maturity", Value::Event(date(2027, 8, 1)));
    context.bind_constant("Ccy", Value::Currency("USD".into()));
    ScriptEngine::new(&model, &mut context)
        .run("{ NUMBER Value; Value = pay(1.0, Today, Maturity, Ccy); }")
        .unwrap();
    match &context.scalars["Value"] {
        Value::Number(rv) => {
            assert!(rv.deterministic());
            assert_relative_eq!(rv.at(0), (-0.05_f64).exp(), epsilon = 1e-10);
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// Scenario: European call via the `black` builtin matches the Black-76
/// closed form scaled by 0.95 to 1e-12.
#[test]
fn european_call_against_black76() {
    let expiry = date(2026, 10, 31);
    let model = FlatForwardModel::new(1, asof(), 0.05).with_rate("USD", 0.05);
    let t = model.dt(asof(), expiry);
    let mut context = Context::new();
    context.bind_constant("Today", Value::Event(asof()));
    context.bind_constant("Expiry", Value::Event(expiry));
    ScriptEngine::new(&model, &mut context)
        .run("{ NUMBER V; V = black(1, Today, Expiry, 100, 100, 0.2) * 0.95; }")
        .unwrap();
    let expected = black76(1.0, t, 100.0, 100.0, 0.2) * 0.95;
    assert_relative_eq!(number(&context, "V"), expected, epsilon = 1e-12);
}

/// Scenario: a deterministically-false IF condition must skip the THEN
/// branch entirely, so a REQUIRE that could never hold goes unevaluated.
#[test]
fn short_circuit_if_completes() {
    let model = FlatForwardModel::new(4, asof(), 0.05).with_rate("USD", 0.05);
    let mut context = Context::new();
    ScriptEngine::new(&model, &mut context)
        .run("{ NUMBER x; IF 1 == 2 THEN REQUIRE 1 == 2; ELSE x = 1; }")
        .unwrap();
    assert_relative_eq!(number(&context, "x"), 1.0, epsilon = 0.0);
}

/// Full pipeline: scripted forwards priced under simulated scenarios into
/// a cube, post-processed into exposures and CVA.
#[test]
fn simulate_and_aggregate_scripted_portfolio() {
    let maturity = date(2028, 8, 1);
    let payload = PortfolioPayload {
        portfolio_id: "PF-1".into(),
        trades: vec![
            TradePayload {
                trade_id: "FWD-1".into(),
                netting_set_id: "NS-1".into(),
                counterparty: "CPTY-A".into(),
                currency: "USD".into(),
                maturity,
                script: "{ NUMBER Value; \
                          Value = pay(Underlying(Maturity) - Strike, Today, Maturity, Ccy); }"
                    .into(),
                result_variable: "Value".into(),
                bindings: vec![
                    Binding::Event {
                        name: "Maturity".into(),
                        value: maturity,
                    },
                    Binding::Currency {
                        name: "Ccy".into(),
                        value: "USD".into(),
                    },
                    Binding::Index {
                        name: "Underlying".into(),
                        value: "EQ-ACME".into(),
                    },
                    Binding::Number {
                        name: "Strike".into(),
                        value: 100.0,
                    },
                ],
                legs: vec![],
                option: None,
            },
            TradePayload {
                trade_id: "BOND-1".into(),
                netting_set_id: "NS-1".into(),
                counterparty: "CPTY-A".into(),
                currency: "USD".into(),
                maturity,
                script: "{ NUMBER Value; Value = pay(100, Today, Maturity, Ccy); }".into(),
                result_variable: "Value".into(),
                bindings: vec![
                    Binding::Event {
                        name: "Maturity".into(),
                        value: maturity,
                    },
                    Binding::Currency {
                        name: "Ccy".into(),
                        value: "USD".into(),
                    },
                ],
                legs: vec![],
                option: None,
            },
        ],
    };
    let portfolio = Portfolio::build(&payload).unwrap();

    let mut sim_market = DeterministicSimMarket::new(asof(), "USD", 0.03);
    sim_market.add_index("EQ-ACME", 100.0, 0.25);

    let grid = monthly_grid(asof(), 8, 3);
    let samples = 64;
    let mut cube = NpvCube::new(asof(), portfolio.ids(), grid.clone(), samples, 1);
    let mut scenario_data = AggregationScenarioData::new(grid.len(), samples);
    let engine = ValuationEngine::new(asof(), grid.clone(), sim_market);
    let calculators: Vec<Box<dyn ValuationCalculator>> = vec![Box::new(NpvCalculator::new(0))];
    engine
        .build_cube(&portfolio, &mut cube, &calculators, &mut scenario_data)
        .unwrap();

    // Dimensional consistency between cube, portfolio, and scenario data.
    assert_eq!(cube.num_ids(), portfolio.size());
    assert_eq!(scenario_data.dim_dates(), cube.num_dates());
    assert_eq!(scenario_data.dim_samples(), cube.samples());

    // The bond leg is deterministic: T0 NPV is the discounted notional.
    let bond_t0 = cube.get_t0(1, 0).unwrap();
    assert_relative_eq!(bond_t0, 100.0 * (-0.03_f64 * 2.0).exp(), max_relative = 1e-2);

    let mut market = Market::new("USD");
    market.add_discount_curve("USD", YieldCurve::flat(0.03));
    market.add_survival_curve(
        "CPTY-A",
        SurvivalCurve::from_piecewise_hazard(&[1.0, 3.0, 5.0], &[0.015; 3]),
        0.4,
    );
    let netting_manager = NettingSetManager::from_definitions(vec![NettingSetDefinition {
        netting_set_id: "NS-1".into(),
        counterparty: "CPTY-A".into(),
        csa: None,
    }]);
    let mut analytics = BTreeMap::new();
    analytics.insert("cva".to_string(), true);
    let post_process = PostProcess::new(
        &portfolio,
        &netting_manager,
        &market,
        &cube,
        &scenario_data,
        PostProcessConfig {
            analytics,
            base_currency: "USD".into(),
            allocation_method: AllocationMethod::Marginal,
            marginal_allocation_limit: 1e-8,
            ..PostProcessConfig::default()
        },
    )
    .unwrap();

    // The bond dominates the netting set, so exposure is comfortably
    // positive and the CVA with it.
    let net_epe = post_process.net_epe("NS-1").unwrap();
    assert!(net_epe.iter().all(|&v| v >= 0.0));
    assert!(net_epe[1] > 50.0);
    assert!(post_process.netting_set_cva("NS-1").unwrap() > 0.0);

    // Marginal allocation sums back to the netting-set exposure profile.
    let alloc_1 = post_process.allocated_trade_epe("FWD-1").unwrap();
    let alloc_2 = post_process.allocated_trade_epe("BOND-1").unwrap();
    for k in 1..net_epe.len() {
        assert_relative_eq!(
            alloc_1[k] + alloc_2[k],
            net_epe[k],
            max_relative = 1e-8
        );
    }
}
