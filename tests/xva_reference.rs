//! Aggregation and XVA reference numbers on hand-built cubes: allocation
//! closure, PFE quantiles, and CVA against a flat-hazard closed form.

use std::collections::BTreeMap;
use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::NaiveDate;

use ferroxva::aggregation::{AllocationMethod, PostProcess, PostProcessConfig};
use ferroxva::cube::{AggregationScenarioData, NpvCube, ScenarioKey};
use ferroxva::market::{Market, SurvivalCurve, YieldCurve};
use ferroxva::portfolio::{
    CsaDetails, Instrument, NettingSetDefinition, NettingSetManager, Portfolio, Trade,
};
use ferroxva::simulation::ScenarioMarket;

#[derive(Debug)]
struct InertInstrument;

impl Instrument for InertInstrument {
    fn npv(&self, _market: &dyn ScenarioMarket) -> Result<f64, String> {
        Ok(0.0)
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn asof() -> NaiveDate {
    date(2026, 8, 1)
}

fn trade(id: &str, netting_set: &str) -> Trade {
    Trade {
        id: id.to_string(),
        netting_set_id: netting_set.to_string(),
        counterparty: "CPTY-A".to_string(),
        currency: "USD".to_string(),
        maturity: date(2031, 8, 1),
        legs: vec![],
        option: None,
        instrument: Arc::new(InertInstrument),
    }
}

fn market() -> Market {
    let mut market = Market::new("USD");
    market.add_discount_curve("USD", YieldCurve::flat(0.0));
    let tenors: Vec<f64> = (1..=10).map(|i| i as f64).collect();
    let hazards = vec![0.02; 10];
    market.add_survival_curve(
        "CPTY-A",
        SurvivalCurve::from_piecewise_hazard(&tenors, &hazards),
        0.4,
    );
    market
}

fn netting_manager(csa: Option<CsaDetails>) -> NettingSetManager {
    NettingSetManager::from_definitions(vec![NettingSetDefinition {
        netting_set_id: "NS-1".to_string(),
        counterparty: "CPTY-A".to_string(),
        csa,
    }])
}

fn scenario_data(dates: usize, samples: usize) -> AggregationScenarioData {
    let mut data = AggregationScenarioData::new(dates, samples);
    for d in 0..dates {
        for s in 0..samples {
            data.set(1.0, d, s, ScenarioKey::Numeraire).unwrap();
        }
    }
    data
}

fn config(allocation: AllocationMethod) -> PostProcessConfig {
    let mut analytics = BTreeMap::new();
    analytics.insert("cva".to_string(), true);
    PostProcessConfig {
        analytics,
        base_currency: "USD".to_string(),
        allocation_method: allocation,
        quantile: 0.95,
        ..PostProcessConfig::default()
    }
}

/// Two trades with 3:1 exposure share in one netting set: RelativeXVA
/// allocation preserves the ratio and the allocated CVAs add up to the
/// netting-set CVA within 1e-8 relative.
#[test]
fn relative_xva_allocation_closes_to_net_cva() {
    let grid: Vec<NaiveDate> = (1..=4).map(|i| date(2026 + i, 8, 1)).collect();
    let samples = 10;
    let portfolio = Portfolio::new(vec![trade("TRD-1", "NS-1"), trade("TRD-2", "NS-1")]);
    let mut cube = NpvCube::new(asof(), portfolio.ids(), grid.clone(), samples, 1);
    // Deterministic exposures: trade 1 carries 30, trade 2 carries 10.
    for d in 0..grid.len() {
        for s in 0..samples {
            cube.set(30.0, 0, d, s, 0).unwrap();
            cube.set(10.0, 1, d, s, 0).unwrap();
        }
    }
    cube.set_t0(30.0, 0, 0).unwrap();
    cube.set_t0(10.0, 1, 0).unwrap();

    let post_process = PostProcess::new(
        &portfolio,
        &netting_manager(None),
        &market(),
        &cube,
        &scenario_data(grid.len(), samples),
        config(AllocationMethod::RelativeXVA),
    )
    .unwrap();

    let net_cva = post_process.netting_set_cva("NS-1").unwrap();
    let allocated_1 = post_process.allocated_trade_cva("TRD-1").unwrap();
    let allocated_2 = post_process.allocated_trade_cva("TRD-2").unwrap();
    assert!(net_cva > 0.0);
    assert_relative_eq!(allocated_1 + allocated_2, net_cva, max_relative = 1e-8);
    // Stand-alone CVAs are 3:1, so the allocation must be too.
    assert_relative_eq!(allocated_1 / allocated_2, 3.0, max_relative = 1e-8);
}

/// Stand-alone CVAs in proportion {3, 1} allocate a net CVA of 3.2 into
/// {2.4, 0.8}.
#[test]
fn relative_xva_allocation_splits_proportionally() {
    let grid: Vec<NaiveDate> = (1..=4).map(|i| date(2026 + i, 8, 1)).collect();
    let samples = 2;
    let portfolio = Portfolio::new(vec![trade("TRD-1", "NS-1"), trade("TRD-2", "NS-1")]);
    let mut cube = NpvCube::new(asof(), portfolio.ids(), grid.clone(), samples, 1);
    // Offsetting positions: net exposure is below the gross sum.
    for d in 0..grid.len() {
        for s in 0..samples {
            cube.set(30.0, 0, d, s, 0).unwrap();
            cube.set(if s == 0 { 10.0 } else { -10.0 }, 1, d, s, 0).unwrap();
        }
    }
    cube.set_t0(30.0, 0, 0).unwrap();
    cube.set_t0(0.0, 1, 0).unwrap();

    let post_process = PostProcess::new(
        &portfolio,
        &netting_manager(None),
        &market(),
        &cube,
        &scenario_data(grid.len(), samples),
        config(AllocationMethod::RelativeXVA),
    )
    .unwrap();

    let net_cva = post_process.netting_set_cva("NS-1").unwrap();
    let cva_1 = post_process.trade_cva("TRD-1").unwrap();
    let cva_2 = post_process.trade_cva("TRD-2").unwrap();
    let allocated_1 = post_process.allocated_trade_cva("TRD-1").unwrap();
    let allocated_2 = post_process.allocated_trade_cva("TRD-2").unwrap();
    let share_1 = cva_1 / (cva_1 + cva_2);
    assert_relative_eq!(allocated_1, net_cva * share_1, max_relative = 1e-8);
    assert_relative_eq!(allocated_1 + allocated_2, net_cva, max_relative = 1e-8);
}

/// N = 1000 NPV samples uniform on [-1, 1] at a single date: the 95% PFE
/// is 0.90 within the sampling tolerance.
#[test]
fn pfe_quantile_of_uniform_exposure() {
    let grid = vec![date(2027, 8, 1)];
    let samples = 1000;
    let portfolio = Portfolio::new(vec![trade("TRD-1", "NS-1")]);
    let mut cube = NpvCube::new(asof(), portfolio.ids(), grid.clone(), samples, 1);
    for s in 0..samples {
        let v = -1.0 + 2.0 * s as f64 / (samples - 1) as f64;
        cube.set(v, 0, 0, s, 0).unwrap();
    }

    let post_process = PostProcess::new(
        &portfolio,
        &netting_manager(None),
        &market(),
        &cube,
        &scenario_data(1, samples),
        config(AllocationMethod::None),
    )
    .unwrap();

    let pfe = post_process.net_pfe("NS-1").unwrap();
    assert!((pfe[1] - 0.90).abs() < 0.05, "PFE {} out of band", pfe[1]);
}

/// Flat exposure against a flat hazard curve reproduces the closed-form
/// CVA = LGD x E x (1 - S(T)).
#[test]
fn net_cva_matches_flat_hazard_closed_form() {
    let grid: Vec<NaiveDate> = (1..=5).map(|i| date(2026 + i, 8, 1)).collect();
    let samples = 4;
    let portfolio = Portfolio::new(vec![trade("TRD-1", "NS-1")]);
    let mut cube = NpvCube::new(asof(), portfolio.ids(), grid.clone(), samples, 1);
    for d in 0..grid.len() {
        for s in 0..samples {
            cube.set(100.0, 0, d, s, 0).unwrap();
        }
    }
    cube.set_t0(100.0, 0, 0).unwrap();

    let post_process = PostProcess::new(
        &portfolio,
        &netting_manager(None),
        &market(),
        &cube,
        &scenario_data(grid.len(), samples),
        config(AllocationMethod::None),
    )
    .unwrap();

    let cva = post_process.netting_set_cva("NS-1").unwrap();
    let expected = 0.6 * 100.0 * (1.0 - (-0.02_f64 * 5.0).exp());
    // The grid dates are not exactly integer year fractions, so allow a
    // small tolerance.
    assert_relative_eq!(cva, expected, max_relative = 5e-3);
}

/// Full collateralisation under a zero-threshold CSA pushes the netted
/// exposure towards zero relative to the uncollateralised run.
#[test]
fn collateralisation_reduces_epe() {
    let grid: Vec<NaiveDate> = (1..=4).map(|i| date(2026 + i, 8, 1)).collect();
    let samples = 8;
    let portfolio = Portfolio::new(vec![trade("TRD-1", "NS-1")]);
    let mut cube = NpvCube::new(asof(), portfolio.ids(), grid.clone(), samples, 1);
    for d in 0..grid.len() {
        for s in 0..samples {
            cube.set(50.0 + d as f64 * 10.0 + s as f64, 0, d, s, 0).unwrap();
        }
    }
    cube.set_t0(50.0, 0, 0).unwrap();

    let uncollateralised = PostProcess::new(
        &portfolio,
        &netting_manager(None),
        &market(),
        &cube,
        &scenario_data(grid.len(), samples),
        config(AllocationMethod::None),
    )
    .unwrap();
    let csa = CsaDetails {
        margin_period_of_risk_days: 0,
        ..CsaDetails::default()
    };
    let collateralised = PostProcess::new(
        &portfolio,
        &netting_manager(Some(csa)),
        &market(),
        &cube,
        &scenario_data(grid.len(), samples),
        config(AllocationMethod::None),
    )
    .unwrap();

    let open = uncollateralised.net_epe("NS-1").unwrap();
    let secured = collateralised.net_epe("NS-1").unwrap();
    for k in 1..open.len() {
        assert!(
            secured[k] <= open[k] + 1e-12,
            "collateral increased exposure at {k}: {} > {}",
            secured[k],
            open[k]
        );
    }
}

/// Mirror-image KVA: under identical own and counterparty credit curves
/// and a sign-symmetric exposure distribution, the "their"-side capital
/// charges must equal the "our"-side ones. Both sides have to apply the
/// same Basel weighting P(t) = DF(t) x S(t) to their effective exposure
/// profiles; a missing weight on either side breaks the equality as soon
/// as rates or hazards are non-zero.
#[test]
fn kva_charges_are_symmetric_under_mirrored_curves() {
    let grid: Vec<NaiveDate> = (1..=4).map(|i| date(2026 + i, 8, 1)).collect();
    let samples = 2;
    let portfolio = Portfolio::new(vec![trade("TRD-1", "NS-1")]);
    let mut cube = NpvCube::new(asof(), portfolio.ids(), grid.clone(), samples, 1);
    // Sign-symmetric exposures: EPE and ENE profiles coincide.
    for d in 0..grid.len() {
        cube.set(50.0, 0, d, 0, 0).unwrap();
        cube.set(-50.0, 0, d, 1, 0).unwrap();
    }
    cube.set_t0(0.0, 0, 0).unwrap();

    // Non-trivial discounting and hazards, identical for both parties, so
    // the Basel weight differs visibly from 1 on every pillar.
    let mut market = Market::new("USD");
    market.add_discount_curve("USD", YieldCurve::flat(0.03));
    let tenors: Vec<f64> = (1..=10).map(|i| i as f64).collect();
    let hazards = vec![0.05; 10];
    market.add_survival_curve(
        "CPTY-A",
        SurvivalCurve::from_piecewise_hazard(&tenors, &hazards),
        0.4,
    );
    market.add_survival_curve(
        "OURBANK",
        SurvivalCurve::from_piecewise_hazard(&tenors, &hazards),
        0.4,
    );

    let mut analytics = BTreeMap::new();
    analytics.insert("cva".to_string(), true);
    analytics.insert("dva".to_string(), true);
    analytics.insert("kva".to_string(), true);
    let post_process = PostProcess::new(
        &portfolio,
        &netting_manager(None),
        &market,
        &cube,
        &scenario_data(grid.len(), samples),
        PostProcessConfig {
            analytics,
            base_currency: "USD".to_string(),
            dva_name: "OURBANK".to_string(),
            ..PostProcessConfig::default()
        },
    )
    .unwrap();

    // The exposure legs really are mirror images.
    let epe = post_process.net_epe("NS-1").unwrap();
    let ene = post_process.net_ene("NS-1").unwrap();
    for (e, n) in epe.iter().zip(ene.iter()) {
        assert_relative_eq!(*e, *n, epsilon = 1e-12);
    }

    let our_ccr = post_process.netting_set_our_kva_ccr("NS-1").unwrap();
    let their_ccr = post_process.netting_set_their_kva_ccr("NS-1").unwrap();
    let our_cva = post_process.netting_set_our_kva_cva("NS-1").unwrap();
    let their_cva = post_process.netting_set_their_kva_cva("NS-1").unwrap();
    assert!(our_ccr > 0.0, "our KVA-CCR must be positive, got {our_ccr}");
    assert!(our_cva > 0.0, "our KVA-CVA must be positive, got {our_cva}");
    assert_relative_eq!(their_ccr, our_ccr, max_relative = 1e-12);
    assert_relative_eq!(their_cva, our_cva, max_relative = 1e-12);
}

/// Cube and scenario-data dimension mismatches are rejected up front.
#[test]
fn dimension_mismatch_is_an_error() {
    let grid = vec![date(2027, 8, 1)];
    let portfolio = Portfolio::new(vec![trade("TRD-1", "NS-1")]);
    let cube = NpvCube::new(asof(), portfolio.ids(), grid, 4, 1);
    let bad_scenario_data = scenario_data(2, 4);
    let err = PostProcess::new(
        &portfolio,
        &netting_manager(None),
        &market(),
        &cube,
        &bad_scenario_data,
        config(AllocationMethod::None),
    )
    .err()
    .expect("mismatch must be rejected");
    assert!(err.to_string().contains("dimension"));
}
