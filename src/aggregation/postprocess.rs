//! Exposure aggregation and XVA calculation.
//!
//! Aggregates NPV cube data into netting-set exposures, computes exposure
//! statistics and the XVA suite at trade and netting-set level, and
//! allocates netting-set figures back to trades. All analytics are
//! precomputed when [`PostProcess::new`] runs; the accessors are plain
//! lookups afterwards.
//!
//! Exposures are discounted at the numeraire used by the simulation that
//! produced the cube, so no further discounting appears in the CVA/DVA
//! integrals; the survival-probability weights carry the credit component.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::aggregation::allocators::{allocate_exposures, AllocatorInputs};
use crate::aggregation::collateral::CollateralExposureHelper;
use crate::aggregation::dim::DimCalculator;
use crate::aggregation::{AggregationError, AllocationMethod};
use crate::cube::{AggregationScenarioData, NpvCube};
use crate::market::{year_fraction, DayCountConvention, Market, SurvivalCurve};
use crate::math::{empirical_quantile, normal_cdf, normal_inv_cdf};
use crate::portfolio::{CollateralCalculationType, NettingSetManager, Portfolio};

/// Regulatory capital parameters for the KVA charges.
#[derive(Debug, Clone, Copy)]
pub struct KvaParams {
    /// Discount rate for expected future capital.
    pub capital_discount_rate: f64,
    /// Alpha scaling EEPE into EAD.
    pub alpha: f64,
    /// Regulatory adjustment, 1 / minimum capital requirement.
    pub reg_adjustment: f64,
    /// Capital hurdle; cost of capital = reg adjustment x hurdle.
    pub capital_hurdle: f64,
    pub our_pd_floor: f64,
    pub their_pd_floor: f64,
    pub our_cva_risk_weight: f64,
    pub their_cva_risk_weight: f64,
}

impl Default for KvaParams {
    fn default() -> Self {
        Self {
            capital_discount_rate: 0.10,
            alpha: 1.4,
            reg_adjustment: 12.5,
            capital_hurdle: 0.012,
            our_pd_floor: 0.03,
            their_pd_floor: 0.03,
            our_cva_risk_weight: 0.05,
            their_cva_risk_weight: 0.05,
        }
    }
}

/// Configuration of the post-processing run.
#[derive(Debug, Clone)]
pub struct PostProcessConfig {
    /// Selection of analytics to produce (`cva`, `dva`, `fva`, `colva`,
    /// `collateralFloor`, `mva`, `dim`, `kva`). Missing keys default off,
    /// except exposures which are always produced.
    pub analytics: BTreeMap<String, bool>,
    pub base_currency: String,
    pub allocation_method: AllocationMethod,
    pub marginal_allocation_limit: f64,
    /// Quantile for the PFE output.
    pub quantile: f64,
    pub calculation_type: CollateralCalculationType,
    /// Credit curve for our own credit; empty disables DVA and the
    /// own-survival weighting.
    pub dva_name: String,
    pub fva_borrowing_curve: String,
    pub fva_lending_curve: String,
    pub dim_calculator: Option<DimCalculator>,
    /// Assume the t=0 collateral balance equals the netting-set NPV.
    pub full_initial_collateralisation: bool,
    /// CVA spread sensitivity pillars in year fractions.
    pub cva_spread_sensi_grid: Vec<f64>,
    pub cva_spread_sensi_shift_size: f64,
    pub kva: KvaParams,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            analytics: BTreeMap::new(),
            base_currency: "USD".to_string(),
            allocation_method: AllocationMethod::None,
            marginal_allocation_limit: 1.0,
            quantile: 0.95,
            calculation_type: CollateralCalculationType::Symmetric,
            dva_name: String::new(),
            fva_borrowing_curve: String::new(),
            fva_lending_curve: String::new(),
            dim_calculator: None,
            full_initial_collateralisation: false,
            cva_spread_sensi_grid: vec![0.5, 1.0, 3.0, 5.0, 10.0],
            cva_spread_sensi_shift_size: 0.0001,
            kva: KvaParams::default(),
        }
    }
}

type ProfileMap = BTreeMap<String, Vec<f64>>;
type ScalarMap = BTreeMap<String, f64>;

pub struct PostProcess {
    trade_ids: Vec<String>,
    netting_set_ids: Vec<String>,
    counterparty: BTreeMap<String, String>,

    // profiles have length dates + 1, slot 0 being t = 0
    trade_epe: ProfileMap,
    trade_ene: ProfileMap,
    trade_ee_b: ProfileMap,
    trade_eee_b: ProfileMap,
    trade_pfe: ProfileMap,
    trade_epe_b: ScalarMap,
    trade_eepe_b: ScalarMap,
    allocated_trade_epe: ProfileMap,
    allocated_trade_ene: ProfileMap,

    net_epe: ProfileMap,
    net_ene: ProfileMap,
    net_ee_b: ProfileMap,
    net_eee_b: ProfileMap,
    net_pfe: ProfileMap,
    net_epe_b: ScalarMap,
    net_eepe_b: ScalarMap,
    expected_collateral: ProfileMap,
    colva_inc: ProfileMap,
    collateral_floor_inc: ProfileMap,

    trade_cva: ScalarMap,
    trade_dva: ScalarMap,
    trade_fba: ScalarMap,
    trade_fca: ScalarMap,
    trade_fba_ex_own_sp: ScalarMap,
    trade_fca_ex_own_sp: ScalarMap,
    trade_fba_ex_all_sp: ScalarMap,
    trade_fca_ex_all_sp: ScalarMap,
    sum_trade_cva: ScalarMap,
    sum_trade_dva: ScalarMap,
    allocated_trade_cva: ScalarMap,
    allocated_trade_dva: ScalarMap,

    netting_set_cva: ScalarMap,
    netting_set_dva: ScalarMap,
    netting_set_mva: ScalarMap,
    netting_set_fba: ScalarMap,
    netting_set_fca: ScalarMap,
    netting_set_fba_ex_own_sp: ScalarMap,
    netting_set_fca_ex_own_sp: ScalarMap,
    netting_set_fba_ex_all_sp: ScalarMap,
    netting_set_fca_ex_all_sp: ScalarMap,
    netting_set_colva: ScalarMap,
    netting_set_collateral_floor: ScalarMap,
    our_kva_ccr: ScalarMap,
    their_kva_ccr: ScalarMap,
    our_kva_cva: ScalarMap,
    their_kva_cva: ScalarMap,

    net_cva_hazard_sensi: ProfileMap,
    net_cva_spread_sensi: ProfileMap,
    cva_sensi_times: Vec<f64>,

    dim_evolution: ProfileMap,
    net_cube: NpvCube,
}

impl PostProcess {
    pub fn new(
        portfolio: &Portfolio,
        netting_manager: &NettingSetManager,
        market: &Market,
        cube: &NpvCube,
        scenario_data: &AggregationScenarioData,
        config: PostProcessConfig,
    ) -> Result<Self, AggregationError> {
        if cube.num_ids() != portfolio.size() {
            return Err(AggregationError::DimensionMismatch(format!(
                "cube id dimension ({}) does not match portfolio size ({})",
                cube.num_ids(),
                portfolio.size()
            )));
        }
        if scenario_data.dim_dates() != cube.num_dates()
            || scenario_data.dim_samples() != cube.samples()
        {
            return Err(AggregationError::DimensionMismatch(format!(
                "scenario data ({} x {}) does not match cube ({} x {})",
                scenario_data.dim_dates(),
                scenario_data.dim_samples(),
                cube.num_dates(),
                cube.samples()
            )));
        }
        for trade in portfolio.trades() {
            if !netting_manager.has(&trade.netting_set_id) {
                return Err(AggregationError::UnknownNettingSet(
                    trade.netting_set_id.clone(),
                ));
            }
        }

        let asof = cube.asof();
        let dates = cube.dates().to_vec();
        let times: Vec<f64> = dates
            .iter()
            .map(|&d| year_fraction(asof, d, DayCountConvention::Act365Fixed))
            .collect();
        let netting_set_ids = portfolio.netting_set_ids();
        let mut counterparty = BTreeMap::new();
        for ns in &netting_set_ids {
            counterparty.insert(ns.clone(), netting_manager.get(ns).map_err(|_| {
                AggregationError::UnknownNettingSet(ns.clone())
            })?.counterparty.clone());
        }

        let mut this = Self {
            trade_ids: portfolio.ids(),
            netting_set_ids: netting_set_ids.clone(),
            counterparty,
            trade_epe: BTreeMap::new(),
            trade_ene: BTreeMap::new(),
            trade_ee_b: BTreeMap::new(),
            trade_eee_b: BTreeMap::new(),
            trade_pfe: BTreeMap::new(),
            trade_epe_b: BTreeMap::new(),
            trade_eepe_b: BTreeMap::new(),
            allocated_trade_epe: BTreeMap::new(),
            allocated_trade_ene: BTreeMap::new(),
            net_epe: BTreeMap::new(),
            net_ene: BTreeMap::new(),
            net_ee_b: BTreeMap::new(),
            net_eee_b: BTreeMap::new(),
            net_pfe: BTreeMap::new(),
            net_epe_b: BTreeMap::new(),
            net_eepe_b: BTreeMap::new(),
            expected_collateral: BTreeMap::new(),
            colva_inc: BTreeMap::new(),
            collateral_floor_inc: BTreeMap::new(),
            trade_cva: BTreeMap::new(),
            trade_dva: BTreeMap::new(),
            trade_fba: BTreeMap::new(),
            trade_fca: BTreeMap::new(),
            trade_fba_ex_own_sp: BTreeMap::new(),
            trade_fca_ex_own_sp: BTreeMap::new(),
            trade_fba_ex_all_sp: BTreeMap::new(),
            trade_fca_ex_all_sp: BTreeMap::new(),
            sum_trade_cva: BTreeMap::new(),
            sum_trade_dva: BTreeMap::new(),
            allocated_trade_cva: BTreeMap::new(),
            allocated_trade_dva: BTreeMap::new(),
            netting_set_cva: BTreeMap::new(),
            netting_set_dva: BTreeMap::new(),
            netting_set_mva: BTreeMap::new(),
            netting_set_fba: BTreeMap::new(),
            netting_set_fca: BTreeMap::new(),
            netting_set_fba_ex_own_sp: BTreeMap::new(),
            netting_set_fca_ex_own_sp: BTreeMap::new(),
            netting_set_fba_ex_all_sp: BTreeMap::new(),
            netting_set_fca_ex_all_sp: BTreeMap::new(),
            netting_set_colva: BTreeMap::new(),
            netting_set_collateral_floor: BTreeMap::new(),
            our_kva_ccr: BTreeMap::new(),
            their_kva_ccr: BTreeMap::new(),
            our_kva_cva: BTreeMap::new(),
            their_kva_cva: BTreeMap::new(),
            net_cva_hazard_sensi: BTreeMap::new(),
            net_cva_spread_sensi: BTreeMap::new(),
            cva_sensi_times: config.cva_spread_sensi_grid.clone(),
            dim_evolution: BTreeMap::new(),
            net_cube: NpvCube::new(asof, netting_set_ids, dates.clone(), cube.samples(), 1),
        };
        this.update_stand_alone_xva(portfolio, netting_manager, market, cube, &times, &config)?;
        this.update_netting_set_kva(portfolio, market, &times, &config)?;
        this.update_allocated_xva(portfolio, market, cube, &times, &config)?;
        info!(
            trades = this.trade_ids.len(),
            netting_sets = this.netting_set_ids.len(),
            "post-processing complete"
        );
        Ok(this)
    }

    fn analytic_on(config: &PostProcessConfig, key: &str) -> bool {
        config.analytics.get(key).copied().unwrap_or(false)
    }

    fn our_curve<'m>(
        market: &'m Market,
        config: &PostProcessConfig,
    ) -> Result<Option<(&'m SurvivalCurve, f64)>, AggregationError> {
        if config.dva_name.is_empty() {
            return Ok(None);
        }
        let curve = market
            .survival_curve(&config.dva_name)
            .map_err(AggregationError::MarketData)?;
        let lgd = 1.0
            - market
                .recovery_rate(&config.dva_name)
                .map_err(AggregationError::MarketData)?;
        Ok(Some((curve, lgd)))
    }

    /// First stage: exposures, collateral, and stand-alone XVAs at trade
    /// and netting-set level.
    fn update_stand_alone_xva(
        &mut self,
        portfolio: &Portfolio,
        netting_manager: &NettingSetManager,
        market: &Market,
        cube: &NpvCube,
        times: &[f64],
        config: &PostProcessConfig,
    ) -> Result<(), AggregationError> {
        let num_dates = times.len();
        let samples = cube.samples();
        let times_ext = extend_times(times);
        let our = Self::our_curve(market, config)?;

        // Trade-level profiles and stand-alone adjustments.
        for (i, trade) in portfolio.trades().iter().enumerate() {
            let cpty = &self.counterparty[&trade.netting_set_id];
            let cpty_curve = market
                .survival_curve(cpty)
                .map_err(AggregationError::MarketData)?;
            let lgd_cpty = 1.0
                - market
                    .recovery_rate(cpty)
                    .map_err(AggregationError::MarketData)?;

            let t0 = cube.get_t0(i, 0)?;
            let mut epe = vec![0.0; num_dates + 1];
            let mut ene = vec![0.0; num_dates + 1];
            let mut pfe = vec![0.0; num_dates + 1];
            epe[0] = t0.max(0.0);
            ene[0] = (-t0).max(0.0);
            pfe[0] = t0.max(0.0);
            let mut sample_scratch = vec![0.0; samples];
            for d in 0..num_dates {
                for (s, slot) in sample_scratch.iter_mut().enumerate() {
                    let v = cube.get(i, d, s, 0)?;
                    epe[d + 1] += v.max(0.0);
                    ene[d + 1] += (-v).max(0.0);
                    *slot = v.max(0.0);
                }
                epe[d + 1] /= samples as f64;
                ene[d + 1] /= samples as f64;
                pfe[d + 1] = empirical_quantile(&mut sample_scratch, config.quantile);
            }

            let p = |t: f64| discount_weight(market, config, cpty_curve, t);
            let (ee_b, eee_b, epe_b, eepe_b) = basel_measures(&epe, &times_ext, p);

            let cva = credit_integral(&epe, &times_ext, cpty_curve, lgd_cpty);
            self.trade_cva.insert(trade.id.clone(), cva);
            *self
                .sum_trade_cva
                .entry(trade.netting_set_id.clone())
                .or_insert(0.0) += cva;
            let dva = match our {
                Some((our_curve, lgd_own)) if Self::analytic_on(config, "dva") => {
                    credit_integral(&ene, &times_ext, our_curve, lgd_own)
                }
                _ => 0.0,
            };
            self.trade_dva.insert(trade.id.clone(), dva);
            *self
                .sum_trade_dva
                .entry(trade.netting_set_id.clone())
                .or_insert(0.0) += dva;

            if Self::analytic_on(config, "fva") {
                self.store_funding_adjustments(
                    trade.id.clone(),
                    &epe,
                    &ene,
                    &times_ext,
                    market,
                    config,
                    cpty_curve,
                    our.map(|(c, _)| c),
                    true,
                )?;
            }

            self.trade_epe.insert(trade.id.clone(), epe);
            self.trade_ene.insert(trade.id.clone(), ene);
            self.trade_ee_b.insert(trade.id.clone(), ee_b);
            self.trade_eee_b.insert(trade.id.clone(), eee_b);
            self.trade_pfe.insert(trade.id.clone(), pfe);
            self.trade_epe_b.insert(trade.id.clone(), epe_b);
            self.trade_eepe_b.insert(trade.id.clone(), eepe_b);
        }

        // Netting-set level: collateralised exposures and adjustments.
        for ns in &self.netting_set_ids.clone() {
            let local: Vec<usize> = portfolio
                .trades()
                .iter()
                .enumerate()
                .filter(|(_, t)| &t.netting_set_id == ns)
                .map(|(i, _)| i)
                .collect();
            let mut value = vec![vec![0.0; samples]; num_dates];
            let mut value_today = 0.0;
            for &i in &local {
                value_today += cube.get_t0(i, 0)?;
                for (d, row) in value.iter_mut().enumerate() {
                    for (s, slot) in row.iter_mut().enumerate() {
                        *slot += cube.get(i, d, s, 0)?;
                    }
                }
            }

            let definition = netting_manager
                .get(ns)
                .map_err(|_| AggregationError::UnknownNettingSet(ns.clone()))?;
            let csa = definition.csa;
            let accounts = match csa {
                Some(csa_details) => {
                    let helper = CollateralExposureHelper::new(
                        csa_details,
                        config.calculation_type,
                        config.full_initial_collateralisation,
                    );
                    Some(helper.collateral_paths(cube.dates(), value_today, &value)?)
                }
                None => None,
            };

            let mut epe = vec![0.0; num_dates + 1];
            let mut ene = vec![0.0; num_dates + 1];
            let mut pfe = vec![0.0; num_dates + 1];
            let collateral_today = if config.full_initial_collateralisation && csa.is_some() {
                value_today
            } else {
                0.0
            };
            epe[0] = (value_today - collateral_today).max(0.0);
            ene[0] = (collateral_today - value_today).max(0.0);
            pfe[0] = epe[0];
            let ns_index = self.net_cube.index_of_id(ns)?;
            let mut scratch = vec![0.0; samples];
            for d in 0..num_dates {
                for s in 0..samples {
                    let collateral = accounts
                        .as_ref()
                        .map_or(0.0, |acc| acc[s].balance[d]);
                    let net = value[d][s] - collateral;
                    epe[d + 1] += net.max(0.0);
                    ene[d + 1] += (-net).max(0.0);
                    scratch[s] = net.max(0.0);
                    self.net_cube.set(net, ns_index, d, s, 0)?;
                }
                epe[d + 1] /= samples as f64;
                ene[d + 1] /= samples as f64;
                pfe[d + 1] = empirical_quantile(&mut scratch, config.quantile);
            }
            self.net_cube.set_t0(value_today, ns_index, 0)?;

            let cpty = &self.counterparty[ns];
            let cpty_curve = market
                .survival_curve(cpty)
                .map_err(AggregationError::MarketData)?;
            let lgd_cpty = 1.0
                - market
                    .recovery_rate(cpty)
                    .map_err(AggregationError::MarketData)?;
            let p = |t: f64| discount_weight(market, config, cpty_curve, t);
            let (ee_b, eee_b, epe_b, eepe_b) = basel_measures(&epe, &times_ext, p);

            let cva = credit_integral(&epe, &times_ext, cpty_curve, lgd_cpty);
            self.netting_set_cva.insert(ns.clone(), cva);
            let dva = match our {
                Some((our_curve, lgd_own)) if Self::analytic_on(config, "dva") => {
                    credit_integral(&ene, &times_ext, our_curve, lgd_own)
                }
                _ => 0.0,
            };
            self.netting_set_dva.insert(ns.clone(), dva);

            if Self::analytic_on(config, "fva") {
                self.store_funding_adjustments(
                    ns.clone(),
                    &epe,
                    &ene,
                    &times_ext,
                    market,
                    config,
                    cpty_curve,
                    our.map(|(c, _)| c),
                    false,
                )?;
            }

            // Collateral remuneration: COLVA and the collateral rate floor.
            let expected_collateral = accounts
                .as_ref()
                .map(|acc| CollateralExposureHelper::expected_collateral(acc))
                .unwrap_or_else(|| vec![0.0; num_dates]);
            let spread = csa.map_or(0.0, |c| c.collateral_spread);
            let floor = csa.map_or(0.0, |c| c.collateral_floor);
            let mut colva_inc = vec![0.0; num_dates + 1];
            let mut floor_inc = vec![0.0; num_dates + 1];
            if Self::analytic_on(config, "colva") || Self::analytic_on(config, "collateralFloor")
            {
                let base_curve = market
                    .discount_curve(&config.base_currency)
                    .map_err(AggregationError::MarketData)?;
                for d in 0..num_dates {
                    let dt = times_ext[d + 1] - times_ext[d];
                    if Self::analytic_on(config, "colva") {
                        colva_inc[d + 1] = -expected_collateral[d] * spread * dt;
                    }
                    if Self::analytic_on(config, "collateralFloor") {
                        let rate = base_curve.zero_rate(times_ext[d + 1]) - spread;
                        let shortfall = (floor - rate).max(0.0);
                        let positive_collateral = accounts.as_ref().map_or(0.0, |acc| {
                            acc.iter().map(|a| a.balance[d].max(0.0)).sum::<f64>()
                                / samples as f64
                        });
                        floor_inc[d + 1] = positive_collateral * shortfall * dt;
                    }
                }
            }
            self.netting_set_colva
                .insert(ns.clone(), colva_inc.iter().sum());
            self.netting_set_collateral_floor
                .insert(ns.clone(), floor_inc.iter().sum());
            self.colva_inc.insert(ns.clone(), colva_inc);
            self.collateral_floor_inc.insert(ns.clone(), floor_inc);

            // MVA from the dynamic initial margin forecast.
            let mva = if Self::analytic_on(config, "mva") {
                match &config.dim_calculator {
                    Some(calculator) => {
                        let dim = calculator.compute(times, &value)?;
                        let mva = self.margin_value_adjustment(
                            &dim.expected_dim,
                            &times_ext,
                            market,
                            config,
                            cpty_curve,
                            our.map(|(c, _)| c),
                        )?;
                        self.dim_evolution.insert(ns.clone(), dim.expected_dim);
                        mva
                    }
                    None => 0.0,
                }
            } else {
                0.0
            };
            self.netting_set_mva.insert(ns.clone(), mva);

            // CVA credit-spread sensitivities on the configured pillar grid.
            let (hazard_sensi, spread_sensi) = self.cva_sensitivities(
                &epe,
                &times_ext,
                cpty_curve,
                lgd_cpty,
                config,
            );
            self.net_cva_hazard_sensi.insert(ns.clone(), hazard_sensi);
            self.net_cva_spread_sensi.insert(ns.clone(), spread_sensi);

            self.net_epe.insert(ns.clone(), epe);
            self.net_ene.insert(ns.clone(), ene);
            self.net_ee_b.insert(ns.clone(), ee_b);
            self.net_eee_b.insert(ns.clone(), eee_b);
            self.net_pfe.insert(ns.clone(), pfe);
            self.net_epe_b.insert(ns.clone(), epe_b);
            self.net_eepe_b.insert(ns.clone(), eepe_b);
            self.expected_collateral
                .insert(ns.clone(), expected_collateral);
            debug!(netting_set = %ns, "netting set aggregation done");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn store_funding_adjustments(
        &mut self,
        key: String,
        epe: &[f64],
        ene: &[f64],
        times_ext: &[f64],
        market: &Market,
        config: &PostProcessConfig,
        cpty_curve: &SurvivalCurve,
        our_curve: Option<&SurvivalCurve>,
        is_trade: bool,
    ) -> Result<(), AggregationError> {
        let borrow = |t: f64| {
            if config.fva_borrowing_curve.is_empty() {
                Ok(0.0)
            } else {
                market
                    .spread(&config.fva_borrowing_curve, t)
                    .map_err(AggregationError::MarketData)
            }
        };
        let lend = |t: f64| {
            if config.fva_lending_curve.is_empty() {
                Ok(0.0)
            } else {
                market
                    .spread(&config.fva_lending_curve, t)
                    .map_err(AggregationError::MarketData)
            }
        };
        let fca = funding_integral(epe, times_ext, &borrow, Some(cpty_curve), our_curve)?;
        let fba = funding_integral(ene, times_ext, &lend, Some(cpty_curve), our_curve)?;
        let fca_ex_own = funding_integral(epe, times_ext, &borrow, Some(cpty_curve), None)?;
        let fba_ex_own = funding_integral(ene, times_ext, &lend, Some(cpty_curve), None)?;
        let fca_ex_all = funding_integral(epe, times_ext, &borrow, None, None)?;
        let fba_ex_all = funding_integral(ene, times_ext, &lend, None, None)?;
        if is_trade {
            self.trade_fca.insert(key.clone(), fca);
            self.trade_fba.insert(key.clone(), fba);
            self.trade_fca_ex_own_sp.insert(key.clone(), fca_ex_own);
            self.trade_fba_ex_own_sp.insert(key.clone(), fba_ex_own);
            self.trade_fca_ex_all_sp.insert(key.clone(), fca_ex_all);
            self.trade_fba_ex_all_sp.insert(key, fba_ex_all);
        } else {
            self.netting_set_fca.insert(key.clone(), fca);
            self.netting_set_fba.insert(key.clone(), fba);
            self.netting_set_fca_ex_own_sp.insert(key.clone(), fca_ex_own);
            self.netting_set_fba_ex_own_sp.insert(key.clone(), fba_ex_own);
            self.netting_set_fca_ex_all_sp.insert(key.clone(), fca_ex_all);
            self.netting_set_fba_ex_all_sp.insert(key, fba_ex_all);
        }
        Ok(())
    }

    fn margin_value_adjustment(
        &self,
        expected_dim: &[f64],
        times_ext: &[f64],
        market: &Market,
        config: &PostProcessConfig,
        cpty_curve: &SurvivalCurve,
        our_curve: Option<&SurvivalCurve>,
    ) -> Result<f64, AggregationError> {
        let borrow = |t: f64| {
            if config.fva_borrowing_curve.is_empty() {
                Ok(0.0)
            } else {
                market
                    .spread(&config.fva_borrowing_curve, t)
                    .map_err(AggregationError::MarketData)
            }
        };
        // The DIM profile has no t=0 slot; prepend it.
        let mut profile = vec![0.0; expected_dim.len() + 1];
        profile[1..].copy_from_slice(expected_dim);
        funding_integral(&profile, times_ext, &borrow, Some(cpty_curve), our_curve)
    }

    fn cva_sensitivities(
        &self,
        epe: &[f64],
        times_ext: &[f64],
        cpty_curve: &SurvivalCurve,
        lgd: f64,
        config: &PostProcessConfig,
    ) -> (Vec<f64>, Vec<f64>) {
        // Re-pillar the curve onto the sensitivity grid so each bump hits
        // exactly one pillar.
        let pillars: Vec<(f64, f64)> = config
            .cva_spread_sensi_grid
            .iter()
            .map(|&t| (t, cpty_curve.survival_prob(t)))
            .collect();
        let base_curve = SurvivalCurve::new(pillars);
        let base_cva = credit_integral(epe, times_ext, &base_curve, lgd);
        let mut hazard = Vec::with_capacity(config.cva_spread_sensi_grid.len());
        let mut spread = Vec::with_capacity(config.cva_spread_sensi_grid.len());
        for pillar in 0..base_curve.num_pillars() {
            let bumped = base_curve.bumped(pillar, config.cva_spread_sensi_shift_size);
            hazard.push(credit_integral(epe, times_ext, &bumped, lgd) - base_cva);
            let spread_bumped =
                base_curve.bumped(pillar, config.cva_spread_sensi_shift_size / lgd.max(1.0e-8));
            spread.push(credit_integral(epe, times_ext, &spread_bumped, lgd) - base_cva);
        }
        (hazard, spread)
    }

    /// Second stage: KVA capital charges per netting set.
    fn update_netting_set_kva(
        &mut self,
        portfolio: &Portfolio,
        market: &Market,
        times: &[f64],
        config: &PostProcessConfig,
    ) -> Result<(), AggregationError> {
        let times_ext = extend_times(times);
        let our = Self::our_curve(market, config)?;
        for ns in &self.netting_set_ids.clone() {
            if !Self::analytic_on(config, "kva") {
                self.our_kva_ccr.insert(ns.clone(), 0.0);
                self.their_kva_ccr.insert(ns.clone(), 0.0);
                self.our_kva_cva.insert(ns.clone(), 0.0);
                self.their_kva_cva.insert(ns.clone(), 0.0);
                continue;
            }
            let cpty = &self.counterparty[ns];
            let cpty_curve = market
                .survival_curve(cpty)
                .map_err(AggregationError::MarketData)?;
            let lgd_cpty = 1.0
                - market
                    .recovery_rate(cpty)
                    .map_err(AggregationError::MarketData)?;
            let maturity = portfolio
                .trades()
                .iter()
                .filter(|t| &t.netting_set_id == ns)
                .map(|t| {
                    year_fraction(
                        self.net_cube.asof(),
                        t.maturity,
                        DayCountConvention::Act365Fixed,
                    )
                })
                .fold(0.0_f64, f64::max);

            // Exposure from our side keys off the counterparty's default;
            // the mirrored charge uses our own curve against the ENE-based
            // effective exposure.
            let their_pd = (1.0 - cpty_curve.survival_prob(1.0)).max(config.kva.their_pd_floor);
            let eee = &self.net_eee_b[ns];
            let our_ccr = kva_charge(
                eee,
                &times_ext,
                their_pd,
                lgd_cpty,
                maturity,
                &config.kva,
                None,
            );
            let our_cva_charge = kva_charge(
                eee,
                &times_ext,
                their_pd,
                lgd_cpty,
                maturity,
                &config.kva,
                Some(config.kva.their_cva_risk_weight),
            );
            self.our_kva_ccr.insert(ns.clone(), our_ccr);
            self.our_kva_cva.insert(ns.clone(), our_cva_charge);

            let (their_ccr, their_cva) = match our {
                Some((our_curve, lgd_own)) => {
                    let our_pd =
                        (1.0 - our_curve.survival_prob(1.0)).max(config.kva.our_pd_floor);
                    // Their effective exposure profile is built from our ENE,
                    // Basel-weighted by our own survival curve.
                    let ene = &self.net_ene[ns];
                    let p = |t: f64| discount_weight(market, config, our_curve, t);
                    let (_, their_eee, _, _) = basel_measures(ene, &times_ext, p);
                    (
                        kva_charge(
                            &their_eee,
                            &times_ext,
                            our_pd,
                            lgd_own,
                            maturity,
                            &config.kva,
                            None,
                        ),
                        kva_charge(
                            &their_eee,
                            &times_ext,
                            our_pd,
                            lgd_own,
                            maturity,
                            &config.kva,
                            Some(config.kva.our_cva_risk_weight),
                        ),
                    )
                }
                None => (0.0, 0.0),
            };
            self.their_kva_ccr.insert(ns.clone(), their_ccr);
            self.their_kva_cva.insert(ns.clone(), their_cva);
        }
        Ok(())
    }

    /// Third stage: allocation of netting-set exposures and XVAs back to
    /// trade level.
    fn update_allocated_xva(
        &mut self,
        portfolio: &Portfolio,
        market: &Market,
        cube: &NpvCube,
        times: &[f64],
        config: &PostProcessConfig,
    ) -> Result<(), AggregationError> {
        let num_dates = times.len();
        let samples = cube.samples();
        let times_ext = extend_times(times);
        let our = Self::our_curve(market, config)?;

        for ns in &self.netting_set_ids.clone() {
            let local: Vec<(usize, String)> = portfolio
                .trades()
                .iter()
                .enumerate()
                .filter(|(_, t)| &t.netting_set_id == ns)
                .map(|(i, t)| (i, t.id.clone()))
                .collect();

            // Row 0 carries the t=0 slice so the allocation covers the
            // whole profile with one weight scheme.
            let mut trade_values = Vec::with_capacity(local.len());
            let mut trade_values_today = Vec::with_capacity(local.len());
            for &(i, _) in &local {
                let today = cube.get_t0(i, 0)?;
                let mut matrix = vec![vec![0.0; samples]; num_dates + 1];
                matrix[0] = vec![today; samples];
                for (d, row) in matrix.iter_mut().skip(1).enumerate() {
                    for (s, slot) in row.iter_mut().enumerate() {
                        *slot = cube.get(i, d, s, 0)?;
                    }
                }
                trade_values.push(matrix);
                trade_values_today.push(today);
            }

            // Netting-set path exposures from the netted cube.
            let ns_index = self.net_cube.index_of_id(ns)?;
            let mut net_epe_paths = vec![vec![0.0; samples]; num_dates + 1];
            let mut net_ene_paths = vec![vec![0.0; samples]; num_dates + 1];
            net_epe_paths[0] = vec![self.net_epe[ns][0]; samples];
            net_ene_paths[0] = vec![self.net_ene[ns][0]; samples];
            for d in 0..num_dates {
                for s in 0..samples {
                    let net = self.net_cube.get(ns_index, d, s, 0)?;
                    net_epe_paths[d + 1][s] = net.max(0.0);
                    net_ene_paths[d + 1][s] = (-net).max(0.0);
                }
            }

            let trade_cva: Vec<f64> = local.iter().map(|(_, id)| self.trade_cva[id]).collect();
            let trade_dva: Vec<f64> = local.iter().map(|(_, id)| self.trade_dva[id]).collect();

            let inputs = AllocatorInputs {
                netting_set_id: ns,
                net_epe: &net_epe_paths,
                net_ene: &net_ene_paths,
                trade_values: &trade_values,
                trade_values_today: &trade_values_today,
                trade_cva: &trade_cva,
                trade_dva: &trade_dva,
                marginal_limit: config.marginal_allocation_limit,
            };
            let (alloc_epe, alloc_ene) =
                allocate_exposures(config.allocation_method, &inputs)?;

            let cpty = &self.counterparty[ns];
            let cpty_curve = market
                .survival_curve(cpty)
                .map_err(AggregationError::MarketData)?;
            let lgd_cpty = 1.0
                - market
                    .recovery_rate(cpty)
                    .map_err(AggregationError::MarketData)?;

            for (k, (_, trade_id)) in local.iter().enumerate() {
                let mut epe = vec![0.0; num_dates + 1];
                let mut ene = vec![0.0; num_dates + 1];
                for d in 0..=num_dates {
                    epe[d] = alloc_epe[k][d].iter().sum::<f64>() / samples as f64;
                    ene[d] = alloc_ene[k][d].iter().sum::<f64>() / samples as f64;
                }
                let allocated_cva = credit_integral(&epe, &times_ext, cpty_curve, lgd_cpty);
                let allocated_dva = match our {
                    Some((our_curve, lgd_own)) if Self::analytic_on(config, "dva") => {
                        credit_integral(&ene, &times_ext, our_curve, lgd_own)
                    }
                    _ => 0.0,
                };
                self.allocated_trade_epe.insert(trade_id.clone(), epe);
                self.allocated_trade_ene.insert(trade_id.clone(), ene);
                self.allocated_trade_cva
                    .insert(trade_id.clone(), allocated_cva);
                self.allocated_trade_dva
                    .insert(trade_id.clone(), allocated_dva);
            }
        }
        Ok(())
    }

    // ---- accessors -------------------------------------------------------

    pub fn trade_ids(&self) -> &[String] {
        &self.trade_ids
    }

    pub fn netting_set_ids(&self) -> &[String] {
        &self.netting_set_ids
    }

    pub fn counterparty_id(&self, netting_set_id: &str) -> Result<&str, AggregationError> {
        self.counterparty
            .get(netting_set_id)
            .map(String::as_str)
            .ok_or_else(|| AggregationError::UnknownNettingSet(netting_set_id.to_string()))
    }

    pub fn spread_sensitivity_times(&self) -> &[f64] {
        &self.cva_sensi_times
    }

    pub fn net_cube(&self) -> &NpvCube {
        &self.net_cube
    }

    pub fn dim_evolution(&self, netting_set_id: &str) -> Option<&Vec<f64>> {
        self.dim_evolution.get(netting_set_id)
    }

    pub fn trade_epe(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.trade_epe, id, false)
    }

    pub fn trade_ene(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.trade_ene, id, false)
    }

    pub fn trade_ee_b(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.trade_ee_b, id, false)
    }

    pub fn trade_eee_b(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.trade_eee_b, id, false)
    }

    pub fn trade_pfe(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.trade_pfe, id, false)
    }

    pub fn trade_epe_b(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.trade_epe_b, id, false)
    }

    pub fn trade_eepe_b(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.trade_eepe_b, id, false)
    }

    pub fn allocated_trade_epe(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.allocated_trade_epe, id, false)
    }

    pub fn allocated_trade_ene(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.allocated_trade_ene, id, false)
    }

    pub fn net_epe(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.net_epe, id, true)
    }

    pub fn net_ene(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.net_ene, id, true)
    }

    pub fn net_ee_b(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.net_ee_b, id, true)
    }

    pub fn net_eee_b(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.net_eee_b, id, true)
    }

    pub fn net_pfe(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.net_pfe, id, true)
    }

    pub fn net_epe_b(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.net_epe_b, id, true)
    }

    pub fn net_eepe_b(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.net_eepe_b, id, true)
    }

    pub fn expected_collateral(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.expected_collateral, id, true)
    }

    pub fn colva_increments(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.colva_inc, id, true)
    }

    pub fn collateral_floor_increments(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.collateral_floor_inc, id, true)
    }

    pub fn net_cva_hazard_rate_sensitivity(
        &self,
        id: &str,
    ) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.net_cva_hazard_sensi, id, true)
    }

    pub fn net_cva_spread_sensitivity(&self, id: &str) -> Result<&Vec<f64>, AggregationError> {
        profile(&self.net_cva_spread_sensi, id, true)
    }

    pub fn trade_cva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.trade_cva, id, false)
    }

    pub fn trade_dva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.trade_dva, id, false)
    }

    pub fn trade_fba(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.trade_fba, id)
    }

    pub fn trade_fca(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.trade_fca, id)
    }

    pub fn trade_fba_ex_own_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.trade_fba_ex_own_sp, id)
    }

    pub fn trade_fca_ex_own_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.trade_fca_ex_own_sp, id)
    }

    pub fn trade_fba_ex_all_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.trade_fba_ex_all_sp, id)
    }

    pub fn trade_fca_ex_all_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.trade_fca_ex_all_sp, id)
    }

    pub fn allocated_trade_cva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.allocated_trade_cva, id, false)
    }

    pub fn allocated_trade_dva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.allocated_trade_dva, id, false)
    }

    pub fn netting_set_cva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.netting_set_cva, id, true)
    }

    pub fn netting_set_dva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.netting_set_dva, id, true)
    }

    pub fn netting_set_mva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.netting_set_mva, id, true)
    }

    pub fn netting_set_fba(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.netting_set_fba, id)
    }

    pub fn netting_set_fca(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.netting_set_fca, id)
    }

    pub fn netting_set_fba_ex_own_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.netting_set_fba_ex_own_sp, id)
    }

    pub fn netting_set_fca_ex_own_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.netting_set_fca_ex_own_sp, id)
    }

    pub fn netting_set_fba_ex_all_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.netting_set_fba_ex_all_sp, id)
    }

    pub fn netting_set_fca_ex_all_sp(&self, id: &str) -> Result<f64, AggregationError> {
        scalar_or_zero(&self.netting_set_fca_ex_all_sp, id)
    }

    pub fn netting_set_colva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.netting_set_colva, id, true)
    }

    pub fn netting_set_collateral_floor(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.netting_set_collateral_floor, id, true)
    }

    pub fn netting_set_our_kva_ccr(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.our_kva_ccr, id, true)
    }

    pub fn netting_set_their_kva_ccr(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.their_kva_ccr, id, true)
    }

    pub fn netting_set_our_kva_cva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.our_kva_cva, id, true)
    }

    pub fn netting_set_their_kva_cva(&self, id: &str) -> Result<f64, AggregationError> {
        scalar(&self.their_kva_cva, id, true)
    }
}

fn profile<'a>(
    map: &'a ProfileMap,
    id: &str,
    is_netting_set: bool,
) -> Result<&'a Vec<f64>, AggregationError> {
    map.get(id).ok_or_else(|| unknown(id, is_netting_set))
}

fn scalar(map: &ScalarMap, id: &str, is_netting_set: bool) -> Result<f64, AggregationError> {
    map.get(id).copied().ok_or_else(|| unknown(id, is_netting_set))
}

// FVA maps are only populated when the analytic is on; absent means zero.
fn scalar_or_zero(map: &ScalarMap, id: &str) -> Result<f64, AggregationError> {
    Ok(map.get(id).copied().unwrap_or(0.0))
}

fn unknown(id: &str, is_netting_set: bool) -> AggregationError {
    if is_netting_set {
        AggregationError::UnknownNettingSet(id.to_string())
    } else {
        AggregationError::UnknownTrade(id.to_string())
    }
}

fn extend_times(times: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(times.len() + 1);
    out.push(0.0);
    out.extend_from_slice(times);
    out
}

/// Default-probability-weighted discount factor P(t) used for the Basel
/// exposure measures.
fn discount_weight(
    market: &Market,
    config: &PostProcessConfig,
    cpty_curve: &SurvivalCurve,
    t: f64,
) -> f64 {
    let df = market
        .discount_curve(&config.base_currency)
        .map(|c| c.discount_factor(t))
        .unwrap_or(1.0);
    df * cpty_curve.survival_prob(t)
}

/// Basel measures from a (t=0 inclusive) EPE profile: EE_B, EEE_B, and the
/// time-weighted one-year averages EPE_B / EEPE_B.
fn basel_measures(
    epe: &[f64],
    times_ext: &[f64],
    p: impl Fn(f64) -> f64,
) -> (Vec<f64>, Vec<f64>, f64, f64) {
    let n = epe.len();
    let mut ee_b = vec![0.0; n];
    let mut eee_b = vec![0.0; n];
    for k in 0..n {
        let weight = p(times_ext[k]).max(1.0e-12);
        ee_b[k] = epe[k] / weight;
        eee_b[k] = if k == 0 { ee_b[0] } else { eee_b[k - 1].max(ee_b[k]) };
    }
    let epe_b = one_year_average(&ee_b, times_ext);
    let eepe_b = one_year_average(&eee_b, times_ext);
    (ee_b, eee_b, epe_b, eepe_b)
}

/// Time-weighted average over the first year.
fn one_year_average(values: &[f64], times_ext: &[f64]) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for k in 1..values.len() {
        let t0 = times_ext[k - 1].min(1.0);
        let t1 = times_ext[k].min(1.0);
        let dt = t1 - t0;
        if dt <= 0.0 {
            break;
        }
        weighted += values[k] * dt;
        total += dt;
    }
    if total > 0.0 {
        weighted / total
    } else {
        values.first().copied().unwrap_or(0.0)
    }
}

/// Unilateral credit integral: sum of LGD x PD increment x trapezoidal
/// exposure. The exposure profile carries the numeraire discounting.
fn credit_integral(
    profile: &[f64],
    times_ext: &[f64],
    curve: &SurvivalCurve,
    lgd: f64,
) -> f64 {
    let mut total = 0.0;
    for k in 1..profile.len() {
        let pd = curve.default_prob(times_ext[k - 1], times_ext[k]);
        total += lgd * pd * 0.5 * (profile[k - 1] + profile[k]);
    }
    total
}

/// Funding integral: sum of spread x exposure x dt, optionally weighted by
/// one or two survival curves.
fn funding_integral(
    profile: &[f64],
    times_ext: &[f64],
    spread: &dyn Fn(f64) -> Result<f64, AggregationError>,
    survival_1: Option<&SurvivalCurve>,
    survival_2: Option<&SurvivalCurve>,
) -> Result<f64, AggregationError> {
    let mut total = 0.0;
    for k in 1..profile.len() {
        let t = times_ext[k];
        let dt = t - times_ext[k - 1];
        let s1 = survival_1.map_or(1.0, |c| c.survival_prob(t));
        let s2 = survival_2.map_or(1.0, |c| c.survival_prob(t));
        total += spread(t)? * 0.5 * (profile[k - 1] + profile[k]) * dt * s1 * s2;
    }
    Ok(total)
}

/// Cost-of-capital charge over an effective exposure profile.
///
/// `cva_risk_weight` switches between the CCR charge (IRB capital formula)
/// and the CVA capital charge (flat risk weight).
fn kva_charge(
    eee_b: &[f64],
    times_ext: &[f64],
    pd: f64,
    lgd: f64,
    maturity: f64,
    kva: &KvaParams,
    cva_risk_weight: Option<f64>,
) -> f64 {
    let mut total = 0.0;
    for k in 1..eee_b.len() {
        let t = times_ext[k];
        let dt = t - times_ext[k - 1];
        let ead = kva.alpha * eee_b[k];
        let capital = match cva_risk_weight {
            Some(rw) => rw * ead,
            None => irb_capital_ratio(pd, lgd, maturity) * ead,
        };
        total += capital
            * kva.reg_adjustment
            * kva.capital_hurdle
            * dt
            * (-kva.capital_discount_rate * t).exp();
    }
    total
}

/// Basel IRB capital ratio K for wholesale exposures.
fn irb_capital_ratio(pd: f64, lgd: f64, maturity: f64) -> f64 {
    let pd = pd.clamp(1.0e-4, 0.9999);
    let decay = (1.0 - (-50.0 * pd).exp()) / (1.0 - (-50.0_f64).exp());
    let correlation = 0.12 * decay + 0.24 * (1.0 - decay);
    let b = (0.11852 - 0.05478 * pd.ln()).powi(2);
    let m = maturity.clamp(1.0, 5.0);
    let maturity_adj = (1.0 + (m - 2.5) * b) / (1.0 - 1.5 * b);
    let quantile = (normal_inv_cdf(pd) + correlation.sqrt() * normal_inv_cdf(0.999))
        / (1.0 - correlation).sqrt();
    (lgd * (normal_cdf(quantile) - pd) * maturity_adj).max(0.0)
}
