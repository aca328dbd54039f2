//! Pricing-model capability set consumed by the script engine.
//!
//! The interpreter is polymorphic over [`Model`]; concrete models own the
//! stochastic state (paths, numeraires, regressors) and return
//! [`RandomVariable`]s of length `size()`. The historical fixing store is an
//! explicit handle threaded through the model rather than process-global
//! state.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::NaiveDate;

use crate::lang::random_variable::{Filter, RandomVariable};
use crate::market::{year_fraction, DayCountConvention};

/// Discretization family of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    MonteCarlo,
    FiniteDifference,
}

/// Historical index fixings keyed by (index name, fixing date).
#[derive(Debug, Clone, Default)]
pub struct FixingStore {
    fixings: BTreeMap<(String, NaiveDate), f64>,
}

impl FixingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, index: impl Into<String>, date: NaiveDate, value: f64) {
        self.fixings.insert((index.into(), date), value);
    }

    pub fn get(&self, index: &str, date: NaiveDate) -> Option<f64> {
        self.fixings.get(&(index.to_string(), date)).copied()
    }

    pub fn has(&self, index: &str, date: NaiveDate) -> bool {
        self.fixings.contains_key(&(index.to_string(), date))
    }

    pub fn len(&self) -> usize {
        self.fixings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixings.is_empty()
    }
}

/// Optional parameter block of `fwdComp`/`fwdAvg`.
#[derive(Debug, Clone, Copy)]
pub struct FwdCompAvgParams {
    pub spread: f64,
    pub gearing: f64,
    pub lookback: i64,
    pub rate_cutoff: u32,
    pub fixing_days: u32,
    pub include_spread: bool,
    pub cap: f64,
    pub floor: f64,
    pub naked_option: bool,
    pub local_cap_floor: bool,
}

impl Default for FwdCompAvgParams {
    fn default() -> Self {
        Self {
            spread: 0.0,
            gearing: 1.0,
            lookback: 0,
            rate_cutoff: 0,
            fixing_days: 0,
            include_spread: false,
            cap: 999_999.0,
            floor: -999_999.0,
            naked_option: false,
            local_cap_floor: false,
        }
    }
}

/// Capability set the interpreter drives. All date arguments are calendar
/// dates; methods returning lanes must produce variables of length `size()`.
pub trait Model: Send + Sync {
    /// Number of Monte-Carlo samples (1 for deterministic models).
    fn size(&self) -> usize;

    /// Valuation date.
    fn reference_date(&self) -> NaiveDate;

    /// Year fraction used for volatility time.
    fn dt(&self, from: NaiveDate, to: NaiveDate) -> f64;

    /// Discounted payoff observed at `obs`, paid at `pay` in `ccy`,
    /// numeraire-normalized and expressed at the observation time.
    fn pay(
        &self,
        amount: &RandomVariable,
        obs: NaiveDate,
        pay: NaiveDate,
        ccy: &str,
    ) -> Result<RandomVariable, String>;

    /// Path-wise discount factor from `pay` back to `obs` in `ccy`.
    fn discount(&self, obs: NaiveDate, pay: NaiveDate, ccy: &str)
        -> Result<RandomVariable, String>;

    /// Conditional expectation of `amount` at `obs`, via regression on path
    /// state. `mem_slot` keys a reusable regression basis across
    /// evaluations; `filter` restricts the regression sample.
    fn npv(
        &self,
        amount: &RandomVariable,
        obs: NaiveDate,
        filter: Option<&Filter>,
        mem_slot: Option<i64>,
        add_regressor_1: Option<&RandomVariable>,
        add_regressor_2: Option<&RandomVariable>,
    ) -> Result<RandomVariable, String>;

    /// Realization of `index` at `obs`, or its forward seen from `obs` for
    /// delivery at `fwd`.
    fn eval(
        &self,
        index: &str,
        obs: NaiveDate,
        fwd: Option<NaiveDate>,
    ) -> Result<RandomVariable, String>;

    /// Compounded (or averaged) overnight-rate coupon over `[start, end]`.
    #[allow(clippy::too_many_arguments)]
    fn fwd_comp_avg(
        &self,
        is_avg: bool,
        index: &str,
        obs: NaiveDate,
        start: NaiveDate,
        end: NaiveDate,
        params: &FwdCompAvgParams,
    ) -> Result<RandomVariable, String>;

    /// Path-wise probability that `index` crosses `barrier` within
    /// `[obs1, obs2]`, from above or below.
    fn barrier_probability(
        &self,
        index: &str,
        obs1: NaiveDate,
        obs2: NaiveDate,
        barrier: &RandomVariable,
        above: bool,
    ) -> Result<RandomVariable, String>;

    fn model_type(&self) -> ModelType;

    /// Historical fixings consulted by `histfixing`.
    fn fixing_store(&self) -> &FixingStore;
}

/// Deterministic single-index model on flat per-currency short rates.
///
/// Indices grow at the base rate from their spot; discounting is
/// `exp(-r (t2 - t1))`. `npv` reduces to the identity under a trivial
/// regression basis, with memory slots recording the first basis seen per
/// slot so cross-evaluation reuse is observable. Used by the engine tests
/// and the demo pipeline.
#[derive(Debug)]
pub struct FlatForwardModel {
    samples: usize,
    reference_date: NaiveDate,
    rates: BTreeMap<String, f64>,
    index_spots: BTreeMap<String, f64>,
    base_rate: f64,
    fixings: FixingStore,
    npv_memory: Mutex<BTreeMap<i64, usize>>,
}

impl FlatForwardModel {
    pub fn new(samples: usize, reference_date: NaiveDate, base_rate: f64) -> Self {
        Self {
            samples,
            reference_date,
            rates: BTreeMap::new(),
            index_spots: BTreeMap::new(),
            base_rate,
            fixings: FixingStore::new(),
            npv_memory: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_rate(mut self, ccy: impl Into<String>, rate: f64) -> Self {
        self.rates.insert(ccy.into(), rate);
        self
    }

    pub fn with_index_spot(mut self, index: impl Into<String>, spot: f64) -> Self {
        self.index_spots.insert(index.into(), spot);
        self
    }

    pub fn with_fixing(mut self, index: impl Into<String>, date: NaiveDate, value: f64) -> Self {
        self.fixings.add(index, date, value);
        self
    }

    fn rate(&self, ccy: &str) -> Result<f64, String> {
        self.rates
            .get(ccy)
            .copied()
            .ok_or_else(|| format!("no rate configured for currency {ccy}"))
    }
}

impl Model for FlatForwardModel {
    fn size(&self) -> usize {
        self.samples
    }

    fn reference_date(&self) -> NaiveDate {
        self.reference_date
    }

    fn dt(&self, from: NaiveDate, to: NaiveDate) -> f64 {
        year_fraction(from, to, DayCountConvention::Act365Fixed)
    }

    fn pay(
        &self,
        amount: &RandomVariable,
        obs: NaiveDate,
        pay: NaiveDate,
        ccy: &str,
    ) -> Result<RandomVariable, String> {
        if pay <= self.reference_date {
            return Ok(RandomVariable::new(self.samples, 0.0));
        }
        let df = self.discount(obs, pay, ccy)?;
        let mut result = amount * &df;
        result.set_time(Some(self.dt(self.reference_date, obs)));
        Ok(result)
    }

    fn discount(
        &self,
        obs: NaiveDate,
        pay: NaiveDate,
        ccy: &str,
    ) -> Result<RandomVariable, String> {
        let r = self.rate(ccy)?;
        let t = self.dt(obs, pay);
        let mut df = RandomVariable::new(self.samples, (-r * t).exp());
        df.set_time(Some(self.dt(self.reference_date, obs)));
        Ok(df)
    }

    fn npv(
        &self,
        amount: &RandomVariable,
        obs: NaiveDate,
        _filter: Option<&Filter>,
        mem_slot: Option<i64>,
        _add_regressor_1: Option<&RandomVariable>,
        _add_regressor_2: Option<&RandomVariable>,
    ) -> Result<RandomVariable, String> {
        if let Some(slot) = mem_slot {
            // Record the basis size for the slot; later evaluations reuse it.
            let mut memory = self
                .npv_memory
                .lock()
                .map_err(|_| "npv memory poisoned".to_string())?;
            memory.entry(slot).or_insert(self.samples);
        }
        // Deterministic model: the conditional expectation is the mean.
        let mut result = RandomVariable::new(self.samples, amount.expectation());
        result.set_time(Some(self.dt(self.reference_date, obs)));
        Ok(result)
    }

    fn eval(
        &self,
        index: &str,
        obs: NaiveDate,
        fwd: Option<NaiveDate>,
    ) -> Result<RandomVariable, String> {
        let spot = self
            .index_spots
            .get(index)
            .copied()
            .ok_or_else(|| format!("unknown index {index}"))?;
        if obs <= self.reference_date {
            if let Some(fixing) = self.fixings.get(index, obs) {
                return Ok(RandomVariable::new(self.samples, fixing));
            }
        }
        let horizon = fwd.unwrap_or(obs);
        let t = self.dt(self.reference_date, horizon);
        let mut result = RandomVariable::new(self.samples, spot * (self.base_rate * t).exp());
        result.set_time(Some(self.dt(self.reference_date, obs)));
        Ok(result)
    }

    fn fwd_comp_avg(
        &self,
        _is_avg: bool,
        index: &str,
        obs: NaiveDate,
        start: NaiveDate,
        end: NaiveDate,
        params: &FwdCompAvgParams,
    ) -> Result<RandomVariable, String> {
        let _ = self
            .index_spots
            .get(index)
            .ok_or_else(|| format!("unknown index {index}"))?;
        // Flat curve: the compounded and averaged rates coincide with the
        // base rate over the accrual period.
        let accrual = self.dt(start, end);
        if accrual <= 0.0 {
            return Err(format!("non-positive accrual from {start} to {end}"));
        }
        let raw = self.base_rate * params.gearing + params.spread;
        let capped = raw.clamp(params.floor, params.cap);
        let mut result = RandomVariable::new(self.samples, capped);
        result.set_time(Some(self.dt(self.reference_date, obs)));
        Ok(result)
    }

    fn barrier_probability(
        &self,
        index: &str,
        _obs1: NaiveDate,
        _obs2: NaiveDate,
        barrier: &RandomVariable,
        above: bool,
    ) -> Result<RandomVariable, String> {
        let spot = self
            .index_spots
            .get(index)
            .copied()
            .ok_or_else(|| format!("unknown index {index}"))?;
        // Deterministic paths either touch the barrier or never do.
        let lanes = (0..self.samples)
            .map(|k| {
                let b = barrier.at(k);
                let crossed = if above { spot >= b } else { spot <= b };
                if crossed {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();
        Ok(RandomVariable::from_lanes(lanes))
    }

    fn model_type(&self) -> ModelType {
        ModelType::MonteCarlo
    }

    fn fixing_store(&self) -> &FixingStore {
        &self.fixings
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn model() -> FlatForwardModel {
        FlatForwardModel::new(1, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(), 0.05)
            .with_rate("USD", 0.05)
            .with_index_spot("EQ-ACME", 100.0)
    }

    #[test]
    fn discount_bond_matches_flat_curve() {
        let m = model();
        let obs = m.reference_date();
        let pay = NaiveDate::from_ymd_opt(2027, 8, 1).unwrap();
        let one = RandomVariable::new(1, 1.0);
        let v = m.pay(&one, obs, pay, "USD").unwrap();
        assert!(v.deterministic());
        assert_relative_eq!(v.at(0), (-0.05_f64).exp(), epsilon = 1e-10);
    }

    #[test]
    fn past_payment_is_zero() {
        let m = model();
        let past = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let one = RandomVariable::new(1, 1.0);
        let v = m.pay(&one, past, past, "USD").unwrap();
        assert!(v.deterministic());
        assert_relative_eq!(v.at(0), 0.0, epsilon = 0.0);
    }

    #[test]
    fn eval_prefers_historical_fixing() {
        let fix_date = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let m = model().with_fixing("EQ-ACME", fix_date, 97.5);
        let v = m.eval("EQ-ACME", fix_date, None).unwrap();
        assert_relative_eq!(v.at(0), 97.5, epsilon = 0.0);
    }

    #[test]
    fn unknown_currency_is_an_error() {
        let m = model();
        let obs = m.reference_date();
        let pay = NaiveDate::from_ymd_opt(2027, 8, 1).unwrap();
        assert!(m.discount(obs, pay, "JPY").is_err());
    }
}
