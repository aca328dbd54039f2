//! Scenario market abstraction the valuation driver advances through the
//! simulation grid, plus a seeded lognormal implementation used by the demo
//! pipeline and the tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::market::{year_fraction, DayCountConvention};

/// Read side of a simulated market state: what calculators and instruments
/// see at one (sample, date) coordinate.
pub trait ScenarioMarket: Send + Sync {
    /// Current evaluation date.
    fn asof(&self) -> NaiveDate;

    fn base_currency(&self) -> &str;

    /// Numeraire of the simulation measure at the current state.
    fn numeraire(&self) -> f64;

    /// FX spot vs the base currency at the current state.
    fn fx_spot(&self, ccy: &str) -> Result<f64, String>;

    /// Flat short rate of a currency at the current state.
    fn discount_rate(&self, ccy: &str) -> Result<f64, String>;

    /// Index value at the current state.
    fn index_value(&self, name: &str) -> Result<f64, String>;
}

/// Write side: the valuation driver positions the market on a scenario.
pub trait SimMarket: ScenarioMarket + Clone + Send {
    /// Moves the market to sample `sample` at evaluation date `date`.
    fn advance(&mut self, sample: usize, date: NaiveDate);

    /// Returns to the t=0 state.
    fn reset(&mut self);

    fn fx_currencies(&self) -> Vec<String>;

    fn index_names(&self) -> Vec<String>;
}

/// Seeded lognormal scenario market.
///
/// Each index and FX pair follows a one-factor lognormal evolution driven by
/// a per-(sample, name) standard normal, so a given (seed, sample, date)
/// coordinate always reproduces the same state regardless of visit order.
/// The numeraire accrues at the base-currency rate.
#[derive(Debug, Clone)]
pub struct DeterministicSimMarket {
    t0: NaiveDate,
    current: NaiveDate,
    current_sample: usize,
    base_ccy: String,
    seed: u64,
    rates: BTreeMap<String, f64>,
    fx: BTreeMap<String, (f64, f64)>,
    indices: BTreeMap<String, (f64, f64)>,
}

impl DeterministicSimMarket {
    pub fn new(t0: NaiveDate, base_ccy: impl Into<String>, base_rate: f64) -> Self {
        let base_ccy = base_ccy.into();
        let mut rates = BTreeMap::new();
        rates.insert(base_ccy.clone(), base_rate);
        Self {
            t0,
            current: t0,
            current_sample: 0,
            base_ccy,
            seed: 42,
            rates,
            fx: BTreeMap::new(),
            indices: BTreeMap::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn add_currency(&mut self, ccy: impl Into<String>, rate: f64) {
        self.rates.insert(ccy.into(), rate);
    }

    /// FX spot vs base with lognormal volatility.
    pub fn add_fx(&mut self, ccy: impl Into<String>, spot: f64, vol: f64) {
        self.fx.insert(ccy.into(), (spot, vol));
    }

    pub fn add_index(&mut self, name: impl Into<String>, spot: f64, vol: f64) {
        self.indices.insert(name.into(), (spot, vol));
    }

    fn horizon(&self) -> f64 {
        year_fraction(self.t0, self.current, DayCountConvention::Act365Fixed)
    }

    fn driver(&self, name: &str) -> f64 {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        self.current_sample.hash(&mut hasher);
        name.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());
        rng.sample(StandardNormal)
    }

    fn evolve(&self, spot: f64, vol: f64, drift: f64, name: &str) -> f64 {
        let t = self.horizon();
        if t <= 0.0 {
            return spot;
        }
        let z = self.driver(name);
        spot * ((drift - 0.5 * vol * vol) * t + vol * t.sqrt() * z).exp()
    }
}

impl ScenarioMarket for DeterministicSimMarket {
    fn asof(&self) -> NaiveDate {
        self.current
    }

    fn base_currency(&self) -> &str {
        &self.base_ccy
    }

    fn numeraire(&self) -> f64 {
        let base_rate = self.rates[&self.base_ccy];
        (base_rate * self.horizon()).exp()
    }

    fn fx_spot(&self, ccy: &str) -> Result<f64, String> {
        if ccy == self.base_ccy {
            return Ok(1.0);
        }
        let (spot, vol) = self
            .fx
            .get(ccy)
            .copied()
            .ok_or_else(|| format!("no FX spot for {ccy} vs {}", self.base_ccy))?;
        let foreign = self
            .rates
            .get(ccy)
            .copied()
            .ok_or_else(|| format!("no rate for currency {ccy}"))?;
        let domestic = self.rates[&self.base_ccy];
        Ok(self.evolve(spot, vol, domestic - foreign, ccy))
    }

    fn discount_rate(&self, ccy: &str) -> Result<f64, String> {
        self.rates
            .get(ccy)
            .copied()
            .ok_or_else(|| format!("no rate for currency {ccy}"))
    }

    fn index_value(&self, name: &str) -> Result<f64, String> {
        let (spot, vol) = self
            .indices
            .get(name)
            .copied()
            .ok_or_else(|| format!("unknown index {name}"))?;
        let drift = self.rates[&self.base_ccy];
        Ok(self.evolve(spot, vol, drift, name))
    }
}

impl SimMarket for DeterministicSimMarket {
    fn advance(&mut self, sample: usize, date: NaiveDate) {
        self.current_sample = sample;
        self.current = date;
    }

    fn reset(&mut self) {
        self.current_sample = 0;
        self.current = self.t0;
    }

    fn fx_currencies(&self) -> Vec<String> {
        self.fx.keys().cloned().collect()
    }

    fn index_names(&self) -> Vec<String> {
        self.indices.keys().cloned().collect()
    }
}
