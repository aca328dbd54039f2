//! Deterministic market data consumed by the XVA post-processor: discount
//! curves, survival curves, FX spots and funding spreads.

mod daycount;

pub use daycount::{day_count, parse_day_counter, year_fraction, DayCountConvention};

use std::collections::BTreeMap;

/// Discount-factor term structure keyed by maturity tenor in years.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldCurve {
    /// Curve nodes as `(tenor, discount_factor)`.
    pub tenors: Vec<(f64, f64)>,
}

impl YieldCurve {
    /// Creates a curve from unsorted discount-factor nodes.
    pub fn new(mut tenors: Vec<(f64, f64)>) -> Self {
        tenors.retain(|(t, df)| *t > 0.0 && *df > 0.0);
        tenors.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { tenors }
    }

    /// Flat curve at a continuously-compounded rate.
    pub fn flat(rate: f64) -> Self {
        let tenors = (1..=50)
            .map(|i| {
                let t = i as f64;
                (t, (-rate * t).exp())
            })
            .collect();
        Self { tenors }
    }

    /// Returns discount factor at tenor `t` using log-linear interpolation.
    pub fn discount_factor(&self, t: f64) -> f64 {
        if t <= 0.0 || self.tenors.is_empty() {
            return 1.0;
        }
        let first = self.tenors[0];
        if t <= first.0 {
            // log-linear from (0, 1)
            return first.1.powf(t / first.0);
        }
        for window in self.tenors.windows(2) {
            let (t1, df1) = window[0];
            let (t2, df2) = window[1];
            if t <= t2 {
                let w = (t - t1) / (t2 - t1);
                return (df1.ln() * (1.0 - w) + df2.ln() * w).exp();
            }
        }
        // Flat-forward extrapolation past the last node.
        let (tn, dfn) = *self.tenors.last().unwrap_or(&(1.0, 1.0));
        let zero = -dfn.ln() / tn;
        (-zero * t).exp()
    }

    /// Returns continuously-compounded zero rate at tenor `t`.
    pub fn zero_rate(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        -self.discount_factor(t).ln() / t
    }

    /// Returns continuously-compounded forward rate between `t1` and `t2`.
    pub fn forward_rate(&self, t1: f64, t2: f64) -> f64 {
        assert!(t2 > t1, "t2 must be greater than t1");
        (self.discount_factor(t1) / self.discount_factor(t2)).ln() / (t2 - t1)
    }
}

/// Survival-probability term structure keyed by maturity tenor in years.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalCurve {
    /// Curve nodes as `(tenor, survival_probability)`.
    pub tenors: Vec<(f64, f64)>,
}

impl SurvivalCurve {
    /// Creates a survival curve from unsorted nodes, keeping probabilities
    /// monotone non-increasing.
    pub fn new(mut tenors: Vec<(f64, f64)>) -> Self {
        tenors.retain(|(t, p)| *t > 0.0 && *p > 0.0);
        tenors.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut cleaned: Vec<(f64, f64)> = Vec::with_capacity(tenors.len());
        let mut prev_prob = 1.0_f64;
        for (t, p) in tenors {
            let prob = p.clamp(1.0e-12, 1.0).min(prev_prob);
            match cleaned.last_mut() {
                Some(last) if (last.0 - t).abs() <= 1.0e-12 => last.1 = prob,
                _ => cleaned.push((t, prob)),
            }
            prev_prob = prob;
        }
        Self { tenors: cleaned }
    }

    /// Builds a survival curve from piecewise-constant hazard rates.
    pub fn from_piecewise_hazard(tenors: &[f64], hazards: &[f64]) -> Self {
        assert_eq!(
            tenors.len(),
            hazards.len(),
            "tenors and hazards must have same length"
        );
        let mut points = Vec::with_capacity(tenors.len());
        let mut cum_hazard = 0.0;
        let mut prev_t = 0.0;
        for (&t, &h) in tenors.iter().zip(hazards.iter()) {
            if t <= prev_t {
                continue;
            }
            cum_hazard += h.max(0.0) * (t - prev_t);
            points.push((t, (-cum_hazard).exp()));
            prev_t = t;
        }
        Self::new(points)
    }

    /// Returns survival probability at tenor `t` (log-linear interpolation,
    /// flat-hazard extrapolation).
    pub fn survival_prob(&self, t: f64) -> f64 {
        if t <= 0.0 || self.tenors.is_empty() {
            return 1.0;
        }
        let first = self.tenors[0];
        if t <= first.0 {
            return first.1.powf(t / first.0);
        }
        for window in self.tenors.windows(2) {
            let (t1, p1) = window[0];
            let (t2, p2) = window[1];
            if t <= t2 {
                let w = (t - t1) / (t2 - t1);
                return (p1.ln() * (1.0 - w) + p2.ln() * w).exp();
            }
        }
        let (tn, pn) = *self.tenors.last().unwrap_or(&(1.0, 1.0));
        let hazard = -pn.ln() / tn;
        (-hazard * t).exp()
    }

    /// Returns default probability in `(t1, t2]`.
    pub fn default_prob(&self, t1: f64, t2: f64) -> f64 {
        if t2 <= t1 {
            return 0.0;
        }
        (self.survival_prob(t1) - self.survival_prob(t2)).clamp(0.0, 1.0)
    }

    /// Copy of the curve with every pillar hazard shifted by `shift`
    /// (additive), used for CVA spread sensitivities.
    pub fn bumped(&self, pillar: usize, shift: f64) -> SurvivalCurve {
        let mut hazards = Vec::with_capacity(self.tenors.len());
        let mut tenors = Vec::with_capacity(self.tenors.len());
        let mut prev_t = 0.0;
        let mut prev_p = 1.0;
        for (i, &(t, p)) in self.tenors.iter().enumerate() {
            let mut h = -(p / prev_p).ln() / (t - prev_t);
            if i == pillar {
                h += shift;
            }
            hazards.push(h);
            tenors.push(t);
            prev_t = t;
            prev_p = p;
        }
        SurvivalCurve::from_piecewise_hazard(&tenors, &hazards)
    }

    pub fn num_pillars(&self) -> usize {
        self.tenors.len()
    }
}

/// Market container handed to the post-processor: per-currency discounting,
/// named credit curves, FX spots against the base currency, and named
/// funding/collateral spread quotes.
#[derive(Debug, Clone, Default)]
pub struct Market {
    pub base_currency: String,
    discount_curves: BTreeMap<String, YieldCurve>,
    survival_curves: BTreeMap<String, SurvivalCurve>,
    recovery_rates: BTreeMap<String, f64>,
    fx_spots: BTreeMap<String, f64>,
    spread_curves: BTreeMap<String, YieldCurve>,
}

impl Market {
    pub fn new(base_currency: impl Into<String>) -> Self {
        Self {
            base_currency: base_currency.into(),
            ..Self::default()
        }
    }

    pub fn add_discount_curve(&mut self, ccy: impl Into<String>, curve: YieldCurve) {
        self.discount_curves.insert(ccy.into(), curve);
    }

    pub fn add_survival_curve(
        &mut self,
        name: impl Into<String>,
        curve: SurvivalCurve,
        recovery: f64,
    ) {
        let name = name.into();
        self.recovery_rates.insert(name.clone(), recovery);
        self.survival_curves.insert(name, curve);
    }

    /// FX spot quoted as units of base currency per unit of `ccy`.
    pub fn add_fx_spot(&mut self, ccy: impl Into<String>, spot: f64) {
        self.fx_spots.insert(ccy.into(), spot);
    }

    pub fn add_spread_curve(&mut self, name: impl Into<String>, curve: YieldCurve) {
        self.spread_curves.insert(name.into(), curve);
    }

    pub fn discount_curve(&self, ccy: &str) -> Result<&YieldCurve, String> {
        self.discount_curves
            .get(ccy)
            .ok_or_else(|| format!("no discount curve for currency {ccy}"))
    }

    pub fn survival_curve(&self, name: &str) -> Result<&SurvivalCurve, String> {
        self.survival_curves
            .get(name)
            .ok_or_else(|| format!("no survival curve '{name}'"))
    }

    pub fn recovery_rate(&self, name: &str) -> Result<f64, String> {
        self.recovery_rates
            .get(name)
            .copied()
            .ok_or_else(|| format!("no recovery rate for '{name}'"))
    }

    pub fn fx_spot(&self, ccy: &str) -> Result<f64, String> {
        if ccy == self.base_currency {
            return Ok(1.0);
        }
        self.fx_spots
            .get(ccy)
            .copied()
            .ok_or_else(|| format!("no FX spot for {ccy} vs {}", self.base_currency))
    }

    /// Funding/collateral spread read off a named curve's zero rate.
    pub fn spread(&self, name: &str, t: f64) -> Result<f64, String> {
        self.spread_curves
            .get(name)
            .map(|c| c.zero_rate(t))
            .ok_or_else(|| format!("no spread curve '{name}'"))
    }

    pub fn has_spread_curve(&self, name: &str) -> bool {
        self.spread_curves.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn flat_curve_discounts_exponentially() {
        let yc = YieldCurve::flat(0.05);
        assert_relative_eq!(yc.discount_factor(1.0), (-0.05_f64).exp(), epsilon = 1e-10);
        assert_relative_eq!(yc.zero_rate(7.3), 0.05, epsilon = 1e-10);
    }

    #[test]
    fn log_linear_interpolation_between_nodes() {
        let yc = YieldCurve::new(vec![(1.0, 0.95), (3.0, 0.85)]);
        let mid = yc.discount_factor(2.0);
        let expected = (0.95_f64.ln() * 0.5 + 0.85_f64.ln() * 0.5).exp();
        assert_relative_eq!(mid, expected, epsilon = 1e-12);
    }

    #[test]
    fn piecewise_hazard_survival_is_consistent() {
        let sc = SurvivalCurve::from_piecewise_hazard(&[1.0, 2.0], &[0.02, 0.02]);
        assert_relative_eq!(sc.survival_prob(2.0), (-0.04_f64).exp(), epsilon = 1e-10);
        assert_relative_eq!(
            sc.default_prob(1.0, 2.0),
            (-0.02_f64).exp() - (-0.04_f64).exp(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn bumping_one_pillar_moves_later_survival() {
        let sc = SurvivalCurve::from_piecewise_hazard(&[1.0, 2.0, 3.0], &[0.02, 0.02, 0.02]);
        let bumped = sc.bumped(1, 0.0001);
        assert_relative_eq!(sc.survival_prob(1.0), bumped.survival_prob(1.0), epsilon = 1e-12);
        assert!(bumped.survival_prob(2.0) < sc.survival_prob(2.0));
    }

    #[test]
    fn market_lookups_are_checked() {
        let mut market = Market::new("USD");
        market.add_discount_curve("USD", YieldCurve::flat(0.03));
        market.add_fx_spot("EUR", 1.1);
        assert!(market.discount_curve("USD").is_ok());
        assert!(market.discount_curve("GBP").is_err());
        assert_relative_eq!(market.fx_spot("USD").unwrap(), 1.0);
        assert_relative_eq!(market.fx_spot("EUR").unwrap(), 1.1);
    }
}
