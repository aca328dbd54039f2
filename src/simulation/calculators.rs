//! Per-trade cube calculators invoked by the valuation driver.
//!
//! Each calculator owns one depth slot of the output cube. Per-trade
//! valuation failures are caught here: the offending slot is left at zero,
//! an error is logged, and the run continues.

use chrono::NaiveDate;
use tracing::error;

use crate::cube::NpvCube;
use crate::portfolio::Trade;
use crate::simulation::market::ScenarioMarket;

/// Per-sample scratch buffer one worker fills before the driver merges it
/// into the cube: dense (trade, date, depth) block for a single sample.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    trades: usize,
    dates: usize,
    depth: usize,
    data: Vec<f32>,
}

impl SampleBuffer {
    pub fn new(trades: usize, dates: usize, depth: usize) -> Self {
        Self {
            trades,
            dates,
            depth,
            data: vec![0.0; trades * dates * depth],
        }
    }

    pub fn set(&mut self, value: f64, trade: usize, date: usize, depth_slot: usize) {
        debug_assert!(trade < self.trades && date < self.dates && depth_slot < self.depth);
        self.data[(trade * self.dates + date) * self.depth + depth_slot] = value as f32;
    }

    /// The (date x depth) block of one trade, matching the cube's sample
    /// block layout.
    pub fn trade_block(&self, trade: usize) -> &[f32] {
        let stride = self.dates * self.depth;
        &self.data[trade * stride..(trade + 1) * stride]
    }
}

/// A calculator writes one value per (trade, date, sample) into its depth
/// slot, and fills the T0 row once per trade.
pub trait ValuationCalculator: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn calculate(
        &self,
        trade: &Trade,
        trade_index: usize,
        market: &dyn ScenarioMarket,
        output: &mut SampleBuffer,
        date: NaiveDate,
        date_index: usize,
        is_close_out: bool,
    );

    fn calculate_t0(
        &self,
        trade: &Trade,
        trade_index: usize,
        market: &dyn ScenarioMarket,
        cube: &mut NpvCube,
    );
}

/// Writes `instrument NPV x fx(tradeCcy -> base) / numeraire` into its slot.
pub struct NpvCalculator {
    index: usize,
}

impl NpvCalculator {
    pub fn new(index: usize) -> Self {
        Self { index }
    }

    fn npv(&self, trade: &Trade, market: &dyn ScenarioMarket) -> Result<f64, String> {
        let npv = trade.instrument.npv(market)?;
        let fx = market.fx_spot(&trade.currency)?;
        Ok(npv * fx / market.numeraire())
    }
}

impl ValuationCalculator for NpvCalculator {
    fn calculate(
        &self,
        trade: &Trade,
        trade_index: usize,
        market: &dyn ScenarioMarket,
        output: &mut SampleBuffer,
        _date: NaiveDate,
        date_index: usize,
        is_close_out: bool,
    ) {
        if is_close_out {
            return;
        }
        match self.npv(trade, market) {
            Ok(value) => output.set(value, trade_index, date_index, self.index),
            Err(e) => {
                error!(trade = %trade.id, "failed to calculate NPV: {e}");
            }
        }
    }

    fn calculate_t0(
        &self,
        trade: &Trade,
        trade_index: usize,
        market: &dyn ScenarioMarket,
        cube: &mut NpvCube,
    ) {
        match self.npv(trade, market) {
            Ok(value) => {
                if let Err(e) = cube.set_t0(value, trade_index, self.index) {
                    error!(trade = %trade.id, "failed to store T0 NPV: {e}");
                }
            }
            Err(e) => {
                error!(trade = %trade.id, "failed to calculate T0 NPV: {e}");
            }
        }
    }
}

/// Sums flows with payment date in `(grid[d], grid[d+1]]`, converts to base
/// currency and deflates by the numeraire. Flows of option underlyings
/// count only once the option is exercised with physical delivery.
pub struct CashflowCalculator {
    grid: Vec<NaiveDate>,
    index: usize,
}

impl CashflowCalculator {
    pub fn new(grid: Vec<NaiveDate>, index: usize) -> Self {
        Self { grid, index }
    }

    fn net_flow(
        &self,
        trade: &Trade,
        market: &dyn ScenarioMarket,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<f64, String> {
        let mut long_short = 1.0;
        if let Some(option) = &trade.option {
            if !(option.exercised && option.physical_delivery) {
                return Ok(0.0);
            }
            long_short = if option.long { 1.0 } else { -1.0 };
        }
        let mut net_flow = 0.0;
        for leg in &trade.legs {
            let mut leg_flow = 0.0;
            for &(pay_date, amount) in &leg.flows {
                // Take flows in (t, t+1].
                if start < pay_date && pay_date <= end {
                    leg_flow += amount;
                }
            }
            if leg_flow != 0.0 {
                let fx = market.fx_spot(&leg.currency)?;
                let direction = if leg.payer { -1.0 } else { 1.0 };
                net_flow += leg_flow * direction * long_short * fx;
            }
        }
        Ok(net_flow)
    }
}

impl ValuationCalculator for CashflowCalculator {
    fn calculate(
        &self,
        trade: &Trade,
        trade_index: usize,
        market: &dyn ScenarioMarket,
        output: &mut SampleBuffer,
        date: NaiveDate,
        date_index: usize,
        is_close_out: bool,
    ) {
        if is_close_out {
            return;
        }
        let start = date;
        let end = if Some(&date) == self.grid.last() {
            date
        } else {
            self.grid[date_index + 1]
        };
        let flow = match self.net_flow(trade, market, start, end) {
            Ok(flow) => flow,
            Err(e) => {
                error!(trade = %trade.id, "failed to calculate cashflows: {e}");
                0.0
            }
        };
        output.set(flow / market.numeraire(), trade_index, date_index, self.index);
    }

    fn calculate_t0(
        &self,
        _trade: &Trade,
        _trade_index: usize,
        _market: &dyn ScenarioMarket,
        _cube: &mut NpvCube,
    ) {
        // Flows before the first grid date are not part of the cube.
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::portfolio::{Instrument, Leg, OptionTerms};
    use crate::simulation::DeterministicSimMarket;

    #[derive(Debug)]
    struct FixedNpv(f64);

    impl Instrument for FixedNpv {
        fn npv(&self, _market: &dyn ScenarioMarket) -> Result<f64, String> {
            Ok(self.0)
        }
    }

    #[derive(Debug)]
    struct FailingNpv;

    impl Instrument for FailingNpv {
        fn npv(&self, _market: &dyn ScenarioMarket) -> Result<f64, String> {
            Err("engine unavailable".to_string())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn trade(instrument: Arc<dyn Instrument>) -> Trade {
        Trade {
            id: "TRD-1".into(),
            netting_set_id: "NS-1".into(),
            counterparty: "CPTY".into(),
            currency: "USD".into(),
            maturity: date(2027, 8, 1),
            legs: vec![Leg {
                currency: "USD".into(),
                payer: false,
                flows: vec![(date(2026, 9, 15), 100.0), (date(2026, 11, 15), 50.0)],
            }],
            option: None,
            instrument,
        }
    }

    #[test]
    fn npv_calculator_deflates_by_numeraire() {
        let market = DeterministicSimMarket::new(date(2026, 8, 1), "USD", 0.0);
        let t = trade(Arc::new(FixedNpv(250.0)));
        let mut buffer = SampleBuffer::new(1, 1, 1);
        let calc = NpvCalculator::new(0);
        calc.calculate(&t, 0, &market, &mut buffer, date(2026, 8, 1), 0, false);
        assert_eq!(buffer.trade_block(0)[0], 250.0);
    }

    #[test]
    fn failed_npv_leaves_slot_at_zero() {
        let market = DeterministicSimMarket::new(date(2026, 8, 1), "USD", 0.0);
        let t = trade(Arc::new(FailingNpv));
        let mut buffer = SampleBuffer::new(1, 1, 1);
        NpvCalculator::new(0).calculate(&t, 0, &market, &mut buffer, date(2026, 8, 1), 0, false);
        assert_eq!(buffer.trade_block(0)[0], 0.0);
    }

    #[test]
    fn close_out_dates_skip_writes() {
        let market = DeterministicSimMarket::new(date(2026, 8, 1), "USD", 0.0);
        let t = trade(Arc::new(FixedNpv(250.0)));
        let mut buffer = SampleBuffer::new(1, 1, 1);
        NpvCalculator::new(0).calculate(&t, 0, &market, &mut buffer, date(2026, 8, 1), 0, true);
        assert_eq!(buffer.trade_block(0)[0], 0.0);
    }

    #[test]
    fn cashflow_calculator_buckets_flows_into_half_open_windows() {
        let market = DeterministicSimMarket::new(date(2026, 8, 1), "USD", 0.0);
        let grid = vec![date(2026, 9, 1), date(2026, 10, 1), date(2026, 12, 1)];
        let t = trade(Arc::new(FixedNpv(0.0)));
        let calc = CashflowCalculator::new(grid.clone(), 0);
        let mut buffer = SampleBuffer::new(1, 3, 1);
        for (i, d) in grid.iter().enumerate() {
            calc.calculate(&t, 0, &market, &mut buffer, *d, i, false);
        }
        // (Sep 1, Oct 1] catches the Sep 15 flow; (Oct 1, Dec 1] the Nov 15.
        assert_eq!(buffer.trade_block(0)[0], 100.0);
        assert_eq!(buffer.trade_block(0)[1], 50.0);
        assert_eq!(buffer.trade_block(0)[2], 0.0);
    }

    #[test]
    fn unexercised_option_legs_produce_no_flows() {
        let market = DeterministicSimMarket::new(date(2026, 8, 1), "USD", 0.0);
        let mut t = trade(Arc::new(FixedNpv(0.0)));
        t.option = Some(OptionTerms {
            long: true,
            physical_delivery: true,
            exercised: false,
        });
        let grid = vec![date(2026, 9, 1), date(2026, 10, 1)];
        let calc = CashflowCalculator::new(grid, 0);
        let mut buffer = SampleBuffer::new(1, 2, 1);
        calc.calculate(&t, 0, &market, &mut buffer, date(2026, 9, 1), 0, false);
        assert_eq!(buffer.trade_block(0)[0], 0.0);
    }
}
