//! Ordered record of path-wise cashflows produced by `logpay`.
//!
//! Entries are appended in node-visitation order, which is deterministic for
//! a fixed AST. Amounts are stored undiscounted together with the filter
//! active at the write, so reporting can mask lanes after the fact.

use chrono::NaiveDate;

use crate::lang::random_variable::{Filter, RandomVariable};

#[derive(Debug, Clone)]
pub struct PayLogEntry {
    pub amount: RandomVariable,
    pub filter: Filter,
    pub obs_date: NaiveDate,
    pub pay_date: NaiveDate,
    pub currency: String,
    pub leg_no: usize,
    pub cashflow_type: String,
    pub slot: usize,
}

/// One consolidated flow: lanes masked by the filter, grouped by payment
/// coordinates.
#[derive(Debug, Clone)]
pub struct ConsolidatedFlow {
    pub pay_date: NaiveDate,
    pub currency: String,
    pub leg_no: usize,
    pub cashflow_type: String,
    pub slot: usize,
    /// Per-lane amount, zero where the recording filter was false.
    pub lanes: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct PayLog {
    entries: Vec<PayLogEntry>,
}

impl PayLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        amount: RandomVariable,
        filter: Filter,
        obs_date: NaiveDate,
        pay_date: NaiveDate,
        currency: String,
        leg_no: usize,
        cashflow_type: String,
        slot: usize,
    ) {
        self.entries.push(PayLogEntry {
            amount,
            filter,
            obs_date,
            pay_date,
            currency,
            leg_no,
            cashflow_type,
            slot,
        });
    }

    pub fn entries(&self) -> &[PayLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges entries sharing (payDate, ccy, leg, type, slot), masking lanes
    /// by each entry's filter. Output order follows first appearance.
    pub fn consolidate(&self) -> Vec<ConsolidatedFlow> {
        let mut flows: Vec<ConsolidatedFlow> = Vec::new();
        for entry in &self.entries {
            let n = entry.amount.size();
            let key_pos = flows.iter().position(|f| {
                f.pay_date == entry.pay_date
                    && f.currency == entry.currency
                    && f.leg_no == entry.leg_no
                    && f.cashflow_type == entry.cashflow_type
                    && f.slot == entry.slot
            });
            let pos = match key_pos {
                Some(pos) => pos,
                None => {
                    flows.push(ConsolidatedFlow {
                        pay_date: entry.pay_date,
                        currency: entry.currency.clone(),
                        leg_no: entry.leg_no,
                        cashflow_type: entry.cashflow_type.clone(),
                        slot: entry.slot,
                        lanes: vec![0.0; n],
                    });
                    flows.len() - 1
                }
            };
            let flow = &mut flows[pos];
            for k in 0..n {
                if entry.filter.at(k) {
                    flow.lanes[k] += entry.amount.at(k);
                }
            }
        }
        flows
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn consolidation_masks_lanes_and_merges_keys() {
        let mut log = PayLog::new();
        log.write(
            RandomVariable::from_lanes(vec![1.0, 2.0, 3.0]),
            Filter::from_lanes(vec![true, false, true]),
            date(2026, 8, 1),
            date(2026, 9, 1),
            "USD".into(),
            0,
            "Interest".into(),
            0,
        );
        log.write(
            RandomVariable::new(3, 10.0),
            Filter::new(3, true),
            date(2026, 8, 15),
            date(2026, 9, 1),
            "USD".into(),
            0,
            "Interest".into(),
            0,
        );

        let flows = log.consolidate();
        assert_eq!(flows.len(), 1);
        assert_relative_eq!(flows[0].lanes[0], 11.0, epsilon = 0.0);
        assert_relative_eq!(flows[0].lanes[1], 10.0, epsilon = 0.0);
        assert_relative_eq!(flows[0].lanes[2], 13.0, epsilon = 0.0);
    }

    #[test]
    fn distinct_legs_stay_separate() {
        let mut log = PayLog::new();
        for leg in 0..2 {
            log.write(
                RandomVariable::new(1, 1.0),
                Filter::new(1, true),
                date(2026, 8, 1),
                date(2026, 9, 1),
                "USD".into(),
                leg,
                "Unspecified".into(),
                0,
            );
        }
        assert_eq!(log.consolidate().len(), 2);
    }
}
