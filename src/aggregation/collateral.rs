//! Collateral account evolution under a CSA.
//!
//! `CollateralExposureHelper` turns a netting set's MTM paths into per-path
//! collateral balances, honouring thresholds, minimum transfer amounts,
//! independent amount, margining frequency, and the margin period of risk.
//! The calculation type controls which MTM observation drives a margin
//! call: the symmetric type lags both directions by the MPoR, the
//! asymmetric types lag only the side that worsens the respective
//! adjustment, and `NoLag` reads the same-date MTM.

use chrono::NaiveDate;

use crate::aggregation::AggregationError;
use crate::portfolio::{CollateralCalculationType, CsaDetails};

/// Per-path collateral balance series. Positive balances are collateral we
/// hold (the counterparty has posted).
#[derive(Debug, Clone)]
pub struct CollateralAccount {
    /// Balance per grid date, aligned with the exposure grid.
    pub balance: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct CollateralExposureHelper {
    csa: CsaDetails,
    calculation_type: CollateralCalculationType,
    full_initial_collateralisation: bool,
}

impl CollateralExposureHelper {
    pub fn new(
        csa: CsaDetails,
        calculation_type: CollateralCalculationType,
        full_initial_collateralisation: bool,
    ) -> Self {
        Self {
            csa,
            calculation_type,
            full_initial_collateralisation,
        }
    }

    /// Collateral a CSA requires against mark-to-market `mtm`: positive
    /// above the receive threshold, negative below the pay threshold.
    fn required_margin(&self, mtm: f64) -> f64 {
        if mtm > self.csa.threshold_receive {
            mtm - self.csa.threshold_receive
        } else if mtm < -self.csa.threshold_pay {
            mtm + self.csa.threshold_pay
        } else {
            0.0
        }
    }

    /// Index of the MTM observation driving the call at `date_index`,
    /// lagged by the margin period of risk where the calculation type asks
    /// for it. `direction_up` is true when the call would raise the balance.
    fn driving_index(
        &self,
        dates: &[NaiveDate],
        date_index: usize,
        direction_up: bool,
    ) -> usize {
        let lagged = || {
            let cutoff = dates[date_index]
                - chrono::Duration::days(self.csa.margin_period_of_risk_days as i64);
            (0..=date_index)
                .rev()
                .find(|&i| dates[i] <= cutoff)
                .unwrap_or(0)
        };
        match self.calculation_type {
            CollateralCalculationType::NoLag => date_index,
            CollateralCalculationType::Symmetric => lagged(),
            // For CVA the exposure-raising direction (counterparty posting)
            // lags; our own posting is instantaneous. DVA mirrors this.
            CollateralCalculationType::AsymmetricCVA => {
                if direction_up {
                    lagged()
                } else {
                    date_index
                }
            }
            CollateralCalculationType::AsymmetricDVA => {
                if direction_up {
                    date_index
                } else {
                    lagged()
                }
            }
        }
    }

    /// Evolves the collateral account along one MTM path.
    ///
    /// `mtm_path` holds the netting-set value per grid date and
    /// `mtm_today` the t=0 value; dates must be ordered.
    pub fn collateral_path(
        &self,
        dates: &[NaiveDate],
        mtm_today: f64,
        mtm_path: &[f64],
    ) -> Result<CollateralAccount, AggregationError> {
        if dates.len() != mtm_path.len() {
            return Err(AggregationError::DimensionMismatch(format!(
                "collateral grid ({}) vs mtm path ({})",
                dates.len(),
                mtm_path.len()
            )));
        }
        let mut balance = Vec::with_capacity(dates.len());
        let mut current = if self.full_initial_collateralisation {
            mtm_today
        } else {
            0.0
        };
        current += self.csa.independent_amount;

        let mut last_call: Option<NaiveDate> = None;
        for (d, &date) in dates.iter().enumerate() {
            let call_due = match last_call {
                None => true,
                Some(prev) => {
                    (date - prev).num_days() >= self.csa.margin_call_frequency_days as i64
                }
            };
            if call_due {
                // A tentative target per direction decides which MTM
                // observation the call keys off.
                let spot_target =
                    self.required_margin(mtm_path[d]) + self.csa.independent_amount;
                let direction_up = spot_target > current;
                let drive = self.driving_index(dates, d, direction_up);
                let target =
                    self.required_margin(mtm_path[drive]) + self.csa.independent_amount;
                let delta = target - current;
                if delta.abs() >= self.csa.min_transfer_amount {
                    current = target;
                    last_call = Some(date);
                }
            }
            balance.push(current);
        }
        Ok(CollateralAccount { balance })
    }

    /// Collateral paths for every sample: `mtm[date][sample]`.
    pub fn collateral_paths(
        &self,
        dates: &[NaiveDate],
        mtm_today: f64,
        mtm: &[Vec<f64>],
    ) -> Result<Vec<CollateralAccount>, AggregationError> {
        if mtm.len() != dates.len() {
            return Err(AggregationError::DimensionMismatch(format!(
                "collateral grid ({}) vs mtm matrix ({})",
                dates.len(),
                mtm.len()
            )));
        }
        let samples = mtm.first().map_or(0, Vec::len);
        let mut accounts = Vec::with_capacity(samples);
        let mut path = vec![0.0; dates.len()];
        for s in 0..samples {
            for (d, row) in mtm.iter().enumerate() {
                path[d] = row[s];
            }
            accounts.push(self.collateral_path(dates, mtm_today, &path)?);
        }
        Ok(accounts)
    }

    /// Mean collateral balance per grid date.
    pub fn expected_collateral(accounts: &[CollateralAccount]) -> Vec<f64> {
        if accounts.is_empty() {
            return Vec::new();
        }
        let dates = accounts[0].balance.len();
        let mut expected = vec![0.0; dates];
        for account in accounts {
            for (d, &b) in account.balance.iter().enumerate() {
                expected[d] += b;
            }
        }
        for v in &mut expected {
            *v /= accounts.len() as f64;
        }
        expected
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn grid() -> Vec<NaiveDate> {
        (1..=6).map(|m| date(2026, 8, 1) + chrono::Duration::days(30 * m)).collect()
    }

    fn helper(csa: CsaDetails, calc: CollateralCalculationType) -> CollateralExposureHelper {
        CollateralExposureHelper::new(csa, calc, false)
    }

    #[test]
    fn zero_threshold_tracks_mtm_under_no_lag() {
        let h = helper(CsaDetails::default(), CollateralCalculationType::NoLag);
        let mtm = vec![10.0, 20.0, -5.0, 0.0, 15.0, 15.0];
        let account = h.collateral_path(&grid(), 0.0, &mtm).unwrap();
        assert_eq!(account.balance, mtm);
    }

    #[test]
    fn threshold_and_mta_gate_margin_calls() {
        let csa = CsaDetails {
            threshold_receive: 5.0,
            min_transfer_amount: 3.0,
            ..CsaDetails::default()
        };
        let h = helper(csa, CollateralCalculationType::NoLag);
        let mtm = vec![6.0, 7.5, 20.0, 20.0, 20.0, 20.0];
        let account = h.collateral_path(&grid(), 0.0, &mtm).unwrap();
        // 6.0 - 5.0 = 1.0 < MTA: no call. 7.5 - 5.0 = 2.5 < MTA: no call.
        // 20 - 5 = 15: call.
        assert_eq!(account.balance[0], 0.0);
        assert_eq!(account.balance[1], 0.0);
        assert_eq!(account.balance[2], 15.0);
    }

    #[test]
    fn symmetric_type_lags_by_margin_period_of_risk() {
        let csa = CsaDetails {
            margin_period_of_risk_days: 30,
            ..CsaDetails::default()
        };
        let h = helper(csa, CollateralCalculationType::Symmetric);
        let mtm = vec![10.0, 40.0, 40.0, 40.0, 40.0, 40.0];
        let account = h.collateral_path(&grid(), 0.0, &mtm).unwrap();
        // At the second date the driving observation is the first date.
        assert_relative_eq!(account.balance[1], 10.0, epsilon = 1e-12);
        assert_relative_eq!(account.balance[2], 40.0, epsilon = 1e-12);
    }

    #[test]
    fn full_initial_collateralisation_seeds_balance() {
        let h = CollateralExposureHelper::new(
            CsaDetails::default(),
            CollateralCalculationType::NoLag,
            true,
        );
        let mtm = vec![12.0; 6];
        let account = h.collateral_path(&grid(), 12.0, &mtm).unwrap();
        assert_relative_eq!(account.balance[0], 12.0, epsilon = 1e-12);
    }

    #[test]
    fn expected_collateral_is_sample_mean() {
        let h = helper(CsaDetails::default(), CollateralCalculationType::NoLag);
        let dates = grid();
        let mtm: Vec<Vec<f64>> = (0..6).map(|d| vec![d as f64, 3.0 * d as f64]).collect();
        let accounts = h.collateral_paths(&dates, 0.0, &mtm).unwrap();
        let expected = CollateralExposureHelper::expected_collateral(&accounts);
        assert_relative_eq!(expected[3], 2.0 * 3.0, epsilon = 1e-12);
    }
}
