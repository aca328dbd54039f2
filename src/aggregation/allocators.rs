//! Allocation of netting-set exposure back to trade level, such that the
//! allocated contributions add up to the netting-set figure.

use std::fmt;
use std::str::FromStr;

use crate::aggregation::AggregationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMethod {
    None,
    /// Pykhtin & Rosen (2010) marginal contributions, with an equal-split
    /// fallback below the marginal allocation limit.
    Marginal,
    RelativeFairValueGross,
    RelativeFairValueNet,
    RelativeXVA,
}

impl FromStr for AllocationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "Marginal" => Ok(Self::Marginal),
            "RelativeFairValueGross" => Ok(Self::RelativeFairValueGross),
            "RelativeFairValueNet" => Ok(Self::RelativeFairValueNet),
            "RelativeXVA" => Ok(Self::RelativeXVA),
            other => Err(format!("unknown allocation method '{other}'")),
        }
    }
}

impl fmt::Display for AllocationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "None",
            Self::Marginal => "Marginal",
            Self::RelativeFairValueGross => "RelativeFairValueGross",
            Self::RelativeFairValueNet => "RelativeFairValueNet",
            Self::RelativeXVA => "RelativeXVA",
        };
        f.write_str(label)
    }
}

/// Inputs for allocating one netting set. Trade-level slices are local to
/// the netting set and aligned with each other.
pub(crate) struct AllocatorInputs<'a> {
    pub netting_set_id: &'a str,
    /// Netting-set path exposures `[date][sample]`.
    pub net_epe: &'a [Vec<f64>],
    pub net_ene: &'a [Vec<f64>],
    /// Trade NPV paths `[trade][date][sample]`.
    pub trade_values: &'a [Vec<Vec<f64>>],
    pub trade_values_today: &'a [f64],
    /// Stand-alone CVA/DVA per trade (RelativeXVA weights).
    pub trade_cva: &'a [f64],
    pub trade_dva: &'a [f64],
    pub marginal_limit: f64,
}

/// Allocated `(epe, ene)` paths per trade, `[trade][date][sample]`.
pub(crate) type AllocatedPaths = (Vec<Vec<Vec<f64>>>, Vec<Vec<Vec<f64>>>);

pub(crate) fn allocate_exposures(
    method: AllocationMethod,
    inputs: &AllocatorInputs<'_>,
) -> Result<AllocatedPaths, AggregationError> {
    let trades = inputs.trade_values.len();
    let dates = inputs.net_epe.len();
    let samples = inputs.net_epe.first().map_or(0, Vec::len);
    let mut epe = vec![vec![vec![0.0; samples]; dates]; trades];
    let mut ene = vec![vec![vec![0.0; samples]; dates]; trades];

    match method {
        AllocationMethod::None => {}
        AllocationMethod::Marginal => {
            for d in 0..dates {
                for s in 0..samples {
                    let total: f64 = inputs.trade_values.iter().map(|v| v[d][s]).sum();
                    for i in 0..trades {
                        let weight = if total.abs() >= inputs.marginal_limit {
                            inputs.trade_values[i][d][s] / total
                        } else {
                            1.0 / trades as f64
                        };
                        epe[i][d][s] = inputs.net_epe[d][s] * weight;
                        ene[i][d][s] = inputs.net_ene[d][s] * weight;
                    }
                }
            }
        }
        AllocationMethod::RelativeFairValueGross => {
            let total: f64 = inputs.trade_values_today.iter().sum();
            if total == 0.0 {
                return Err(AggregationError::ZeroAllocationDenominator(
                    inputs.netting_set_id.to_string(),
                ));
            }
            for (i, &v0) in inputs.trade_values_today.iter().enumerate() {
                let weight = v0 / total;
                fill_scaled(&mut epe[i], inputs.net_epe, weight);
                fill_scaled(&mut ene[i], inputs.net_ene, weight);
            }
        }
        AllocationMethod::RelativeFairValueNet => {
            let positive: f64 = inputs
                .trade_values_today
                .iter()
                .filter(|v| **v > 0.0)
                .sum();
            let negative: f64 = inputs
                .trade_values_today
                .iter()
                .filter(|v| **v < 0.0)
                .sum();
            if positive <= 0.0 || negative >= 0.0 {
                return Err(AggregationError::ZeroAllocationDenominator(
                    inputs.netting_set_id.to_string(),
                ));
            }
            for (i, &v0) in inputs.trade_values_today.iter().enumerate() {
                let epe_weight = v0.max(0.0) / positive;
                let ene_weight = (-v0).max(0.0) / -negative;
                fill_scaled(&mut epe[i], inputs.net_epe, epe_weight);
                fill_scaled(&mut ene[i], inputs.net_ene, ene_weight);
            }
        }
        AllocationMethod::RelativeXVA => {
            let sum_cva: f64 = inputs.trade_cva.iter().sum();
            let sum_dva: f64 = inputs.trade_dva.iter().sum();
            if sum_cva == 0.0 && sum_dva == 0.0 {
                return Err(AggregationError::ZeroAllocationDenominator(
                    inputs.netting_set_id.to_string(),
                ));
            }
            // With one adjustment disabled, its weights degenerate; reuse
            // the other side's weights so the closure property still holds.
            for i in 0..trades {
                let cva_weight = if sum_cva != 0.0 {
                    inputs.trade_cva[i] / sum_cva
                } else {
                    inputs.trade_dva[i] / sum_dva
                };
                let dva_weight = if sum_dva != 0.0 {
                    inputs.trade_dva[i] / sum_dva
                } else {
                    inputs.trade_cva[i] / sum_cva
                };
                fill_scaled(&mut epe[i], inputs.net_epe, cva_weight);
                fill_scaled(&mut ene[i], inputs.net_ene, dva_weight);
            }
        }
    }
    Ok((epe, ene))
}

fn fill_scaled(target: &mut [Vec<f64>], source: &[Vec<f64>], weight: f64) {
    for (t_row, s_row) in target.iter_mut().zip(source.iter()) {
        for (t, s) in t_row.iter_mut().zip(s_row.iter()) {
            *t = s * weight;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(
        net_epe: &'a [Vec<f64>],
        net_ene: &'a [Vec<f64>],
        trade_values: &'a [Vec<Vec<f64>>],
        today: &'a [f64],
        cva: &'a [f64],
        dva: &'a [f64],
    ) -> AllocatorInputs<'a> {
        AllocatorInputs {
            netting_set_id: "NS-1",
            net_epe,
            net_ene,
            trade_values,
            trade_values_today: today,
            trade_cva: cva,
            trade_dva: dva,
            marginal_limit: 1.0e-8,
        }
    }

    #[test]
    fn relative_xva_allocation_closes() {
        let net_epe = vec![vec![10.0, 20.0]];
        let net_ene = vec![vec![4.0, 2.0]];
        let values = vec![vec![vec![0.0, 0.0]]; 2];
        let today = [1.0, 1.0];
        let cva = [3.0, 1.0];
        let dva = [1.0, 1.0];
        let (epe, _) = allocate_exposures(
            AllocationMethod::RelativeXVA,
            &inputs(&net_epe, &net_ene, &values, &today, &cva, &dva),
        )
        .unwrap();
        let total: f64 = (0..2).map(|i| epe[i][0][0]).sum();
        assert!((total - 10.0).abs() < 1e-12);
        assert!((epe[0][0][0] - 7.5).abs() < 1e-12);
    }

    #[test]
    fn marginal_weights_follow_npv_contributions() {
        let net_epe = vec![vec![12.0]];
        let net_ene = vec![vec![0.0]];
        let values = vec![vec![vec![30.0]], vec![vec![-10.0]]];
        let today = [0.0, 0.0];
        let (epe, _) = allocate_exposures(
            AllocationMethod::Marginal,
            &inputs(&net_epe, &net_ene, &values, &today, &[], &[]),
        )
        .unwrap();
        // total 20: weights 1.5 and -0.5, preserving the closure property.
        assert!((epe[0][0][0] - 18.0).abs() < 1e-12);
        assert!((epe[1][0][0] + 6.0).abs() < 1e-12);
    }

    #[test]
    fn marginal_falls_back_to_equal_split_below_limit() {
        let net_epe = vec![vec![12.0]];
        let net_ene = vec![vec![0.0]];
        let values = vec![vec![vec![1.0e-12]], vec![vec![-1.0e-12]]];
        let today = [0.0, 0.0];
        let mut input = inputs(&net_epe, &net_ene, &values, &today, &[], &[]);
        input.marginal_limit = 1.0e-6;
        let (epe, _) = allocate_exposures(AllocationMethod::Marginal, &input).unwrap();
        assert!((epe[0][0][0] - 6.0).abs() < 1e-12);
        assert!((epe[1][0][0] - 6.0).abs() < 1e-12);
    }

    #[test]
    fn zero_denominators_are_reported() {
        let net_epe = vec![vec![1.0]];
        let net_ene = vec![vec![1.0]];
        let values = vec![vec![vec![0.0]]; 2];
        let today_all_positive = [1.0, 2.0];
        let err = allocate_exposures(
            AllocationMethod::RelativeFairValueNet,
            &inputs(&net_epe, &net_ene, &values, &today_all_positive, &[], &[]),
        )
        .unwrap_err();
        assert!(matches!(err, AggregationError::ZeroAllocationDenominator(_)));

        let today_netting_to_zero = [1.0, -1.0];
        let err = allocate_exposures(
            AllocationMethod::RelativeFairValueGross,
            &inputs(&net_epe, &net_ene, &values, &today_netting_to_zero, &[], &[]),
        )
        .unwrap_err();
        assert!(matches!(err, AggregationError::ZeroAllocationDenominator(_)));
    }

    #[test]
    fn none_method_zeroes_allocations() {
        let net_epe = vec![vec![5.0]];
        let net_ene = vec![vec![5.0]];
        let values = vec![vec![vec![1.0]]];
        let (epe, ene) = allocate_exposures(
            AllocationMethod::None,
            &inputs(&net_epe, &net_ene, &values, &[1.0], &[], &[]),
        )
        .unwrap();
        assert_eq!(epe[0][0][0], 0.0);
        assert_eq!(ene[0][0][0], 0.0);
    }
}
