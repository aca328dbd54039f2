//! Dynamic initial margin via regression.
//!
//! For each exposure date the squared NPV move over the margin period of
//! risk is regressed on a polynomial of the current netting-set NPV; the
//! conditional standard deviation scaled by a normal quantile gives the
//! path-wise initial margin forecast.

use crate::aggregation::AggregationError;
use crate::math::normal_inv_cdf;

#[derive(Debug, Clone)]
pub struct DimCalculator {
    pub quantile: f64,
    pub horizon_calendar_days: u32,
    pub regression_order: usize,
    pub scaling: f64,
}

impl Default for DimCalculator {
    fn default() -> Self {
        Self {
            quantile: 0.99,
            horizon_calendar_days: 14,
            regression_order: 2,
            scaling: 1.0,
        }
    }
}

/// Regression DIM output for one netting set.
#[derive(Debug, Clone)]
pub struct DimResult {
    /// `dim[date][sample]` initial margin forecasts.
    pub dim: Vec<Vec<f64>>,
    /// Mean over samples per date.
    pub expected_dim: Vec<f64>,
    /// Fitted regression coefficients per date (for diagnostics exports).
    pub coefficients: Vec<Vec<f64>>,
}

impl DimCalculator {
    /// Computes DIM paths from netting-set values `values[date][sample]` on
    /// the time grid `times` (year fractions from the as-of date).
    pub fn compute(
        &self,
        times: &[f64],
        values: &[Vec<f64>],
    ) -> Result<DimResult, AggregationError> {
        if times.len() != values.len() {
            return Err(AggregationError::DimensionMismatch(format!(
                "times ({}) vs value matrix ({})",
                times.len(),
                values.len()
            )));
        }
        let dates = times.len();
        let samples = values.first().map_or(0, Vec::len);
        let z = normal_inv_cdf(self.quantile);
        let horizon = self.horizon_calendar_days as f64 / 365.0;

        let mut dim = vec![vec![0.0; samples]; dates];
        let mut expected = vec![0.0; dates];
        let mut coefficients = Vec::with_capacity(dates);

        for d in 0..dates {
            if d + 1 >= dates || samples == 0 {
                coefficients.push(Vec::new());
                continue;
            }
            let dt = (times[d + 1] - times[d]).max(1.0e-8);
            let scale = (horizon / dt).sqrt();
            // Regress squared scaled moves on powers of the current NPV.
            let xs = &values[d];
            let ys: Vec<f64> = (0..samples)
                .map(|s| {
                    let mv = (values[d + 1][s] - values[d][s]) * scale;
                    mv * mv
                })
                .collect();
            let coeffs = polynomial_fit(xs, &ys, self.regression_order)?;
            for s in 0..samples {
                let variance = eval_polynomial(&coeffs, xs[s]).max(0.0);
                dim[d][s] = z * variance.sqrt() * self.scaling;
                expected[d] += dim[d][s];
            }
            expected[d] /= samples as f64;
            coefficients.push(coeffs);
        }
        Ok(DimResult {
            dim,
            expected_dim: expected,
            coefficients,
        })
    }
}

/// Least-squares polynomial fit via normal equations.
fn polynomial_fit(xs: &[f64], ys: &[f64], order: usize) -> Result<Vec<f64>, AggregationError> {
    let n = order + 1;
    // Scale the abscissa for conditioning.
    let spread = xs
        .iter()
        .fold(0.0_f64, |acc, &x| acc.max(x.abs()))
        .max(1.0);
    let mut moments = vec![0.0; 2 * n - 1];
    let mut rhs = vec![0.0; n];
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        let xv = x / spread;
        let mut p = 1.0;
        for m in moments.iter_mut() {
            *m += p;
            p *= xv;
        }
        let mut p = 1.0;
        for r in rhs.iter_mut() {
            *r += p * y;
            p *= xv;
        }
    }
    let mut matrix = vec![vec![0.0; n]; n];
    for (i, row) in matrix.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = moments[i + j];
        }
    }
    let mut beta = solve_linear(matrix, rhs)?;
    // Undo the abscissa scaling.
    let mut factor = 1.0;
    for b in beta.iter_mut() {
        *b /= factor;
        factor *= spread;
    }
    Ok(beta)
}

fn eval_polynomial(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

/// Gaussian elimination with partial pivoting on a small dense system.
fn solve_linear(
    mut a: Vec<Vec<f64>>,
    mut b: Vec<f64>,
) -> Result<Vec<f64>, AggregationError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1.0e-14 {
            return Err(AggregationError::DimensionMismatch(
                "singular regression matrix in DIM fit".to_string(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in (row + 1)..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn polynomial_fit_recovers_quadratic() {
        let xs: Vec<f64> = (0..50).map(|i| i as f64 / 10.0).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| 2.0 + 3.0 * x + 0.5 * x * x).collect();
        let coeffs = polynomial_fit(&xs, &ys, 2).unwrap();
        assert_relative_eq!(coeffs[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(coeffs[1], 3.0, epsilon = 1e-8);
        assert_relative_eq!(coeffs[2], 0.5, epsilon = 1e-8);
    }

    #[test]
    fn constant_volatility_gives_flat_dim() {
        // Moves of constant magnitude: DIM should be close to z * |move|.
        let times: Vec<f64> = (0..5).map(|i| 0.1 * (i + 1) as f64).collect();
        let samples = 100;
        let mut values = vec![vec![0.0; samples]; 5];
        for d in 0..5 {
            for s in 0..samples {
                // Alternate up/down moves of size 1 around a level.
                values[d][s] = if (s + d) % 2 == 0 { 1.0 } else { 0.0 };
            }
        }
        let calc = DimCalculator {
            quantile: 0.99,
            horizon_calendar_days: 14,
            regression_order: 0,
            scaling: 1.0,
        };
        let result = calc.compute(&times, &values).unwrap();
        let scale = (14.0f64 / 365.0 / 0.1).sqrt();
        let expected = normal_inv_cdf(0.99) * scale;
        assert_relative_eq!(result.expected_dim[0], expected, max_relative = 1e-6);
        // Last date has no forward move to regress on.
        assert_relative_eq!(result.expected_dim[4], 0.0, epsilon = 0.0);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let calc = DimCalculator::default();
        assert!(calc.compute(&[0.1, 0.2], &[vec![0.0]]).is_err());
    }
}
