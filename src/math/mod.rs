//! Scalar numerical kernels shared by the payoff engine and the aggregator.

pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

pub fn normal_cdf(x: f64) -> f64 {
    // Abramowitz & Stegun 7.1.26
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782
                + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let approx = 1.0 - normal_pdf(z) * poly;
    if x >= 0.0 { approx } else { 1.0 - approx }
}

/// Inverse standard normal CDF (Acklam's rational approximation).
pub fn normal_inv_cdf(p: f64) -> f64 {
    assert!(p > 0.0 && p < 1.0, "p must be in (0, 1)");

    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -normal_inv_cdf(1.0 - p)
    }
}

/// Undiscounted Black-76 value.
///
/// `omega` is +1 for a call, -1 for a put, `t` the variance time, `k` the
/// strike, `f` the forward and `v` the annualized lognormal volatility.
/// Collapses to intrinsic value when `t` or `v` vanish.
pub fn black76(omega: f64, t: f64, k: f64, f: f64, v: f64) -> f64 {
    let stdev = v * t.max(0.0).sqrt();
    if stdev < 1.0e-14 || k <= 0.0 || f <= 0.0 {
        return (omega * (f - k)).max(0.0);
    }
    let d1 = ((f / k).ln() + 0.5 * stdev * stdev) / stdev;
    let d2 = d1 - stdev;
    omega * (f * normal_cdf(omega * d1) - k * normal_cdf(omega * d2))
}

/// Empirical quantile of a sample (linear interpolation between order
/// statistics). `q` in [0, 1].
pub fn empirical_quantile(sample: &mut [f64], q: f64) -> f64 {
    assert!(!sample.is_empty(), "sample must be non-empty");
    assert!((0.0..=1.0).contains(&q), "quantile must be in [0, 1]");
    sample.sort_by(|a, b| a.total_cmp(b));
    let n = sample.len();
    if n == 1 {
        return sample[0];
    }
    let pos = q * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let w = pos - lo as f64;
    sample[lo] * (1.0 - w) + sample[hi] * w
}
