//! Vectorized Monte-Carlo lanes: `RandomVariable` (numeric) and `Filter`
//! (boolean), both with a compact deterministic representation.
//!
//! When every lane holds the same value the variable is stored as a single
//! scalar and elementwise arithmetic is O(1). The first per-lane write
//! expands the representation eagerly. Branch skipping in the interpreter
//! relies on this collapse being maintained, so every operation that could
//! produce a homogeneous result calls `update_deterministic` before
//! returning.

use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::math;

const EPS: f64 = 1.0e-15;

fn close(a: f64, b: f64) -> bool {
    let diff = (a - b).abs();
    diff <= EPS * a.abs().max(b.abs()).max(1.0)
}

#[derive(Debug, Clone, PartialEq)]
enum Lanes {
    Deterministic(f64),
    Expanded(Vec<f64>),
}

/// Fixed-size vector of real-valued Monte-Carlo lanes.
///
/// The optional `time` tag positions the variable on the model's stochastic
/// calendar; it is set by the model primitives (`pay`, `npv`, `discount`,
/// index evaluation) and cleared on assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomVariable {
    n: usize,
    lanes: Lanes,
    time: Option<f64>,
}

impl RandomVariable {
    /// All lanes equal to `value`.
    pub fn new(n: usize, value: f64) -> Self {
        assert!(n > 0, "sample count must be positive");
        Self {
            n,
            lanes: Lanes::Deterministic(value),
            time: None,
        }
    }

    pub fn from_lanes(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "sample count must be positive");
        let mut rv = Self {
            n: values.len(),
            lanes: Lanes::Expanded(values),
            time: None,
        };
        rv.update_deterministic();
        rv
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn deterministic(&self) -> bool {
        matches!(self.lanes, Lanes::Deterministic(_))
    }

    pub fn at(&self, k: usize) -> f64 {
        debug_assert!(k < self.n, "lane index out of range");
        match &self.lanes {
            Lanes::Deterministic(v) => *v,
            Lanes::Expanded(v) => v[k],
        }
    }

    /// Writes a single lane, demoting a deterministic variable to expanded
    /// form first.
    pub fn set(&mut self, k: usize, value: f64) {
        debug_assert!(k < self.n, "lane index out of range");
        self.expand();
        if let Lanes::Expanded(v) = &mut self.lanes {
            v[k] = value;
        }
    }

    /// Re-scans the lanes and collapses back to the compact form when all
    /// lanes coincide.
    pub fn update_deterministic(&mut self) {
        if let Lanes::Expanded(v) = &self.lanes {
            let first = v[0];
            if v.iter().all(|&x| close(x, first)) {
                self.lanes = Lanes::Deterministic(first);
            }
        }
    }

    fn expand(&mut self) {
        if let Lanes::Deterministic(v) = self.lanes {
            self.lanes = Lanes::Expanded(vec![v; self.n]);
        }
    }

    pub fn time(&self) -> Option<f64> {
        self.time
    }

    pub fn set_time(&mut self, time: Option<f64>) {
        self.time = time;
    }

    /// Mean across lanes (MC expectation).
    pub fn expectation(&self) -> f64 {
        match &self.lanes {
            Lanes::Deterministic(v) => *v,
            Lanes::Expanded(v) => v.iter().sum::<f64>() / self.n as f64,
        }
    }

    fn zip_with(&self, rhs: &RandomVariable, f: impl Fn(f64, f64) -> f64) -> RandomVariable {
        assert_eq!(self.n, rhs.n, "lane count mismatch");
        let mut out = match (&self.lanes, &rhs.lanes) {
            (Lanes::Deterministic(a), Lanes::Deterministic(b)) => RandomVariable {
                n: self.n,
                lanes: Lanes::Deterministic(f(*a, *b)),
                time: None,
            },
            _ => {
                let v = (0..self.n).map(|k| f(self.at(k), rhs.at(k))).collect();
                let mut rv = RandomVariable {
                    n: self.n,
                    lanes: Lanes::Expanded(v),
                    time: None,
                };
                rv.update_deterministic();
                rv
            }
        };
        out.time = merge_time(self.time, rhs.time);
        out
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> RandomVariable {
        let mut out = match &self.lanes {
            Lanes::Deterministic(v) => RandomVariable {
                n: self.n,
                lanes: Lanes::Deterministic(f(*v)),
                time: self.time,
            },
            Lanes::Expanded(v) => {
                let mut rv = RandomVariable {
                    n: self.n,
                    lanes: Lanes::Expanded(v.iter().map(|&x| f(x)).collect()),
                    time: self.time,
                };
                rv.update_deterministic();
                rv
            }
        };
        out.time = self.time;
        out
    }

    pub fn abs(&self) -> RandomVariable {
        self.map(f64::abs)
    }

    pub fn exp(&self) -> RandomVariable {
        self.map(f64::exp)
    }

    pub fn ln(&self) -> RandomVariable {
        self.map(f64::ln)
    }

    pub fn sqrt(&self) -> RandomVariable {
        self.map(f64::sqrt)
    }

    pub fn pow(&self, rhs: &RandomVariable) -> RandomVariable {
        self.zip_with(rhs, f64::powf)
    }

    pub fn normal_cdf(&self) -> RandomVariable {
        self.map(math::normal_cdf)
    }

    pub fn normal_pdf(&self) -> RandomVariable {
        self.map(math::normal_pdf)
    }

    pub fn min(&self, rhs: &RandomVariable) -> RandomVariable {
        self.zip_with(rhs, f64::min)
    }

    pub fn max(&self, rhs: &RandomVariable) -> RandomVariable {
        self.zip_with(rhs, f64::max)
    }

    /// Undiscounted Black-76 lane by lane.
    pub fn black(
        omega: &RandomVariable,
        t: &RandomVariable,
        k: &RandomVariable,
        f: &RandomVariable,
        v: &RandomVariable,
    ) -> RandomVariable {
        let n = omega.size();
        let all_det = omega.deterministic()
            && t.deterministic()
            && k.deterministic()
            && f.deterministic()
            && v.deterministic();
        if all_det {
            return RandomVariable::new(
                n,
                math::black76(omega.at(0), t.at(0), k.at(0), f.at(0), v.at(0)),
            );
        }
        let lanes = (0..n)
            .map(|i| math::black76(omega.at(i), t.at(i), k.at(i), f.at(i), v.at(i)))
            .collect();
        RandomVariable::from_lanes(lanes)
    }

    fn compare(&self, rhs: &RandomVariable, f: impl Fn(f64, f64) -> bool) -> Filter {
        assert_eq!(self.n, rhs.n, "lane count mismatch");
        match (&self.lanes, &rhs.lanes) {
            (Lanes::Deterministic(a), Lanes::Deterministic(b)) => Filter::new(self.n, f(*a, *b)),
            _ => {
                let v = (0..self.n).map(|k| f(self.at(k), rhs.at(k))).collect();
                Filter::from_lanes(v)
            }
        }
    }

    pub fn eq(&self, rhs: &RandomVariable) -> Filter {
        self.compare(rhs, close)
    }

    pub fn neq(&self, rhs: &RandomVariable) -> Filter {
        self.compare(rhs, |a, b| !close(a, b))
    }

    pub fn lt(&self, rhs: &RandomVariable) -> Filter {
        self.compare(rhs, |a, b| a < b && !close(a, b))
    }

    pub fn leq(&self, rhs: &RandomVariable) -> Filter {
        self.compare(rhs, |a, b| a < b || close(a, b))
    }

    pub fn gt(&self, rhs: &RandomVariable) -> Filter {
        self.compare(rhs, |a, b| a > b && !close(a, b))
    }

    pub fn geq(&self, rhs: &RandomVariable) -> Filter {
        self.compare(rhs, |a, b| a > b || close(a, b))
    }

    /// True when every lane of `self` equals the corresponding lane of `rhs`.
    pub fn close_enough_all(&self, rhs: &RandomVariable) -> bool {
        assert_eq!(self.n, rhs.n, "lane count mismatch");
        (0..self.n).all(|k| close(self.at(k), rhs.at(k)))
    }
}

fn merge_time(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait for &RandomVariable {
            type Output = RandomVariable;
            fn $method(self, rhs: &RandomVariable) -> RandomVariable {
                self.zip_with(rhs, |a, b| a $op b)
            }
        }
    };
}

impl_binop!(Add, add, +);
impl_binop!(Sub, sub, -);
impl_binop!(Mul, mul, *);
impl_binop!(Div, div, /);

impl Neg for &RandomVariable {
    type Output = RandomVariable;
    fn neg(self) -> RandomVariable {
        self.map(|x| -x)
    }
}

/// Lane-wise `mask ? then : else`.
pub fn conditional_result(
    mask: &Filter,
    then: &RandomVariable,
    otherwise: &RandomVariable,
) -> RandomVariable {
    assert_eq!(mask.size(), then.size(), "lane count mismatch");
    assert_eq!(mask.size(), otherwise.size(), "lane count mismatch");
    if mask.deterministic() {
        return if mask.at(0) {
            then.clone()
        } else {
            otherwise.clone()
        };
    }
    let lanes = (0..mask.size())
        .map(|k| if mask.at(k) { then.at(k) } else { otherwise.at(k) })
        .collect();
    RandomVariable::from_lanes(lanes)
}

#[derive(Debug, Clone, PartialEq)]
enum Bits {
    Deterministic(bool),
    Expanded(Vec<bool>),
}

/// Fixed-size vector of boolean lanes with the same compact representation
/// as [`RandomVariable`].
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    n: usize,
    bits: Bits,
}

impl Filter {
    pub fn new(n: usize, value: bool) -> Self {
        assert!(n > 0, "sample count must be positive");
        Self {
            n,
            bits: Bits::Deterministic(value),
        }
    }

    pub fn from_lanes(values: Vec<bool>) -> Self {
        assert!(!values.is_empty(), "sample count must be positive");
        let mut f = Self {
            n: values.len(),
            bits: Bits::Expanded(values),
        };
        f.update_deterministic();
        f
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn deterministic(&self) -> bool {
        matches!(self.bits, Bits::Deterministic(_))
    }

    pub fn at(&self, k: usize) -> bool {
        debug_assert!(k < self.n, "lane index out of range");
        match &self.bits {
            Bits::Deterministic(v) => *v,
            Bits::Expanded(v) => v[k],
        }
    }

    pub fn set(&mut self, k: usize, value: bool) {
        debug_assert!(k < self.n, "lane index out of range");
        if let Bits::Deterministic(v) = self.bits {
            self.bits = Bits::Expanded(vec![v; self.n]);
        }
        if let Bits::Expanded(v) = &mut self.bits {
            v[k] = value;
        }
    }

    pub fn update_deterministic(&mut self) {
        if let Bits::Expanded(v) = &self.bits {
            let first = v[0];
            if v.iter().all(|&x| x == first) {
                self.bits = Bits::Deterministic(first);
            }
        }
    }

    pub fn any_true(&self) -> bool {
        match &self.bits {
            Bits::Deterministic(v) => *v,
            Bits::Expanded(v) => v.iter().any(|&x| x),
        }
    }

    pub fn all_true(&self) -> bool {
        match &self.bits {
            Bits::Deterministic(v) => *v,
            Bits::Expanded(v) => v.iter().all(|&x| x),
        }
    }

    pub fn and(&self, rhs: &Filter) -> Filter {
        self.zip_with(rhs, |a, b| a && b)
    }

    pub fn or(&self, rhs: &Filter) -> Filter {
        self.zip_with(rhs, |a, b| a || b)
    }

    pub fn not(&self) -> Filter {
        match &self.bits {
            Bits::Deterministic(v) => Filter::new(self.n, !v),
            Bits::Expanded(v) => Filter::from_lanes(v.iter().map(|&x| !x).collect()),
        }
    }

    fn zip_with(&self, rhs: &Filter, f: impl Fn(bool, bool) -> bool) -> Filter {
        assert_eq!(self.n, rhs.n, "lane count mismatch");
        match (&self.bits, &rhs.bits) {
            (Bits::Deterministic(a), Bits::Deterministic(b)) => Filter::new(self.n, f(*a, *b)),
            _ => {
                let v = (0..self.n).map(|k| f(self.at(k), rhs.at(k))).collect();
                Filter::from_lanes(v)
            }
        }
    }
}
