//! Forward-mode automatic differentiation.
//!
//! `Dual` carries a value and one directional derivative. Models written
//! generically over `Scalar` evaluate on duals unchanged, which is how the
//! crate obtains exact Jacobians for the variational equations and for
//! Newton's method without hand-written derivatives.

use crate::traits::{DynamicalSystem, Scalar};
use nalgebra::DMatrix;
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::num::FpCategory;
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// Applies a scalar function given its value and derivative at `self.val`.
    #[inline]
    fn chain(self, value: f64, derivative: f64) -> Self {
        Self::new(value, derivative * self.eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / (rhs.val * rhs.val),
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

/// `a mod m` has slope one in `a` and `-trunc(a/m)` in `m` away from the jumps,
/// which keeps maps such as `2x mod 1` differentiable almost everywhere.
impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        let quotient = (self.val / rhs.val).trunc();
        Self::new(self.val % rhs.val, self.eps - quotient * rhs.eps)
    }
}

macro_rules! assign_via_binary {
    ($($trait:ident :: $method:ident => $op:tt),* $(,)?) => {
        $(
            impl $trait for Dual {
                fn $method(&mut self, rhs: Self) {
                    *self = *self $op rhs;
                }
            }
        )*
    };
}

assign_via_binary!(
    AddAssign::add_assign => +,
    SubAssign::sub_assign => -,
    MulAssign::mul_assign => *,
    DivAssign::div_assign => /,
    RemAssign::rem_assign => %,
);

impl Num for Dual {
    type FromStrRadixErr = <f64 as Num>::FromStrRadixErr;
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix).map(Self::constant)
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<N: ToPrimitive>(n: N) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

/// Piecewise-constant functions: derivative is zero wherever it exists.
macro_rules! flat {
    ($($name:ident),*) => {
        $(fn $name(self) -> Self { Self::constant(self.val.$name()) })*
    };
}

/// Predicates and classifiers that only look at the value.
macro_rules! on_value {
    ($($name:ident -> $ret:ty),*) => {
        $(fn $name(self) -> $ret { self.val.$name() })*
    };
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, 0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }

    on_value!(
        is_nan -> bool,
        is_infinite -> bool,
        is_finite -> bool,
        is_normal -> bool,
        classify -> FpCategory,
        is_sign_positive -> bool,
        is_sign_negative -> bool,
        integer_decode -> (u64, i16, i8)
    );

    flat!(floor, ceil, round, trunc, signum);

    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        if self.val < 0.0 {
            -self
        } else {
            self
        }
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }
    fn powi(self, n: i32) -> Self {
        self.chain(self.val.powi(n), n as f64 * self.val.powi(n - 1))
    }
    fn powf(self, n: Self) -> Self {
        let value = self.val.powf(n.val);
        let d_base = if self.val == 0.0 {
            0.0
        } else {
            n.val * self.val.powf(n.val - 1.0)
        };
        let d_exp = if n.eps == 0.0 { 0.0 } else { value * self.val.ln() };
        Self::new(value, d_base * self.eps + d_exp * n.eps)
    }
    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }
    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }
    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn exp_m1(self) -> Self {
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn max(self, other: Self) -> Self {
        if self.val >= other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val <= other.val {
            self
        } else {
            other
        }
    }
    #[allow(deprecated)]
    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }
    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }
    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }
}

/// Jacobian of `system` at `(t, x)`, row-major, one dual evaluation per column.
pub fn jacobian<S>(system: &S, t: f64, x: &[f64]) -> Vec<f64>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    let n = x.len();
    let mut jac = vec![0.0; n * n];
    let mut dual_x: Vec<Dual> = x.iter().map(|&v| Dual::constant(v)).collect();
    let mut dual_out = vec![Dual::zero(); n];
    let t_dual = Dual::constant(t);

    for j in 0..n {
        dual_x[j].eps = 1.0;
        system.apply(t_dual, &dual_x, &mut dual_out);
        dual_x[j].eps = 0.0;
        for i in 0..n {
            jac[i * n + j] = dual_out[i].eps;
        }
    }
    jac
}

/// Same as [`jacobian`] but packed into an nalgebra matrix.
pub fn jacobian_matrix<S>(system: &S, t: f64, x: &[f64]) -> DMatrix<f64>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    DMatrix::from_row_slice(x.len(), x.len(), &jacobian(system, t, x))
}

// --- Tangent System Wrapper ---

/// Augments a system with its variational equations.
///
/// The state is `[x, Φ]` where `Φ` is an `n×n` matrix stored row-major whose
/// columns are deviation vectors. For a flow the right-hand side is
/// `[f(x), J(x)·Φ]`; for a map the same expression is the next iterate.
pub struct TangentSystem<S> {
    pub inner: S,
    pub dimension: usize,
}

impl<S> TangentSystem<S> {
    pub fn new(inner: S, dim: usize) -> Self {
        Self {
            inner,
            dimension: dim,
        }
    }
}

impl<S> DynamicalSystem<f64> for TangentSystem<S>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    fn dimension(&self) -> usize {
        let n = self.dimension;
        n + n * n
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let n = self.dimension;
        let (base, phi) = x.split_at(n);
        let (base_out, phi_out) = out.split_at_mut(n);

        DynamicalSystem::<f64>::apply(&self.inner, t, base, base_out);
        let jac = jacobian(&self.inner, t, base);

        for i in 0..n {
            for j in 0..n {
                phi_out[i * n + j] = (0..n).map(|k| jac[i * n + k] * phi[k * n + j]).sum();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pendulum;

    impl<T: Scalar> DynamicalSystem<T> for Pendulum {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = x[1];
            out[1] = -x[0].sin();
        }
    }

    #[test]
    fn dual_arithmetic_follows_product_and_quotient_rules() {
        let x = Dual::new(3.0, 1.0);
        let y = x * x / (x + Dual::constant(1.0));
        // d/dx x^2/(x+1) = (x^2 + 2x)/(x+1)^2 = 15/16 at x = 3
        assert!((y.val - 2.25).abs() < 1e-14);
        assert!((y.eps - 15.0 / 16.0).abs() < 1e-14);
    }

    #[test]
    fn dual_rem_keeps_unit_slope() {
        let x = Dual::new(0.75, 2.0);
        let y = x % Dual::constant(0.5);
        assert!((y.val - 0.25).abs() < 1e-15);
        assert_eq!(y.eps, 2.0);
    }

    #[test]
    fn transcendental_derivatives_match_closed_forms() {
        let x = Dual::new(0.4, 1.0);
        assert!((x.tanh().eps - (1.0 - 0.4f64.tanh().powi(2))).abs() < 1e-14);
        assert!((x.atan().eps - 1.0 / 1.16).abs() < 1e-14);
        assert!((x.exp2().eps - 0.4f64.exp2() * std::f64::consts::LN_2).abs() < 1e-14);
        let y = Dual::new(2.0, 0.0);
        let angle = x.atan2(y);
        assert!((angle.eps - 2.0 / 4.16).abs() < 1e-14);
    }

    #[test]
    fn jacobian_of_pendulum() {
        let jac = jacobian(&Pendulum, 0.0, &[0.5, 1.0]);
        assert_eq!(jac[0], 0.0);
        assert_eq!(jac[1], 1.0);
        assert!((jac[2] + 0.5f64.cos()).abs() < 1e-15);
        assert_eq!(jac[3], 0.0);
    }

    #[test]
    fn tangent_system_multiplies_deviation_matrix() {
        let tangent = TangentSystem::new(Pendulum, 2);
        let state = [0.0, 1.0, 1.0, 2.0, 3.0, 4.0];
        let mut out = [0.0; 6];
        tangent.apply(0.0, &state, &mut out);
        assert_eq!(&out[..2], &[1.0, 0.0]);
        // J = [[0, 1], [-1, 0]] at x = 0, so J·Φ = [[3, 4], [-1, -2]].
        assert_eq!(&out[2..], &[3.0, 4.0, -1.0, -2.0]);
    }
}
