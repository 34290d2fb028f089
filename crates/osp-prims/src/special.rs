//! Scalar special functions backing the nontrivial primitive kernels.
//!
//! The Bessel evaluations use the ascending power series rescaled by
//! `exp(-|x|)` from the first term, so the exponentially scaled variants
//! never overflow on the way to the sum. Past the range where the scale
//! factor itself degrades, the large-argument asymptotic expansion takes
//! over. Hurwitz zeta follows the Euler-Maclaurin form with exact
//! Bernoulli-number divisors.

/// Switch point between the rescaled power series and the asymptotic
/// expansion. Below it `exp(-x)` is a normal f64; above it the asymptotic
/// tail is already far below f64 resolution.
const BESSEL_SERIES_CUTOFF: f64 = 700.0;

const MAX_SERIES_TERMS: usize = 2000;

/// `I0(x) * exp(-|x|)`.
#[must_use]
pub fn bessel_i0e(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let z = x.abs();
    if z <= BESSEL_SERIES_CUTOFF {
        scaled_series_i0(z)
    } else {
        asymptotic_scaled(z, 0.0)
    }
}

/// `I1(x)`, unscaled. Overflows to infinity where `exp(|x|)` does.
#[must_use]
pub fn bessel_i1(x: f64) -> f64 {
    let scaled = bessel_i1e(x);
    scaled * x.abs().exp()
}

/// `I1(x) * exp(-|x|)`. Odd in `x` like `I1` itself.
#[must_use]
pub fn bessel_i1e(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let z = x.abs();
    let magnitude = if z <= BESSEL_SERIES_CUTOFF {
        scaled_series_i1(z)
    } else {
        asymptotic_scaled(z, 1.0)
    };
    if x < 0.0 { -magnitude } else { magnitude }
}

/// Ascending series for `I0`, with every term carrying the `exp(-z)`
/// scale so the partial sums stay bounded: term_0 = exp(-z),
/// term_{k+1} = term_k * (z^2/4) / (k+1)^2.
fn scaled_series_i0(z: f64) -> f64 {
    let quarter_sq = z * z / 4.0;
    let mut term = (-z).exp();
    let mut sum = term;
    for k in 0..MAX_SERIES_TERMS {
        let k1 = (k + 1) as f64;
        term *= quarter_sq / (k1 * k1);
        sum += term;
        if term < sum * f64::EPSILON {
            break;
        }
    }
    sum
}

/// Ascending series for `I1`: `I1(z) = (z/2) * sum_k (z^2/4)^k / (k! (k+1)!)`.
fn scaled_series_i1(z: f64) -> f64 {
    let quarter_sq = z * z / 4.0;
    let mut term = (z / 2.0) * (-z).exp();
    let mut sum = term;
    for k in 0..MAX_SERIES_TERMS {
        let k1 = (k + 1) as f64;
        term *= quarter_sq / (k1 * (k1 + 1.0));
        sum += term;
        if term < sum * f64::EPSILON {
            break;
        }
    }
    sum
}

/// Large-argument expansion of `I_nu(z) * exp(-z)`:
/// `(2*pi*z)^{-1/2} * sum_k u_k` with
/// `u_0 = 1`, `u_k = u_{k-1} * ((2k-1)^2 - 4*nu^2) / (8*k*z)`.
fn asymptotic_scaled(z: f64, nu: f64) -> f64 {
    let four_nu_sq = 4.0 * nu * nu;
    let mut term = 1.0f64;
    let mut sum = term;
    let mut prev = f64::INFINITY;
    for k in 1..=30u32 {
        let two_k_minus_1 = f64::from(2 * k - 1);
        term *= (two_k_minus_1 * two_k_minus_1 - four_nu_sq) / (8.0 * f64::from(k) * z);
        if term.abs() >= prev {
            // Divergent tail reached; stop at the smallest term.
            break;
        }
        prev = term.abs();
        sum += term;
        if term.abs() < sum.abs() * f64::EPSILON {
            break;
        }
    }
    sum / (2.0 * std::f64::consts::PI * z).sqrt()
}

/// Euler-Maclaurin divisors `(2j)! / B_{2j}` for `2j = 2, 4, ..., 24`,
/// written as exact factorial/Bernoulli fractions.
const EULER_MACLAURIN_DIVISORS: [f64; 12] = [
    12.0,
    -720.0,
    30_240.0,
    -1_209_600.0,
    47_900_160.0,
    -1_307_674_368_000.0 / 691.0,
    74_724_249_600.0,
    -20_922_789_888_000.0 * 510.0 / 3_617.0,
    6_402_373_705_728_000.0 * 798.0 / 43_867.0,
    -2_432_902_008_176_640_000.0 * 330.0 / 174_611.0,
    1_124_000_727_777_607_680_000.0 * 138.0 / 854_513.0,
    -620_448_401_733_239_439_360_000.0 * 2_730.0 / 236_364_091.0,
];

/// Hurwitz zeta `zeta(x, q) = sum_{n >= 0} (n + q)^{-x}`.
///
/// Domain follows the real-valued convention: `x = 1` is the pole
/// (infinity), `x < 1` has no real value (NaN), and non-positive integer
/// `q` sits on a singularity (infinity).
#[must_use]
pub fn zeta(x: f64, q: f64) -> f64 {
    if x.is_nan() || q.is_nan() {
        return f64::NAN;
    }
    if x == 1.0 {
        return f64::INFINITY;
    }
    if x < 1.0 {
        return f64::NAN;
    }
    if q <= 0.0 {
        if q == q.floor() {
            return f64::INFINITY;
        }
        if x != x.floor() {
            // (n + q)^{-x} is complex for negative non-integer bases.
            return f64::NAN;
        }
    }

    let mut s = q.powf(-x);
    let mut a = q;
    let mut b = 0.0f64;
    let mut i = 0;
    while i < 9 || a <= 9.0 {
        i += 1;
        a += 1.0;
        b = a.powf(-x);
        s += b;
        if (b / s).abs() < f64::EPSILON {
            return s;
        }
    }

    let w = a;
    s += b * w / (x - 1.0);
    s -= 0.5 * b;
    let mut numerator = 1.0f64;
    let mut k = 0.0f64;
    for divisor in EULER_MACLAURIN_DIVISORS {
        numerator *= x + k;
        b /= w;
        let t = numerator * b / divisor;
        s += t;
        if (t / s).abs() < f64::EPSILON {
            return s;
        }
        k += 1.0;
        numerator *= x + k;
        b /= w;
        k += 1.0;
    }
    s
}
