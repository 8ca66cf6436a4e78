//! Scalar statistics helpers shared by the filter, the GP and the
//! acquisition functions.

/// `1 / sqrt(2π)`.
const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Standard normal PDF.
pub(crate) fn norm_pdf(x: f64) -> f64 {
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Natural log of the standard normal PDF.
pub(crate) fn log_norm_pdf(x: f64) -> f64 {
    INV_SQRT_2PI.ln() - 0.5 * x * x
}

/// Complementary error function, split as `erfc(x) = t * exp(poly(t) - x²)`
/// for `x >= 0` (Chebyshev fit, relative error below 1.2e-7).
fn erfc_parts(x: f64) -> (f64, f64) {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    (t, poly - z * z)
}

/// Complementary error function.
pub(crate) fn erfc(x: f64) -> f64 {
    let (t, e) = erfc_parts(x);
    let ans = t * e.exp();
    if x >= 0.0 { ans } else { 2.0 - ans }
}

/// Standard normal CDF.
pub(crate) fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x * core::f64::consts::FRAC_1_SQRT_2)
}

/// Natural log of the standard normal CDF, accurate far into the left tail.
pub(crate) fn log_norm_cdf(x: f64) -> f64 {
    if x < 0.0 {
        let (t, e) = erfc_parts(-x * core::f64::consts::FRAC_1_SQRT_2);
        t.ln() + e - core::f64::consts::LN_2
    } else {
        norm_cdf(x).ln()
    }
}

/// Arithmetic mean. Returns NaN for an empty slice.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with `ddof` delta degrees of freedom.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn std_dev(values: &[f64], ddof: usize) -> f64 {
    let n = values.len();
    if n <= ddof {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (n - ddof) as f64).sqrt()
}

/// `log(Σ exp(v))` computed without overflow.
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Natural log of `softplus(x) = log(1 + e^x)`.
pub(crate) fn log_softplus(x: f64) -> f64 {
    if x > 30.0 {
        x.ln()
    } else if x < -30.0 {
        x
    } else {
        x.exp().ln_1p().ln()
    }
}
