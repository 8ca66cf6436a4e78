//! Gaussian-process regression with fixed, per-point observation noise.
//!
//! Inputs are model-space rows (normalized features), targets are
//! standardized outputs, and the noise vector holds the standardized
//! observation variances. The prior is a constant mean plus a Matérn 5/2
//! ARD kernel (or a constant kernel). Hyperparameters are found by
//! maximizing the log marginal likelihood with weak Gamma priors on the
//! lengthscales and the outputscale, using the bounded L-BFGS from
//! [`crate::lbfgs`].

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::kernel::Kernel;
use crate::lbfgs::{self, LbfgsOptions};
use crate::rng_util;

/// Diagonal floor added to the observation noise in model space.
pub(crate) const MIN_NOISE: f64 = 1e-6;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

// Gamma(3, 6) on each lengthscale and Gamma(2, 0.15) on the outputscale.
const LENGTHSCALE_PRIOR: (f64, f64) = (3.0, 6.0);
const OUTPUTSCALE_PRIOR: (f64, f64) = (2.0, 0.15);

const LOG_LENGTHSCALE_BOUNDS: (f64, f64) = (-5.298_317_366_548_036, 2.995_732_273_553_991); // ln 0.005, ln 20
const LOG_OUTPUTSCALE_BOUNDS: (f64, f64) = (-4.605_170_185_988_091, 4.605_170_185_988_091); // ln 0.01, ln 100
const MEAN_BOUNDS: (f64, f64) = (-10.0, 10.0);

/// Settings of one hyperparameter fit.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GpFitOptions {
    pub(crate) max_attempts: usize,
    pub(crate) lbfgs: LbfgsOptions,
    pub(crate) seed: u64,
}

/// What happened while fitting.
#[derive(Clone, Debug, Default)]
pub(crate) struct FitReport {
    /// Loss (negative log posterior per point) after every accepted step of
    /// the successful attempt.
    pub(crate) losses: Vec<f64>,
    pub(crate) attempts: usize,
    pub(crate) converged: bool,
}

/// A fitted GP posterior.
#[derive(Clone, Debug)]
pub(crate) struct GaussianProcess {
    x: Vec<Vec<f64>>,
    kernel: Kernel,
    mean: f64,
    cholesky: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
}

impl GaussianProcess {
    /// Fit hyperparameters and condition on the data.
    ///
    /// On failure returns the last reason and the number of attempts made.
    pub(crate) fn fit(
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        noise: &DVector<f64>,
        constant_kernel: bool,
        opts: &GpFitOptions,
    ) -> Result<(Self, FitReport), (String, usize)> {
        let rows = rows_of(x);
        let d = x.ncols();
        let (lower, upper) = param_bounds(constant_kernel, d);
        let theta0 = initial_params(&rows, constant_kernel, d);
        let mut rng = fastrand::Rng::with_seed(opts.seed);
        let mut reason = String::from("no attempt made");

        for attempt in 0..opts.max_attempts.max(1) {
            let jitter = if attempt == 0 {
                0.0
            } else {
                MIN_NOISE * 10f64.powi(i32::try_from(attempt.min(4)).unwrap_or(4))
            };
            let start: Vec<f64> = if attempt == 0 {
                theta0.clone()
            } else {
                theta0
                    .iter()
                    .zip(lower.iter().zip(&upper))
                    .map(|(t, (lo, hi))| (t + rng_util::f64_range(&mut rng, -1.0, 1.0)).clamp(*lo, *hi))
                    .collect()
            };
            let noise_j = noise.map(|v| v.max(MIN_NOISE) + jitter);

            let objective = |theta: &[f64]| neg_log_posterior(&rows, y, &noise_j, constant_kernel, theta);
            let Some(min) = lbfgs::minimize(objective, &start, &lower, &upper, &opts.lbfgs) else {
                reason = String::from("covariance is not positive definite at the starting point");
                trace_debug!(attempt, "hyperparameter start rejected, retrying with jitter");
                continue;
            };
            let Some(gp) = Self::condition(&rows, y, &noise_j, constant_kernel, &min.x) else {
                reason = String::from("covariance is not positive definite at the optimum");
                continue;
            };
            if !min.converged {
                trace_debug!(
                    attempt,
                    iterations = min.iterations,
                    "hyperparameter optimizer stopped before converging"
                );
            }
            let report = FitReport {
                losses: min.history,
                attempts: attempt + 1,
                converged: min.converged,
            };
            return Ok((gp, report));
        }
        Err((reason, opts.max_attempts.max(1)))
    }

    fn condition(
        rows: &[Vec<f64>],
        y: &DVector<f64>,
        noise: &DVector<f64>,
        constant_kernel: bool,
        theta: &[f64],
    ) -> Option<Self> {
        let (kparams, mean) = split_params(theta);
        let kernel = Kernel::from_log_params(constant_kernel, kparams);
        let k = kernel.matrix(rows) + DMatrix::from_diagonal(noise);
        let cholesky = Cholesky::new(k)?;
        let alpha = cholesky.solve(&y.map(|v| v - mean));
        Some(Self {
            x: rows.to_vec(),
            kernel,
            mean,
            cholesky,
            alpha,
        })
    }

    /// Posterior mean and marginal variance of the latent function.
    pub(crate) fn predict(&self, xs: &DMatrix<f64>) -> (DVector<f64>, DVector<f64>) {
        let rows = rows_of(xs);
        let ks = self.kernel.cross(&rows, &self.x);
        let mean = (&ks * &self.alpha).map(|v| v + self.mean);
        let v = self.solve_lower(&ks);
        let var = DVector::from_fn(rows.len(), |i, _| {
            let prior = self.kernel.eval(&rows[i], &rows[i]);
            (prior - v.column(i).norm_squared()).max(0.0)
        });
        (mean, var)
    }

    /// Posterior mean and full covariance of the latent function.
    pub(crate) fn predict_cov(&self, xs: &DMatrix<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let rows = rows_of(xs);
        let ks = self.kernel.cross(&rows, &self.x);
        let mean = (&ks * &self.alpha).map(|v| v + self.mean);
        let v = self.solve_lower(&ks);
        let cov = self.kernel.matrix(&rows) - v.transpose() * &v;
        (mean, cov)
    }

    fn solve_lower(&self, ks: &DMatrix<f64>) -> DMatrix<f64> {
        let kt = ks.transpose();
        self.cholesky
            .l_dirty()
            .solve_lower_triangular(&kt)
            .unwrap_or_else(|| DMatrix::zeros(kt.nrows(), kt.ncols()))
    }

    pub(crate) fn lengthscales(&self) -> &[f64] {
        self.kernel.lengthscales()
    }

    pub(crate) fn outputscale(&self) -> f64 {
        self.kernel.outputscale()
    }

    pub(crate) fn mean_constant(&self) -> f64 {
        self.mean
    }
}

/// Posterior of a constant level under a flat prior, for degenerate outputs.
///
/// The mean is the inverse-variance weighted mean of the targets and the
/// variance is `1 / Σ 1/σ²`, the same everywhere.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct ConstantModel {
    pub(crate) mean: f64,
    pub(crate) variance: f64,
}

impl ConstantModel {
    pub(crate) fn fit(y: &DVector<f64>, noise: &DVector<f64>) -> Self {
        let mut wsum = 0.0;
        let mut wy = 0.0;
        for (v, s2) in y.iter().zip(noise.iter()) {
            if !v.is_finite() {
                continue;
            }
            let w = 1.0 / s2.max(MIN_NOISE);
            wsum += w;
            wy += w * v;
        }
        if wsum > 0.0 {
            Self {
                mean: wy / wsum,
                variance: 1.0 / wsum,
            }
        } else {
            Self {
                mean: 0.0,
                variance: 1.0,
            }
        }
    }

    pub(crate) fn predict(&self, n: usize) -> (DVector<f64>, DVector<f64>) {
        (
            DVector::from_element(n, self.mean),
            DVector::from_element(n, self.variance),
        )
    }
}

fn rows_of(x: &DMatrix<f64>) -> Vec<Vec<f64>> {
    x.row_iter().map(|r| r.iter().copied().collect()).collect()
}

fn split_params(theta: &[f64]) -> (&[f64], f64) {
    match theta.split_last() {
        Some((m, k)) => (k, *m),
        None => (&[], 0.0),
    }
}

fn param_bounds(constant_kernel: bool, d: usize) -> (Vec<f64>, Vec<f64>) {
    let n = Kernel::n_params(constant_kernel, d) + 1;
    let mut lower = Vec::with_capacity(n);
    let mut upper = Vec::with_capacity(n);
    if !constant_kernel {
        lower.extend(std::iter::repeat_n(LOG_LENGTHSCALE_BOUNDS.0, d));
        upper.extend(std::iter::repeat_n(LOG_LENGTHSCALE_BOUNDS.1, d));
    }
    lower.extend([LOG_OUTPUTSCALE_BOUNDS.0, MEAN_BOUNDS.0]);
    upper.extend([LOG_OUTPUTSCALE_BOUNDS.1, MEAN_BOUNDS.1]);
    (lower, upper)
}

/// Lengthscales start at the per-dimension spread of the inputs.
#[allow(clippy::cast_precision_loss)]
fn initial_params(rows: &[Vec<f64>], constant_kernel: bool, d: usize) -> Vec<f64> {
    // Kernel parameters, then the constant mean.
    let mut theta = Vec::with_capacity(Kernel::n_params(constant_kernel, d) + 1);
    if !constant_kernel {
        let n = rows.len().max(1) as f64;
        for j in 0..d {
            let mean = rows.iter().map(|r| r[j]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[j] - mean).powi(2)).sum::<f64>() / n;
            theta.push(var.sqrt().clamp(0.05, 20.0).ln());
        }
    }
    theta.extend([0.0, 0.0]);
    theta
}

/// Negative log posterior per data point and its gradient.
#[allow(clippy::cast_precision_loss)]
fn neg_log_posterior(
    rows: &[Vec<f64>],
    y: &DVector<f64>,
    noise: &DVector<f64>,
    constant_kernel: bool,
    theta: &[f64],
) -> Option<(f64, Vec<f64>)> {
    let n = rows.len();
    let (kparams, mean) = split_params(theta);
    let kernel = Kernel::from_log_params(constant_kernel, kparams);
    let k = kernel.matrix(rows) + DMatrix::from_diagonal(noise);
    let chol = Cholesky::new(k)?;
    let r = y.map(|v| v - mean);
    let alpha = chol.solve(&r);
    let log_det: f64 = 2.0 * chol.l_dirty().diagonal().iter().map(|v| v.ln()).sum::<f64>();
    let mll = -0.5 * r.dot(&alpha) - 0.5 * log_det - 0.5 * n as f64 * LN_2PI;

    // d mll / d θ = ½ tr((α αᵀ - K⁻¹) dK/dθ)
    let w = &alpha * alpha.transpose() - chol.inverse();
    let mut grad: Vec<f64> = kernel
        .log_param_gradients(rows)
        .iter()
        .map(|dk| 0.5 * w.component_mul(dk).sum())
        .collect();
    grad.push(alpha.sum());

    let mut log_prior = 0.0;
    let n_l = kparams.len().saturating_sub(1);
    for (p, &t) in kparams.iter().enumerate() {
        let (a, b) = if p < n_l {
            LENGTHSCALE_PRIOR
        } else {
            OUTPUTSCALE_PRIOR
        };
        log_prior += (a - 1.0) * t - b * t.exp();
        grad[p] += (a - 1.0) - b * t.exp();
    }

    let scale = -1.0 / n as f64;
    let loss = scale * (mll + log_prior);
    Some((loss, grad.into_iter().map(|g| g * scale).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let x = DMatrix::<f64>::from_row_slice(6, 1, &[0.0, 0.2, 0.4, 0.6, 0.8, 1.0]);
        let y = x.column(0).map(|v| (6.0 * v).sin());
        let noise = DVector::from_element(6, 1e-4);
        (x, y, noise)
    }

    fn opts() -> GpFitOptions {
        GpFitOptions {
            max_attempts: 5,
            lbfgs: LbfgsOptions::default(),
            seed: 3,
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let (x, y, noise) = toy();
        let rows = rows_of(&x);
        let theta = [-1.2, 0.3, 0.1];
        let (_, g) = neg_log_posterior(&rows, &y, &noise, false, &theta).unwrap();
        let h = 1e-6;
        for p in 0..theta.len() {
            let mut up = theta;
            up[p] += h;
            let mut down = theta;
            down[p] -= h;
            let fu = neg_log_posterior(&rows, &y, &noise, false, &up).unwrap().0;
            let fd = neg_log_posterior(&rows, &y, &noise, false, &down).unwrap().0;
            let num = (fu - fd) / (2.0 * h);
            assert!((num - g[p]).abs() < 1e-4 * num.abs().max(1.0), "param {p}: {num} vs {}", g[p]);
        }
    }

    #[test]
    fn parameter_vector_is_kernel_params_plus_mean() {
        let rows = rows_of(&DMatrix::from_row_slice(2, 3, &[0.0, 0.5, 1.0, 1.0, 0.5, 0.0]));
        for constant in [false, true] {
            let n = Kernel::n_params(constant, 3) + 1;
            assert_eq!(initial_params(&rows, constant, 3).len(), n);
            let (lower, upper) = param_bounds(constant, 3);
            assert_eq!((lower.len(), upper.len()), (n, n));
        }
    }

    #[test]
    fn fit_interpolates_low_noise_data() {
        let (x, y, noise) = toy();
        let (gp, report) = GaussianProcess::fit(&x, &y, &noise, false, &opts()).unwrap();
        let (mean, var) = gp.predict(&x);
        for i in 0..y.len() {
            assert!((mean[i] - y[i]).abs() < 0.05, "point {i}: {} vs {}", mean[i], y[i]);
            assert!(var[i] >= 0.0);
        }
        assert!(report.losses.first().unwrap() >= report.losses.last().unwrap());
        assert!(gp.lengthscales()[0] > 0.0);
    }

    #[test]
    fn covariance_diagonal_matches_variance() {
        let (x, y, noise) = toy();
        let (gp, _) = GaussianProcess::fit(&x, &y, &noise, false, &opts()).unwrap();
        let xs = DMatrix::from_row_slice(3, 1, &[0.1, 0.5, 0.95]);
        let (m1, v) = gp.predict(&xs);
        let (m2, c) = gp.predict_cov(&xs);
        assert!((m1 - m2).amax() < 1e-12);
        for i in 0..3 {
            assert!((c[(i, i)].max(0.0) - v[i]).abs() < 1e-10);
        }
    }

    #[test]
    fn constant_model_weights_by_precision() {
        let y = DVector::from_vec(vec![1.0, 2.0]);
        let noise = DVector::from_vec(vec![1.0, 0.25]);
        let m = ConstantModel::fit(&y, &noise);
        assert!((m.mean - 1.8).abs() < 1e-12);
        assert!((m.variance - 0.2).abs() < 1e-12);
        assert!(m.variance <= 0.25);
    }
}
