//! Covariance kernels over model-space inputs.

use nalgebra::DMatrix;

/// `√5`.
const SQRT_5: f64 = 2.236_067_977_499_79;

/// Stationary covariance function with log-parameterised hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Kernel {
    /// Matérn 5/2 with one lengthscale per input dimension (ARD).
    ///
    /// `k(a, b) = s (1 + √5 r + 5/3 r²) exp(-√5 r)`,
    /// `r = sqrt(Σ ((a_i - b_i) / l_i)²)`.
    Matern52 {
        lengthscales: Vec<f64>,
        outputscale: f64,
    },
    /// `k(a, b) = s` for every pair.
    Constant { outputscale: f64 },
}

impl Kernel {
    /// Build from log hyperparameters: `[log l_1 .. log l_d, log s]` for
    /// Matérn, `[log s]` for the constant kernel.
    pub(crate) fn from_log_params(constant: bool, log_params: &[f64]) -> Self {
        let (log_s, log_l) = match log_params.split_last() {
            Some((s, l)) => (*s, l),
            None => (0.0, &[][..]),
        };
        if constant {
            Kernel::Constant {
                outputscale: log_s.exp(),
            }
        } else {
            Kernel::Matern52 {
                lengthscales: log_l.iter().map(|v| v.exp()).collect(),
                outputscale: log_s.exp(),
            }
        }
    }

    /// Number of log hyperparameters for `d` input dimensions.
    pub(crate) fn n_params(constant: bool, d: usize) -> usize {
        if constant { 1 } else { d + 1 }
    }

    pub(crate) fn outputscale(&self) -> f64 {
        match self {
            Kernel::Matern52 { outputscale, .. } | Kernel::Constant { outputscale } => *outputscale,
        }
    }

    pub(crate) fn lengthscales(&self) -> &[f64] {
        match self {
            Kernel::Matern52 { lengthscales, .. } => lengthscales,
            Kernel::Constant { .. } => &[],
        }
    }

    /// Covariance between two points.
    pub(crate) fn eval(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Kernel::Matern52 {
                lengthscales,
                outputscale,
            } => {
                let r_sq = scaled_sq_dist(a, b, lengthscales);
                let sqrt5_r = SQRT_5 * r_sq.sqrt();
                outputscale * (1.0 + sqrt5_r + 5.0 / 3.0 * r_sq) * (-sqrt5_r).exp()
            }
            Kernel::Constant { outputscale } => *outputscale,
        }
    }

    /// Symmetric covariance matrix of the rows of `x` (no noise).
    pub(crate) fn matrix(&self, x: &[Vec<f64>]) -> DMatrix<f64> {
        let n = x.len();
        let mut k = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..=i {
                let v = self.eval(&x[i], &x[j]);
                k[(i, j)] = v;
                k[(j, i)] = v;
            }
        }
        k
    }

    /// Cross covariance `k(a_i, b_j)` (`|a| × |b|`).
    pub(crate) fn cross(&self, a: &[Vec<f64>], b: &[Vec<f64>]) -> DMatrix<f64> {
        DMatrix::from_fn(a.len(), b.len(), |i, j| self.eval(&a[i], &b[j]))
    }

    /// Derivatives of [`matrix`](Self::matrix) with respect to each log
    /// hyperparameter, in [`from_log_params`](Self::from_log_params) order.
    pub(crate) fn log_param_gradients(&self, x: &[Vec<f64>]) -> Vec<DMatrix<f64>> {
        let n = x.len();
        match self {
            Kernel::Constant { outputscale } => vec![DMatrix::from_element(n, n, *outputscale)],
            Kernel::Matern52 {
                lengthscales,
                outputscale,
            } => {
                let d = lengthscales.len();
                let mut grads = vec![DMatrix::zeros(n, n); d + 1];
                for i in 0..n {
                    for j in 0..=i {
                        let r_sq = scaled_sq_dist(&x[i], &x[j], lengthscales);
                        let sqrt5_r = SQRT_5 * r_sq.sqrt();
                        let e = (-sqrt5_r).exp();
                        let k = outputscale * (1.0 + sqrt5_r + 5.0 / 3.0 * r_sq) * e;
                        // dk/d(log l_p) = s (5/3) (1 + √5 r) e^{-√5 r} (Δ_p / l_p)²
                        let common = outputscale * 5.0 / 3.0 * (1.0 + sqrt5_r) * e;
                        for (p, l) in lengthscales.iter().enumerate() {
                            let t = (x[i][p] - x[j][p]) / l;
                            let g = common * t * t;
                            grads[p][(i, j)] = g;
                            grads[p][(j, i)] = g;
                        }
                        grads[d][(i, j)] = k;
                        grads[d][(j, i)] = k;
                    }
                }
                grads
            }
        }
    }
}

fn scaled_sq_dist(a: &[f64], b: &[f64], lengthscales: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .zip(lengthscales)
        .map(|((p, q), l)| {
            let t = (p - q) / l;
            t * t
        })
        .sum()
}
