//! Acquisition functions over the composite posterior.
//!
//! Every quantity here is maximized. The residual of a point is the negated,
//! normalized norm of its objective minus calibration components, so a point
//! matching its targets exactly scores 0 and everything else scores below.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::composite::CompositeModel;
use crate::error::{Error, Result};
use crate::stats;

/// Temperature of the smoothed `max(·, 0)` in the Monte-Carlo log-EI.
const LOGEI_TAU: f64 = 1e-6;

/// Below this standardized improvement the analytic log-EI switches to its
/// asymptotic expansion.
const LOGEI_ASYMPTOTIC_Z: f64 = -5.0;

/// Output of a scalarization callback for `k` points.
#[derive(Clone, Debug, PartialEq)]
pub struct Scalarization {
    /// Objective components (`k × c`).
    pub objective: DMatrix<f64>,
    /// Calibration components matching `objective` (`k × c`).
    pub calibration: DMatrix<f64>,
    /// One residual per point; higher is better.
    pub residual: DVector<f64>,
}

impl Scalarization {
    /// `objective − calibration`.
    #[must_use]
    pub fn components(&self) -> DMatrix<f64> {
        &self.objective - &self.calibration
    }
}

/// User reduction of raw multi-output values (`k × m`, columns in model
/// output order) to objective, calibration and residual.
pub type Scalarize = Arc<dyn Fn(&DMatrix<f64>) -> Scalarization + Send + Sync>;

/// Norm used to collapse components into a residual.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualNorm {
    /// `−Σ|c| / n`.
    L1,
    /// `−sqrt(Σc² / n)`.
    #[default]
    L2,
}

impl ResidualNorm {
    /// Residual of each row of `components`. Rows with no components
    /// score 0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn residual(self, components: &DMatrix<f64>) -> DVector<f64> {
        let n = components.ncols();
        DVector::from_fn(components.nrows(), |i, _| {
            if n == 0 {
                return 0.0;
            }
            let row = components.row(i);
            match self {
                ResidualNorm::L1 => -row.iter().map(|c| c.abs()).sum::<f64>() / n as f64,
                ResidualNorm::L2 => -(row.iter().map(|c| c * c).sum::<f64>() / n as f64).sqrt(),
            }
        })
    }
}

/// Scalarizer comparing output columns pairwise: `of_cols[i]` should match
/// `cal_cols[i]`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the column lists differ in length.
///
/// # Examples
///
/// ```
/// use nalgebra::DMatrix;
/// use surrogate_optimizer::{ResidualNorm, difference_scalarizer};
///
/// let s = difference_scalarizer(vec![0], vec![1], ResidualNorm::L1).unwrap();
/// let out = s(&DMatrix::from_row_slice(1, 2, &[3.0, 1.0]));
/// assert_eq!(out.residual[0], -2.0);
/// ```
pub fn difference_scalarizer(
    of_cols: Vec<usize>,
    cal_cols: Vec<usize>,
    norm: ResidualNorm,
) -> Result<Scalarize> {
    if of_cols.len() != cal_cols.len() {
        return Err(Error::ShapeMismatch {
            what: "objective vs calibration columns",
            expected: of_cols.len(),
            got: cal_cols.len(),
        });
    }
    Ok(Arc::new(move |y: &DMatrix<f64>| {
        let objective = y.select_columns(&of_cols);
        let calibration = y.select_columns(&cal_cols);
        let residual = norm.residual(&(&objective - &calibration));
        Scalarization {
            objective,
            calibration,
            residual,
        }
    }))
}

/// Scalarizer comparing every output column with a fixed target.
///
/// # Examples
///
/// ```
/// use nalgebra::DMatrix;
/// use surrogate_optimizer::{ResidualNorm, target_scalarizer};
///
/// let s = target_scalarizer(vec![1.0, 2.0], ResidualNorm::L2);
/// let out = s(&DMatrix::from_row_slice(1, 2, &[1.0, 2.0]));
/// assert_eq!(out.residual[0], 0.0);
/// ```
#[must_use]
pub fn target_scalarizer(targets: Vec<f64>, norm: ResidualNorm) -> Scalarize {
    Arc::new(move |y: &DMatrix<f64>| {
        let objective = y.clone();
        let calibration =
            DMatrix::from_fn(y.nrows(), y.ncols(), |_, j| targets.get(j).copied().unwrap_or(0.0));
        let residual = norm.residual(&(&objective - &calibration));
        Scalarization {
            objective,
            calibration,
            residual,
        }
    })
}

/// Which acquisition function to maximize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcquisitionKind {
    /// Residual of the posterior mean.
    #[default]
    #[serde(rename = "posterior_mean")]
    PosteriorMean,
    /// Monte-Carlo expected improvement of the residual.
    #[serde(rename = "ei_mc")]
    ExpectedImprovementMc,
    /// Monte-Carlo log expected improvement with a smoothed maximum.
    #[serde(rename = "logei_mc")]
    LogExpectedImprovementMc,
    /// Analytic log expected improvement of a single output; the
    /// scalarization is not used.
    #[serde(rename = "logei")]
    LogExpectedImprovement,
}

impl AcquisitionKind {
    /// Configuration key.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            AcquisitionKind::PosteriorMean => "posterior_mean",
            AcquisitionKind::ExpectedImprovementMc => "ei_mc",
            AcquisitionKind::LogExpectedImprovementMc => "logei_mc",
            AcquisitionKind::LogExpectedImprovement => "logei",
        }
    }
}

impl fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for AcquisitionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "posterior_mean" => Ok(AcquisitionKind::PosteriorMean),
            "ei_mc" => Ok(AcquisitionKind::ExpectedImprovementMc),
            "logei_mc" => Ok(AcquisitionKind::LogExpectedImprovementMc),
            "logei" => Ok(AcquisitionKind::LogExpectedImprovement),
            other => Err(Error::UnknownAcquisition(other.to_string())),
        }
    }
}

/// An acquisition function bound to a composite model.
///
/// Monte-Carlo variants reuse one fixed set of standard-normal base samples
/// per output, so repeated evaluations at the same point agree exactly.
#[derive(Clone)]
pub struct Acquisition {
    kind: AcquisitionKind,
    model: Arc<CompositeModel>,
    scalarize: Scalarize,
    base_samples: DMatrix<f64>,
    best_f: f64,
}

impl fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquisition")
            .field("kind", &self.kind)
            .field("outputs", &self.model.output_names())
            .field("n_samples", &self.base_samples.nrows())
            .field("best_f", &self.best_f)
            .finish_non_exhaustive()
    }
}

impl Acquisition {
    /// Bind `kind` to `model`.
    ///
    /// The incumbent is the best residual over the model's training outputs,
    /// or for analytic log-EI the largest training output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when an improvement-based kind has no
    /// training data to take the incumbent from, when analytic log-EI is
    /// asked of more than one output, or for zero samples.
    pub fn new(
        kind: AcquisitionKind,
        model: Arc<CompositeModel>,
        scalarize: Scalarize,
        n_samples: usize,
        seed: u64,
    ) -> Result<Self> {
        if n_samples == 0 {
            return Err(Error::InvalidConfig(String::from(
                "acquisition needs at least one sample",
            )));
        }
        let best_f = match kind {
            AcquisitionKind::PosteriorMean => f64::NAN,
            AcquisitionKind::LogExpectedImprovement => {
                if model.n_outputs() != 1 {
                    return Err(Error::InvalidConfig(format!(
                        "analytic log expected improvement needs exactly one output, got {}",
                        model.n_outputs()
                    )));
                }
                trace_warn!("analytic acquisition chosen, the scalarization is ignored");
                incumbent(model.train_y().map(|y| y.column(0).iter().copied().collect()))?
            }
            AcquisitionKind::ExpectedImprovementMc | AcquisitionKind::LogExpectedImprovementMc => {
                incumbent(model.train_y().map(|y| scalarize(y).residual.iter().copied().collect()))?
            }
        };
        let mut rng = fastrand::Rng::with_seed(seed);
        let base_samples = DMatrix::from_fn(n_samples, model.n_outputs(), |_, _| {
            crate::rng_util::standard_normal(&mut rng)
        });
        trace_debug!(kind = %kind, best_f, n_samples, "acquisition defined");
        Ok(Self {
            kind,
            model,
            scalarize,
            base_samples,
            best_f,
        })
    }

    /// Acquisition kind.
    #[must_use]
    pub fn kind(&self) -> AcquisitionKind {
        self.kind
    }

    /// Incumbent value improvements are measured against (NaN for the
    /// posterior mean).
    #[must_use]
    pub fn best_f(&self) -> f64 {
        self.best_f
    }

    /// Acquisition value at each row of raw inputs `x`.
    ///
    /// # Errors
    ///
    /// Propagates prediction failures.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, x: &DMatrix<f64>) -> Result<DVector<f64>> {
        let p = self.model.predict(x, false, None)?;
        let k = x.nrows();
        match self.kind {
            AcquisitionKind::PosteriorMean => Ok((self.scalarize)(&p.mean).residual),
            AcquisitionKind::LogExpectedImprovement => Ok(DVector::from_fn(k, |i, _| {
                log_expected_improvement(p.mean[(i, 0)], p.variance[(i, 0)].max(0.0).sqrt(), self.best_f)
            })),
            AcquisitionKind::ExpectedImprovementMc | AcquisitionKind::LogExpectedImprovementMc => {
                let s = self.base_samples.nrows();
                let std = p.std();
                let mut per_sample = DMatrix::zeros(k, s);
                for j in 0..s {
                    let draw = DMatrix::from_fn(k, p.n_outputs(), |i, o| {
                        p.mean[(i, o)] + std[(i, o)] * self.base_samples[(j, o)]
                    });
                    per_sample.set_column(j, &(self.scalarize)(&draw).residual);
                }
                let log_s = (s as f64).ln();
                Ok(DVector::from_fn(k, |i, _| {
                    let improvements = per_sample.row(i).map(|r| r - self.best_f);
                    if self.kind == AcquisitionKind::ExpectedImprovementMc {
                        improvements.iter().map(|v| v.max(0.0)).sum::<f64>() / s as f64
                    } else {
                        let terms: Vec<f64> = improvements
                            .iter()
                            .map(|v| stats::log_softplus(v / LOGEI_TAU) + LOGEI_TAU.ln())
                            .collect();
                        stats::log_sum_exp(&terms) - log_s
                    }
                }))
            }
        }
    }
}

fn incumbent(values: Option<Vec<f64>>) -> Result<f64> {
    let values = values.ok_or_else(|| {
        Error::InvalidConfig(String::from(
            "improvement-based acquisition needs the model's training data",
        ))
    })?;
    let best = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if best.is_finite() {
        Ok(best)
    } else {
        Err(Error::InvalidConfig(String::from(
            "no finite training value to measure improvement against",
        )))
    }
}

/// `log E[max(f − best, 0)]` for `f ~ N(mean, std²)`.
fn log_expected_improvement(mean: f64, std: f64, best: f64) -> f64 {
    if std <= 0.0 {
        return (mean - best).max(0.0).ln();
    }
    let z = (mean - best) / std;
    std.ln() + log_h(z)
}

/// `log(φ(z) + zΦ(z))`.
fn log_h(z: f64) -> f64 {
    if z > LOGEI_ASYMPTOTIC_Z {
        (stats::norm_pdf(z) + z * stats::norm_cdf(z)).ln()
    } else {
        // φ(z)/z² (1 − 3/z² + 15/z⁴) for large negative z
        let z2 = z * z;
        stats::log_norm_pdf(z) - z2.ln() + (-3.0 / z2 + 15.0 / (z2 * z2)).ln_1p()
    }
}

/// Closures shared by the optimizers for one optimization step.
#[derive(Clone, Debug)]
pub struct Evaluators {
    acquisition: Acquisition,
}

impl Evaluators {
    /// Bundle an acquisition with its model and scalarization.
    #[must_use]
    pub fn new(acquisition: Acquisition) -> Self {
        Self { acquisition }
    }

    /// The acquisition function.
    #[must_use]
    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    /// The composite model.
    #[must_use]
    pub fn model(&self) -> &Arc<CompositeModel> {
        &self.acquisition.model
    }

    /// Scalarization of the posterior mean at `x`.
    ///
    /// # Errors
    ///
    /// Propagates prediction failures.
    pub fn objective(&self, x: &DMatrix<f64>) -> Result<Scalarization> {
        let p = self.acquisition.model.predict(x, false, None)?;
        Ok((self.acquisition.scalarize)(&p.mean))
    }

    /// Residual of the posterior mean at `x`.
    ///
    /// # Errors
    ///
    /// Propagates prediction failures.
    pub fn residual(&self, x: &DMatrix<f64>) -> Result<DVector<f64>> {
        Ok(self.objective(x)?.residual)
    }

    /// `objective − calibration` of the posterior mean at `x`.
    ///
    /// # Errors
    ///
    /// Propagates prediction failures.
    pub fn residual_components(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        Ok(self.objective(x)?.components())
    }

    /// Scalarize raw output values directly.
    #[must_use]
    pub fn scalarize(&self, y: &DMatrix<f64>) -> Scalarization {
        (self.acquisition.scalarize)(y)
    }
}
