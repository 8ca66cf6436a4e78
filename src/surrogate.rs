//! One surrogate per predicted output.
//!
//! [`SurrogateModel::builder`] performs all data preparation for one output:
//! avoided rows are removed, extra points are merged from a snapshot file,
//! negligible jitter in extra features is suppressed, a single point is
//! duplicated, the noise floor is applied, the training snapshot is written
//! and the normalization pass runs. [`SurrogateModel::fit`] then fits either
//! a GP or, for degenerate outputs, a constant model.
//!
//! # Examples
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use surrogate_optimizer::SurrogateModel;
//!
//! let x = DMatrix::from_row_slice(4, 1, &[0.0, 1.0, 2.0, 3.0]);
//! let y = DVector::from_vec(vec![1.0, 2.0, 4.0, 8.0]);
//! let yvar = DVector::from_element(4, 1e-4);
//!
//! let mut model = SurrogateModel::builder("f", x, y, yvar).build().unwrap();
//! model.fit().unwrap();
//! let p = model.predict(&DMatrix::from_element(1, 1, 1.5), false, None).unwrap();
//! assert!(p.lower[(0, 0)] <= p.mean[(0, 0)] && p.mean[(0, 0)] <= p.upper[(0, 0)]);
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::gp::{ConstantModel, GaussianProcess, GpFitOptions};
use crate::lbfgs::LbfgsOptions;
use crate::rng_util;
use crate::snapshot::{SnapshotEntry, SnapshotStore};
use crate::training::{AvoidSet, ExtraPoints, select_rows, vstack};
use crate::transform::{
    IdentityTransform, InputNormalization, OutputStandardization, PhysicsTransform,
    TransformPipeline,
};

/// Covariance family of the GP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelChoice {
    /// Matérn 5/2 with ARD lengthscales.
    #[default]
    Matern52,
    /// Constant covariance (a fitted level with uncertainty).
    Constant,
}

/// Per-output surrogate configuration.
///
/// | Field | Default |
/// |-------|---------|
/// | `kernel` | Matérn 5/2 |
/// | `minimum_relative_noise` | none |
/// | `extra_points_file` | none |
/// | `fit_only_from_extra_points` | `false` |
/// | `constant_threshold` | 1e-6 |
/// | `variation_threshold` | 1e-6 |
/// | `duplicate_factor` | 1.2 |
/// | `max_fit_attempts` | 20 |
/// | `max_iterations` | 200 |
/// | `confidence_stds` | 2.0 |
/// | `normalization_range` | (0, 1) |
/// | `learn_input_bounds` | `true` |
/// | `seed` | 0 |
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurrogateOptions {
    /// Covariance family.
    pub kernel: KernelChoice,
    /// Noise floor as a fraction of the largest output magnitude.
    pub minimum_relative_noise: Option<f64>,
    /// Snapshot file to read extra points from.
    pub extra_points_file: Option<PathBuf>,
    /// Ignore the run's own points and fit from extra points only.
    pub fit_only_from_extra_points: bool,
    /// Relative output range below which the output is degenerate.
    pub constant_threshold: f64,
    /// Relative variation below which extra-point features are snapped to
    /// the run's constant value.
    pub variation_threshold: f64,
    /// Scale of the copy made when only one point is available.
    pub duplicate_factor: f64,
    /// Hyperparameter fit attempts before giving up.
    pub max_fit_attempts: usize,
    /// L-BFGS iterations per attempt.
    pub max_iterations: usize,
    /// Half-width of the confidence band in standard deviations.
    pub confidence_stds: f64,
    /// Target interval of the input normalization.
    pub normalization_range: (f64, f64),
    /// Fit the input normalization to the data instead of the bounds.
    pub learn_input_bounds: bool,
    /// Seed for restarts and posterior draws.
    pub seed: u64,
}

impl Default for SurrogateOptions {
    fn default() -> Self {
        Self {
            kernel: KernelChoice::Matern52,
            minimum_relative_noise: None,
            extra_points_file: None,
            fit_only_from_extra_points: false,
            constant_threshold: 1e-6,
            variation_threshold: 1e-6,
            duplicate_factor: 1.2,
            max_fit_attempts: 20,
            max_iterations: 200,
            confidence_stds: 2.0,
            normalization_range: (0.0, 1.0),
            learn_input_bounds: true,
            seed: 0,
        }
    }
}

impl SurrogateOptions {
    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let bad = |what: &str| Err(Error::InvalidConfig(format!("surrogate option {what}")));
        if let Some(r) = self.minimum_relative_noise {
            if !(r.is_finite() && r >= 0.0) {
                return bad("minimum_relative_noise must be a non-negative number");
            }
        }
        if !(self.constant_threshold.is_finite() && self.constant_threshold >= 0.0) {
            return bad("constant_threshold must be non-negative");
        }
        if !(self.variation_threshold.is_finite() && self.variation_threshold >= 0.0) {
            return bad("variation_threshold must be non-negative");
        }
        if !(self.duplicate_factor.is_finite() && self.duplicate_factor != 1.0) {
            return bad("duplicate_factor must be finite and differ from 1");
        }
        if self.max_fit_attempts == 0 {
            return bad("max_fit_attempts must be at least 1");
        }
        if !(self.confidence_stds.is_finite() && self.confidence_stds >= 0.0) {
            return bad("confidence_stds must be non-negative");
        }
        let (lo, hi) = self.normalization_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return bad("normalization_range must be increasing");
        }
        Ok(())
    }
}

/// Posterior summary in raw units, one column per output.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    /// Posterior mean (`n × m`).
    pub mean: DMatrix<f64>,
    /// Posterior variance (`n × m`).
    pub variance: DMatrix<f64>,
    /// `mean + k·σ`.
    pub upper: DMatrix<f64>,
    /// `mean − k·σ`.
    pub lower: DMatrix<f64>,
    /// Posterior draws, each `n × m`, when requested.
    pub samples: Option<Vec<DMatrix<f64>>>,
}

impl Prediction {
    /// Number of predicted points.
    #[must_use]
    pub fn n_points(&self) -> usize {
        self.mean.nrows()
    }

    /// Number of outputs.
    #[must_use]
    pub fn n_outputs(&self) -> usize {
        self.mean.ncols()
    }

    /// Standard deviations.
    #[must_use]
    pub fn std(&self) -> DMatrix<f64> {
        self.variance.map(f64::sqrt)
    }

    /// Join single-output predictions column-wise, in order.
    pub(crate) fn concat(parts: &[Prediction]) -> Prediction {
        let n = parts.first().map_or(0, Prediction::n_points);
        let join = |blocks: Vec<&DMatrix<f64>>| hcat(n, &blocks);
        let samples = match parts.first().and_then(|p| p.samples.as_ref()) {
            Some(first) if parts.iter().all(|p| p.samples.is_some()) => Some(
                (0..first.len())
                    .map(|s| {
                        join(
                            parts
                                .iter()
                                .filter_map(|p| p.samples.as_ref().and_then(|v| v.get(s)))
                                .collect(),
                        )
                    })
                    .collect(),
            ),
            _ => None,
        };
        Prediction {
            mean: join(parts.iter().map(|p| &p.mean).collect()),
            variance: join(parts.iter().map(|p| &p.variance).collect()),
            upper: join(parts.iter().map(|p| &p.upper).collect()),
            lower: join(parts.iter().map(|p| &p.lower).collect()),
            samples,
        }
    }
}

fn hcat(n: usize, blocks: &[&DMatrix<f64>]) -> DMatrix<f64> {
    let m: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut out = DMatrix::zeros(n, m);
    let mut c = 0;
    for b in blocks {
        out.columns_mut(c, b.ncols()).copy_from(*b);
        c += b.ncols();
    }
    out
}

/// Fitted GP hyperparameters in model space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// One lengthscale per feature (empty for the constant kernel).
    pub lengthscales: Vec<f64>,
    /// Kernel outputscale.
    pub outputscale: f64,
    /// Constant prior mean.
    pub mean: f64,
}

#[derive(Clone, Debug)]
enum ModelState {
    Unfitted,
    Gp(Box<GaussianProcess>),
    Constant(ConstantModel),
}

/// Builder for [`SurrogateModel`].
#[must_use]
pub struct SurrogateBuilder<'a> {
    output: String,
    x: DMatrix<f64>,
    y: DVector<f64>,
    yvar: DVector<f64>,
    bounds: Option<&'a Bounds>,
    avoid: Option<&'a AvoidSet>,
    options: SurrogateOptions,
    physics: Arc<dyn PhysicsTransform>,
    snapshot: Option<&'a SnapshotStore>,
}

impl<'a> SurrogateBuilder<'a> {
    /// Bounds of the raw inputs, used for feature names and static scaling.
    pub fn bounds(mut self, bounds: &'a Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Rows to leave out.
    pub fn avoid(mut self, avoid: &'a AvoidSet) -> Self {
        self.avoid = Some(avoid);
        self
    }

    /// Surrogate options.
    pub fn options(mut self, options: SurrogateOptions) -> Self {
        self.options = options;
        self
    }

    /// Physics transform (identity by default).
    pub fn physics(mut self, physics: Arc<dyn PhysicsTransform>) -> Self {
        self.physics = physics;
        self
    }

    /// Snapshot store receiving this output's training data.
    pub fn snapshot(mut self, store: &'a SnapshotStore) -> Self {
        self.snapshot = Some(store);
        self
    }

    /// Prepare the training data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] for inconsistent arrays,
    /// [`Error::InvalidConfig`] for bad options or extra points missing a
    /// fitted feature, and I/O or snapshot errors from the snapshot files.
    #[allow(clippy::too_many_lines)]
    pub fn build(self) -> Result<SurrogateModel> {
        let SurrogateBuilder {
            output,
            x,
            y,
            yvar,
            bounds,
            avoid,
            options,
            physics,
            snapshot,
        } = self;
        options.validate()?;
        if y.len() != x.nrows() {
            return Err(Error::ShapeMismatch {
                what: "surrogate y vs x rows",
                expected: x.nrows(),
                got: y.len(),
            });
        }
        if yvar.len() != x.nrows() {
            return Err(Error::ShapeMismatch {
                what: "surrogate yvar vs x rows",
                expected: x.nrows(),
                got: yvar.len(),
            });
        }
        if let Some(b) = bounds {
            if b.len() != x.ncols() {
                return Err(Error::ShapeMismatch {
                    what: "bounds vs x columns",
                    expected: x.ncols(),
                    got: b.len(),
                });
            }
        }
        let n_inputs = x.ncols();
        let mut pipeline = TransformPipeline::new(&output, physics, options.normalization_range)?;

        // Avoided rows, or every run row when fitting from extra points only.
        let kept: Vec<usize> = if options.fit_only_from_extra_points {
            trace_info!(output = %output, "fitting from extra points only, run points ignored");
            Vec::new()
        } else {
            let avoid_empty = AvoidSet::new();
            let avoid = avoid.unwrap_or(&avoid_empty);
            (0..x.nrows()).filter(|i| !avoid.contains(*i)).collect()
        };
        if kept.len() < x.nrows() && !options.fit_only_from_extra_points {
            trace_info!(
                output = %output,
                removed = x.nrows() - kept.len(),
                "avoided points removed before fitting"
            );
        }
        let mut run_x = select_rows(&x, &kept);
        let run_y = DVector::from_iterator(kept.len(), kept.iter().map(|&i| y[i]));
        let run_yvar = DVector::from_iterator(kept.len(), kept.iter().map(|&i| yvar[i]));

        let features = pipeline.features(&run_x);
        let n_features = if features.ncols() > 0 || run_x.nrows() > 0 {
            features.ncols()
        } else {
            n_inputs
        };

        let raw_names: Vec<String> = match bounds {
            Some(b) => b.names().into_iter().map(String::from).collect(),
            None => (0..n_inputs).map(|j| format!("x_{j}")).collect(),
        };
        let raw_refs: Vec<&str> = raw_names.iter().map(String::as_str).collect();
        let feature_names = pipeline.physics().feature_names(&output, &raw_refs);

        // Extra points as stored (complete width) and as fitted.
        let extra_full = match &options.extra_points_file {
            Some(path) => conform_width(
                &output,
                SnapshotStore::new(path).extra_points(&output)?,
                feature_names.len(),
            )?,
            None => ExtraPoints::empty(feature_names.len()),
        };
        let mut added = fit_extra_points(&output, &pipeline, &extra_full, n_features)?;
        if !added.is_empty() {
            trace_info!(output = %output, rows = added.len(), "extra points merged into the fit");
        }

        let (run_yp, run_yvarp) = pipeline.physics_outputs(&run_x, &run_y, &run_yvar);

        let constant = if options.fit_only_from_extra_points {
            false
        } else {
            is_degenerate(&run_y, options.constant_threshold)
        };
        if constant {
            trace_warn!(
                output = %output,
                points = run_y.len(),
                "output is degenerate (near-constant or NaN), using a constant model"
            );
        }

        let mut added_x = added.x().clone();
        let snapped = suppress_minimal_variation(&features, &mut added_x, options.variation_threshold);
        if snapped > 0 {
            trace_info!(
                output = %output,
                columns = snapped,
                "extra-point features with negligible variation snapped to the run's value"
            );
            added = ExtraPoints::new(added_x, added.y().clone(), added.yvar().clone())?;
        }

        // Snapshot rows are the data as evaluated, before duplication.
        if let Some(store) = snapshot {
            let complete = if run_x.nrows() == 0 {
                DMatrix::zeros(0, extra_full.width())
            } else {
                pipeline.physics().complete_inputs(&output, &run_x)
            };
            store.update(SnapshotEntry::from_matrices(
                &output,
                feature_names.clone(),
                &vstack(extra_full.x(), &complete),
                &stack_vectors(extra_full.y(), &run_yp),
                &stack_vectors(extra_full.yvar(), &run_yvarp),
            ))?;
        }

        let n_run = run_x.nrows();
        let (mut run_yp, mut run_yvarp) = (run_yp, run_yvarp);
        let mut features = features;
        if n_run + added.len() == 1 {
            let f = options.duplicate_factor;
            trace_warn!(
                output = %output,
                factor = f,
                "only one training point, duplicating it with a scaled copy"
            );
            if n_run == 1 {
                run_x = vstack(&run_x, &run_x.map(|v| v * f));
                features = pipeline.features(&run_x);
                run_yp = DVector::from_vec(vec![run_yp[0], run_yp[0] * f]);
                run_yvarp = DVector::from_vec(vec![run_yvarp[0], run_yvarp[0] * f]);
            } else {
                let ax = added.x();
                added = ExtraPoints::new(
                    vstack(ax, &ax.map(|v| v * f)),
                    DVector::from_vec(vec![added.y()[0], added.y()[0] * f]),
                    DVector::from_vec(vec![added.yvar()[0], added.yvar()[0] * f]),
                )?;
            }
        }

        let fit_x = vstack(added.x(), &features);
        let fit_y = stack_vectors(added.y(), &run_yp);
        let mut fit_yvar = stack_vectors(added.yvar(), &run_yvarp);

        if let Some(rel) = options.minimum_relative_noise {
            apply_noise_floor(&output, &fit_y, &mut fit_yvar, rel);
        }

        let outputs = OutputStandardization::fit(&fit_y);
        let static_inputs = bounds
            .filter(|b| !options.learn_input_bounds && b.len() == n_features)
            .map(|b| {
                InputNormalization::with_bounds(
                    b.lower().iter().copied().collect(),
                    b.upper().iter().copied().collect(),
                    options.normalization_range,
                )
            })
            .transpose()?;
        match static_inputs {
            Some(inputs) => pipeline.set_normalization(inputs, outputs),
            None => pipeline.fit_normalization(&fit_x, &fit_y)?,
        }

        Ok(SurrogateModel {
            output,
            options,
            pipeline,
            n_inputs,
            n_features,
            run_x,
            run_y,
            n_run,
            added,
            fit_x,
            fit_y,
            fit_yvar,
            constant,
            state: ModelState::Unfitted,
            losses: Vec::new(),
            feature_names,
        })
    }
}

/// GP (or constant) surrogate of one output.
#[derive(Debug)]
pub struct SurrogateModel {
    output: String,
    options: SurrogateOptions,
    pipeline: TransformPipeline,
    n_inputs: usize,
    n_features: usize,
    run_x: DMatrix<f64>,
    run_y: DVector<f64>,
    n_run: usize,
    added: ExtraPoints,
    fit_x: DMatrix<f64>,
    fit_y: DVector<f64>,
    fit_yvar: DVector<f64>,
    constant: bool,
    state: ModelState,
    losses: Vec<f64>,
    feature_names: Vec<String>,
}

impl SurrogateModel {
    /// Start preparing a surrogate for `output` from raw inputs (`n × d`),
    /// outputs and output variances.
    pub fn builder<'a>(
        output: impl Into<String>,
        x: DMatrix<f64>,
        y: DVector<f64>,
        yvar: DVector<f64>,
    ) -> SurrogateBuilder<'a> {
        SurrogateBuilder {
            output: output.into(),
            x,
            y,
            yvar,
            bounds: None,
            avoid: None,
            options: SurrogateOptions::default(),
            physics: Arc::new(IdentityTransform),
            snapshot: None,
        }
    }

    /// Fit the model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTrainingSet`] when no point is left and
    /// [`Error::FitFailed`] when every hyperparameter attempt failed.
    pub fn fit(&mut self) -> Result<()> {
        if self.fit_y.is_empty() {
            return Err(Error::EmptyTrainingSet(self.output.clone()));
        }
        let xm = self.pipeline.normalize_features(&self.fit_x);
        let (ym, vm) = self.pipeline.to_model_outputs(&self.fit_y, &self.fit_yvar);

        if self.constant {
            let model = ConstantModel::fit(&ym, &vm);
            trace_info!(
                output = %self.output,
                mean = model.mean,
                variance = model.variance,
                "constant model fitted"
            );
            self.losses.clear();
            self.state = ModelState::Constant(model);
            return Ok(());
        }

        let opts = GpFitOptions {
            max_attempts: self.options.max_fit_attempts,
            lbfgs: LbfgsOptions {
                max_iter: self.options.max_iterations,
                ..LbfgsOptions::default()
            },
            seed: self.options.seed,
        };
        let constant_kernel = self.options.kernel == KernelChoice::Constant;
        let (gp, report) = GaussianProcess::fit(&xm, &ym, &vm, constant_kernel, &opts).map_err(
            |(reason, attempts)| Error::FitFailed {
                output: self.output.clone(),
                attempts,
                reason,
            },
        )?;
        trace_info!(
            output = %self.output,
            points = ym.len(),
            attempts = report.attempts,
            converged = report.converged,
            loss = report.losses.last().copied().unwrap_or(f64::NAN),
            "surrogate fitted"
        );
        self.losses = report.losses;
        self.state = ModelState::Gp(Box::new(gp));
        Ok(())
    }

    /// Posterior at raw inputs `x` (`k × d`).
    ///
    /// With `fundamental` the physics stage is bypassed: `x` must then hold
    /// features and the returned values are in physics space. `n_samples`
    /// requests posterior draws.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before [`fit`](Self::fit) and
    /// [`Error::ShapeMismatch`] for a wrong column count.
    pub fn predict(
        &self,
        x: &DMatrix<f64>,
        fundamental: bool,
        n_samples: Option<usize>,
    ) -> Result<Prediction> {
        let expected = if fundamental { self.n_features } else { self.n_inputs };
        if x.ncols() != expected {
            return Err(Error::ShapeMismatch {
                what: "prediction input columns",
                expected,
                got: x.ncols(),
            });
        }
        let physics = !fundamental && self.pipeline.physics_enabled();
        let xm = self.pipeline.to_model_inputs_with(x, physics);
        let k = x.nrows();

        let (mean_m, var_m, draws_m) = match &self.state {
            ModelState::Unfitted => {
                return Err(Error::InvalidPhase {
                    expected: "fitted",
                    found: "unfitted",
                });
            }
            ModelState::Constant(c) => {
                let (m, v) = c.predict(k);
                let draws = n_samples.map(|s| {
                    let mut rng = fastrand::Rng::with_seed(self.options.seed);
                    (0..s)
                        .map(|_| {
                            let z = rng_util::standard_normal(&mut rng);
                            m.map(|mi| mi + c.variance.sqrt() * z)
                        })
                        .collect::<Vec<_>>()
                });
                (m, v, draws)
            }
            ModelState::Gp(gp) => match n_samples {
                None => {
                    let (m, v) = gp.predict(&xm);
                    (m, v, None)
                }
                Some(s) => {
                    let (m, cov) = gp.predict_cov(&xm);
                    let v = DVector::from_fn(k, |i, _| cov[(i, i)].max(0.0));
                    let draws = draw_samples(&m, &cov, s, self.options.seed);
                    (m, v, Some(draws))
                }
            },
        };

        let (mean, var) = self.pipeline.from_model_outputs_with(x, &mean_m, &var_m, physics);
        let zeros = DVector::zeros(k);
        let samples = draws_m.map(|draws| {
            draws
                .iter()
                .map(|d| {
                    let (raw, _) = self.pipeline.from_model_outputs_with(x, d, &zeros, physics);
                    DMatrix::from_column_slice(k, 1, raw.as_slice())
                })
                .collect()
        });

        let kstd = self.options.confidence_stds;
        let std = var.map(|v| v.max(0.0).sqrt());
        Ok(Prediction {
            mean: DMatrix::from_column_slice(k, 1, mean.as_slice()),
            variance: DMatrix::from_column_slice(k, 1, var.as_slice()),
            upper: DMatrix::from_column_slice(k, 1, (&mean + &std * kstd).as_slice()),
            lower: DMatrix::from_column_slice(k, 1, (&mean - &std * kstd).as_slice()),
            samples,
        })
    }

    /// [`predict`](Self::predict) over several batches.
    ///
    /// # Errors
    ///
    /// As [`predict`](Self::predict), for the first failing batch.
    pub fn predict_batched(
        &self,
        batches: &[DMatrix<f64>],
        fundamental: bool,
        n_samples: Option<usize>,
    ) -> Result<Vec<Prediction>> {
        batches
            .iter()
            .map(|b| self.predict(b, fundamental, n_samples))
            .collect()
    }

    /// Relative in-sample error (%) at each run point, in raw units.
    /// Points whose target is zero report the absolute error instead.
    ///
    /// # Errors
    ///
    /// As [`predict`](Self::predict).
    pub fn training_errors(&self) -> Result<Vec<f64>> {
        if self.n_run == 0 {
            return Ok(Vec::new());
        }
        let x = self.run_x.rows(0, self.n_run).into_owned();
        let p = self.predict(&x, false, None)?;
        Ok((0..self.n_run)
            .map(|i| {
                let err = (p.mean[(i, 0)] - self.run_y[i]).abs();
                if self.run_y[i] == 0.0 {
                    err * 100.0
                } else {
                    err / self.run_y[i].abs() * 100.0
                }
            })
            .collect())
    }

    /// Largest relative in-sample error (%), NaN entries ignored.
    ///
    /// # Errors
    ///
    /// As [`predict`](Self::predict).
    pub fn training_accuracy(&self) -> Result<f64> {
        Ok(self
            .training_errors()?
            .into_iter()
            .filter(|e| !e.is_nan())
            .fold(0.0, f64::max))
    }

    /// Objective value after every accepted optimizer step.
    #[must_use]
    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    /// Whether the output was fitted with a constant model.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// Whether [`fit`](Self::fit) has completed.
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        !matches!(self.state, ModelState::Unfitted)
    }

    /// Output name.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Number of run points used (after avoidance, before duplication).
    #[must_use]
    pub fn n_train(&self) -> usize {
        self.n_run
    }

    /// Number of extra points merged into the fit.
    #[must_use]
    pub fn n_added(&self) -> usize {
        self.added.len()
    }

    /// Number of raw inputs.
    #[must_use]
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    /// Number of features after the physics stage.
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Names of the complete feature set.
    #[must_use]
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Transform pipeline of this output.
    #[must_use]
    pub fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    /// Physics-space training rows actually fitted: extra points first.
    #[must_use]
    pub fn fit_data(&self) -> (&DMatrix<f64>, &DVector<f64>, &DVector<f64>) {
        (&self.fit_x, &self.fit_y, &self.fit_yvar)
    }

    /// Options the model was built with.
    #[must_use]
    pub fn options(&self) -> &SurrogateOptions {
        &self.options
    }

    /// Fitted GP hyperparameters, `None` for constant or unfitted models.
    #[must_use]
    pub fn hyperparameters(&self) -> Option<Hyperparameters> {
        match &self.state {
            ModelState::Gp(gp) => Some(Hyperparameters {
                lengthscales: gp.lengthscales().to_vec(),
                outputscale: gp.outputscale(),
                mean: gp.mean_constant(),
            }),
            _ => None,
        }
    }
}

/// Relative range below `threshold`, or any NaN, over at least two points.
pub(crate) fn is_degenerate(y: &DVector<f64>, threshold: f64) -> bool {
    if y.iter().any(|v| v.is_nan()) {
        return true;
    }
    if y.len() < 2 {
        return false;
    }
    let (lo, hi) = y
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
    let range = hi - lo;
    if range == 0.0 {
        return true;
    }
    let mean = crate::stats::mean(y.as_slice()).abs();
    range / mean < threshold
}

/// Bring stored extra points to the complete feature width: narrower rows
/// are padded with NaN and wider rows truncated, both with a warning.
fn conform_width(output: &str, extra: ExtraPoints, width: usize) -> Result<ExtraPoints> {
    let stored = extra.width();
    if extra.is_empty() {
        return Ok(ExtraPoints::empty(width));
    }
    if stored == width {
        return Ok(extra);
    }
    let x = if stored < width {
        trace_warn!(output, stored, width, "extra points narrower than the features, padded with NaN");
        DMatrix::from_fn(extra.len(), width, |i, j| {
            if j < stored { extra.x()[(i, j)] } else { f64::NAN }
        })
    } else {
        trace_warn!(output, stored, width, "extra points wider than the features, extra columns dropped");
        extra.x().columns(0, width).into_owned()
    };
    ExtraPoints::new(x, extra.y().clone(), extra.yvar().clone())
}

/// Map complete-width extra points to the features used in the fit.
fn fit_extra_points(
    output: &str,
    pipeline: &TransformPipeline,
    extra: &ExtraPoints,
    n_features: usize,
) -> Result<ExtraPoints> {
    if extra.is_empty() {
        return Ok(ExtraPoints::empty(n_features));
    }
    let x = pipeline.physics().features_from_complete(output, extra.x());
    if x.ncols() != n_features {
        return Err(Error::ShapeMismatch {
            what: "extra points feature columns",
            expected: n_features,
            got: x.ncols(),
        });
    }
    if let Some(row) = x.row_iter().position(|r| r.iter().any(|v| v.is_nan())) {
        return Err(Error::InvalidConfig(format!(
            "extra point {row} of '{output}' lacks a feature used in the fit"
        )));
    }
    if let Some(row) = extra.y().iter().position(|v| !v.is_finite()) {
        return Err(Error::InvalidConfig(format!(
            "extra point {row} of '{output}' has no output value"
        )));
    }
    ExtraPoints::new(x, extra.y().clone(), extra.yvar().map(|v| if v.is_nan() { 0.0 } else { v }))
}

/// Snap extra-point feature columns that barely vary to the run's value
/// wherever the run itself holds that column constant. Returns the number
/// of columns changed.
fn suppress_minimal_variation(run: &DMatrix<f64>, added: &mut DMatrix<f64>, threshold: f64) -> usize {
    if run.nrows() == 0 || added.nrows() == 0 || run.ncols() != added.ncols() {
        return 0;
    }
    let relative = |dev: f64, reference: f64| {
        if reference == 0.0 { dev } else { dev / reference.abs() }
    };
    let mut snapped = 0;
    for j in 0..run.ncols() {
        let col = run.column(j);
        let reference = col[0];
        let run_dev = col.iter().map(|v| (v - reference).abs()).fold(0.0, f64::max);
        if relative(run_dev, reference) >= threshold {
            continue;
        }
        let added_dev = added
            .column(j)
            .iter()
            .map(|v| (v - reference).abs())
            .fold(0.0, f64::max);
        if added_dev > 0.0 && relative(added_dev, reference) < threshold {
            added.column_mut(j).fill(reference);
            snapped += 1;
        }
    }
    snapped
}

fn apply_noise_floor(output: &str, y: &DVector<f64>, yvar: &mut DVector<f64>, relative: f64) {
    let max_abs = y
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.abs())
        .fold(0.0, f64::max);
    let floor = relative * max_abs;
    let floor_var = floor * floor;
    let clipped = yvar.iter().filter(|v| **v < floor_var).count();
    if clipped > 0 {
        trace_warn!(
            output,
            points = clipped,
            min_std = floor,
            "uncertainties below the noise floor clipped"
        );
        for v in yvar.iter_mut() {
            *v = v.max(floor_var);
        }
    }
}

fn stack_vectors(a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(a.len() + b.len(), a.iter().chain(b.iter()).copied())
}

/// Correlated draws `mean + L z` from a model-space posterior.
fn draw_samples(mean: &DVector<f64>, cov: &DMatrix<f64>, n: usize, seed: u64) -> Vec<DVector<f64>> {
    let k = mean.len();
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut jitter = 1e-10;
    let factor = loop {
        let c = cov + DMatrix::identity(k, k) * jitter;
        if let Some(ch) = nalgebra::linalg::Cholesky::new(c) {
            break Some(ch.unpack());
        }
        jitter *= 10.0;
        if jitter > 1e-3 {
            break None;
        }
    };
    // Fall back to independent marginals when the covariance is not usable.
    let factor = factor.unwrap_or_else(|| {
        DMatrix::from_diagonal(&DVector::from_fn(k, |i, _| cov[(i, i)].max(0.0).sqrt()))
    });
    (0..n)
        .map(|_| {
            let z = DVector::from_fn(k, |_, _| rng_util::standard_normal(&mut rng));
            mean + &factor * z
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let x = DMatrix::from_fn(n, 1, |i, _| i as f64);
        let y = DVector::from_fn(n, |i, _| 10.0 + 2.0 * i as f64);
        let yvar = DVector::from_element(n, 1e-4);
        (x, y, yvar)
    }

    #[test]
    fn degenerate_detection() {
        assert!(is_degenerate(&DVector::from_vec(vec![5.0, 5.0 + 1e-9, 5.0]), 1e-6));
        assert!(is_degenerate(&DVector::from_vec(vec![1.0, f64::NAN]), 1e-6));
        assert!(!is_degenerate(&DVector::from_vec(vec![1.0, 1.1]), 1e-6));
        assert!(!is_degenerate(&DVector::from_vec(vec![3.0]), 1e-6));
        assert!(is_degenerate(&DVector::from_vec(vec![0.0, 0.0]), 1e-6));
    }

    #[test]
    fn avoided_rows_are_removed() {
        let (x, y, yvar) = line(5);
        let avoid: AvoidSet = [0, 4].into_iter().collect();
        let m = SurrogateModel::builder("f", x, y, yvar).avoid(&avoid).build().unwrap();
        assert_eq!(m.n_train(), 3);
        assert_eq!(m.fit_data().1.as_slice(), &[12.0, 14.0, 16.0]);
    }

    #[test]
    fn single_point_is_duplicated() {
        let (x, y, yvar) = line(1);
        let mut m = SurrogateModel::builder("f", x, y, yvar).build().unwrap();
        let (fx, fy, _) = m.fit_data();
        assert_eq!(fx.nrows(), 2);
        assert!((fy[1] - 12.0).abs() < 1e-12);
        m.fit().unwrap();
        assert_eq!(m.n_train(), 1);
    }

    #[test]
    fn noise_floor_clips_small_uncertainties() {
        let (x, y, _) = line(4);
        let yvar = DVector::from_vec(vec![0.0, 1e-8, 4.0, 0.0]);
        let opts = SurrogateOptions {
            minimum_relative_noise: Some(0.01),
            ..SurrogateOptions::default()
        };
        let m = SurrogateModel::builder("f", x, y, yvar).options(opts).build().unwrap();
        // max |y| = 16, floor std 0.16
        let floor = 0.16_f64 * 0.16;
        let v = m.fit_data().2;
        assert!((v[0] - floor).abs() < 1e-12);
        assert!((v[1] - floor).abs() < 1e-12);
        assert_eq!(v[2], 4.0);
    }

    #[test]
    fn unfitted_model_refuses_to_predict() {
        let (x, y, yvar) = line(3);
        let m = SurrogateModel::builder("f", x, y, yvar).build().unwrap();
        assert!(matches!(
            m.predict(&DMatrix::zeros(1, 1), false, None),
            Err(Error::InvalidPhase { .. })
        ));
    }

    #[test]
    fn wrong_column_count_is_rejected() {
        let (x, y, yvar) = line(3);
        let mut m = SurrogateModel::builder("f", x, y, yvar).build().unwrap();
        m.fit().unwrap();
        assert!(matches!(
            m.predict(&DMatrix::zeros(1, 2), false, None),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn empty_training_set_is_an_error() {
        let (x, y, yvar) = line(2);
        let avoid: AvoidSet = [0, 1].into_iter().collect();
        let mut m = SurrogateModel::builder("f", x, y, yvar).avoid(&avoid).build().unwrap();
        assert!(matches!(m.fit(), Err(Error::EmptyTrainingSet(o)) if o == "f"));
    }

    #[test]
    fn samples_are_reproducible() {
        let (x, y, yvar) = line(5);
        let mut m = SurrogateModel::builder("f", x, y, yvar).build().unwrap();
        m.fit().unwrap();
        let xs = DMatrix::from_row_slice(2, 1, &[0.5, 3.5]);
        let a = m.predict(&xs, false, Some(8)).unwrap();
        let b = m.predict(&xs, false, Some(8)).unwrap();
        assert_eq!(a.samples.as_ref().unwrap().len(), 8);
        assert_eq!(a.samples, b.samples);
    }

    #[test]
    fn minimal_variation_is_snapped() {
        let run = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1.0, 1.0]);
        let mut added = DMatrix::from_row_slice(2, 2, &[1.0 + 1e-9, 0.3, 1.0, 0.7]);
        assert_eq!(suppress_minimal_variation(&run, &mut added, 1e-6), 1);
        assert_eq!(added[(0, 0)], 1.0);
        assert_eq!(added[(0, 1)], 0.3);
    }

    #[test]
    fn extra_points_are_conformed_to_the_feature_width() {
        let extra = |w: usize| {
            ExtraPoints::new(
                DMatrix::from_element(2, w, 0.5),
                DVector::from_element(2, 1.0),
                DVector::from_element(2, 0.01),
            )
            .unwrap()
        };
        let narrow = conform_width("f", extra(1), 2).unwrap();
        assert_eq!(narrow.width(), 2);
        assert!(narrow.x()[(0, 1)].is_nan());
        assert_eq!(conform_width("f", extra(3), 2).unwrap().width(), 2);

        let pipeline =
            TransformPipeline::new("f", Arc::new(IdentityTransform), (0.0, 1.0)).unwrap();
        assert!(matches!(
            fit_extra_points("f", &pipeline, &narrow, 2),
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(fit_extra_points("f", &pipeline, &extra(2), 2).unwrap().len(), 2);
    }
}
