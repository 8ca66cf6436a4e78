//! Transform pipeline between raw design variables and model space.
//!
//! Every surrogate owns one [`TransformPipeline`]. The pipeline applies two
//! stages in order:
//!
//! 1. A problem-specific [`PhysicsTransform`] that turns raw design
//!    variables into engineered features and may re-center the outputs.
//! 2. A statistical stage: [`InputNormalization`] min-max scales the
//!    features and [`OutputStandardization`] brings the outputs to zero
//!    mean and unit variance.
//!
//! Predictions travel back through both stages in reverse. The physics
//! stage can be switched off for the duration of a scope with
//! [`TransformPipeline::fundamental`], so callers can query the model
//! directly in feature space.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest spread accepted when scaling; narrower ranges scale by one.
const MIN_RANGE: f64 = 1e-8;

/// Problem-specific feature engineering, applied per output.
///
/// Implementations must be deterministic. The default methods describe the
/// identity transform, so an implementation only overrides what it changes.
pub trait PhysicsTransform: Send + Sync + fmt::Debug {
    /// Map raw inputs (`n × d`) to the features used to fit `output`.
    fn inputs(&self, output: &str, x: &DMatrix<f64>) -> DMatrix<f64> {
        let _ = output;
        x.clone()
    }

    /// Map raw inputs to the complete feature set, written to snapshots.
    ///
    /// Defaults to [`inputs`](Self::inputs).
    fn complete_inputs(&self, output: &str, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.inputs(output, x)
    }

    /// Fit features from rows of the complete feature set, as stored in
    /// snapshots. Defaults to the identity.
    fn features_from_complete(&self, output: &str, complete: &DMatrix<f64>) -> DMatrix<f64> {
        let _ = output;
        complete.clone()
    }

    /// Names of the complete feature columns.
    fn feature_names(&self, output: &str, raw_names: &[&str]) -> Vec<String> {
        let _ = output;
        raw_names.iter().map(|s| (*s).to_string()).collect()
    }

    /// Map raw outputs and variances of `output` into the fitted quantity.
    ///
    /// `x` holds the raw inputs of the same rows.
    fn outputs(
        &self,
        output: &str,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        yvar: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        let _ = (output, x);
        (y.clone(), yvar.clone())
    }

    /// Inverse of [`outputs`](Self::outputs) for predicted means and
    /// variances.
    fn outputs_inverse(
        &self,
        output: &str,
        x: &DMatrix<f64>,
        mean: &DVector<f64>,
        var: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        let _ = (output, x);
        (mean.clone(), var.clone())
    }
}

/// Leaves inputs and outputs untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityTransform;

impl PhysicsTransform for IdentityTransform {}

/// Feeds each output only the raw columns relevant to it.
///
/// Outputs without an entry use every column. The snapshot always carries
/// every column so a later run can select differently.
///
/// # Examples
///
/// ```
/// use nalgebra::DMatrix;
/// use surrogate_optimizer::{ColumnSelection, PhysicsTransform};
///
/// let sel = ColumnSelection::new().select("Qe", [0, 2]);
/// let x = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
/// assert_eq!(sel.inputs("Qe", &x).as_slice(), &[1.0, 3.0]);
/// assert_eq!(sel.inputs("Qi", &x).ncols(), 3);
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ColumnSelection {
    per_output: HashMap<String, Vec<usize>>,
}

impl ColumnSelection {
    /// Creates an empty selection (every output sees every column).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `output` to the given raw columns.
    #[must_use]
    pub fn select(mut self, output: impl Into<String>, columns: impl IntoIterator<Item = usize>) -> Self {
        self.per_output.insert(output.into(), columns.into_iter().collect());
        self
    }

    /// Check every selected column exists in a `d`-column input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty selection or an
    /// out-of-range column.
    pub fn validate(&self, d: usize) -> Result<()> {
        for (output, cols) in &self.per_output {
            if cols.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "column selection for '{output}' is empty"
                )));
            }
            if let Some(bad) = cols.iter().find(|&&c| c >= d) {
                return Err(Error::InvalidConfig(format!(
                    "column selection for '{output}' references column {bad} of {d}"
                )));
            }
        }
        Ok(())
    }
}

impl PhysicsTransform for ColumnSelection {
    fn inputs(&self, output: &str, x: &DMatrix<f64>) -> DMatrix<f64> {
        match self.per_output.get(output) {
            Some(cols) => DMatrix::from_fn(x.nrows(), cols.len(), |i, j| x[(i, cols[j])]),
            None => x.clone(),
        }
    }

    fn complete_inputs(&self, _output: &str, x: &DMatrix<f64>) -> DMatrix<f64> {
        x.clone()
    }

    fn features_from_complete(&self, output: &str, complete: &DMatrix<f64>) -> DMatrix<f64> {
        self.inputs(output, complete)
    }
}

/// Re-centers outputs by a fixed offset and scale: `y' = (y - offset) * scale`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutputCalibration {
    per_output: HashMap<String, (f64, f64)>,
}

impl OutputCalibration {
    /// Creates an empty calibration (identity for every output).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calibrate `output` with `offset` and non-zero `scale`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `scale` is zero or not finite.
    pub fn with(mut self, output: impl Into<String>, offset: f64, scale: f64) -> Result<Self> {
        let output = output.into();
        if scale == 0.0 || !scale.is_finite() || !offset.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "calibration of '{output}' needs a finite offset and non-zero scale"
            )));
        }
        self.per_output.insert(output, (offset, scale));
        Ok(self)
    }
}

impl PhysicsTransform for OutputCalibration {
    fn outputs(
        &self,
        output: &str,
        _x: &DMatrix<f64>,
        y: &DVector<f64>,
        yvar: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        match self.per_output.get(output) {
            Some(&(offset, scale)) => (
                y.map(|v| (v - offset) * scale),
                yvar.map(|v| v * scale * scale),
            ),
            None => (y.clone(), yvar.clone()),
        }
    }

    fn outputs_inverse(
        &self,
        output: &str,
        _x: &DMatrix<f64>,
        mean: &DVector<f64>,
        var: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        match self.per_output.get(output) {
            Some(&(offset, scale)) => (
                mean.map(|v| v / scale + offset),
                var.map(|v| v / (scale * scale)),
            ),
            None => (mean.clone(), var.clone()),
        }
    }
}

/// Min-max scaling of feature columns into `range`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputNormalization {
    lower: Vec<f64>,
    upper: Vec<f64>,
    range: (f64, f64),
}

impl InputNormalization {
    /// Scaling with static per-column bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the bound vectors differ in length
    /// and [`Error::InvalidConfig`] for an empty or inverted `range`.
    pub fn with_bounds(lower: Vec<f64>, upper: Vec<f64>, range: (f64, f64)) -> Result<Self> {
        if lower.len() != upper.len() {
            return Err(Error::ShapeMismatch {
                what: "normalization bounds",
                expected: lower.len(),
                got: upper.len(),
            });
        }
        check_range(range)?;
        Ok(Self { lower, upper, range })
    }

    /// Scaling fitted to the column extremes of `x`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty or inverted `range`.
    pub fn fit(x: &DMatrix<f64>, range: (f64, f64)) -> Result<Self> {
        check_range(range)?;
        let (lower, upper): (Vec<f64>, Vec<f64>) = x
            .column_iter()
            .map(|c| {
                let finite = c.iter().copied().filter(|v| v.is_finite());
                finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                })
            })
            .map(|(lo, hi)| if lo.is_finite() { (lo, hi) } else { (0.0, 1.0) })
            .unzip();
        Ok(Self { lower, upper, range })
    }

    /// Number of feature columns.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    fn scale(&self, j: usize) -> f64 {
        let span = self.upper[j] - self.lower[j];
        let span = if span.abs() < MIN_RANGE { 1.0 } else { span };
        (self.range.1 - self.range.0) / span
    }

    /// Features to model space.
    #[must_use]
    pub fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
            self.range.0 + (x[(i, j)] - self.lower[j]) * self.scale(j)
        })
    }

    /// Model space back to features.
    #[must_use]
    pub fn inverse(&self, u: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(u.nrows(), u.ncols(), |i, j| {
            self.lower[j] + (u[(i, j)] - self.range.0) / self.scale(j)
        })
    }
}

fn check_range(range: (f64, f64)) -> Result<()> {
    if range.0.is_finite() && range.1.is_finite() && range.0 < range.1 {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "normalization range ({}, {}) must be increasing",
            range.0, range.1
        )))
    }
}

/// Zero-mean, unit-variance scaling of one output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputStandardization {
    mean: f64,
    std: f64,
}

impl Default for OutputStandardization {
    fn default() -> Self {
        Self { mean: 0.0, std: 1.0 }
    }
}

impl OutputStandardization {
    /// Fit to the finite values of `y`. Fewer than two values, or a spread
    /// below the scaling floor, keep a unit scale.
    #[must_use]
    pub fn fit(y: &DVector<f64>) -> Self {
        let finite: Vec<f64> = y.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Self::default();
        }
        let mean = crate::stats::mean(&finite);
        let std = crate::stats::std_dev(&finite, 1);
        let std = if std.is_finite() && std >= MIN_RANGE { std } else { 1.0 };
        Self { mean, std }
    }

    /// Fitted mean.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Fitted standard deviation.
    #[must_use]
    pub fn std(&self) -> f64 {
        self.std
    }

    /// Outputs and variances to model space.
    #[must_use]
    pub fn apply(&self, y: &DVector<f64>, yvar: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let s2 = self.std * self.std;
        (y.map(|v| (v - self.mean) / self.std), yvar.map(|v| v / s2))
    }

    /// Model-space means and variances back to output units.
    #[must_use]
    pub fn inverse(&self, mean: &DVector<f64>, var: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let s2 = self.std * self.std;
        (mean.map(|v| v * self.std + self.mean), var.map(|v| v * s2))
    }
}

/// Both transform stages for one output.
#[derive(Debug)]
pub struct TransformPipeline {
    output: String,
    physics: Arc<dyn PhysicsTransform>,
    inputs: Option<InputNormalization>,
    outputs: OutputStandardization,
    range: (f64, f64),
    suspended: AtomicUsize,
}

impl TransformPipeline {
    /// Creates an unfitted pipeline for `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an invalid normalization range.
    pub fn new(
        output: impl Into<String>,
        physics: Arc<dyn PhysicsTransform>,
        range: (f64, f64),
    ) -> Result<Self> {
        check_range(range)?;
        Ok(Self {
            output: output.into(),
            physics,
            inputs: None,
            outputs: OutputStandardization::default(),
            range,
            suspended: AtomicUsize::new(0),
        })
    }

    /// Output this pipeline serves.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// The physics stage.
    #[must_use]
    pub fn physics(&self) -> &Arc<dyn PhysicsTransform> {
        &self.physics
    }

    /// Whether the physics stage is currently active.
    #[must_use]
    pub fn physics_enabled(&self) -> bool {
        self.suspended.load(Ordering::Acquire) == 0
    }

    /// Disable the physics stage until the returned guard is dropped.
    ///
    /// Guards nest; the stage comes back once every guard is gone, on every
    /// exit path including unwinding. The switch lives on the pipeline, so
    /// it affects every user of a shared model; a single prediction in
    /// fundamental space should go through the `*_with` methods instead.
    #[must_use = "the physics stage is restored as soon as the guard is dropped"]
    pub fn fundamental(&self) -> FundamentalGuard<'_> {
        self.suspended.fetch_add(1, Ordering::AcqRel);
        FundamentalGuard { pipeline: self }
    }

    /// Engineered features of raw inputs (identity in fundamental mode).
    #[must_use]
    pub fn features(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.features_with(x, self.physics_enabled())
    }

    /// Engineered features when `physics` is set, `x` unchanged otherwise.
    #[must_use]
    pub fn features_with(&self, x: &DMatrix<f64>, physics: bool) -> DMatrix<f64> {
        if physics {
            self.physics.inputs(&self.output, x)
        } else {
            x.clone()
        }
    }

    /// Physics-transformed outputs (identity in fundamental mode).
    #[must_use]
    pub fn physics_outputs(
        &self,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        yvar: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        if self.physics_enabled() {
            self.physics.outputs(&self.output, x, y, yvar)
        } else {
            (y.clone(), yvar.clone())
        }
    }

    /// Fit the statistical stage to features and physics-space outputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configured range is invalid.
    pub fn fit_normalization(&mut self, features: &DMatrix<f64>, y: &DVector<f64>) -> Result<()> {
        self.inputs = Some(InputNormalization::fit(features, self.range)?);
        self.outputs = OutputStandardization::fit(y);
        trace_debug!(
            output = %self.output,
            y_mean = self.outputs.mean(),
            y_std = self.outputs.std(),
            "normalization pass"
        );
        Ok(())
    }

    /// Install a prepared statistical stage, e.g. static input bounds.
    pub fn set_normalization(&mut self, inputs: InputNormalization, outputs: OutputStandardization) {
        self.inputs = Some(inputs);
        self.outputs = outputs;
    }

    /// Configured normalization range.
    #[must_use]
    pub fn range(&self) -> (f64, f64) {
        self.range
    }

    /// Fitted output standardization.
    #[must_use]
    pub fn output_standardization(&self) -> OutputStandardization {
        self.outputs
    }

    /// Fitted input normalization, if any.
    #[must_use]
    pub fn input_normalization(&self) -> Option<&InputNormalization> {
        self.inputs.as_ref()
    }

    /// Features already in physics space to model space.
    #[must_use]
    pub fn normalize_features(&self, features: &DMatrix<f64>) -> DMatrix<f64> {
        match &self.inputs {
            Some(n) => n.apply(features),
            None => features.clone(),
        }
    }

    /// Raw inputs to model space.
    #[must_use]
    pub fn to_model_inputs(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.to_model_inputs_with(x, self.physics_enabled())
    }

    /// Inputs to model space, through the physics stage only if `physics`.
    #[must_use]
    pub fn to_model_inputs_with(&self, x: &DMatrix<f64>, physics: bool) -> DMatrix<f64> {
        self.normalize_features(&self.features_with(x, physics))
    }

    /// Physics-space outputs to model space.
    #[must_use]
    pub fn to_model_outputs(
        &self,
        y: &DVector<f64>,
        yvar: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        self.outputs.apply(y, yvar)
    }

    /// Model-space predictions back to raw units, for raw inputs `x`.
    #[must_use]
    pub fn from_model_outputs(
        &self,
        x: &DMatrix<f64>,
        mean: &DVector<f64>,
        var: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        self.from_model_outputs_with(x, mean, var, self.physics_enabled())
    }

    /// Model-space predictions back to physics space, and on to raw units
    /// only if `physics`.
    #[must_use]
    pub fn from_model_outputs_with(
        &self,
        x: &DMatrix<f64>,
        mean: &DVector<f64>,
        var: &DVector<f64>,
        physics: bool,
    ) -> (DVector<f64>, DVector<f64>) {
        let (m, v) = self.outputs.inverse(mean, var);
        if physics {
            self.physics.outputs_inverse(&self.output, x, &m, &v)
        } else {
            (m, v)
        }
    }
}

/// Scope in which a pipeline's physics stage is disabled.
#[derive(Debug)]
pub struct FundamentalGuard<'a> {
    pipeline: &'a TransformPipeline,
}

impl Drop for FundamentalGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.suspended.fetch_sub(1, Ordering::AcqRel);
    }
}
