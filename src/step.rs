//! One optimization step: fit the surrogates, define the acquisition and
//! search it for the next points.
//!
//! A step is built fresh for every iteration of the outer loop and moves
//! through [`StepPhase`] in order. Operations called out of order fail with
//! [`Error::InvalidPhase`].

use core::fmt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::acquisition::{Acquisition, AcquisitionKind, Evaluators, Scalarize};
use crate::bounds::Bounds;
use crate::composite::CompositeModel;
use crate::error::{Error, Result};
use crate::outlier::OutlierFilter;
use crate::search::{self, BestPoint, Candidate, SearchDiagnostics, SearchOptions};
use crate::snapshot::SnapshotStore;
use crate::surrogate::{SurrogateModel, SurrogateOptions};
use crate::training::{AvoidSet, TrainingSet};
use crate::transform::{IdentityTransform, PhysicsTransform};

/// File name of the per-step training snapshot.
pub const SNAPSHOT_FILE: &str = "training_data.json";

/// Per-output override of the surrogate options.
pub type SelectOptions = Arc<dyn Fn(&str, &SurrogateOptions) -> SurrogateOptions + Send + Sync>;

/// Configuration shared by every step of a run.
///
/// Created via [`StepSettings::builder`].
///
/// # Examples
///
/// ```
/// use surrogate_optimizer::prelude::*;
///
/// let settings = StepSettings::builder(["flux", "target"])
///     .acquisition(AcquisitionKind::PosteriorMean)
///     .seed(7)
///     .build()
///     .unwrap();
/// assert_eq!(settings.outputs().len(), 2);
/// ```
#[derive(Clone)]
pub struct StepSettings {
    outputs: Vec<String>,
    surrogate: SurrogateOptions,
    acquisition: AcquisitionKind,
    search: SearchOptions,
    outlier: OutlierFilter,
    mc_samples: usize,
    output_folder: Option<PathBuf>,
    table_groups: Vec<Vec<String>>,
    accuracy_tolerance: f64,
    seed: u64,
    select_options: Option<SelectOptions>,
}

impl fmt::Debug for StepSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSettings")
            .field("outputs", &self.outputs)
            .field("surrogate", &self.surrogate)
            .field("acquisition", &self.acquisition)
            .field("search", &self.search)
            .field("outlier", &self.outlier)
            .field("mc_samples", &self.mc_samples)
            .field("output_folder", &self.output_folder)
            .field("table_groups", &self.table_groups)
            .field("accuracy_tolerance", &self.accuracy_tolerance)
            .field("seed", &self.seed)
            .field("select_options", &self.select_options.is_some())
            .finish()
    }
}

impl StepSettings {
    /// Start configuring a step over the named outputs, in column order.
    pub fn builder<S: Into<String>>(outputs: impl IntoIterator<Item = S>) -> StepSettingsBuilder {
        StepSettingsBuilder {
            settings: StepSettings {
                outputs: outputs.into_iter().map(Into::into).collect(),
                surrogate: SurrogateOptions::default(),
                acquisition: AcquisitionKind::default(),
                search: SearchOptions::default(),
                outlier: OutlierFilter::default(),
                mc_samples: 128,
                output_folder: None,
                table_groups: vec![Vec::new()],
                accuracy_tolerance: 5.0,
                seed: 0,
                select_options: None,
            },
        }
    }

    /// Output names, in column order.
    #[must_use]
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Base surrogate options.
    #[must_use]
    pub fn surrogate(&self) -> &SurrogateOptions {
        &self.surrogate
    }

    /// Acquisition kind.
    #[must_use]
    pub fn acquisition(&self) -> AcquisitionKind {
        self.acquisition
    }

    /// Search options.
    #[must_use]
    pub fn search(&self) -> &SearchOptions {
        &self.search
    }

    /// Outlier filter run before fitting.
    #[must_use]
    pub fn outlier(&self) -> &OutlierFilter {
        &self.outlier
    }

    /// Folder receiving snapshots and tables, if any.
    #[must_use]
    pub fn output_folder(&self) -> Option<&Path> {
        self.output_folder.as_deref()
    }

    /// Base seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Options used for `output`, after the per-output override.
    #[must_use]
    pub fn options_for(&self, output: &str) -> SurrogateOptions {
        match &self.select_options {
            Some(select) => select(output, &self.surrogate),
            None => self.surrogate.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(Error::InvalidConfig(String::from("at least one output is required")));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = self.outputs.iter().find(|o| !seen.insert(o.as_str())) {
            return Err(Error::InvalidConfig(format!("output '{dup}' is listed twice")));
        }
        if self.mc_samples == 0 {
            return Err(Error::InvalidConfig(String::from("mc_samples must be at least 1")));
        }
        if self.accuracy_tolerance.is_nan() || self.accuracy_tolerance <= 0.0 {
            return Err(Error::InvalidConfig(String::from(
                "accuracy_tolerance must be positive",
            )));
        }
        self.surrogate.validate()?;
        self.search.validate()
    }
}

/// Fluent builder for [`StepSettings`].
///
/// # Defaults
///
/// - Acquisition: [`AcquisitionKind::default`]
/// - Search: [`SearchOptions::default`]
/// - Outliers: five standard deviations, one channel
/// - Monte-Carlo samples: 128
/// - Training accuracy tolerance: 5 %
/// - No output folder (nothing is written)
#[must_use]
pub struct StepSettingsBuilder {
    settings: StepSettings,
}

impl StepSettingsBuilder {
    /// Base surrogate options for every output.
    pub fn surrogate(mut self, options: SurrogateOptions) -> Self {
        self.settings.surrogate = options;
        self
    }

    /// Acquisition function.
    pub fn acquisition(mut self, kind: AcquisitionKind) -> Self {
        self.settings.acquisition = kind;
        self
    }

    /// Acquisition search.
    pub fn search(mut self, options: SearchOptions) -> Self {
        self.settings.search = options;
        self
    }

    /// Outlier filter.
    pub fn outlier(mut self, filter: OutlierFilter) -> Self {
        self.settings.outlier = filter;
        self
    }

    /// Base samples of the Monte-Carlo acquisitions.
    pub fn mc_samples(mut self, n: usize) -> Self {
        self.settings.mc_samples = n;
        self
    }

    /// Write the training snapshot and tables under `folder`.
    pub fn output_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.settings.output_folder = Some(folder.into());
        self
    }

    /// Groups of output-name fragments, one pair of tables per group. An
    /// empty group selects every output.
    pub fn table_groups(mut self, groups: Vec<Vec<String>>) -> Self {
        self.settings.table_groups = groups;
        self
    }

    /// Largest tolerated in-sample error (%) before a warning.
    pub fn accuracy_tolerance(mut self, percent: f64) -> Self {
        self.settings.accuracy_tolerance = percent;
        self
    }

    /// Base seed; output `j` fits with `seed + j`.
    pub fn seed(mut self, seed: u64) -> Self {
        self.settings.seed = seed;
        self
    }

    /// Per-output override of the surrogate options.
    pub fn select_options(
        mut self,
        select: impl Fn(&str, &SurrogateOptions) -> SurrogateOptions + Send + Sync + 'static,
    ) -> Self {
        self.settings.select_options = Some(Arc::new(select));
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty or duplicated output
    /// list and for out-of-range options.
    pub fn build(self) -> Result<StepSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

/// Where a step is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepPhase {
    /// Data attached, nothing fitted.
    Constructed,
    /// Surrogates fitted and combined.
    Fitted,
    /// Acquisition and residual functions defined.
    FunctionsDefined,
    /// Candidates available.
    Optimized,
}

impl StepPhase {
    /// Lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::Fitted => "fitted",
            Self::FunctionsDefined => "functions defined",
            Self::Optimized => "optimized",
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one post-fit self-consistency check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Which check.
    pub name: String,
    /// Worst deviation found.
    pub value: f64,
    /// Largest accepted deviation.
    pub tolerance: f64,
    /// Whether `value <= tolerance`.
    pub passed: bool,
}

impl CheckReport {
    fn new(name: impl Into<String>, value: f64, tolerance: f64) -> Self {
        Self {
            name: name.into(),
            value,
            tolerance,
            passed: value <= tolerance,
        }
    }
}

/// Relative tolerance of the batch and combination checks.
const CONSISTENCY_TOLERANCE: f64 = 1e-6;

/// One iteration of surrogate fitting and acquisition search.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use nalgebra::DMatrix;
/// use surrogate_optimizer::prelude::*;
///
/// let x = DMatrix::from_row_slice(5, 1, &[0.0, 0.25, 0.5, 0.75, 1.0]);
/// let y = x.map(|v| (v - 0.3) * (v - 0.3));
/// let training = TrainingSet::new(x, y.clone(), y.map(|_| 1e-3)).unwrap();
/// let bounds = Bounds::new([("x", 0.0, 1.0)]).unwrap();
/// let settings = StepSettings::builder(["f"])
///     .acquisition(AcquisitionKind::PosteriorMean)
///     .build()
///     .unwrap();
///
/// let mut step = OptimizationStep::new(training, bounds, settings, None, 1).unwrap();
/// step.fit_step(&AvoidSet::new(), None).unwrap();
/// let scalarize = target_scalarizer(vec![0.0], ResidualNorm::L1);
/// let candidates = step.optimize(scalarize, 0, None).unwrap();
/// assert!(candidates[0].x[0] >= 0.0 && candidates[0].x[0] <= 1.0);
/// ```
pub struct OptimizationStep {
    training: TrainingSet,
    bounds: Bounds,
    settings: StepSettings,
    physics: Arc<dyn PhysicsTransform>,
    iteration: usize,
    phase: StepPhase,
    avoid: AvoidSet,
    outliers: BTreeSet<usize>,
    models: Vec<Arc<SurrogateModel>>,
    composite: Option<Arc<CompositeModel>>,
    checks: Vec<CheckReport>,
    evaluators: Option<Evaluators>,
    best: Option<BestPoint>,
    candidates: Vec<Candidate>,
    diagnostics: Option<SearchDiagnostics>,
}

impl fmt::Debug for OptimizationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationStep")
            .field("iteration", &self.iteration)
            .field("phase", &self.phase)
            .field("n_points", &self.training.n_points())
            .field("outputs", &self.settings.outputs)
            .field("avoid", &self.avoid)
            .field("candidates", &self.candidates.len())
            .finish_non_exhaustive()
    }
}

impl OptimizationStep {
    /// Attach the training data of this iteration.
    ///
    /// `physics` defaults to the identity transform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] when the bounds or the output names
    /// disagree with the training set.
    pub fn new(
        training: TrainingSet,
        bounds: Bounds,
        settings: StepSettings,
        physics: Option<Arc<dyn PhysicsTransform>>,
        iteration: usize,
    ) -> Result<Self> {
        if bounds.len() != training.n_inputs() {
            return Err(Error::ShapeMismatch {
                what: "bounds vs training inputs",
                expected: training.n_inputs(),
                got: bounds.len(),
            });
        }
        if settings.outputs.len() != training.n_outputs() {
            return Err(Error::ShapeMismatch {
                what: "output names vs training outputs",
                expected: training.n_outputs(),
                got: settings.outputs.len(),
            });
        }
        Ok(Self {
            training,
            bounds,
            settings,
            physics: physics.unwrap_or_else(|| Arc::new(IdentityTransform)),
            iteration,
            phase: StepPhase::Constructed,
            avoid: AvoidSet::new(),
            outliers: BTreeSet::new(),
            models: Vec::new(),
            composite: None,
            checks: Vec::new(),
            evaluators: None,
            best: None,
            candidates: Vec::new(),
            diagnostics: None,
        })
    }

    /// Fit one surrogate per output and combine them.
    ///
    /// Outliers found by the filter are added to `avoid` for this step.
    /// When `fit_with_training_data_if_contains` is given, outputs whose
    /// name does not contain it are fitted from their extra points only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] unless the step was just constructed,
    /// and propagates snapshot, preparation and fitting failures (a
    /// [`Error::FitFailed`] names the offending output).
    pub fn fit_step(
        &mut self,
        avoid: &AvoidSet,
        fit_with_training_data_if_contains: Option<&str>,
    ) -> Result<&Arc<CompositeModel>> {
        self.require(StepPhase::Constructed, self.phase == StepPhase::Constructed)?;

        let x = self.training.x();
        let y = self.training.y();
        let yvar = self.training.yvar();

        let mut avoid = avoid.clone();
        self.outliers = self.settings.outlier.find(y, &yvar, avoid.as_set());
        if !self.outliers.is_empty() {
            trace_warn!(
                outliers = ?self.outliers,
                "outliers found, added to the avoided points"
            );
            avoid.extend(self.outliers.iter().copied());
        }
        trace_info!(
            iteration = self.iteration,
            points = x.nrows() - avoid.len().min(x.nrows()),
            avoided = avoid.len(),
            total = x.nrows(),
            "fitting surrogates"
        );

        let store = match &self.settings.output_folder {
            Some(folder) => {
                std::fs::create_dir_all(folder)?;
                Some(SnapshotStore::create(folder.join(SNAPSHOT_FILE), &self.settings.outputs)?)
            }
            None => None,
        };

        let mut models = Vec::with_capacity(self.settings.outputs.len());
        for (j, output) in self.settings.outputs.iter().enumerate() {
            let mut options = self.settings.options_for(output);
            options.seed = self.settings.seed.wrapping_add(j as u64);
            if fit_with_training_data_if_contains.is_some_and(|p| !output.contains(p)) {
                options.fit_only_from_extra_points = true;
            }
            let mut builder = SurrogateModel::builder(
                output.as_str(),
                x.clone(),
                y.column(j).into_owned(),
                yvar.column(j).into_owned(),
            )
            .bounds(&self.bounds)
            .avoid(&avoid)
            .options(options)
            .physics(Arc::clone(&self.physics));
            if let Some(store) = &store {
                builder = builder.snapshot(store);
            }
            let mut model = builder.build()?;
            model.fit()?;
            models.push(Arc::new(model));
        }

        let composite = CompositeModel::new(models.clone())?
            .with_training_data(avoid.retain_rows(x), avoid.retain_rows(y))?;

        if let (Some(store), Some(folder)) = (&store, &self.settings.output_folder) {
            for group in &self.settings.table_groups {
                store.export_tables(group, folder)?;
            }
        }

        self.models = models;
        self.avoid = avoid;
        self.checks = self.run_checks(&composite)?;
        for check in self.checks.iter().filter(|c| !c.passed) {
            trace_warn!(
                check = %check.name,
                value = check.value,
                tolerance = check.tolerance,
                "surrogate self-consistency check failed"
            );
        }
        self.phase = StepPhase::Fitted;
        Ok(self.composite.insert(Arc::new(composite)))
    }

    /// Build the acquisition, objective and residual functions over the
    /// fitted composite model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before [`fit_step`](Self::fit_step)
    /// and propagates acquisition construction failures.
    pub fn define_functions(&mut self, scalarize: Scalarize) -> Result<&Evaluators> {
        let composite = match (&self.composite, self.phase) {
            (Some(c), phase) if phase >= StepPhase::Fitted => Arc::clone(c),
            _ => return Err(self.phase_error(StepPhase::Fitted)),
        };
        let acquisition = Acquisition::new(
            self.settings.acquisition,
            composite,
            scalarize,
            self.settings.mc_samples,
            self.settings.seed,
        )?;
        self.phase = StepPhase::FunctionsDefined;
        Ok(self.evaluators.insert(Evaluators::new(acquisition)))
    }

    /// Maximize the acquisition and return the ranked candidates.
    ///
    /// `best_hint` names the training row of the best point so far; without
    /// it the non-avoided row with the largest residual is used. That point
    /// anchors the proximity ranking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before [`fit_step`](Self::fit_step),
    /// [`Error::InvalidConfig`] for a hint outside the training set and
    /// [`Error::AcquisitionFailed`] when no strategy produced a candidate.
    pub fn optimize(
        &mut self,
        scalarize: Scalarize,
        seed: u64,
        best_hint: Option<usize>,
    ) -> Result<&[Candidate]> {
        self.define_functions(scalarize)?;
        let Some(evaluators) = self.evaluators.as_ref() else {
            return Err(self.phase_error(StepPhase::FunctionsDefined));
        };
        let best = self.best_point(evaluators, best_hint)?;

        trace_info!(
            iteration = self.iteration,
            acquisition = %self.settings.acquisition,
            chain = %self.settings.search.chain,
            n_candidates = self.settings.search.n_candidates,
            "optimizing acquisition"
        );
        let (candidates, diagnostics) =
            search::run_chain(evaluators, &self.bounds, &self.settings.search, seed, best.as_ref())?;
        trace_info!(
            iteration = self.iteration,
            candidates = candidates.len(),
            pool = diagnostics.pool_size,
            "acquisition optimized"
        );

        self.best = best;
        self.candidates = candidates;
        self.diagnostics = Some(diagnostics);
        self.phase = StepPhase::Optimized;
        Ok(&self.candidates)
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    /// Iteration number given at construction.
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Training data of this step.
    #[must_use]
    pub fn training(&self) -> &TrainingSet {
        &self.training
    }

    /// Search domain.
    #[must_use]
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Settings of this step.
    #[must_use]
    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    /// Points excluded from the fit, outliers included.
    #[must_use]
    pub fn avoided(&self) -> &AvoidSet {
        &self.avoid
    }

    /// Outliers found by [`fit_step`](Self::fit_step).
    #[must_use]
    pub fn outliers(&self) -> &BTreeSet<usize> {
        &self.outliers
    }

    /// Fitted per-output surrogates, in output order.
    #[must_use]
    pub fn models(&self) -> &[Arc<SurrogateModel>] {
        &self.models
    }

    /// Fitted surrogate of `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before fitting and
    /// [`Error::UnknownOutput`] for a name not in the step.
    pub fn model(&self, output: &str) -> Result<&Arc<SurrogateModel>> {
        self.composite()?.model(output)
    }

    /// The combined model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before fitting.
    pub fn composite(&self) -> Result<&Arc<CompositeModel>> {
        self.composite
            .as_ref()
            .ok_or_else(|| self.phase_error(StepPhase::Fitted))
    }

    /// Self-consistency checks run after fitting.
    #[must_use]
    pub fn checks(&self) -> &[CheckReport] {
        &self.checks
    }

    /// The functions defined for the search.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before they are defined.
    pub fn evaluators(&self) -> Result<&Evaluators> {
        self.evaluators
            .as_ref()
            .ok_or_else(|| self.phase_error(StepPhase::FunctionsDefined))
    }

    /// Anchor used by the last [`optimize`](Self::optimize).
    #[must_use]
    pub fn best(&self) -> Option<&BestPoint> {
        self.best.as_ref()
    }

    /// Ranked candidates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before [`optimize`](Self::optimize).
    pub fn candidates(&self) -> Result<&[Candidate]> {
        self.require(StepPhase::Optimized, self.phase == StepPhase::Optimized)?;
        Ok(&self.candidates)
    }

    /// Per-strategy diagnostics of the search.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before [`optimize`](Self::optimize).
    pub fn diagnostics(&self) -> Result<&SearchDiagnostics> {
        self.diagnostics
            .as_ref()
            .ok_or_else(|| self.phase_error(StepPhase::Optimized))
    }

    /// Consume the step, keeping the ranked candidates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] before [`optimize`](Self::optimize).
    pub fn into_candidates(self) -> Result<Vec<Candidate>> {
        self.require(StepPhase::Optimized, self.phase == StepPhase::Optimized)?;
        Ok(self.candidates)
    }

    fn require(&self, expected: StepPhase, ok: bool) -> Result<()> {
        if ok { Ok(()) } else { Err(self.phase_error(expected)) }
    }

    fn phase_error(&self, expected: StepPhase) -> Error {
        Error::InvalidPhase {
            expected: expected.as_str(),
            found: self.phase.as_str(),
        }
    }

    fn best_point(&self, evaluators: &Evaluators, hint: Option<usize>) -> Result<Option<BestPoint>> {
        let x = self.training.x();
        let residuals = evaluators.scalarize(self.training.y()).residual;
        let index = match hint {
            Some(i) if i < x.nrows() => Some(i),
            Some(i) => {
                return Err(Error::InvalidConfig(format!(
                    "best point hint {i} is outside the {} training points",
                    x.nrows()
                )));
            }
            None => (0..x.nrows())
                .filter(|&i| !self.avoid.contains(i) && residuals[i].is_finite())
                .max_by(|&a, &b| residuals[a].total_cmp(&residuals[b])),
        };
        Ok(index.map(|i| BestPoint {
            x: x.row(i).iter().copied().collect(),
            residual: residuals[i],
        }))
    }

    /// Batch consistency, combination agreement and training accuracy.
    fn run_checks(&self, composite: &CompositeModel) -> Result<Vec<CheckReport>> {
        let points = match composite.train_x() {
            Some(x) if x.nrows() > 0 => x.clone(),
            _ => {
                let mid: Vec<f64> = self
                    .bounds
                    .lower()
                    .iter()
                    .zip(self.bounds.upper().iter())
                    .map(|(l, u)| 0.5 * (l + u))
                    .collect();
                DMatrix::from_row_slice(1, mid.len(), &mid)
            }
        };

        let joint = composite.predict(&points, false, None)?;
        let scale = |v: f64| v.abs().max(1.0);

        let rows: Vec<DMatrix<f64>> = (0..points.nrows())
            .map(|i| points.rows(i, 1).into_owned())
            .collect();
        let singles = composite.predict_batched(&rows, false, None)?;
        let mut batch_dev: f64 = 0.0;
        for (i, p) in singles.iter().enumerate() {
            for j in 0..composite.n_outputs() {
                let (a, b) = (joint.mean[(i, j)], p.mean[(0, j)]);
                batch_dev = batch_dev.max((a - b).abs() / scale(a));
            }
        }

        let mut combination_dev: f64 = 0.0;
        for (j, model) in composite.models().iter().enumerate() {
            let single = model.predict(&points, false, None)?;
            combination_dev = combination_dev.max(max_relative_deviation(
                &joint.mean.column(j).into_owned(),
                &single.mean.column(0).into_owned(),
                scale,
            ));
        }

        let mut reports = vec![
            CheckReport::new("batch", batch_dev, CONSISTENCY_TOLERANCE),
            CheckReport::new("combination", combination_dev, CONSISTENCY_TOLERANCE),
        ];
        for model in composite.models() {
            let accuracy = model.training_accuracy()?;
            trace_debug!(output = %model.output(), max_error = accuracy, "training accuracy");
            reports.push(CheckReport::new(
                format!("training_accuracy:{}", model.output()),
                accuracy,
                self.settings.accuracy_tolerance,
            ));
        }
        Ok(reports)
    }
}

fn max_relative_deviation(a: &DVector<f64>, b: &DVector<f64>, scale: impl Fn(f64) -> f64) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs() / scale(*x))
        .fold(0.0, f64::max)
}
