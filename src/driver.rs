//! The outer Bayesian-optimization loop.
//!
//! Every iteration builds a fresh [`OptimizationStep`] from the current
//! training set, fits it, searches the acquisition, evaluates the proposed
//! points and appends the results.

use core::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;

use crate::acquisition::Scalarize;
use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::evaluator::Evaluator;
use crate::search::Candidate;
use crate::step::{OptimizationStep, StepSettings};
use crate::training::{AvoidSet, TrainingSet};
use crate::transform::PhysicsTransform;

/// What happened in one iteration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IterationSummary {
    /// Iteration number, starting at 1.
    pub iteration: usize,
    /// Training points the step was fitted on.
    pub n_train: usize,
    /// Ranked candidates proposed by the step.
    pub candidates: Vec<Candidate>,
    /// Candidates whose evaluation was appended.
    pub evaluated: usize,
    /// Indices (into `candidates`) whose evaluation failed.
    pub failed: Vec<usize>,
    /// Outliers excluded from the fit.
    pub outliers: Vec<usize>,
    /// Self-consistency checks that failed.
    pub failed_checks: Vec<String>,
    /// Best residual over the training set after appending.
    pub best_residual: f64,
}

/// Result of [`BayesianLoop::run`].
#[derive(Debug)]
pub struct LoopOutcome {
    /// One summary per completed iteration.
    pub summaries: Vec<IterationSummary>,
    /// The fatal error that stopped the loop early, if any.
    pub error: Option<Error>,
}

impl LoopOutcome {
    /// Whether every requested iteration completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives fit, search and evaluation for a number of iterations.
///
/// # Examples
///
/// ```
/// use nalgebra::DMatrix;
/// use surrogate_optimizer::prelude::*;
///
/// let x = DMatrix::from_row_slice(4, 1, &[0.0, 0.3, 0.7, 1.0]);
/// let y = x.map(|v| (v - 0.6) * (v - 0.6));
/// let training = TrainingSet::new(x, y.clone(), y.map(|_| 1e-3)).unwrap();
/// let bounds = Bounds::new([("x", 0.0, 1.0)]).unwrap();
/// let settings = StepSettings::builder(["f"])
///     .acquisition(AcquisitionKind::PosteriorMean)
///     .build()
///     .unwrap();
///
/// let mut bo = BayesianLoop::new(
///     training,
///     bounds,
///     settings,
///     target_scalarizer(vec![0.0], ResidualNorm::L1),
/// );
/// let mut sim = EvaluatorKind::function(|x: &[f64]| {
///     Ok(Evaluation::new(vec![(x[0] - 0.6).powi(2)], vec![1e-3]))
/// });
/// let outcome = bo.run(2, &mut sim);
/// assert!(outcome.is_complete());
/// assert_eq!(bo.training().n_points(), 6);
/// ```
pub struct BayesianLoop {
    training: TrainingSet,
    bounds: Bounds,
    settings: StepSettings,
    scalarize: Scalarize,
    physics: Option<Arc<dyn PhysicsTransform>>,
    avoid: AvoidSet,
    fit_filter: Option<String>,
    iteration: usize,
}

impl core::fmt::Debug for BayesianLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BayesianLoop")
            .field("iteration", &self.iteration)
            .field("n_points", &self.training.n_points())
            .field("settings", &self.settings)
            .field("avoid", &self.avoid)
            .finish_non_exhaustive()
    }
}

impl BayesianLoop {
    /// Start a loop from an initial training set.
    #[must_use]
    pub fn new(
        training: TrainingSet,
        bounds: Bounds,
        settings: StepSettings,
        scalarize: Scalarize,
    ) -> Self {
        Self {
            training,
            bounds,
            settings,
            scalarize,
            physics: None,
            avoid: AvoidSet::new(),
            fit_filter: None,
            iteration: 0,
        }
    }

    /// Feature engineering applied by every step.
    #[must_use]
    pub fn physics(mut self, physics: Arc<dyn PhysicsTransform>) -> Self {
        self.physics = Some(physics);
        self
    }

    /// Points excluded from every fit.
    #[must_use]
    pub fn avoid(mut self, avoid: AvoidSet) -> Self {
        self.avoid = avoid;
        self
    }

    /// Fit only outputs whose name contains `pattern` from the training
    /// set; the others use their extra points.
    #[must_use]
    pub fn fit_with_training_data_if_contains(mut self, pattern: impl Into<String>) -> Self {
        self.fit_filter = Some(pattern.into());
        self
    }

    /// Current training set.
    #[must_use]
    pub fn training(&self) -> &TrainingSet {
        &self.training
    }

    /// Consume the loop, keeping the training set.
    #[must_use]
    pub fn into_training(self) -> TrainingSet {
        self.training
    }

    /// Iterations completed so far.
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Run `n_iterations` iterations.
    pub fn run(&mut self, n_iterations: usize, evaluator: &mut impl Evaluator) -> LoopOutcome {
        self.run_with(n_iterations, evaluator, |_| ControlFlow::Continue(()))
    }

    /// Run up to `n_iterations` iterations, calling `after_iteration` after
    /// each. Returning `ControlFlow::Break(())` stops the loop.
    pub fn run_with(
        &mut self,
        n_iterations: usize,
        evaluator: &mut impl Evaluator,
        mut after_iteration: impl FnMut(&IterationSummary) -> ControlFlow<()>,
    ) -> LoopOutcome {
        let mut summaries = Vec::with_capacity(n_iterations);
        for _ in 0..n_iterations {
            match self.iterate(evaluator) {
                Ok(summary) => {
                    let flow = after_iteration(&summary);
                    summaries.push(summary);
                    if flow.is_break() {
                        break;
                    }
                }
                Err(e) => {
                    trace_warn!(iteration = self.iteration + 1, error = %e, "optimization step failed, stopping");
                    return LoopOutcome {
                        summaries,
                        error: Some(e),
                    };
                }
            }
        }
        LoopOutcome {
            summaries,
            error: None,
        }
    }

    fn iterate(&mut self, evaluator: &mut impl Evaluator) -> Result<IterationSummary> {
        let iteration = self.iteration + 1;
        let n_train = self.training.n_points();
        let mut step = OptimizationStep::new(
            self.training.clone(),
            self.bounds.clone(),
            self.settings.clone(),
            self.physics.clone(),
            iteration,
        )?;
        step.fit_step(&self.avoid, self.fit_filter.as_deref())?;
        let outliers: Vec<usize> = step.outliers().iter().copied().collect();
        let failed_checks: Vec<String> = step
            .checks()
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect();
        let seed = self.settings.seed().wrapping_add(iteration as u64);
        step.optimize(Arc::clone(&self.scalarize), seed, None)?;
        let candidates = step.into_candidates()?;

        let xs: Vec<Vec<f64>> = candidates.iter().map(|c| c.x.clone()).collect();
        let mut failed = Vec::new();
        for (i, result) in evaluator.evaluate_batch(&xs).into_iter().enumerate() {
            let appended = result.and_then(|e| self.training.push(&xs[i], &e.y, &e.ystd));
            if let Err(e) = appended {
                trace_warn!(iteration, point = i, error = %e, "evaluation failed, point skipped");
                failed.push(i);
            }
        }

        let best_residual = (self.scalarize)(self.training.y())
            .residual
            .iter()
            .copied()
            .filter(|r| r.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        trace_info!(
            iteration,
            evaluated = candidates.len() - failed.len(),
            best_residual,
            "iteration complete"
        );
        self.iteration = iteration;
        Ok(IterationSummary {
            iteration,
            n_train,
            evaluated: candidates.len() - failed.len(),
            candidates,
            failed,
            outliers,
            failed_checks,
            best_residual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{AcquisitionKind, ResidualNorm, target_scalarizer};
    use crate::evaluator::{Evaluation, EvaluatorKind};
    use nalgebra::DMatrix;

    fn bo() -> BayesianLoop {
        let x = DMatrix::from_row_slice(4, 1, &[0.0, 0.3, 0.7, 1.0]);
        let y = x.map(|v| (v - 0.6) * (v - 0.6));
        let training = TrainingSet::new(x, y.clone(), y.map(|_| 1e-3)).unwrap();
        let bounds = Bounds::new([("x", 0.0, 1.0)]).unwrap();
        let settings = StepSettings::builder(["f"])
            .acquisition(AcquisitionKind::PosteriorMean)
            .build()
            .unwrap();
        BayesianLoop::new(training, bounds, settings, target_scalarizer(vec![0.0], ResidualNorm::L1))
    }

    #[test]
    fn failed_evaluations_are_skipped() {
        let mut bo = bo();
        let mut sim = EvaluatorKind::function(|_: &[f64]| Err(String::from("solver diverged")));
        let outcome = bo.run(1, &mut sim);
        assert!(outcome.is_complete());
        assert_eq!(outcome.summaries[0].failed, vec![0]);
        assert_eq!(outcome.summaries[0].evaluated, 0);
        assert_eq!(bo.training().n_points(), 4);
    }

    #[test]
    fn hook_can_stop_the_loop() {
        let mut bo = bo();
        let mut sim = EvaluatorKind::function(|x: &[f64]| {
            Ok(Evaluation::new(vec![(x[0] - 0.6).powi(2)], vec![1e-3]))
        });
        let outcome = bo.run_with(5, &mut sim, |_| ControlFlow::Break(()));
        assert_eq!(outcome.summaries.len(), 1);
        assert_eq!(bo.iteration(), 1);
    }

    #[test]
    fn best_residual_never_decreases() {
        let mut bo = bo();
        let mut sim = EvaluatorKind::function(|x: &[f64]| {
            Ok(Evaluation::new(vec![(x[0] - 0.6).powi(2)], vec![1e-3]))
        });
        let outcome = bo.run(3, &mut sim);
        assert!(outcome.is_complete());
        let r: Vec<f64> = outcome.summaries.iter().map(|s| s.best_residual).collect();
        assert!(r.windows(2).all(|w| w[1] >= w[0]), "{r:?}");
    }

    #[test]
    fn fatal_step_errors_stop_the_loop() {
        let mut bo = bo();
        bo.bounds = Bounds::new([("x", 0.0, 1.0), ("z", 0.0, 1.0)]).unwrap();
        let mut sim = EvaluatorKind::function(|_: &[f64]| Err(String::new()));
        let outcome = bo.run(2, &mut sim);
        assert!(matches!(outcome.error, Some(Error::ShapeMismatch { .. })));
        assert!(outcome.summaries.is_empty());
    }
}
