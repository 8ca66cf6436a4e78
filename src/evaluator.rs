//! The [`Evaluator`] capability: map input points to measured outputs.
//!
//! The optimization core never runs simulations itself. Whatever produces
//! outputs for a proposed point implements [`Evaluator`]; the closed set of
//! built-in variants is [`EvaluatorKind`].
//!
//! ```
//! use surrogate_optimizer::prelude::*;
//!
//! let mut eval = EvaluatorKind::function(|x: &[f64]| {
//!     Ok(Evaluation::new(vec![(x[0] - 0.3).powi(2)], vec![1e-3]))
//! });
//! let e = eval.evaluate(&[0.5]).unwrap();
//! assert!((e.y[0] - 0.04).abs() < 1e-12);
//! ```

use core::fmt;
use std::sync::Arc;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::composite::CompositeModel;
use crate::error::{Error, Result};

/// Outputs measured at one point, with their standard deviations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// One value per output.
    pub y: Vec<f64>,
    /// One standard deviation per output.
    pub ystd: Vec<f64>,
}

impl Evaluation {
    /// Bundle outputs and their uncertainties.
    #[must_use]
    pub fn new(y: Vec<f64>, ystd: Vec<f64>) -> Self {
        Self { y, ystd }
    }
}

/// Something that evaluates input points.
pub trait Evaluator {
    /// Evaluate one raw input vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Evaluation`] when the point could not be evaluated.
    fn evaluate(&mut self, x: &[f64]) -> Result<Evaluation>;

    /// Evaluate several points in order. Failures are reported per point
    /// and never stop the batch.
    ///
    /// Default: calls [`evaluate`](Evaluator::evaluate) on each point and
    /// tags failures with the point's index.
    fn evaluate_batch(&mut self, xs: &[Vec<f64>]) -> Vec<Result<Evaluation>> {
        xs.iter()
            .enumerate()
            .map(|(i, x)| {
                self.evaluate(x).map_err(|e| match e {
                    Error::Evaluation { reason, .. } => Error::Evaluation { point: i, reason },
                    other => other,
                })
            })
            .collect()
    }
}

/// User function evaluating one point.
pub type EvaluationFn = Box<dyn FnMut(&[f64]) -> core::result::Result<Evaluation, String> + Send>;

/// Built-in evaluators.
pub enum EvaluatorKind {
    /// A user function, typically wrapping an external simulation.
    Function(EvaluationFn),
    /// The posterior of a fitted model: mean as the value, posterior
    /// standard deviation as the uncertainty.
    Surrogate(Arc<CompositeModel>),
}

impl fmt::Debug for EvaluatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function(_) => f.write_str("Function(..)"),
            Self::Surrogate(m) => f.debug_tuple("Surrogate").field(&m.output_names()).finish(),
        }
    }
}

impl EvaluatorKind {
    /// Wrap a function.
    pub fn function(
        f: impl FnMut(&[f64]) -> core::result::Result<Evaluation, String> + Send + 'static,
    ) -> Self {
        Self::Function(Box::new(f))
    }

    /// Evaluate on a fitted model.
    #[must_use]
    pub fn surrogate(model: Arc<CompositeModel>) -> Self {
        Self::Surrogate(model)
    }
}

impl Evaluator for EvaluatorKind {
    fn evaluate(&mut self, x: &[f64]) -> Result<Evaluation> {
        match self {
            Self::Function(f) => f(x).map_err(|reason| Error::Evaluation { point: 0, reason }),
            Self::Surrogate(model) => {
                let p = model.predict(&DMatrix::from_row_slice(1, x.len(), x), false, None)?;
                Ok(Evaluation {
                    y: p.mean.row(0).iter().copied().collect(),
                    ystd: p.variance.row(0).iter().map(|v| v.max(0.0).sqrt()).collect(),
                })
            }
        }
    }
}
