#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

//! Gaussian-process surrogates and acquisition search for calibrating
//! expensive simulations. One GP is fitted per output, the GPs are combined
//! into a joint model, and the joint posterior is reduced by a user
//! scalarization to a residual that the acquisition search maximizes.
//!
//! # Getting Started
//!
//! Fit a surrogate to five points and ask for the next one:
//!
//! ```
//! use nalgebra::DMatrix;
//! use surrogate_optimizer::prelude::*;
//!
//! let x = DMatrix::from_row_slice(5, 1, &[0.0, 0.25, 0.5, 0.75, 1.0]);
//! let y = x.map(|v| (v - 0.4) * (v - 0.4));
//! let training = TrainingSet::new(x, y.clone(), y.map(|_| 1e-3)).unwrap();
//! let bounds = Bounds::new([("x", 0.0, 1.0)]).unwrap();
//! let settings = StepSettings::builder(["f"])
//!     .acquisition(AcquisitionKind::PosteriorMean)
//!     .build()
//!     .unwrap();
//!
//! let mut step = OptimizationStep::new(training, bounds, settings, None, 1).unwrap();
//! step.fit_step(&AvoidSet::new(), None).unwrap();
//! let next = step
//!     .optimize(target_scalarizer(vec![0.0], ResidualNorm::L2), 0, None)
//!     .unwrap();
//! assert!((next[0].x[0] - 0.4).abs() < 0.1);
//! ```
//!
//! # Core Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`TrainingSet`] | Evaluated points: inputs, outputs and output uncertainties. |
//! | [`SurrogateModel`] | GP for one output, with data preparation and transforms. |
//! | [`CompositeModel`] | Per-output surrogates side by side, one column each. |
//! | [`Acquisition`] | Scores points from the joint posterior and a [`Scalarize`] callback. |
//! | [`OptimizerChain`] | Ordered search strategies (gradient, genetic, root). |
//! | [`OptimizationStep`] | Fit, define functions and optimize, in that order. |
//! | [`BayesianLoop`] | Repeats steps, evaluating candidates with an [`Evaluator`]. |
//!
//! # Sign convention
//!
//! Everything is maximized. Residuals are the negative normalized norm of
//! the `objective - calibration` components, so `0` is a perfect match.
//!
//! # Feature Flags
//!
//! | Flag | What it enables | Default |
//! |------|----------------|---------|
//! | `tracing` | Structured log events via [`tracing`](https://docs.rs/tracing) for every recoverable anomaly | on |
//! | `sobol` | Sobol start points for the search strategies | off |

/// Emit a `tracing::info!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_info {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::debug!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::warn!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn {
    ($($arg:tt)*) => {};
}

mod acquisition;
mod bounds;
mod composite;
mod driver;
mod error;
mod evaluator;
mod gp;
mod kernel;
mod lbfgs;
mod outlier;
mod rng_util;
pub mod search;
pub mod snapshot;
mod stats;
mod step;
mod surrogate;
mod training;
pub mod transform;

pub use acquisition::{
    Acquisition, AcquisitionKind, Evaluators, ResidualNorm, Scalarization, Scalarize,
    difference_scalarizer, target_scalarizer,
};
pub use bounds::{Bound, Bounds};
pub use composite::CompositeModel;
pub use driver::{BayesianLoop, IterationSummary, LoopOutcome};
pub use error::{Error, Result};
pub use evaluator::{Evaluation, EvaluationFn, Evaluator, EvaluatorKind};
pub use outlier::{MIN_PEERS, OutlierFilter};
pub use search::{
    BestPoint, Candidate, DeStrategy, GaOptions, GradientOptions, OptimizerChain, OptimizerKind,
    ProximityPolicy, RootOptions, SearchDiagnostics, SearchOptions, StrategyReport,
    rank_candidates, run_chain,
};
pub use snapshot::{SNAPSHOT_VERSION, SnapshotEntry, SnapshotStore, TrainingSnapshot};
pub use step::{
    CheckReport, OptimizationStep, SNAPSHOT_FILE, SelectOptions, StepPhase, StepSettings,
    StepSettingsBuilder,
};
pub use surrogate::{
    Hyperparameters, KernelChoice, Prediction, SurrogateBuilder, SurrogateModel,
    SurrogateOptions,
};
pub use training::{Array, AvoidSet, ExtraPoints, Noise, TrainingSet};
pub use transform::{
    ColumnSelection, FundamentalGuard, IdentityTransform, InputNormalization, OutputCalibration,
    OutputStandardization, PhysicsTransform, TransformPipeline,
};

/// Convenient wildcard import for the most common types.
///
/// ```
/// use surrogate_optimizer::prelude::*;
/// ```
pub mod prelude {
    pub use crate::acquisition::{
        AcquisitionKind, ResidualNorm, Scalarization, Scalarize, difference_scalarizer,
        target_scalarizer,
    };
    pub use crate::bounds::Bounds;
    pub use crate::composite::CompositeModel;
    pub use crate::driver::{BayesianLoop, IterationSummary, LoopOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::evaluator::{Evaluation, Evaluator, EvaluatorKind};
    pub use crate::outlier::OutlierFilter;
    pub use crate::search::{
        BestPoint, Candidate, OptimizerChain, OptimizerKind, ProximityPolicy, SearchOptions,
    };
    pub use crate::step::{OptimizationStep, StepPhase, StepSettings};
    pub use crate::surrogate::{Prediction, SurrogateModel, SurrogateOptions};
    pub use crate::training::{AvoidSet, Noise, TrainingSet};
    pub use crate::transform::{ColumnSelection, PhysicsTransform};
}
