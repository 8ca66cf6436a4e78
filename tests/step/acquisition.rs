use nalgebra::DMatrix;
use surrogate_optimizer::prelude::*;
use surrogate_optimizer::{Acquisition, Evaluators};

use crate::{bounds, training};

#[test]
fn residual_is_the_negative_normalized_norm() {
    let y = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 3.0, -1.0]);
    let l1 = target_scalarizer(vec![1.0, 1.0], ResidualNorm::L1)(&y);
    let l2 = target_scalarizer(vec![1.0, 1.0], ResidualNorm::L2)(&y);
    assert_eq!(l1.residual[0], 0.0);
    assert_eq!(l1.residual[1], -2.0);
    assert!((l2.residual[1] + 2.0).abs() < 1e-12);
    // Closer to the targets is always larger.
    assert!(l1.residual[0] > l1.residual[1]);
    assert!(l2.residual[0] > l2.residual[1]);
}

#[test]
fn difference_scalarizer_pairs_columns() {
    let s = difference_scalarizer(vec![0, 1], vec![2, 2], ResidualNorm::L2).unwrap();
    let out = s(&DMatrix::from_row_slice(1, 3, &[2.0, 4.0, 3.0]));
    assert_eq!(out.components(), DMatrix::from_row_slice(1, 2, &[-1.0, 1.0]));
    assert_eq!(out.residual[0], -1.0);
    assert!(difference_scalarizer(vec![0], vec![], ResidualNorm::L1).is_err());
}

#[test]
fn every_kind_is_parseable_from_its_key() {
    for key in ["posterior_mean", "ei_mc", "logei_mc", "logei"] {
        let kind: AcquisitionKind = key.parse().unwrap();
        assert_eq!(kind.to_string(), key);
    }
    assert!(matches!("ucb".parse::<AcquisitionKind>(), Err(Error::UnknownAcquisition(_))));
}

#[test]
fn functions_are_defined_over_the_fitted_model() {
    let settings = StepSettings::builder(["a", "b"])
        .acquisition(AcquisitionKind::LogExpectedImprovementMc)
        .mc_samples(64)
        .build()
        .unwrap();
    let mut step = OptimizationStep::new(training(), bounds(), settings, None, 1).unwrap();
    step.fit_step(&AvoidSet::new(), None).unwrap();
    let scalarize = difference_scalarizer(vec![0], vec![1], ResidualNorm::L1).unwrap();
    let evaluators: Evaluators = step.define_functions(scalarize).unwrap().clone();
    assert_eq!(step.phase(), StepPhase::FunctionsDefined);

    let xs = DMatrix::from_row_slice(3, 1, &[0.1, 0.5, 0.9]);
    let acq = evaluators.acquisition().evaluate(&xs).unwrap();
    assert!(acq.iter().all(|v| v.is_finite()));
    let residual = evaluators.residual(&xs).unwrap();
    let components = evaluators.residual_components(&xs).unwrap();
    for i in 0..3 {
        assert!((residual[i] + components[(i, 0)].abs()).abs() < 1e-12);
    }
}

#[test]
fn analytic_log_ei_needs_a_single_output() {
    let settings = StepSettings::builder(["a", "b"])
        .acquisition(AcquisitionKind::LogExpectedImprovement)
        .build()
        .unwrap();
    let mut step = OptimizationStep::new(training(), bounds(), settings, None, 1).unwrap();
    step.fit_step(&AvoidSet::new(), None).unwrap();
    let scalarize = target_scalarizer(vec![0.0, 0.0], ResidualNorm::L2);
    assert!(matches!(step.define_functions(scalarize), Err(Error::InvalidConfig(_))));
}

#[test]
fn improvement_is_measured_against_the_best_training_residual() {
    let settings = StepSettings::builder(["a", "b"])
        .acquisition(AcquisitionKind::ExpectedImprovementMc)
        .build()
        .unwrap();
    let mut step = OptimizationStep::new(training(), bounds(), settings, None, 1).unwrap();
    let composite = step.fit_step(&AvoidSet::new(), None).unwrap().clone();
    let scalarize = target_scalarizer(vec![0.0, 0.0], ResidualNorm::L1);
    let expected = scalarize(composite.train_y().unwrap())
        .residual
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let acq = Acquisition::new(
        AcquisitionKind::ExpectedImprovementMc,
        composite,
        scalarize,
        32,
        0,
    )
    .unwrap();
    assert_eq!(acq.best_f(), expected);
}
