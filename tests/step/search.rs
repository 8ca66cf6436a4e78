use nalgebra::DMatrix;
use surrogate_optimizer::prelude::*;

use crate::bounds;

fn parabola() -> TrainingSet {
    let x = DMatrix::from_row_slice(6, 1, &[0.0, 0.15, 0.45, 0.6, 0.8, 1.0]);
    let y = x.map(|v| (v - 0.3) * (v - 0.3));
    TrainingSet::new(x, y, DMatrix::from_element(6, 1, 1e-3)).unwrap()
}

fn optimize(chain: &str, acquisition: AcquisitionKind, n_candidates: usize, seed: u64) -> (Vec<Candidate>, usize) {
    let search = SearchOptions {
        chain: chain.parse().unwrap(),
        n_candidates,
        ..SearchOptions::default()
    };
    let settings = StepSettings::builder(["f"])
        .acquisition(acquisition)
        .search(search)
        .build()
        .unwrap();
    let mut step = OptimizationStep::new(parabola(), bounds(), settings, None, 1).unwrap();
    step.fit_step(&AvoidSet::new(), None).unwrap();
    step.optimize(target_scalarizer(vec![0.0], ResidualNorm::L1), seed, None)
        .unwrap();
    let strategies = step.diagnostics().unwrap().strategies.len();
    (step.into_candidates().unwrap(), strategies)
}

#[test]
fn each_strategy_locates_the_target() {
    for chain in ["botorch", "ga", "root_3"] {
        let (candidates, _) = optimize(chain, AcquisitionKind::PosteriorMean, 1, 0);
        assert!((candidates[0].x[0] - 0.3).abs() < 0.08, "{chain}: {:?}", candidates[0]);
    }
}

#[test]
fn chains_report_every_strategy() {
    let (candidates, strategies) = optimize("root_2-botorch-ga", AcquisitionKind::PosteriorMean, 3, 0);
    assert_eq!(strategies, 3);
    assert!(!candidates.is_empty() && candidates.len() <= 3);
    assert!(candidates.iter().all(|c| (0.0..=1.0).contains(&c.x[0])));
    assert!(candidates.windows(2).all(|w| w[0].residual >= w[1].residual));
}

#[test]
fn same_seed_gives_same_candidates() {
    let a = optimize("botorch-ga", AcquisitionKind::LogExpectedImprovementMc, 2, 11).0;
    let b = optimize("botorch-ga", AcquisitionKind::LogExpectedImprovementMc, 2, 11).0;
    assert_eq!(a, b);
}

#[test]
fn analytic_log_ei_proposes_points_in_bounds() {
    let (candidates, _) = optimize("botorch", AcquisitionKind::LogExpectedImprovement, 1, 0);
    assert!((0.0..=1.0).contains(&candidates[0].x[0]));
    assert!(candidates[0].acquisition.is_finite());
}
