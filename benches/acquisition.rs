
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nalgebra::DMatrix;
use surrogate_optimizer::prelude::*;
use surrogate_optimizer::{Evaluators, run_chain};

const DIMS: usize = 3;

fn fitted_step(kind: AcquisitionKind) -> (OptimizationStep, Evaluators) {
    let points = test_functions::halton(25, DIMS);
    let x = DMatrix::from_fn(25, DIMS, |i, j| points[i][j]);
    let y = DMatrix::from_fn(25, 2, |i, j| test_functions::fluxes(&points[i])[j]);
    let training = TrainingSet::new(x, y, DMatrix::from_element(25, 2, 1e-3)).unwrap();
    let bounds = Bounds::new((0..DIMS).map(|j| (format!("x{j}"), 0.0, 1.0))).unwrap();
    let settings = StepSettings::builder(["qe", "qi"])
        .acquisition(kind)
        .seed(42)
        .build()
        .unwrap();
    let mut step = OptimizationStep::new(training, bounds, settings, None, 1).unwrap();
    step.fit_step(&AvoidSet::new(), None).unwrap();
    let target = test_functions::fluxes(&[0.4; DIMS]);
    let evaluators = step
        .define_functions(target_scalarizer(target.to_vec(), ResidualNorm::L2))
        .unwrap()
        .clone();
    (step, evaluators)
}

fn bench_acquisition_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquisition_batch");
    group.sample_size(10);

    for kind in [
        AcquisitionKind::PosteriorMean,
        AcquisitionKind::ExpectedImprovementMc,
        AcquisitionKind::LogExpectedImprovementMc,
    ] {
        let (_, evaluators) = fitted_step(kind);
        for batch in [16, 256] {
            let points = test_functions::halton(batch, DIMS);
            let xs = DMatrix::from_fn(batch, DIMS, |i, j| points[i][j]);
            group.bench_with_input(BenchmarkId::new(kind.key(), batch), &xs, |b, xs| {
                b.iter(|| evaluators.acquisition().evaluate(xs).unwrap());
            });
        }
    }
    group.finish();
}

fn bench_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_strategy");
    group.sample_size(10);
    let (step, evaluators) = fitted_step(AcquisitionKind::PosteriorMean);

    for chain in ["botorch", "ga", "root_3", "root_3-botorch-ga"] {
        let options = SearchOptions {
            chain: chain.parse().unwrap(),
            ..SearchOptions::default()
        };
        group.bench_function(chain, |b| {
            b.iter(|| run_chain(&evaluators, step.bounds(), &options, 7, None).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_acquisition_batch, bench_strategies);
criterion_main!(benches);
