
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nalgebra::{DMatrix, DVector};
use surrogate_optimizer::{KernelChoice, SurrogateModel, SurrogateOptions};

fn training(n: usize, dims: usize) -> (DMatrix<f64>, DVector<f64>) {
    let points = test_functions::halton(n, dims);
    let x = DMatrix::from_fn(n, dims, |i, j| points[i][j]);
    let y = DVector::from_fn(n, |i, _| test_functions::fluxes(&points[i])[0]);
    (x, y)
}

fn bench_fit_points(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit_matern_points");
    group.sample_size(10);

    for n in [10, 30, 60] {
        let (x, y) = training(n, 3);
        group.bench_with_input(BenchmarkId::new("n", n), &(x, y), |b, (x, y)| {
            b.iter(|| {
                let mut model =
                    SurrogateModel::builder("flux", x.clone(), y.clone(), DVector::from_element(n, 1e-4))
                        .build()
                        .unwrap();
                model.fit().unwrap();
                model
            });
        });
    }
    group.finish();
}

fn bench_fit_dims(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit_matern_dims");
    group.sample_size(10);

    for dims in [1, 4, 8] {
        let (x, y) = training(30, dims);
        group.bench_with_input(BenchmarkId::new("dims", dims), &(x, y), |b, (x, y)| {
            b.iter(|| {
                let mut model =
                    SurrogateModel::builder("flux", x.clone(), y.clone(), DVector::from_element(30, 1e-4))
                        .build()
                        .unwrap();
                model.fit().unwrap();
                model
            });
        });
    }
    group.finish();
}

fn bench_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit_kernel");
    group.sample_size(10);
    let (x, y) = training(30, 2);

    for kernel in [KernelChoice::Matern52, KernelChoice::Constant] {
        let options = SurrogateOptions {
            kernel,
            ..SurrogateOptions::default()
        };
        group.bench_function(format!("{kernel:?}"), |b| {
            b.iter(|| {
                let mut model =
                    SurrogateModel::builder("flux", x.clone(), y.clone(), DVector::from_element(30, 1e-4))
                        .options(options.clone())
                        .build()
                        .unwrap();
                model.fit().unwrap();
                model
            });
        });
    }
    group.finish();
}

fn bench_predict(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict");
    group.sample_size(10);
    let (x, y) = training(40, 3);
    let mut model = SurrogateModel::builder("flux", x, y, DVector::from_element(40, 1e-4))
        .build()
        .unwrap();
    model.fit().unwrap();

    for batch in [1, 100, 1000] {
        let points = test_functions::halton(batch, 3);
        let xs = DMatrix::from_fn(batch, 3, |i, j| points[i][j]);
        group.bench_with_input(BenchmarkId::new("batch", batch), &xs, |b, xs| {
            b.iter(|| model.predict(xs, false, None).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fit_points, bench_fit_dims, bench_kernels, bench_predict);
criterion_main!(benches);
