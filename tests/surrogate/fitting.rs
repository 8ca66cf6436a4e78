use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use surrogate_optimizer::prelude::*;
use surrogate_optimizer::{KernelChoice, OutputCalibration};

fn plane() -> (DMatrix<f64>, DMatrix<f64>) {
    let x = DMatrix::from_row_slice(
        5,
        2,
        &[0.1, 0.2, 0.9, 0.1, 0.5, 0.5, 0.2, 0.8, 0.8, 0.9],
    );
    let y = DMatrix::from_fn(5, 1, |i, _| 10.0 + 3.0 * x[(i, 0)] - 2.0 * x[(i, 1)]);
    (x, y)
}

#[test]
fn five_points_in_two_dimensions_are_reproduced() {
    let (x, y) = plane();
    let training = TrainingSet::new(x.clone(), y.clone(), DMatrix::from_element(5, 1, 0.1)).unwrap();
    let bounds = Bounds::new([("a", 0.0, 1.0), ("b", 0.0, 1.0)]).unwrap();
    let settings = StepSettings::builder(["f"]).build().unwrap();
    let mut step = OptimizationStep::new(training, bounds, settings, None, 1).unwrap();
    step.fit_step(&AvoidSet::new(), None).unwrap();

    let p = step.model("f").unwrap().predict(&x, false, None).unwrap();
    let close = (0..5)
        .filter(|&i| (p.mean[(i, 0)] - y[(i, 0)]).abs() < 0.05 * y[(i, 0)].abs())
        .count();
    assert!(close >= 4, "only {close} of 5 points within 5%");
    for i in 0..5 {
        assert!(p.lower[(i, 0)] <= p.mean[(i, 0)]);
        assert!(p.mean[(i, 0)] <= p.upper[(i, 0)]);
    }
}

#[test]
fn in_sample_error_stays_within_tolerance() {
    let x = DMatrix::from_fn(8, 1, |i, _| i as f64 / 7.0);
    let y = DVector::from_fn(8, |i, _| 2.0 + (3.0 * x[(i, 0)]).sin());
    let mut m = SurrogateModel::builder("f", x, y, DVector::from_element(8, 1e-6))
        .build()
        .unwrap();
    m.fit().unwrap();
    assert!(m.training_accuracy().unwrap() < 5.0);
    assert!(!m.losses().is_empty());
    assert!(m.hyperparameters().is_some());
}

#[test]
fn batched_prediction_matches_single_calls() {
    let (x, y) = plane();
    let mut m = SurrogateModel::builder("f", x, y.column(0).into_owned(), DVector::from_element(5, 1e-2))
        .build()
        .unwrap();
    m.fit().unwrap();
    let a = DMatrix::from_row_slice(2, 2, &[0.3, 0.3, 0.6, 0.1]);
    let b = DMatrix::from_row_slice(1, 2, &[0.4, 0.7]);
    let batched = m.predict_batched(&[a.clone(), b.clone()], false, None).unwrap();
    assert_eq!(batched[0].mean, m.predict(&a, false, None).unwrap().mean);
    assert_eq!(batched[1].mean, m.predict(&b, false, None).unwrap().mean);
}

#[test]
fn posterior_samples_have_one_draw_per_request() {
    let (x, y) = plane();
    let mut m = SurrogateModel::builder("f", x, y.column(0).into_owned(), DVector::from_element(5, 1e-2))
        .build()
        .unwrap();
    m.fit().unwrap();
    let xs = DMatrix::from_row_slice(3, 2, &[0.1, 0.1, 0.5, 0.4, 0.9, 0.9]);
    let p = m.predict(&xs, false, Some(16)).unwrap();
    let samples = p.samples.unwrap();
    assert_eq!(samples.len(), 16);
    assert!(samples.iter().all(|s| s.nrows() == 3 && s.ncols() == 1));
}

#[test]
fn constant_kernel_fits_a_level() {
    let x = DMatrix::from_fn(6, 1, |i, _| i as f64);
    let y = DVector::from_fn(6, |i, _| 4.0 + if i % 2 == 0 { 0.1 } else { -0.1 });
    let options = SurrogateOptions {
        kernel: KernelChoice::Constant,
        ..SurrogateOptions::default()
    };
    let mut m = SurrogateModel::builder("f", x, y, DVector::from_element(6, 1e-2))
        .options(options)
        .build()
        .unwrap();
    m.fit().unwrap();
    let p = m.predict(&DMatrix::from_row_slice(1, 1, &[2.5]), false, None).unwrap();
    assert!((p.mean[(0, 0)] - 4.0).abs() < 0.1);
}

#[test]
fn calibrated_outputs_come_back_in_raw_units() {
    let x = DMatrix::from_fn(6, 1, |i, _| i as f64 / 5.0);
    let y = DVector::from_fn(6, |i, _| 100.0 + 10.0 * x[(i, 0)]);
    let calibration = OutputCalibration::new().with("f", 100.0, 0.1).unwrap();
    let mut m = SurrogateModel::builder("f", x.clone(), y.clone(), DVector::from_element(6, 1e-4))
        .physics(Arc::new(calibration))
        .build()
        .unwrap();
    m.fit().unwrap();
    let raw = m.predict(&x, false, None).unwrap();
    let fundamental = m.predict(&x, true, None).unwrap();
    for i in 0..6 {
        assert!((raw.mean[(i, 0)] - y[i]).abs() < 0.5);
        assert!((fundamental.mean[(i, 0)] - (y[i] - 100.0) * 0.1).abs() < 0.05);
    }
    assert!(m.pipeline().physics_enabled());
}

#[test]
fn fundamental_predictions_leave_shared_models_alone() {
    let x = DMatrix::from_fn(6, 1, |i, _| i as f64 / 5.0);
    let y = DVector::from_fn(6, |i, _| 100.0 + 10.0 * x[(i, 0)]);
    let calibration = OutputCalibration::new().with("f", 100.0, 0.1).unwrap();
    let mut m = SurrogateModel::builder("f", x.clone(), y, DVector::from_element(6, 1e-4))
        .physics(Arc::new(calibration))
        .build()
        .unwrap();
    m.fit().unwrap();
    let m = Arc::new(m);
    let reference = m.predict(&x, false, None).unwrap();

    let other = Arc::clone(&m);
    let xs = x.clone();
    let worker = std::thread::spawn(move || {
        for _ in 0..200 {
            other.predict(&xs, true, None).unwrap();
        }
    });
    for _ in 0..200 {
        assert_eq!(m.predict(&x, false, None).unwrap().mean, reference.mean);
    }
    worker.join().unwrap();
    assert!(m.pipeline().physics_enabled());
}
