use nalgebra::{DMatrix, DVector};
use surrogate_optimizer::prelude::*;

#[test]
fn constant_output_uses_a_constant_model() {
    let x = DMatrix::from_row_slice(4, 1, &[0.0, 0.3, 0.6, 0.9]);
    let yvar = DVector::from_element(4, 1e-4);
    let mut m = SurrogateModel::builder("fixed", x, DVector::from_element(4, 5.0), yvar)
        .build()
        .unwrap();
    assert!(m.is_constant());
    m.fit().unwrap();
    assert!(m.losses().is_empty());

    let held_out = DMatrix::from_row_slice(3, 1, &[0.15, 0.45, 0.95]);
    let p = m.predict(&held_out, false, None).unwrap();
    for i in 0..3 {
        assert!((p.mean[(i, 0)] - 5.0).abs() < 1e-9);
        assert!(p.variance[(i, 0)] <= 1e-4);
    }
}

#[test]
fn relative_range_below_threshold_is_degenerate() {
    let x = DMatrix::from_row_slice(3, 1, &[0.0, 0.5, 1.0]);
    let y = DVector::from_vec(vec![1000.0, 1000.0 + 1e-5, 1000.0 - 1e-5]);
    let m = SurrogateModel::builder("fixed", x, y, DVector::from_element(3, 1e-6))
        .build()
        .unwrap();
    assert!(m.is_constant());
}

#[test]
fn nan_output_is_degenerate() {
    let x = DMatrix::from_row_slice(3, 1, &[0.0, 0.5, 1.0]);
    let y = DVector::from_vec(vec![1.0, f64::NAN, 2.0]);
    let m = SurrogateModel::builder("broken", x, y, DVector::from_element(3, 1e-2))
        .build()
        .unwrap();
    assert!(m.is_constant());
}

#[test]
fn extra_points_only_outputs_skip_degeneracy_detection() {
    let x = DMatrix::from_row_slice(3, 1, &[0.0, 0.5, 1.0]);
    let options = SurrogateOptions {
        fit_only_from_extra_points: true,
        ..SurrogateOptions::default()
    };
    let m = SurrogateModel::builder("target", x, DVector::from_element(3, 2.0), DVector::from_element(3, 1e-2))
        .options(options)
        .build()
        .unwrap();
    assert!(!m.is_constant());
    assert_eq!(m.n_train(), 0);
}
