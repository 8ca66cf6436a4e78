use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use surrogate_optimizer::prelude::*;
use surrogate_optimizer::{SnapshotEntry, SnapshotStore};

use crate::temp_path;

fn run() -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
    let x = DMatrix::from_row_slice(4, 2, &[0.1, 0.1, 0.4, 0.7, 0.6, 0.2, 0.9, 0.9]);
    let y = DVector::from_fn(4, |i, _| 1.0 + x[(i, 0)] + x[(i, 1)]);
    (x, y, DVector::from_element(4, 1e-3))
}

fn store_extra(width: usize) -> std::path::PathBuf {
    let path = temp_path("extra");
    let x = DMatrix::from_fn(3, width, |i, j| 0.2 + 0.25 * i as f64 + 0.05 * j as f64);
    let y = DVector::from_fn(3, |i, _| 1.0 + x[(i, 0)] + x[(i, 1.min(width - 1))]);
    let names = (0..width).map(|j| format!("x_{j}")).collect();
    SnapshotStore::new(&path)
        .update(SnapshotEntry::from_matrices("f", names, &x, &y, &DVector::from_element(3, 1e-3)))
        .unwrap();
    path
}

fn options(path: &std::path::Path) -> SurrogateOptions {
    SurrogateOptions {
        extra_points_file: Some(path.to_path_buf()),
        ..SurrogateOptions::default()
    }
}

#[test]
fn matching_extra_points_join_the_fit_and_the_snapshot() {
    let extra = store_extra(2);
    let out = SnapshotStore::create(temp_path("out"), &["f"]).unwrap();
    let (x, y, yvar) = run();
    let mut m = SurrogateModel::builder("f", x, y, yvar)
        .options(options(&extra))
        .snapshot(&out)
        .build()
        .unwrap();
    assert_eq!(m.n_added(), 3);
    assert_eq!(m.n_train(), 4);
    assert_eq!(m.fit_data().0.nrows(), 7);
    m.fit().unwrap();

    let entry = out.read().unwrap().get("f").cloned().unwrap();
    assert_eq!(entry.n_rows(), 3 + 4);
    assert_eq!(entry.x_names, vec!["x_0", "x_1"]);
}

#[test]
fn wider_extra_points_are_truncated() {
    let extra = store_extra(3);
    let (x, y, yvar) = run();
    let m = SurrogateModel::builder("f", x, y, yvar)
        .options(options(&extra))
        .build()
        .unwrap();
    assert_eq!(m.n_added(), 3);
    assert_eq!(m.fit_data().0.ncols(), 2);
}

#[test]
fn narrower_extra_points_missing_a_fitted_feature_are_rejected() {
    let extra = store_extra(1);
    let (x, y, yvar) = run();
    let result = SurrogateModel::builder("f", x, y, yvar)
        .options(options(&extra))
        .build();
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn narrower_extra_points_suffice_when_the_missing_column_is_unused() {
    let extra = store_extra(1);
    let (x, y, yvar) = run();
    let physics = ColumnSelection::new().select("f", [0]);
    let m = SurrogateModel::builder("f", x, y, yvar)
        .options(options(&extra))
        .physics(Arc::new(physics))
        .build()
        .unwrap();
    assert_eq!(m.n_added(), 3);
    assert_eq!(m.n_features(), 1);
}

#[test]
fn extra_points_alone_can_carry_a_fit() {
    let extra = store_extra(2);
    let (x, y, yvar) = run();
    let mut opts = options(&extra);
    opts.fit_only_from_extra_points = true;
    let mut m = SurrogateModel::builder("f", x, y, yvar).options(opts).build().unwrap();
    assert_eq!(m.n_train(), 0);
    assert_eq!(m.n_added(), 3);
    m.fit().unwrap();
    assert!(m.is_fitted());
}

#[test]
fn missing_entry_adds_nothing() {
    let extra = store_extra(2);
    let (x, y, yvar) = run();
    let m = SurrogateModel::builder("g", x, y, yvar)
        .options(options(&extra))
        .build()
        .unwrap();
    assert_eq!(m.n_added(), 0);
}
