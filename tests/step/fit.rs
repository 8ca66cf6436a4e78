use std::sync::Arc;

use nalgebra::DMatrix;
use surrogate_optimizer::prelude::*;
use surrogate_optimizer::{SNAPSHOT_FILE, SnapshotEntry, SnapshotStore};

use crate::{bounds, temp_dir, training};

#[test]
fn composite_columns_match_individual_models() {
    let settings = StepSettings::builder(["a", "b"]).build().unwrap();
    let mut step = OptimizationStep::new(training(), bounds(), settings, None, 1).unwrap();
    let composite = Arc::clone(step.fit_step(&AvoidSet::new(), None).unwrap());

    let xs = DMatrix::from_row_slice(4, 1, &[0.05, 0.33, 0.7, 0.95]);
    let joint = composite.predict(&xs, false, None).unwrap();
    for (j, name) in ["a", "b"].iter().enumerate() {
        let single = step.model(name).unwrap().predict(&xs, false, None).unwrap();
        assert_eq!(joint.mean.column(j), single.mean.column(0));
        assert_eq!(joint.upper.column(j), single.upper.column(0));
    }
    assert_eq!(composite.output_names(), vec!["a", "b"]);
}

#[test]
fn outliers_are_avoided_for_the_step() {
    let x = DMatrix::from_fn(7, 1, |i, _| i as f64 / 6.0);
    let mut y = DMatrix::from_fn(7, 1, |i, _| 1.0 + 0.01 * i as f64);
    y[(3, 0)] = 50.0;
    let training = TrainingSet::new(x, y, DMatrix::from_element(7, 1, 1e-2)).unwrap();
    let settings = StepSettings::builder(["f"]).build().unwrap();
    let mut step = OptimizationStep::new(training, bounds(), settings, None, 1).unwrap();
    let composite = step.fit_step(&AvoidSet::new(), None).unwrap();
    assert_eq!(composite.train_x().unwrap().nrows(), 6);
    assert!(step.outliers().contains(&3));
    assert!(step.avoided().contains(3));
    assert_eq!(step.model("f").unwrap().n_train(), 6);
}

#[test]
fn snapshot_holds_extra_and_run_rows() {
    let folder = temp_dir("snapshot");
    std::fs::create_dir_all(&folder).unwrap();
    let extra_path = folder.join("extra.json");
    let xe = DMatrix::<f64>::from_row_slice(3, 1, &[0.1, 0.5, 0.9]);
    let ye = xe.column(0).map(|v| (v - 0.3).powi(2));
    SnapshotStore::new(&extra_path)
        .update(SnapshotEntry::from_matrices(
            "a",
            vec![String::from("x")],
            &xe,
            &ye,
            &ye.map(|_| 1e-6),
        ))
        .unwrap();

    let settings = StepSettings::builder(["a", "b"])
        .surrogate(SurrogateOptions {
            extra_points_file: Some(extra_path),
            ..SurrogateOptions::default()
        })
        .output_folder(folder.join("out"))
        .build()
        .unwrap();
    let mut step = OptimizationStep::new(training(), bounds(), settings, None, 1).unwrap();
    step.fit_step(&AvoidSet::new(), None).unwrap();
    assert_eq!(step.model("a").unwrap().n_added(), 3);

    let written = SnapshotStore::new(folder.join("out").join(SNAPSHOT_FILE)).read().unwrap();
    assert_eq!(written.get("a").unwrap().n_rows(), 3 + 6);
    assert_eq!(written.get("b").unwrap().n_rows(), 6);
    assert!(folder.join("out").join("training_data_table.dat").exists());
    assert!(folder.join("out").join("training_data_table_errors.dat").exists());
}

#[test]
fn training_data_filter_restricts_run_points() {
    let settings = StepSettings::builder(["flux", "target"]).build().unwrap();
    let x = DMatrix::from_fn(5, 1, |i, _| i as f64 / 4.0);
    let y = DMatrix::from_fn(5, 2, |i, j| x[(i, 0)] * (j + 1) as f64);
    let training = TrainingSet::new(x, y, DMatrix::from_element(5, 2, 1e-3)).unwrap();
    let mut step = OptimizationStep::new(training, bounds(), settings, None, 1).unwrap();
    let result = step.fit_step(&AvoidSet::new(), Some("target"));
    // "flux" has neither run points nor extra points to fit from.
    assert!(matches!(result, Err(Error::EmptyTrainingSet(o)) if o == "flux"));
}

#[test]
fn self_checks_are_reported() {
    let settings = StepSettings::builder(["a", "b"]).build().unwrap();
    let mut step = OptimizationStep::new(training(), bounds(), settings, None, 1).unwrap();
    step.fit_step(&AvoidSet::new(), None).unwrap();
    let names: Vec<&str> = step.checks().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["batch", "combination", "training_accuracy:a", "training_accuracy:b"]
    );
    assert!(step.checks()[0].passed && step.checks()[1].passed);
}
