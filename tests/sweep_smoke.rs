use ndarray::{Array1, Array2, ArrayView3, Axis};
use stop_predict::{
    evaluate, prepare, run_sweep, temporalize, verify_params, verify_phases, write_reports,
    DatasetSplits, LabeledSeries, LstmClassifier, LstmActivation, LstmConfig, ModelError,
    PreparedData, ReportConfig, RunReport, SequenceClassifier, SweepPlan, SweepRecord,
    TrainHistory, TrainParams, WindowSet,
};

/// Label is 1 whenever the first feature is positive, so the last timestep
/// of every window decides its label.
fn sign_series(rows: usize, phase: f64) -> LabeledSeries {
    let features = Array2::from_shape_fn((rows, 2), |(r, c)| {
        let x = (r as f64 * 0.9 + phase).sin();
        if c == 0 {
            x
        } else {
            (r as f64 * 0.3).cos() * 0.5
        }
    });
    let labels = features.column(0).mapv(|x| u8::from(x > 0.0));
    LabeledSeries { features, labels }
}

fn sign_prepared(lookback: usize) -> PreparedData {
    let splits = DatasetSplits {
        feature_names: vec!["signal".to_string(), "noise".to_string()],
        train: sign_series(60, 0.0),
        valid: sign_series(20, 0.4),
        test: sign_series(24, 1.3),
    };
    prepare(&splits, lookback).expect("prepare")
}

/// Scores windows by their last first-feature value. Learning rates below
/// 0.01 flip the ranking.
struct LastStepScorer {
    direction: f64,
    fits: usize,
}

impl LastStepScorer {
    fn new() -> Self {
        Self {
            direction: 1.0,
            fits: 0,
        }
    }
}

impl SequenceClassifier for LastStepScorer {
    fn fit(
        &mut self,
        train: &WindowSet,
        valid: Option<&WindowSet>,
        params: &TrainParams,
    ) -> Result<TrainHistory, ModelError> {
        if train.is_empty() {
            return Err(ModelError::EmptyTrainingSet);
        }
        self.fits += 1;
        self.direction = if params.learning_rate >= 0.01 { 1.0 } else { -1.0 };
        Ok(TrainHistory {
            train_loss: vec![0.5; params.epochs],
            valid_loss: valid.map_or_else(Vec::new, |_| vec![0.6; params.epochs]),
        })
    }

    fn predict_proba(&self, windows: ArrayView3<'_, f64>) -> Result<Array1<f64>, ModelError> {
        let steps = windows.len_of(Axis(1));
        Ok(windows
            .index_axis(Axis(1), steps - 1)
            .column(0)
            .mapv(|v| 1.0 / (1.0 + (-self.direction * v).exp())))
    }
}

fn assert_auc(actual: Option<f64>, expected: f64) {
    let auc = actual.expect("auc defined");
    assert!((auc - expected).abs() < 1e-12, "auc={auc} expected={expected}");
}

fn small_plan() -> SweepPlan {
    SweepPlan {
        initial_batch_size: 4,
        runs: 2,
        learning_rates: vec![0.001, 0.01],
        epochs: 2,
    }
}

#[test]
fn sweep_trains_a_fresh_model_per_point_and_keeps_the_best() {
    let prepared = sign_prepared(3);
    let mut built = 0;

    let outcome = run_sweep(&prepared, &small_plan(), &ReportConfig::default(), || {
        built += 1;
        Ok(LastStepScorer::new())
    })
    .expect("sweep");

    assert_eq!(built, 4);
    assert_eq!(outcome.results.len(), 4);
    let points: Vec<(usize, f64)> = outcome
        .results
        .iter()
        .map(|r| (r.params.batch_size, r.params.learning_rate))
        .collect();
    assert_eq!(points, vec![(4, 0.001), (4, 0.01), (2, 0.001), (2, 0.01)]);

    assert_auc(outcome.results[0].evaluation.auc, 0.0);
    assert_auc(outcome.results[1].evaluation.auc, 1.0);
    assert_eq!(outcome.best_index, Some(1));
    assert_eq!(outcome.best().map(|r| r.params.learning_rate), Some(0.01));

    let best_model = outcome.best_model.expect("best model");
    assert_eq!(best_model.fits, 1);
    assert_eq!(best_model.direction, 1.0);

    for result in &outcome.results {
        assert_eq!(result.evaluation.threshold, 0.99);
        assert_eq!(
            result.evaluation.confusion.total(),
            prepared.test.len() as u64
        );
        assert_eq!(result.history.train_loss.len(), 2);
    }
}

#[test]
fn verification_keeps_training_the_same_model() {
    let prepared = sign_prepared(3);
    let outcome = run_sweep(&prepared, &small_plan(), &ReportConfig::default(), || {
        Ok(LastStepScorer::new())
    })
    .expect("sweep");
    let model = outcome.best_model.expect("best model");

    let points = [
        TrainParams {
            batch_size: 4,
            learning_rate: 0.01,
            epochs: 1,
        },
        TrainParams {
            batch_size: 2,
            learning_rate: 0.001,
            epochs: 1,
        },
    ];
    let (model, results) =
        verify_params(model, &prepared, &points, &ReportConfig::default()).expect("verify");

    assert_eq!(model.fits, 3);
    assert_eq!(results.len(), 2);
    assert_auc(results[0].evaluation.auc, 1.0);
    assert_auc(results[1].evaluation.auc, 0.0);
}

#[test]
fn verification_phases_share_one_model_in_order() {
    let prepared = sign_prepared(3);
    let point = |batch_size, learning_rate| TrainParams {
        batch_size,
        learning_rate,
        epochs: 1,
    };
    let phases = vec![
        vec![point(8, 0.01), point(4, 0.01), point(2, 0.01)],
        vec![point(8, 0.001), point(4, 0.01)],
    ];

    let (model, per_phase) = verify_phases(
        LastStepScorer::new(),
        &prepared,
        &phases,
        &ReportConfig::default(),
    )
    .expect("verify");

    assert_eq!(model.fits, 5);
    assert_eq!(per_phase.len(), 2);
    assert_eq!(per_phase[0].len(), 3);
    assert_eq!(per_phase[1].len(), 2);
    assert_eq!(per_phase[1][0].params, point(8, 0.001));
    assert_auc(per_phase[1][0].evaluation.auc, 0.0);
    assert_auc(per_phase[1][1].evaluation.auc, 1.0);
}

#[test]
fn single_class_test_split_leaves_auc_undefined() {
    let features = Array2::from_shape_fn((12, 2), |(r, c)| (r + c) as f64);
    let labels = Array1::<u8>::zeros(12);
    let set = temporalize(features.view(), labels.view(), 3).expect("temporalize");

    let evaluation = evaluate(&LastStepScorer::new(), &set, &ReportConfig::default())
        .expect("evaluate");

    assert!(evaluation.roc.is_none());
    assert!(evaluation.auc.is_none());
    assert_eq!(evaluation.confusion.total(), set.len() as u64);
}

#[test]
fn lstm_loss_falls_on_a_learnable_signal() {
    let prepared = sign_prepared(3);
    let config = LstmConfig {
        hidden_sizes: vec![4],
        activation: LstmActivation::Tanh,
        dropout: 0.0,
        seed: 3,
    };
    let mut model = LstmClassifier::new(config, 2).expect("model");
    let params = TrainParams {
        batch_size: 8,
        learning_rate: 0.05,
        epochs: 40,
    };

    let history = model
        .fit(&prepared.train, Some(&prepared.valid), &params)
        .expect("fit");

    assert_eq!(history.train_loss.len(), 40);
    assert_eq!(history.valid_loss.len(), 40);
    let first = history.train_loss[0];
    let last = history.final_train_loss().expect("loss");
    assert!(last < first, "first={first} last={last}");

    let probs = model.predict_proba(prepared.test.view()).expect("predict");
    assert_eq!(probs.len(), prepared.test.len());
    assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
}

#[test]
fn default_lstm_trains_reproducibly_with_dropout() {
    let prepared = sign_prepared(3);
    let config = LstmConfig {
        hidden_sizes: vec![4, 3],
        ..LstmConfig::default()
    };
    let params = TrainParams {
        batch_size: 16,
        learning_rate: 0.01,
        epochs: 3,
    };

    let mut first = LstmClassifier::new(config.clone(), 2).expect("model");
    let mut second = LstmClassifier::new(config, 2).expect("model");
    let history_first = first
        .fit(&prepared.train, Some(&prepared.valid), &params)
        .expect("fit");
    let history_second = second
        .fit(&prepared.train, Some(&prepared.valid), &params)
        .expect("fit");

    assert_eq!(history_first, history_second);
    assert!(history_first.train_loss.iter().all(|loss| loss.is_finite()));
    assert_eq!(
        first.predict_proba(prepared.test.view()).expect("predict"),
        second.predict_proba(prepared.test.view()).expect("predict")
    );
}

#[test]
fn lstm_refuses_an_empty_training_set() {
    let mut model = LstmClassifier::new(LstmConfig::default(), 2).expect("model");
    let params = TrainParams {
        batch_size: 4,
        learning_rate: 0.001,
        epochs: 1,
    };
    let err = model
        .fit(&WindowSet::empty(3, 2), None, &params)
        .expect_err("must fail");
    assert_eq!(err, ModelError::EmptyTrainingSet);
}

#[test]
fn reports_land_as_csv_and_json() {
    let prepared = sign_prepared(3);
    let outcome = run_sweep(&prepared, &small_plan(), &ReportConfig::default(), || {
        Ok(LastStepScorer::new())
    })
    .expect("sweep");
    let model = outcome.best_model.expect("best model");
    let phase = [TrainParams {
        batch_size: 4,
        learning_rate: 0.01,
        epochs: 1,
    }];
    let (_model, verified) =
        verify_params(model, &prepared, &phase, &ReportConfig::default()).expect("verify");

    let report = RunReport {
        generated_at_utc: chrono::Utc::now(),
        lookback: 3,
        scaler_fingerprint: prepared.scaler.params().map(|p| p.fingerprint()),
        sweep: outcome.results,
        verification: vec![verified],
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("reports");

    let paths = write_reports(&out, &report).expect("write");

    let mut reader = csv::Reader::from_path(&paths.sweep_csv).expect("csv");
    let headers = reader.headers().expect("headers").clone();
    assert!(headers.iter().any(|h| h == "fn"));
    let records: Vec<SweepRecord> = reader
        .deserialize()
        .collect::<Result<_, _>>()
        .expect("records");
    assert_eq!(records.len(), 4);
    assert_eq!(records[1].point, 2);
    assert_auc(records[1].auc_score, 1.0);
    assert_eq!(records[1].batch_size, 4);

    let raw = std::fs::read_to_string(&paths.run_json).expect("json file");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(json["lookback"], 3);
    assert_eq!(json["sweep"].as_array().map(Vec::len), Some(4));
    assert_eq!(
        json["scaler_fingerprint"].as_str().map(str::len),
        Some(64)
    );
    assert!(json["sweep"][1]["evaluation"]["roc"]["thresholds"][0].is_null());

    let back: RunReport = serde_json::from_str(&raw).expect("run report");
    assert_eq!(back.lookback, report.lookback);
    assert_eq!(back.generated_at_utc, report.generated_at_utc);
    assert_eq!(back.scaler_fingerprint, report.scaler_fingerprint);
    assert_eq!(back.sweep.len(), report.sweep.len());
    assert_eq!(back.verification.len(), 1);
    assert_eq!(back.verification[0].len(), 1);
    for (read, written) in back.sweep.iter().zip(&report.sweep) {
        assert_eq!(read.params, written.params);
        assert_eq!(read.evaluation.confusion, written.evaluation.confusion);
        let (read_roc, written_roc) = (
            read.evaluation.roc.as_ref().expect("roc read"),
            written.evaluation.roc.as_ref().expect("roc written"),
        );
        assert!(read_roc.thresholds[0].is_infinite());
        assert_eq!(read_roc.thresholds.len(), written_roc.thresholds.len());
        assert_eq!(read_roc.fpr.len(), written_roc.fpr.len());
    }
}
