//! Batch-size / learning-rate sweep and the follow-up verification runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::classifier::{ModelError, SequenceClassifier, TrainHistory, TrainParams};
use crate::metrics::{confusion_matrix, roc_curve, ConfusionMatrix, MetricsError, RocCurve};
use crate::pipeline::PreparedData;
use crate::windows::WindowSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    pub initial_batch_size: usize,
    /// Number of batch sizes tried; the batch size halves after each.
    pub runs: usize,
    pub learning_rates: Vec<f64>,
    pub epochs: usize,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            initial_batch_size: 1024,
            runs: 5,
            learning_rates: vec![0.001, 0.0001],
            epochs: 25,
        }
    }
}

impl SweepPlan {
    /// Every learning rate for 1024, then every learning rate for 512, ...
    pub fn points(&self) -> Vec<TrainParams> {
        let mut points = Vec::with_capacity(self.runs * self.learning_rates.len());
        let mut batch_size = self.initial_batch_size;
        for _ in 0..self.runs {
            if batch_size == 0 {
                break;
            }
            for learning_rate in &self.learning_rates {
                points.push(TrainParams {
                    batch_size,
                    learning_rate: *learning_rate,
                    epochs: self.epochs,
                });
            }
            batch_size /= 2;
        }
        points
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Scores strictly above this count as a predicted stop.
    pub decision_threshold: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            decision_threshold: 0.99,
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("sweep plan produced no points")]
    EmptyPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// `None` when the scored split holds a single class.
    pub roc: Option<RocCurve>,
    pub auc: Option<f64>,
    pub threshold: f64,
    pub confusion: ConfusionMatrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub params: TrainParams,
    pub history: TrainHistory,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone)]
pub struct SweepOutcome<M> {
    pub results: Vec<SweepResult>,
    /// Index into `results` of the highest AUC.
    pub best_index: Option<usize>,
    pub best_model: Option<M>,
}

impl<M> SweepOutcome<M> {
    pub fn best(&self) -> Option<&SweepResult> {
        self.best_index.and_then(|idx| self.results.get(idx))
    }
}

/// Scores `model` on `set`: ROC/AUC plus a confusion matrix at the report
/// threshold.
pub fn evaluate<M: SequenceClassifier>(
    model: &M,
    set: &WindowSet,
    report: &ReportConfig,
) -> Result<Evaluation, SweepError> {
    let scores = model.predict_proba(set.view())?;
    let confusion = confusion_matrix(set.labels.view(), scores.view(), report.decision_threshold)?;

    let roc = match roc_curve(set.labels.view(), scores.view()) {
        Ok(curve) => Some(curve),
        Err(err @ (MetricsError::SingleClass { .. } | MetricsError::Empty)) => {
            warn!(
                component = "sweep",
                event = "sweep.evaluate.roc_undefined",
                samples = set.len(),
                reason = %err
            );
            None
        }
        Err(err) => return Err(err.into()),
    };
    let auc = roc.as_ref().map(RocCurve::auc);

    Ok(Evaluation {
        roc,
        auc,
        threshold: report.decision_threshold,
        confusion,
    })
}

/// Trains a fresh model from `make_model` for every plan point and scores it
/// on the test windows. The best-scoring model is handed back to the caller.
pub fn run_sweep<M, F>(
    prepared: &PreparedData,
    plan: &SweepPlan,
    report: &ReportConfig,
    mut make_model: F,
) -> Result<SweepOutcome<M>, SweepError>
where
    M: SequenceClassifier,
    F: FnMut() -> Result<M, ModelError>,
{
    let points = plan.points();
    if points.is_empty() {
        return Err(SweepError::EmptyPlan);
    }

    info!(
        component = "sweep",
        event = "sweep.start",
        points = points.len(),
        initial_batch_size = plan.initial_batch_size,
        learning_rates = ?plan.learning_rates,
        epochs = plan.epochs
    );

    let mut outcome = SweepOutcome {
        results: Vec::with_capacity(points.len()),
        best_index: None,
        best_model: None,
    };
    let mut best_auc = f64::NEG_INFINITY;

    for (idx, params) in points.iter().enumerate() {
        let mut model = make_model()?;
        let history = model.fit(&prepared.train, Some(&prepared.valid), params)?;
        let evaluation = evaluate(&model, &prepared.test, report)?;

        log_point(idx, params, &evaluation);

        if let Some(auc) = evaluation.auc {
            if auc > best_auc {
                best_auc = auc;
                outcome.best_index = Some(idx);
                outcome.best_model = Some(model);
            }
        }
        outcome.results.push(SweepResult {
            params: *params,
            history,
            evaluation,
        });
    }

    Ok(outcome)
}

/// Keeps training one model across `points`, scoring the test windows after
/// each, and returns the model for further use.
pub fn verify_params<M: SequenceClassifier>(
    mut model: M,
    prepared: &PreparedData,
    points: &[TrainParams],
    report: &ReportConfig,
) -> Result<(M, Vec<SweepResult>), SweepError> {
    let mut results = Vec::with_capacity(points.len());
    for (idx, params) in points.iter().enumerate() {
        info!(
            component = "sweep",
            event = "sweep.verify.start",
            verification = idx + 1,
            batch_size = params.batch_size,
            learning_rate = params.learning_rate
        );
        let history = model.fit(&prepared.train, Some(&prepared.valid), params)?;
        let evaluation = evaluate(&model, &prepared.test, report)?;
        log_point(idx, params, &evaluation);
        results.push(SweepResult {
            params: *params,
            history,
            evaluation,
        });
    }
    Ok((model, results))
}

/// Runs `phases` back to back on one model; later phases start from the
/// weights the earlier ones left behind.
pub fn verify_phases<M: SequenceClassifier>(
    mut model: M,
    prepared: &PreparedData,
    phases: &[Vec<TrainParams>],
    report: &ReportConfig,
) -> Result<(M, Vec<Vec<SweepResult>>), SweepError> {
    let mut per_phase = Vec::with_capacity(phases.len());
    for (idx, phase) in phases.iter().enumerate() {
        info!(
            component = "sweep",
            event = "sweep.verify.phase",
            phase = idx + 1,
            points = phase.len()
        );
        let (trained, results) = verify_params(model, prepared, phase, report)?;
        model = trained;
        per_phase.push(results);
    }
    Ok((model, per_phase))
}

fn log_point(idx: usize, params: &TrainParams, evaluation: &Evaluation) {
    let cm = &evaluation.confusion;
    match evaluation.auc {
        Some(auc) => info!(
            component = "sweep",
            event = "sweep.point.finish",
            point = idx + 1,
            batch_size = params.batch_size,
            learning_rate = params.learning_rate,
            auc_score = auc,
            tn = cm.tn,
            fp = cm.fp,
            fn_ = cm.fn_,
            tp = cm.tp
        ),
        None => info!(
            component = "sweep",
            event = "sweep.point.finish",
            point = idx + 1,
            batch_size = params.batch_size,
            learning_rate = params.learning_rate,
            tn = cm.tn,
            fp = cm.fp,
            fn_ = cm.fn_,
            tp = cm.tp
        ),
    }
}
