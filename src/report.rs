//! Sweep results on disk: a flat CSV table plus a JSON document carrying ROC
//! points and confusion matrices for external plotting.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::sweep::SweepResult;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One CSV row per trained point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub point: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub epochs: usize,
    pub auc_score: Option<f64>,
    pub final_train_loss: Option<f64>,
    pub final_valid_loss: Option<f64>,
    pub threshold: f64,
    pub tn: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub tp: u64,
}

impl SweepRecord {
    pub fn from_result(point: usize, result: &SweepResult) -> Self {
        let cm = &result.evaluation.confusion;
        Self {
            point,
            batch_size: result.params.batch_size,
            learning_rate: result.params.learning_rate,
            epochs: result.params.epochs,
            auc_score: result.evaluation.auc,
            final_train_loss: result.history.final_train_loss(),
            final_valid_loss: result.history.final_valid_loss(),
            threshold: result.evaluation.threshold,
            tn: cm.tn,
            fp: cm.fp,
            fn_: cm.fn_,
            tp: cm.tp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at_utc: DateTime<Utc>,
    pub lookback: usize,
    pub scaler_fingerprint: Option<String>,
    pub sweep: Vec<SweepResult>,
    /// One entry per verification phase, in run order.
    pub verification: Vec<Vec<SweepResult>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub sweep_csv: PathBuf,
    pub run_json: PathBuf,
}

pub fn write_sweep_csv(path: &Path, results: &[SweepResult]) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    for (idx, result) in results.iter().enumerate() {
        writer.serialize(SweepRecord::from_result(idx + 1, result))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_run_json(path: &Path, report: &RunReport) -> Result<(), ReportError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)?;
    Ok(())
}

/// Writes `sweep_results.csv` and `run_report.json` under `output_dir`.
pub fn write_reports(output_dir: &Path, report: &RunReport) -> Result<ReportPaths, ReportError> {
    fs::create_dir_all(output_dir)?;
    let paths = ReportPaths {
        sweep_csv: output_dir.join("sweep_results.csv"),
        run_json: output_dir.join("run_report.json"),
    };

    write_sweep_csv(&paths.sweep_csv, &report.sweep)?;
    write_run_json(&paths.run_json, report)?;

    info!(
        component = "report",
        event = "report.written",
        sweep_csv = %paths.sweep_csv.display(),
        run_json = %paths.run_json.display(),
        sweep_points = report.sweep.len(),
        verification_phases = report.verification.len(),
        verification_points = report.verification.iter().map(Vec::len).sum::<usize>()
    );

    Ok(paths)
}
