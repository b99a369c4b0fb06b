//! Experiment settings with environment overrides.

use std::env;
use std::path::PathBuf;

use crate::classifier::TrainParams;
use crate::dataset::DatasetConfig;
use crate::lstm::{LstmActivation, LstmConfig};
use crate::observability::parse_bool;
use crate::sweep::{ReportConfig, SweepPlan};

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    pub dataset: DatasetConfig,
    /// Rows per window; at the 10 minute feature cadence, 10 steps of history.
    pub lookback: usize,
    pub model: LstmConfig,
    pub sweep: SweepPlan,
    pub report: ReportConfig,
    /// Continue training the best sweep model through `verify_phases`.
    pub verify: bool,
    /// Phases run in order on the same model; each is numbered from 1 in
    /// the summary output.
    pub verify_phases: Vec<Vec<TrainParams>>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let epochs = 25;
        let points = |pairs: &[(usize, f64)]| -> Vec<TrainParams> {
            pairs
                .iter()
                .map(|&(batch_size, learning_rate)| TrainParams {
                    batch_size,
                    learning_rate,
                    epochs,
                })
                .collect()
        };
        Self {
            data_path: PathBuf::from("data/features_LSTM_4_5m_full.csv"),
            output_dir: PathBuf::from("reports"),
            dataset: DatasetConfig::default(),
            lookback: 10,
            model: LstmConfig::default(),
            sweep: SweepPlan::default(),
            report: ReportConfig::default(),
            verify: true,
            verify_phases: vec![
                points(&[(1024, 1e-3), (512, 1e-3), (128, 1e-3)]),
                points(&[
                    (1024, 1e-4),
                    (512, 1e-4),
                    (256, 1e-3),
                    (256, 1e-4),
                    (128, 1e-4),
                    (64, 1e-3),
                    (64, 1e-4),
                ]),
            ],
        }
    }
}

pub fn experiment_config_from_env() -> ExperimentConfig {
    let mut config = ExperimentConfig::default();

    if let Some(path) = non_empty_var("STOP_DATA_PATH") {
        config.data_path = PathBuf::from(path);
    }
    if let Some(dir) = non_empty_var("STOP_OUTPUT_DIR") {
        config.output_dir = PathBuf::from(dir);
    }
    if let Some(lookback) = parse_var::<usize>("STOP_LOOKBACK").filter(|v| *v > 0) {
        config.lookback = lookback;
    }
    if let Some(epochs) = parse_var::<usize>("STOP_EPOCHS").filter(|v| *v > 0) {
        config.sweep.epochs = epochs;
        for point in config.verify_phases.iter_mut().flatten() {
            point.epochs = epochs;
        }
    }
    if let Some(seed) = parse_var::<u64>("STOP_SEED") {
        config.model.seed = seed;
    }
    if let Some(threshold) =
        parse_var::<f64>("STOP_THRESHOLD").filter(|v| (0.0..=1.0).contains(v))
    {
        config.report.decision_threshold = threshold;
    }
    if let Some(sizes) = non_empty_var("STOP_HIDDEN_SIZES").and_then(|raw| parse_sizes(&raw)) {
        config.model.hidden_sizes = sizes;
    }
    if let Some(activation) =
        non_empty_var("STOP_ACTIVATION").and_then(|raw| LstmActivation::parse(&raw))
    {
        config.model.activation = activation;
    }
    if let Some(dropout) = parse_var::<f64>("STOP_DROPOUT").filter(|v| (0.0..1.0).contains(v)) {
        config.model.dropout = dropout;
    }
    if let Some(runs) = parse_var::<usize>("STOP_SWEEP_RUNS").filter(|v| *v > 0) {
        config.sweep.runs = runs;
    }
    if let Some(batch) = parse_var::<usize>("STOP_INITIAL_BATCH").filter(|v| *v > 0) {
        config.sweep.initial_batch_size = batch;
    }
    if let Some(verify) = non_empty_var("STOP_VERIFY").and_then(|raw| parse_bool(&raw)) {
        config.verify = verify;
    }

    config
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    non_empty_var(key).and_then(|raw| raw.parse().ok())
}

/// Comma-separated positive sizes, e.g. `128,32`.
fn parse_sizes(raw: &str) -> Option<Vec<usize>> {
    let sizes = raw
        .split(',')
        .map(|part| part.trim().parse::<usize>().ok().filter(|size| *size > 0))
        .collect::<Option<Vec<_>>>()?;
    if sizes.is_empty() {
        None
    } else {
        Some(sizes)
    }
}
