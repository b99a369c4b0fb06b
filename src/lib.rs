//! Equipment-stop prediction from windowed sensor features.
//!
//! - CSV feature loading, row filtering and chronological splits
//! - lookback windowing and train-only standardization
//! - stacked LSTM classifier behind the `SequenceClassifier` seam
//! - batch size / learning rate sweep with ROC/AUC and confusion reporting

mod classifier;
mod config;
mod dataset;
mod lstm;
mod metrics;
mod observability;
mod pipeline;
mod report;
mod scaler;
mod sweep;
mod windows;

pub use classifier::{ModelError, SequenceClassifier, TrainHistory, TrainParams};
pub use config::{experiment_config_from_env, ExperimentConfig};
pub use dataset::{
    load_splits, load_splits_from_reader, split_chronological, DatasetConfig, DatasetError,
    DatasetSplits, FilterOp, LabeledSeries, RowFilter,
};
pub use lstm::{LstmActivation, LstmClassifier, LstmConfig};
pub use metrics::{auc, confusion_matrix, roc_curve, ConfusionMatrix, MetricsError, RocCurve};
pub use observability::{
    init_logging, log_run_finish, log_run_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{prepare, PreparedData};
pub use report::{
    write_reports, write_run_json, write_sweep_csv, ReportError, ReportPaths, RunReport,
    SweepRecord,
};
pub use scaler::{column_moments, ColumnMoments, ScalerParams, StandardScaler};
pub use sweep::{
    evaluate, run_sweep, verify_params, verify_phases, Evaluation, ReportConfig, SweepError,
    SweepOutcome, SweepPlan, SweepResult,
};
pub use windows::{
    flatten_last_step, temporalize, temporalize_series, window_count, PrepError, WindowSet,
};
