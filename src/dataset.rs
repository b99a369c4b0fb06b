//! CSV loading, row filtering, column selection and chronological splits.

use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use csv::StringRecord;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FilterOp {
    LessThan(f64),
    Equals(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
}

impl RowFilter {
    pub fn less_than(column: &str, bound: f64) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::LessThan(bound),
        }
    }

    pub fn equals(column: &str, value: f64) -> Self {
        Self {
            column: column.to_string(),
            op: FilterOp::Equals(value),
        }
    }

    fn keeps(&self, value: f64) -> bool {
        match self.op {
            FilterOp::LessThan(bound) => value < bound,
            FilterOp::Equals(expected) => value == expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub label_column: String,
    /// Features are every kept column from the first one through this one.
    pub last_feature_column: String,
    pub drop_columns: Vec<String>,
    pub drop_prefixes: Vec<String>,
    pub filters: Vec<RowFilter>,
    /// Leading share of rows used for training + validation; the rest is test.
    pub holdout_fraction: f64,
    /// Leading share of the training file used for training; the rest is validation.
    pub train_fraction: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            label_column: "labels_stop_ALM_next_360".to_string(),
            last_feature_column: "pp_mean_19".to_string(),
            drop_columns: vec!["time_since_last_shift_change".to_string()],
            drop_prefixes: vec!["pp_std".to_string()],
            filters: vec![
                RowFilter::less_than("pp_mean_1", 1000.0),
                RowFilter::equals("stop_type1", 0.0),
                RowFilter::equals("stop_type2", 0.0),
                RowFilter::equals("stop_type3", 0.0),
                RowFilter::equals("stop_type4", 0.0),
            ],
            holdout_fraction: 0.8,
            train_fraction: 0.8,
        }
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("column '{0}' not found")]
    MissingColumn(String),
    #[error("invalid dataset config: {0}")]
    InvalidConfig(String),
    #[error("line {line}: failed to parse column {column} value '{value}'")]
    ParseField {
        line: u64,
        column: String,
        value: String,
    },
    #[error("line {line}: label must be 0 or 1, got {value}")]
    NonBinaryLabel { line: u64, value: f64 },
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Time-ordered feature rows with index-aligned 0/1 labels.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSeries {
    pub features: Array2<f64>,
    pub labels: Array1<u8>,
}

impl LabeledSeries {
    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|label| **label == 1).count()
    }

    pub fn rows(&self, range: Range<usize>) -> Self {
        Self {
            features: self.features.slice(s![range.clone(), ..]).to_owned(),
            labels: self.labels.slice(s![range]).to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplits {
    pub feature_names: Vec<String>,
    pub train: LabeledSeries,
    pub valid: LabeledSeries,
    pub test: LabeledSeries,
}

pub fn load_splits(path: &Path, cfg: &DatasetConfig) -> Result<DatasetSplits, DatasetError> {
    info!(
        component = "dataset",
        event = "dataset.load.start",
        path = %path.display()
    );
    let file = File::open(path)?;
    load_splits_from_reader(file, cfg)
}

pub fn load_splits_from_reader<R: Read>(
    reader: R,
    cfg: &DatasetConfig,
) -> Result<DatasetSplits, DatasetError> {
    validate_config(cfg)?;
    let (feature_names, series) = read_series(reader, cfg)?;
    let splits = split_chronological(series, feature_names, cfg);

    info!(
        component = "dataset",
        event = "dataset.load.finish",
        n_features = splits.feature_names.len(),
        train_rows = splits.train.len(),
        valid_rows = splits.valid.len(),
        test_rows = splits.test.len(),
        train_positives = splits.train.positives(),
        test_positives = splits.test.positives()
    );

    Ok(splits)
}

/// Unshuffled split: `[train | valid]` from the leading `holdout_fraction`,
/// test from the rest. Boundaries are floored.
pub fn split_chronological(
    series: LabeledSeries,
    feature_names: Vec<String>,
    cfg: &DatasetConfig,
) -> DatasetSplits {
    let n = series.len();
    let train_file_end = floor_share(n, cfg.holdout_fraction);
    let train_end = floor_share(train_file_end, cfg.train_fraction);

    DatasetSplits {
        feature_names,
        train: series.rows(0..train_end),
        valid: series.rows(train_end..train_file_end),
        test: series.rows(train_file_end..n),
    }
}

fn floor_share(n: usize, fraction: f64) -> usize {
    ((n as f64 * fraction).floor() as usize).min(n)
}

fn validate_config(cfg: &DatasetConfig) -> Result<(), DatasetError> {
    for (name, fraction) in [
        ("holdout_fraction", cfg.holdout_fraction),
        ("train_fraction", cfg.train_fraction),
    ] {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(DatasetError::InvalidConfig(format!(
                "{name} must be within [0, 1], got {fraction}"
            )));
        }
    }
    Ok(())
}

struct ColumnPlan {
    feature_names: Vec<String>,
    feature_idx: Vec<usize>,
    filter_idx: Vec<usize>,
    label_idx: usize,
}

fn plan_columns(headers: &StringRecord, cfg: &DatasetConfig) -> Result<ColumnPlan, DatasetError> {
    let position = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| DatasetError::MissingColumn(name.to_string()))
    };

    let label_idx = position(&cfg.label_column)?;
    let filter_idx = cfg
        .filters
        .iter()
        .map(|filter| position(&filter.column))
        .collect::<Result<Vec<_>, _>>()?;

    let kept: Vec<(usize, &str)> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            !cfg.drop_columns.iter().any(|drop| drop.as_str() == *name)
                && !cfg
                    .drop_prefixes
                    .iter()
                    .any(|prefix| name.starts_with(prefix.as_str()))
        })
        .collect();

    let last = kept
        .iter()
        .position(|(_, name)| *name == cfg.last_feature_column)
        .ok_or_else(|| DatasetError::MissingColumn(cfg.last_feature_column.clone()))?;
    let features = &kept[..=last];

    if features.iter().any(|(idx, _)| *idx == label_idx) {
        return Err(DatasetError::InvalidConfig(format!(
            "label column '{}' falls inside the feature range",
            cfg.label_column
        )));
    }

    Ok(ColumnPlan {
        feature_names: features.iter().map(|(_, name)| name.to_string()).collect(),
        feature_idx: features.iter().map(|(idx, _)| *idx).collect(),
        filter_idx,
        label_idx,
    })
}

fn read_series<R: Read>(
    reader: R,
    cfg: &DatasetConfig,
) -> Result<(Vec<String>, LabeledSeries), DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = reader.headers()?.clone();
    let plan = plan_columns(&headers, cfg)?;

    let mut values = Vec::new();
    let mut labels = Vec::new();
    let mut read_rows = 0u64;

    for record in reader.records() {
        let record = record?;
        read_rows += 1;
        let line = record.position().map(|pos| pos.line()).unwrap_or(read_rows + 1);

        let mut keep = true;
        for (filter, idx) in cfg.filters.iter().zip(&plan.filter_idx) {
            let value = parse_f64(&record, *idx, &headers, line)?;
            if !filter.keeps(value) {
                keep = false;
                break;
            }
        }
        if !keep {
            continue;
        }

        let label = parse_f64(&record, plan.label_idx, &headers, line)?;
        let label = if label == 0.0 {
            0_u8
        } else if label == 1.0 {
            1_u8
        } else {
            return Err(DatasetError::NonBinaryLabel { line, value: label });
        };

        for idx in &plan.feature_idx {
            values.push(parse_f64(&record, *idx, &headers, line)?);
        }
        labels.push(label);
    }

    let kept_rows = labels.len();
    debug!(
        component = "dataset",
        event = "dataset.filter.finish",
        read_rows,
        kept_rows,
        dropped_rows = read_rows - kept_rows as u64
    );

    let features = Array2::from_shape_vec((kept_rows, plan.feature_idx.len()), values)?;
    Ok((
        plan.feature_names,
        LabeledSeries {
            features,
            labels: Array1::from_vec(labels),
        },
    ))
}

fn parse_f64(
    record: &StringRecord,
    idx: usize,
    headers: &StringRecord,
    line: u64,
) -> Result<f64, DatasetError> {
    let raw = record.get(idx).unwrap_or_default();
    raw.parse::<f64>().map_err(|_| DatasetError::ParseField {
        line,
        column: headers.get(idx).unwrap_or_default().to_string(),
        value: raw.to_string(),
    })
}
