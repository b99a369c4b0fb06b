//! Windowing and scaling of the three chronological splits.

use tracing::info;

use crate::dataset::DatasetSplits;
use crate::scaler::{column_moments, ColumnMoments, StandardScaler};
use crate::windows::{flatten_last_step, temporalize_series, PrepError, WindowSet};

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedData {
    pub train: WindowSet,
    pub valid: WindowSet,
    pub test: WindowSet,
    pub scaler: StandardScaler,
    /// Column moments of the flattened, scaled training windows.
    pub train_moments: ColumnMoments,
}

/// Windows every split, fits the scaler on the last timestep of the training
/// windows only, then scales all three splits with those same parameters.
pub fn prepare(splits: &DatasetSplits, lookback: usize) -> Result<PreparedData, PrepError> {
    let mut train = temporalize_series(&splits.train, lookback)?;
    let mut valid = temporalize_series(&splits.valid, lookback)?;
    let mut test = temporalize_series(&splits.test, lookback)?;

    let mut scaler = StandardScaler::new();
    scaler.fit(flatten_last_step(train.view()).view())?;

    scaler.scale_windows(&mut train.windows)?;
    scaler.scale_windows(&mut valid.windows)?;
    scaler.scale_windows(&mut test.windows)?;

    let train_moments = column_moments(flatten_last_step(train.view()).view());
    let max_abs_mean = train_moments
        .mean
        .iter()
        .fold(0.0_f64, |acc, value| acc.max(value.abs()));
    info!(
        component = "pipeline",
        event = "pipeline.prepare.moments",
        colwise_mean = ?train_moments.mean.mapv(|v| (v * 1e6).round() / 1e6).to_vec(),
        colwise_variance = ?train_moments.variance.to_vec(),
        max_abs_mean
    );
    info!(
        component = "pipeline",
        event = "pipeline.prepare.finish",
        lookback,
        train_windows = train.len(),
        valid_windows = valid.len(),
        test_windows = test.len()
    );

    Ok(PreparedData {
        train,
        valid,
        test,
        scaler,
        train_moments,
    })
}
