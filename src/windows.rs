//! Lookback windowing of time-ordered feature rows.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dataset::LabeledSeries;

#[derive(Debug, Error, PartialEq)]
pub enum PrepError {
    #[error("feature rows ({feature_rows}) and labels ({label_rows}) differ in length")]
    ShapeMismatch {
        feature_rows: usize,
        label_rows: usize,
    },
    #[error("lookback must be > 0")]
    InvalidLookback,
    #[error("scaler has not been fitted")]
    ScalerNotFitted,
    #[error("scaler is already fitted")]
    ScalerAlreadyFitted,
    #[error("cannot fit scaler on zero rows")]
    EmptyFit,
    #[error("scaler was fitted on {expected} features, got {actual}")]
    FeatureCountMismatch { expected: usize, actual: usize },
}

/// Overlapping lookback windows paired with the label of the row that closes
/// each window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSet {
    /// samples x lookback x features
    pub windows: Array3<f64>,
    pub labels: Array1<u8>,
}

impl WindowSet {
    pub fn empty(lookback: usize, n_features: usize) -> Self {
        Self {
            windows: Array3::zeros((0, lookback, n_features)),
            labels: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookback(&self) -> usize {
        self.windows.len_of(Axis(1))
    }

    pub fn n_features(&self) -> usize {
        self.windows.len_of(Axis(2))
    }

    pub fn view(&self) -> ArrayView3<'_, f64> {
        self.windows.view()
    }
}

/// Number of windows `temporalize` yields for `n_observations` rows.
pub fn window_count(n_observations: usize, lookback: usize) -> usize {
    n_observations.saturating_sub(lookback + 1)
}

/// Cuts `features` into windows of `lookback` rows.
///
/// Window `i` holds rows `i + 2 ..= i + 1 + lookback` and is labelled with
/// `labels[i + lookback + 1]`, so the label always belongs to the window's
/// last row. Row 0 never starts a window. Fewer than `lookback + 2` rows give
/// an empty set.
pub fn temporalize(
    features: ArrayView2<'_, f64>,
    labels: ArrayView1<'_, u8>,
    lookback: usize,
) -> Result<WindowSet, PrepError> {
    if features.nrows() != labels.len() {
        return Err(PrepError::ShapeMismatch {
            feature_rows: features.nrows(),
            label_rows: labels.len(),
        });
    }
    if lookback == 0 {
        return Err(PrepError::InvalidLookback);
    }

    let n_features = features.ncols();
    let count = window_count(features.nrows(), lookback);
    if count == 0 {
        warn!(
            component = "windows",
            event = "windows.temporalize.degenerate",
            n_observations = features.nrows(),
            lookback,
            min_observations = lookback + 2
        );
        return Ok(WindowSet::empty(lookback, n_features));
    }

    let mut windows = Array3::zeros((count, lookback, n_features));
    for (i, mut window) in windows.outer_iter_mut().enumerate() {
        window.assign(&features.slice(s![i + 2..i + 2 + lookback, ..]));
    }
    let labels = Array1::from_shape_fn(count, |i| labels[i + lookback + 1]);

    debug!(
        component = "windows",
        event = "windows.temporalize.finish",
        n_observations = features.nrows(),
        lookback,
        n_features,
        windows = count
    );

    Ok(WindowSet { windows, labels })
}

pub fn temporalize_series(series: &LabeledSeries, lookback: usize) -> Result<WindowSet, PrepError> {
    temporalize(series.features.view(), series.labels.view(), lookback)
}

/// Last timestep of every window, one row per window.
pub fn flatten_last_step(windows: ArrayView3<'_, f64>) -> Array2<f64> {
    let steps = windows.len_of(Axis(1));
    if steps == 0 {
        return Array2::zeros((windows.len_of(Axis(0)), windows.len_of(Axis(2))));
    }
    windows.index_axis(Axis(1), steps - 1).to_owned()
}
