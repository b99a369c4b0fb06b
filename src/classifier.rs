//! Seam between prepared windows and the sequence model that consumes them.

use ndarray::{Array1, ArrayView3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::windows::WindowSet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub epochs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainHistory {
    pub train_loss: Vec<f64>,
    /// Empty when no validation windows were supplied.
    pub valid_loss: Vec<f64>,
}

impl TrainHistory {
    pub fn final_train_loss(&self) -> Option<f64> {
        self.train_loss.last().copied()
    }

    pub fn final_valid_loss(&self) -> Option<f64> {
        self.valid_loss.last().copied()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("invalid training params: {0}")]
    InvalidParams(String),
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("model expects {expected} features, got {actual}")]
    FeatureCountMismatch { expected: usize, actual: usize },
    #[error("windows must have at least one timestep")]
    EmptyWindow,
    #[error("non-finite training loss at epoch {epoch}")]
    NonFiniteLoss { epoch: usize },
}

/// Binary classifier over lookback windows.
pub trait SequenceClassifier {
    /// Trains on `train`, reporting loss on `valid` after every epoch when
    /// it holds any windows. Calling `fit` again continues from the current
    /// weights with fresh optimizer state.
    fn fit(
        &mut self,
        train: &WindowSet,
        valid: Option<&WindowSet>,
        params: &TrainParams,
    ) -> Result<TrainHistory, ModelError>;

    /// Probability of the positive class for every window.
    fn predict_proba(&self, windows: ArrayView3<'_, f64>) -> Result<Array1<f64>, ModelError>;
}

pub(crate) fn validate_params(params: &TrainParams) -> Result<(), ModelError> {
    if params.batch_size == 0 {
        return Err(ModelError::InvalidParams("batch_size must be > 0".to_string()));
    }
    if params.epochs == 0 {
        return Err(ModelError::InvalidParams("epochs must be > 0".to_string()));
    }
    if !(params.learning_rate.is_finite() && params.learning_rate > 0.0) {
        return Err(ModelError::InvalidParams(
            "learning_rate must be a positive finite number".to_string(),
        ));
    }
    Ok(())
}
