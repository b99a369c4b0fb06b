//! Column-wise standardization fit once on training rows and broadcast over
//! every timestep of every window.

use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::windows::PrepError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
    pub n_samples_seen: usize,
}

impl ScalerParams {
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    /// Hex SHA-256 over the fitted statistics, stable across runs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("n_samples_seen:{};", self.n_samples_seen));
        hasher.update("mean:");
        for value in &self.mean {
            hasher.update(value.to_le_bytes());
        }
        hasher.update(";std:");
        for value in &self.std {
            hasher.update(value.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMoments {
    pub mean: Array1<f64>,
    pub variance: Array1<f64>,
}

/// Zero-mean, unit-variance scaler.
///
/// Starts unfit. `fit` moves it to the fitted state exactly once; after that
/// only the transform methods are valid and none of them touch the stored
/// parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StandardScaler {
    params: Option<ScalerParams>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.params.is_some()
    }

    pub fn params(&self) -> Option<&ScalerParams> {
        self.params.as_ref()
    }

    pub fn fit(&mut self, rows: ArrayView2<'_, f64>) -> Result<&ScalerParams, PrepError> {
        if self.params.is_some() {
            return Err(PrepError::ScalerAlreadyFitted);
        }
        if rows.nrows() == 0 {
            return Err(PrepError::EmptyFit);
        }

        let n = rows.nrows();
        let moments = column_moments(rows);
        let std = Zip::from(&moments.variance)
            .and(&moments.mean)
            .map_collect(|&variance, &mean| {
                if variance.is_finite() && !is_constant_column(variance, mean, n) {
                    variance.sqrt()
                } else {
                    1.0
                }
            });
        let params = ScalerParams {
            mean: moments.mean,
            std,
            n_samples_seen: rows.nrows(),
        };

        info!(
            component = "scaler",
            event = "scaler.fit",
            n_samples = params.n_samples_seen,
            n_features = params.n_features(),
            fingerprint = %params.fingerprint()
        );

        Ok(&*self.params.insert(params))
    }

    pub fn transform_rows(&self, rows: ArrayView2<'_, f64>) -> Result<Array2<f64>, PrepError> {
        let params = self.fitted_for(rows.ncols())?;
        let mut out = rows.to_owned();
        for mut row in out.outer_iter_mut() {
            Zip::from(&mut row)
                .and(&params.mean)
                .and(&params.std)
                .for_each(|value, &mean, &std| *value = (*value - mean) / std);
        }
        Ok(out)
    }

    /// Standardizes every timestep of every window in place.
    pub fn scale_windows(&self, windows: &mut Array3<f64>) -> Result<(), PrepError> {
        let params = self.fitted_for(windows.len_of(Axis(2)))?;
        for mut window in windows.outer_iter_mut() {
            for mut step in window.outer_iter_mut() {
                Zip::from(&mut step)
                    .and(&params.mean)
                    .and(&params.std)
                    .for_each(|value, &mean, &std| *value = (*value - mean) / std);
            }
        }

        debug!(
            component = "scaler",
            event = "scaler.apply",
            windows = windows.len_of(Axis(0)),
            fingerprint = %params.fingerprint()
        );
        Ok(())
    }

    fn fitted_for(&self, n_features: usize) -> Result<&ScalerParams, PrepError> {
        let params = self.params.as_ref().ok_or(PrepError::ScalerNotFitted)?;
        if params.n_features() != n_features {
            return Err(PrepError::FeatureCountMismatch {
                expected: params.n_features(),
                actual: n_features,
            });
        }
        Ok(params)
    }
}

/// A variance this small is rounding noise relative to the column's
/// magnitude: `n * eps * var + (n * |mean| * eps)^2`.
fn is_constant_column(variance: f64, mean: f64, n: usize) -> bool {
    let n = n as f64;
    let upper_bound = n * f64::EPSILON * variance + (n * mean.abs() * f64::EPSILON).powi(2);
    variance <= upper_bound
}

/// Column-wise mean and population variance. Empty input yields zeros.
pub fn column_moments(rows: ArrayView2<'_, f64>) -> ColumnMoments {
    let n = rows.nrows();
    if n == 0 {
        return ColumnMoments {
            mean: Array1::zeros(rows.ncols()),
            variance: Array1::zeros(rows.ncols()),
        };
    }
    let mean = rows.sum_axis(Axis(0)) / n as f64;
    let centered = &rows - &mean;
    let variance = centered.mapv(|d| d * d).sum_axis(Axis(0)) / n as f64;
    ColumnMoments { mean, variance }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn constant_column_keeps_unit_std() {
        let rows = array![[1.0, 5.0], [3.0, 5.0]];
        let mut scaler = StandardScaler::new();
        let params = scaler.fit(rows.view()).expect("fit").clone();
        assert_eq!(params.mean.to_vec(), vec![2.0, 5.0]);
        assert_eq!(params.std.to_vec(), vec![1.0, 1.0]);

        let scaled = scaler.transform_rows(rows.view()).expect("transform");
        assert_eq!(scaled, array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn tiny_but_varying_column_is_scaled() {
        let rows = array![[1e-12], [3e-12]];
        let mut scaler = StandardScaler::new();
        let params = scaler.fit(rows.view()).expect("fit").clone();
        assert!((params.std[0] - 1e-12).abs() < 1e-24);

        let scaled = scaler.transform_rows(rows.view()).expect("transform");
        assert!((scaled[[0, 0]] + 1.0).abs() < 1e-9);
        assert!((scaled[[1, 0]] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rounding_noise_on_a_large_column_counts_as_constant() {
        let base: f64 = 1e8;
        let next = f64::from_bits(base.to_bits() + 1);
        let rows = array![[base], [next], [base], [next]];
        let mut scaler = StandardScaler::new();
        let params = scaler.fit(rows.view()).expect("fit").clone();
        assert_eq!(params.std[0], 1.0);
    }

    #[test]
    fn fingerprint_changes_with_statistics() {
        let mut a = StandardScaler::new();
        let mut b = StandardScaler::new();
        a.fit(array![[1.0], [2.0]].view()).expect("fit a");
        b.fit(array![[1.0], [4.0]].view()).expect("fit b");
        let fa = a.params().expect("fitted").fingerprint();
        let fb = b.params().expect("fitted").fingerprint();
        assert_eq!(fa.len(), 64);
        assert_ne!(fa, fb);
    }
}
