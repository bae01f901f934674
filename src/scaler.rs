//! Column-wise standardisation

use ndarray::{Array1, Array2, Axis};

/// Zero-mean, unit-variance scaler fitted per column
///
/// Columns with zero variance scale to zero instead of dividing by zero.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    means: Array1<f64>,
    stds: Array1<f64>,
}

impl StandardScaler {
    /// Learn per-column mean and population standard deviation
    pub fn fit(data: &Array2<f64>) -> Self {
        let n_features = data.ncols();
        if data.nrows() == 0 {
            return Self {
                means: Array1::zeros(n_features),
                stds: Array1::zeros(n_features),
            };
        }

        let means = data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(n_features));
        let stds = data.std_axis(Axis(0), 0.0);
        Self { means, stds }
    }

    /// Standardise `data` with the fitted parameters
    pub fn transform(&self, data: &Array2<f64>) -> Array2<f64> {
        let mut scaled = data.clone();
        for (mut column, (&mean, &std)) in scaled
            .axis_iter_mut(Axis(1))
            .zip(self.means.iter().zip(self.stds.iter()))
        {
            if std > f64::EPSILON * mean.abs().max(1.0) {
                column.mapv_inplace(|v| (v - mean) / std);
            } else {
                column.fill(0.0);
            }
        }
        scaled
    }

    /// Fit on `data` and return it standardised
    pub fn fit_transform(data: &Array2<f64>) -> (Self, Array2<f64>) {
        let scaler = Self::fit(data);
        let scaled = scaler.transform(data);
        (scaler, scaled)
    }

    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    pub fn stds(&self) -> &Array1<f64> {
        &self.stds
    }
}
