//! Per-device RSSI smoothing.
//!
//! Each tag id owns an independent one-dimensional Kalman filter, created on
//! the first reading and kept for the lifetime of the process. Filters are
//! keyed by the tag id *after* companion resolution, so a phone that rotates
//! its hardware address keeps a single filter.

use std::collections::HashMap;
use std::sync::Mutex;

/// One-dimensional Kalman filter with a constant-state model.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanFilter {
    /// Process noise (R).
    process_noise: f64,
    /// Measurement noise (Q).
    measurement_noise: f64,
    /// Current estimate; `None` until the first measurement.
    estimate: Option<f64>,
    /// Current estimate covariance.
    covariance: f64,
}

impl KalmanFilter {
    /// Create a filter that has not seen any measurement yet.
    #[must_use]
    pub const fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            estimate: None,
            covariance: 0.0,
        }
    }

    /// Feed a measurement and return the new estimate.
    pub fn filter(&mut self, measurement: f64) -> f64 {
        let Some(previous) = self.estimate else {
            self.estimate = Some(measurement);
            self.covariance = self.measurement_noise;
            return measurement;
        };

        let predicted_covariance = self.covariance + self.process_noise;
        let gain = predicted_covariance / (predicted_covariance + self.measurement_noise);
        let estimate = gain.mul_add(measurement - previous, previous);

        self.estimate = Some(estimate);
        self.covariance = predicted_covariance - gain * predicted_covariance;
        estimate
    }

    /// Latest estimate, if any.
    #[must_use]
    pub const fn estimate(&self) -> Option<f64> {
        self.estimate
    }
}

/// Registry of per-tag filters.
#[derive(Debug)]
pub struct SignalFilter {
    process_noise: f64,
    measurement_noise: f64,
    filters: Mutex<HashMap<String, KalmanFilter>>,
}

impl SignalFilter {
    /// Create an empty registry; every new tag gets a filter with these parameters.
    #[must_use]
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            process_noise,
            measurement_noise,
            filters: Mutex::new(HashMap::new()),
        }
    }

    /// Smooth `rssi` for the tag `id`.
    pub fn filter(&self, id: &str, rssi: f64) -> f64 {
        let mut filters = self
            .filters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        filters
            .entry(id.to_string())
            .or_insert_with(|| KalmanFilter::new(self.process_noise, self.measurement_noise))
            .filter(rssi)
    }

    /// Number of tags with filter state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters
            .lock()
            .map_or(0, |filters| filters.len())
    }

    /// Whether no tag has been filtered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
