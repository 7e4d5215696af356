//! One-dimensional recursive estimator
//!
//! Constant-value model: every update grows the uncertainty by the process
//! noise `q`, then blends the measurement in with gain
//! `uncertainty / (uncertainty + r)`.

use crate::config::NoiseTuning;

/// Initial estimate uncertainty
const INITIAL_UNCERTAINTY: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ScalarKalman {
    q: f64,
    r: f64,
    estimate: f64,
    uncertainty: f64,
    initialized: bool,
}

impl ScalarKalman {
    pub fn new(tuning: NoiseTuning) -> Self {
        Self {
            q: tuning.q,
            r: tuning.r,
            estimate: 0.0,
            uncertainty: INITIAL_UNCERTAINTY,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn uncertainty(&self) -> f64 {
        self.uncertainty
    }

    /// Seed the estimate with a first measurement
    pub fn seed(&mut self, measurement: f64) -> f64 {
        self.estimate = measurement;
        self.uncertainty = INITIAL_UNCERTAINTY;
        self.initialized = true;
        self.estimate
    }

    /// Full filter step for a measurement
    pub fn update(&mut self, measurement: f64) -> f64 {
        if !self.initialized {
            return self.seed(measurement);
        }
        self.update_residual(measurement - self.estimate)
    }

    /// Full filter step given the innovation `measurement - estimate`.
    ///
    /// Callers working on a wrapped domain (angles) pass the wrapped residual.
    pub fn update_residual(&mut self, residual: f64) -> f64 {
        self.uncertainty += self.q;
        let gain = self.uncertainty / (self.uncertainty + self.r);
        self.estimate += gain * residual;
        self.uncertainty *= 1.0 - gain;
        self.estimate
    }

    /// Move the estimate a fixed fraction of `residual` without touching the uncertainty
    pub fn nudge(&mut self, residual: f64, fraction: f64) -> f64 {
        self.estimate += fraction * residual;
        self.estimate
    }

    /// Overwrite the estimate, e.g. after wrapping an angle back into range
    pub fn set_estimate(&mut self, estimate: f64) {
        self.estimate = estimate;
    }

    pub fn reset(&mut self) {
        self.estimate = 0.0;
        self.uncertainty = INITIAL_UNCERTAINTY;
        self.initialized = false;
    }
}
