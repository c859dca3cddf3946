//! Protocol overhead estimation from declared vs observed response sizes

use crate::models::ProtocolOverhead;
use crate::stats;

/// Ratios at or outside these bounds are treated as measurement noise
pub const MIN_PLAUSIBLE_RATIO: f64 = 1.01;
pub const MAX_PLAUSIBLE_RATIO: f64 = 1.20;

pub const DEFAULT_REQUIRED_SAMPLES: usize = 3;
const MAX_REQUIRED_SAMPLES: usize = 5;
/// Sample count at which the single highest and lowest ratios are dropped
const TRIM_AT: usize = 5;

/// Per-run accumulator. Locks the factor once enough plausible ratios arrived;
/// later observations are ignored.
#[derive(Debug, Clone)]
pub struct ProtocolOverheadEstimator {
    default_factor: f64,
    required_samples: usize,
    samples: Vec<f64>,
    detected: Option<f64>,
}

impl ProtocolOverheadEstimator {
    pub fn new(default_factor: f64) -> Self {
        Self {
            default_factor,
            required_samples: DEFAULT_REQUIRED_SAMPLES,
            samples: Vec::with_capacity(MAX_REQUIRED_SAMPLES),
            detected: None,
        }
    }

    /// Number of accepted ratios needed before locking, clamped to 3..=5
    pub fn with_required_samples(mut self, required: usize) -> Self {
        self.required_samples = required.clamp(DEFAULT_REQUIRED_SAMPLES, MAX_REQUIRED_SAMPLES);
        self
    }

    pub fn is_detected(&self) -> bool {
        self.detected.is_some()
    }

    pub fn accepted_samples(&self) -> usize {
        self.samples.len()
    }

    /// Feed one completed response. Returns true when this observation locked
    /// the factor in.
    pub fn observe(&mut self, declared_bytes: u64, observed_bytes: u64) -> bool {
        if self.detected.is_some() || declared_bytes == 0 {
            return false;
        }

        let ratio = observed_bytes as f64 / declared_bytes as f64;
        if !(ratio > MIN_PLAUSIBLE_RATIO && ratio < MAX_PLAUSIBLE_RATIO) {
            return false;
        }

        self.samples.push(ratio);
        if self.samples.len() < self.required_samples {
            return false;
        }

        let estimate = if self.samples.len() >= TRIM_AT {
            let mut sorted = self.samples.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            stats::mean(&sorted[1..sorted.len() - 1])
        } else {
            stats::mean(&self.samples)
        };

        match estimate {
            Some(factor) => {
                self.detected = Some(factor.clamp(MIN_PLAUSIBLE_RATIO, MAX_PLAUSIBLE_RATIO));
                true
            }
            None => false,
        }
    }

    /// Detected factor, or the configured default when nothing was detected
    pub fn factor(&self) -> f64 {
        self.detected.unwrap_or(self.default_factor)
    }

    pub fn report(&self) -> ProtocolOverhead {
        ProtocolOverhead::new(self.is_detected(), self.factor())
    }
}
