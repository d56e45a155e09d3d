//! Precision ("Haze") field: distance-zoned attention weights.
//!
//! Haze blends from `haze_critical` near the agent to `haze_peripheral` beyond the
//! critical radial index through a logistic ramp, and precision is `1 / (haze + ε)`.
//! The ramp keeps precision smooth in the radial coordinate, so the controller's gradient
//! never sees a jump when the nearest neighbor crosses the zone boundary.

use crate::WorldStateError;
use crate::spm::{Sharpness, SpmGridSpec};
use serde::{Deserialize, Serialize};

#[inline]
fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Precision weight for a (possibly fractional) radial bin.
#[must_use]
pub fn precision(
    bin: f64,
    zone_threshold: f64,
    haze_critical: f64,
    haze_peripheral: f64,
    blend_width: f64,
    epsilon: f64,
) -> f64 {
    let blend = logistic((bin - (zone_threshold + 0.5)) / blend_width);
    let haze = haze_critical + (haze_peripheral - haze_critical) * blend;
    1.0 / (haze + epsilon)
}

/// Stuck detection and frontal attenuation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelfHazeConfig {
    pub enabled: bool,
    /// Speed below which a tick counts as stuck.
    pub stuck_speed: f64,
    /// Consecutive stuck ticks tolerated before self-haze starts rising.
    pub stuck_patience: u32,
    /// Self-haze increase per tick while stuck beyond patience.
    pub rise_rate: f64,
    /// Self-haze decrease per tick otherwise.
    pub decay_rate: f64,
    /// Lower bound on the frontal attenuation factor so precision stays positive.
    pub min_attenuation: f64,
}

impl Default for SelfHazeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stuck_speed: 0.2,
            stuck_patience: 50,
            rise_rate: 0.05,
            decay_rate: 0.01,
            min_attenuation: 0.01,
        }
    }
}

/// Zoning parameters for the precision field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HazeConfig {
    /// Last radial bin of the critical zone; the blend is centered half a bin further out.
    pub critical_index: f64,
    pub haze_critical: f64,
    pub haze_peripheral: f64,
    /// Width of the logistic blend in bins.
    pub blend_width: f64,
    pub epsilon: f64,
    pub self_haze: SelfHazeConfig,
}

impl Default for HazeConfig {
    fn default() -> Self {
        Self {
            critical_index: 6.0,
            haze_critical: 0.0,
            haze_peripheral: 0.5,
            blend_width: 1.0,
            epsilon: 0.1,
            self_haze: SelfHazeConfig::default(),
        }
    }
}

/// Validated precision field bound to a grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HazeField {
    config: HazeConfig,
    n_rho: usize,
    n_theta: usize,
    radial: Vec<f64>,
}

impl HazeField {
    pub fn new(config: &HazeConfig, spec: &SpmGridSpec) -> Result<Self, WorldStateError> {
        if !(config.haze_critical >= 0.0) || !(config.haze_peripheral >= config.haze_critical) {
            return Err(WorldStateError::InvalidConfig(
                "haze levels need 0 <= haze_critical <= haze_peripheral",
            ));
        }
        if !config.haze_peripheral.is_finite() || !config.critical_index.is_finite() {
            return Err(WorldStateError::InvalidConfig("haze parameters must be finite"));
        }
        if !(config.blend_width > 0.0) || !(config.epsilon > 0.0) {
            return Err(WorldStateError::InvalidConfig(
                "blend_width and epsilon must be positive",
            ));
        }
        let self_haze = &config.self_haze;
        if !(self_haze.stuck_speed >= 0.0)
            || !(self_haze.rise_rate >= 0.0)
            || !(self_haze.decay_rate >= 0.0)
            || !(self_haze.min_attenuation > 0.0 && self_haze.min_attenuation <= 1.0)
        {
            return Err(WorldStateError::InvalidConfig(
                "self-haze rates must be non-negative and min_attenuation in (0, 1]",
            ));
        }
        let mut field = Self {
            config: config.clone(),
            n_rho: spec.n_rho(),
            n_theta: spec.n_theta(),
            radial: Vec::with_capacity(spec.n_rho()),
        };
        field.radial = (0..spec.n_rho())
            .map(|bin| field.precision_at(bin as f64))
            .collect();
        Ok(field)
    }

    #[must_use]
    pub fn config(&self) -> &HazeConfig {
        &self.config
    }

    /// Precision at a fractional radial bin.
    #[must_use]
    pub fn precision_at(&self, bin: f64) -> f64 {
        precision(
            bin,
            self.config.critical_index,
            self.config.haze_critical,
            self.config.haze_peripheral,
            self.config.blend_width,
            self.config.epsilon,
        )
    }

    /// Precision per radial bin.
    #[must_use]
    pub fn radial(&self) -> &[f64] {
        &self.radial
    }

    /// Extreme precision values the field can approach: `(peripheral, critical)`.
    #[must_use]
    pub fn precision_range(&self) -> (f64, f64) {
        (
            1.0 / (self.config.haze_peripheral + self.config.epsilon),
            1.0 / (self.config.haze_critical + self.config.epsilon),
        )
    }

    /// Rescale a precision value into `[0, 1]` against [`Self::precision_range`].
    #[must_use]
    pub fn normalize(&self, precision: f64) -> f64 {
        let (low, high) = self.precision_range();
        if high - low <= f64::EPSILON {
            return 1.0;
        }
        ((precision - low) / (high - low)).clamp(0.0, 1.0)
    }

    /// Scalar precision estimate from the nearest sensed object's log distance.
    ///
    /// Nothing sensed evaluates the outermost bin.
    #[must_use]
    pub fn scalar_precision(&self, spec: &SpmGridSpec, nearest_rho: Option<f64>) -> f64 {
        let bin = match nearest_rho {
            Some(rho) => spec.continuous_rho_bin(rho),
            None => (self.n_rho - 1) as f64,
        };
        self.precision_at(bin)
    }

    /// Sharpness pair derived from a scalar precision estimate.
    #[must_use]
    pub fn sharpness(&self, spec: &SpmGridSpec, scalar_precision: f64) -> Sharpness {
        spec.sharpness_for(self.normalize(scalar_precision))
    }

    /// Radial precision broadcast across every angular bin.
    #[must_use]
    pub fn precision_map(&self) -> PrecisionMap {
        let mut weights = Vec::with_capacity(self.n_rho * self.n_theta);
        for &w in &self.radial {
            weights.extend(std::iter::repeat_n(w, self.n_theta));
        }
        PrecisionMap {
            n_rho: self.n_rho,
            n_theta: self.n_theta,
            weights,
            angular: false,
        }
    }
}

/// Per-cell precision weights consumed by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionMap {
    n_rho: usize,
    n_theta: usize,
    weights: Vec<f64>,
    angular: bool,
}

impl PrecisionMap {
    #[must_use]
    pub fn get(&self, rho: usize, theta: usize) -> f64 {
        self.weights[rho * self.n_theta + theta]
    }

    #[must_use]
    pub const fn dims(&self) -> (usize, usize) {
        (self.n_rho, self.n_theta)
    }

    /// True once angular modulation was applied.
    #[must_use]
    pub const fn is_angular(&self) -> bool {
        self.angular
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.weights
    }

    /// Angular bins within `half_width` bins of the forward direction.
    fn frontal_bins(n_theta: usize, half_width: usize) -> impl Iterator<Item = usize> {
        let center = n_theta as f64 / 2.0;
        let reach = half_width as f64 + 0.5;
        (0..n_theta).filter(move |&j| (j as f64 + 0.5 - center).abs() <= reach)
    }

    /// Multiply the frontal sector by `factor`.
    pub fn attenuate_front(&mut self, half_width: usize, factor: f64) {
        let bins: Vec<usize> = Self::frontal_bins(self.n_theta, half_width).collect();
        for rho in 0..self.n_rho {
            for &theta in &bins {
                self.weights[rho * self.n_theta + theta] *= factor;
            }
        }
        self.angular = true;
    }
}

/// Per-agent deadlock detector driving frontal self-haze.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SelfHaze {
    stuck_ticks: u32,
    level: f64,
}

impl SelfHaze {
    #[must_use]
    pub const fn level(&self) -> f64 {
        self.level
    }

    #[must_use]
    pub const fn stuck_ticks(&self) -> u32 {
        self.stuck_ticks
    }

    /// Advance the detector with the agent's speed after a tick.
    pub fn update(&mut self, speed: f64, config: &SelfHazeConfig) {
        if !config.enabled {
            *self = Self::default();
            return;
        }
        if speed < config.stuck_speed {
            self.stuck_ticks = self.stuck_ticks.saturating_add(1);
        } else {
            self.stuck_ticks = self.stuck_ticks.saturating_sub(1);
        }
        if self.stuck_ticks > config.stuck_patience {
            self.level = (self.level + config.rise_rate).min(1.0);
        } else {
            self.level = (self.level - config.decay_rate).max(0.0);
        }
    }

    /// Attenuate the frontal sector (`±n_theta / 6` bins) by `(1 - level)²`.
    pub fn apply(&self, map: &mut PrecisionMap, config: &SelfHazeConfig) {
        if !config.enabled || self.level <= 0.0 {
            return;
        }
        let factor = ((1.0 - self.level) * (1.0 - self.level)).max(config.min_attenuation);
        map.attenuate_front(map.n_theta / 6, factor);
    }
}
