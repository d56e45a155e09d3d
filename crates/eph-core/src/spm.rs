//! Saliency Polar Map: egocentric log-polar encoding of nearby agents and obstacles.
//!
//! Each percept is placed at `(rho, bearing)` where `rho = ln(max(1, d / contact_radius))` is
//! zero at contact. A Gaussian kernel over `(rho, bearing)` splats it into a fixed grid
//! with three channels: occupancy count, proximity saliency and collision risk. Saliency
//! and risk keep the strongest contribution per cell, so one salient neighbor is never
//! diluted by weaker ones.

use crate::WorldStateError;
use crate::geometry::COINCIDENT_EPS;
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};

/// Number of SPM channels.
pub const CHANNELS: usize = 3;

/// Kernel exponents beyond this contribute nothing measurable and are skipped.
const KERNEL_CUTOFF: f64 = 36.0;

/// SPM channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Occupancy = 0,
    Saliency = 1,
    Risk = 2,
}

/// Inclusive `(min, max)` range for an aggregation sharpness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SharpnessBounds {
    pub min: f64,
    pub max: f64,
}

impl SharpnessBounds {
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Linear interpolation; `t` is clamped to `[0, 1]`.
    #[must_use]
    pub fn lerp(&self, t: f64) -> f64 {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        self.min + (self.max - self.min) * t
    }
}

/// Sharpness pair used by a single encode call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sharpness {
    /// `beta_r`: falloff of proximity saliency with log distance.
    pub radial: f64,
    /// `beta_nu`: gain on inverse time-to-contact for collision risk.
    pub risk: f64,
}

/// User-facing grid configuration, validated into [`SpmGridSpec`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpmConfig {
    /// Number of radial (log-distance) bins.
    pub n_rho: usize,
    /// Number of angular bins spanning the field of view.
    pub n_theta: usize,
    /// Full field of view in degrees, centered on the heading.
    pub fov_degrees: f64,
    /// Percepts at or beyond this distance are ignored.
    pub sensing_range: f64,
    /// Radius used to lay out the radial bins (`rho_max = ln(range / reference)`).
    pub reference_radius: f64,
    /// Gaussian spread of the splatting kernel in `(rho, radians)` units.
    pub sigma: f64,
    /// Occupancy count that saturates a cell.
    pub occupancy_normalizer: f64,
    /// Minimum kernel weight for a percept to count as present in a cell.
    pub presence_threshold: f64,
    pub radial_sharpness: SharpnessBounds,
    pub risk_sharpness: SharpnessBounds,
}

impl Default for SpmConfig {
    fn default() -> Self {
        Self {
            n_rho: 16,
            n_theta: 16,
            fov_degrees: 210.0,
            sensing_range: 7.5,
            reference_radius: 1.0,
            sigma: 0.25,
            occupancy_normalizer: 5.0,
            presence_threshold: 0.1,
            radial_sharpness: SharpnessBounds::new(2.0, 8.0),
            risk_sharpness: SharpnessBounds::new(0.5, 2.0),
        }
    }
}

/// Immutable, validated grid layout shared read-only by every agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpmGridSpec {
    n_rho: usize,
    n_theta: usize,
    fov_half: f64,
    sensing_range: f64,
    rho_max: f64,
    rho_centers: Vec<f64>,
    theta_centers: Vec<f64>,
    sigma: f64,
    occupancy_normalizer: f64,
    presence_threshold: f64,
    radial_sharpness: SharpnessBounds,
    risk_sharpness: SharpnessBounds,
}

fn check_bounds(bounds: &SharpnessBounds) -> bool {
    bounds.min > 0.0 && bounds.min <= bounds.max && bounds.max.is_finite()
}

impl SpmGridSpec {
    pub fn new(config: &SpmConfig) -> Result<Self, WorldStateError> {
        if config.n_rho == 0 || config.n_theta == 0 {
            return Err(WorldStateError::InvalidConfig(
                "SPM bin counts must be non-zero",
            ));
        }
        if !(config.fov_degrees > 0.0 && config.fov_degrees <= 360.0) {
            return Err(WorldStateError::InvalidConfig(
                "fov_degrees must lie in (0, 360]",
            ));
        }
        if !(config.reference_radius > 0.0) {
            return Err(WorldStateError::InvalidConfig(
                "reference_radius must be positive",
            ));
        }
        if !(config.sensing_range > config.reference_radius) || !config.sensing_range.is_finite() {
            return Err(WorldStateError::InvalidConfig(
                "sensing_range must be finite and exceed reference_radius",
            ));
        }
        if !(config.sigma > 0.0) || !(config.occupancy_normalizer > 0.0) {
            return Err(WorldStateError::InvalidConfig(
                "sigma and occupancy_normalizer must be positive",
            ));
        }
        if !(0.0..1.0).contains(&config.presence_threshold) {
            return Err(WorldStateError::InvalidConfig(
                "presence_threshold must lie in [0, 1)",
            ));
        }
        if !check_bounds(&config.radial_sharpness) || !check_bounds(&config.risk_sharpness) {
            return Err(WorldStateError::InvalidConfig(
                "sharpness bounds need 0 < min <= max",
            ));
        }

        let fov_half = config.fov_degrees.to_radians() * 0.5;
        let rho_max = (config.sensing_range / config.reference_radius).ln();
        let rho_step = rho_max / config.n_rho as f64;
        let theta_step = 2.0 * fov_half / config.n_theta as f64;
        Ok(Self {
            n_rho: config.n_rho,
            n_theta: config.n_theta,
            fov_half,
            sensing_range: config.sensing_range,
            rho_max,
            rho_centers: (0..config.n_rho)
                .map(|i| (i as f64 + 0.5) * rho_step)
                .collect(),
            theta_centers: (0..config.n_theta)
                .map(|j| -fov_half + (j as f64 + 0.5) * theta_step)
                .collect(),
            sigma: config.sigma,
            occupancy_normalizer: config.occupancy_normalizer,
            presence_threshold: config.presence_threshold,
            radial_sharpness: config.radial_sharpness,
            risk_sharpness: config.risk_sharpness,
        })
    }

    #[must_use]
    pub const fn n_rho(&self) -> usize {
        self.n_rho
    }

    #[must_use]
    pub const fn n_theta(&self) -> usize {
        self.n_theta
    }

    #[must_use]
    pub const fn fov_half(&self) -> f64 {
        self.fov_half
    }

    #[must_use]
    pub const fn sensing_range(&self) -> f64 {
        self.sensing_range
    }

    #[must_use]
    pub fn rho_centers(&self) -> &[f64] {
        &self.rho_centers
    }

    #[must_use]
    pub fn theta_centers(&self) -> &[f64] {
        &self.theta_centers
    }

    #[must_use]
    pub const fn sigma(&self) -> f64 {
        self.sigma
    }

    #[must_use]
    pub const fn radial_sharpness(&self) -> SharpnessBounds {
        self.radial_sharpness
    }

    #[must_use]
    pub const fn risk_sharpness(&self) -> SharpnessBounds {
        self.risk_sharpness
    }

    /// Log distance of an object `distance` away that touches the observer at `contact_radius`.
    #[must_use]
    pub fn rho(distance: f64, contact_radius: f64) -> f64 {
        (distance / contact_radius).max(1.0).ln()
    }

    /// Radial position in bin units; bin centers map to integers.
    #[must_use]
    pub fn continuous_rho_bin(&self, rho: f64) -> f64 {
        let step = self.rho_max / self.n_rho as f64;
        (rho / step - 0.5).clamp(0.0, (self.n_rho - 1) as f64)
    }

    /// Radial bin whose interval contains `rho`.
    #[must_use]
    pub fn rho_bin_of(&self, rho: f64) -> usize {
        let step = self.rho_max / self.n_rho as f64;
        ((rho / step).floor().max(0.0) as usize).min(self.n_rho - 1)
    }

    /// Angular bin whose interval contains `bearing`.
    #[must_use]
    pub fn theta_bin_of(&self, bearing: f64) -> usize {
        let step = 2.0 * self.fov_half / self.n_theta as f64;
        (((bearing + self.fov_half) / step).floor().max(0.0) as usize).min(self.n_theta - 1)
    }

    /// Map a normalized precision in `[0, 1]` onto the configured sharpness bounds.
    #[must_use]
    pub fn sharpness_for(&self, normalized_precision: f64) -> Sharpness {
        Sharpness {
            radial: self.radial_sharpness.lerp(normalized_precision),
            risk: self.risk_sharpness.lerp(normalized_precision),
        }
    }
}

/// Dense `[n_rho × n_theta × 3]` tensor, row-major with channels innermost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpmTensor<S> {
    n_rho: usize,
    n_theta: usize,
    data: Vec<S>,
}

/// Plain floating-point SPM.
pub type Spm = SpmTensor<f64>;

impl<S: Scalar> SpmTensor<S> {
    #[must_use]
    pub fn zeros(n_rho: usize, n_theta: usize) -> Self {
        Self {
            n_rho,
            n_theta,
            data: vec![S::zero(); n_rho * n_theta * CHANNELS],
        }
    }

    #[must_use]
    pub fn for_spec(spec: &SpmGridSpec) -> Self {
        Self::zeros(spec.n_rho, spec.n_theta)
    }

    /// Build from raw channel-innermost data.
    pub fn from_vec(n_rho: usize, n_theta: usize, data: Vec<S>) -> Option<Self> {
        (data.len() == n_rho * n_theta * CHANNELS).then_some(Self {
            n_rho,
            n_theta,
            data,
        })
    }

    #[must_use]
    pub const fn dims(&self) -> (usize, usize) {
        (self.n_rho, self.n_theta)
    }

    #[inline]
    fn offset(&self, rho: usize, theta: usize, channel: Channel) -> usize {
        (rho * self.n_theta + theta) * CHANNELS + channel as usize
    }

    #[must_use]
    pub fn get(&self, rho: usize, theta: usize, channel: Channel) -> S {
        self.data[self.offset(rho, theta, channel)]
    }

    pub fn set(&mut self, rho: usize, theta: usize, channel: Channel, value: S) {
        let offset = self.offset(rho, theta, channel);
        self.data[offset] = value;
    }

    #[must_use]
    pub fn as_slice(&self) -> &[S] {
        &self.data
    }

    /// Drop derivative information.
    #[must_use]
    pub fn values(&self) -> Spm {
        SpmTensor {
            n_rho: self.n_rho,
            n_theta: self.n_theta,
            data: self.data.iter().map(|v| v.value()).collect(),
        }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

impl Spm {
    /// Cell holding the largest value of `channel`, `None` when the channel is all zero.
    #[must_use]
    pub fn argmax(&self, channel: Channel) -> Option<(usize, usize)> {
        let mut best: Option<((usize, usize), f64)> = None;
        for rho in 0..self.n_rho {
            for theta in 0..self.n_theta {
                let v = self.get(rho, theta, channel);
                if v > 0.0 && best.is_none_or(|(_, b)| v > b) {
                    best = Some(((rho, theta), v));
                }
            }
        }
        best.map(|(cell, _)| cell)
    }

    #[must_use]
    pub fn channel_max(&self, channel: Channel) -> f64 {
        self.data
            .iter()
            .skip(channel as usize)
            .step_by(CHANNELS)
            .fold(0.0, |acc, &v| acc.max(v))
    }
}

/// One sensed object in the egocentric frame of the observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percept<S> {
    /// Offset along the observer's heading.
    pub forward: S,
    /// Offset to the observer's right.
    pub right: S,
    /// Relative velocity along the heading.
    pub v_forward: S,
    /// Relative velocity to the right.
    pub v_right: S,
    /// Center distance at which the object touches the observer.
    pub contact_radius: f64,
}

impl<S: Scalar> Percept<S> {
    #[must_use]
    pub const fn new(forward: S, right: S, v_forward: S, v_right: S, contact_radius: f64) -> Self {
        Self {
            forward,
            right,
            v_forward,
            v_right,
            contact_radius,
        }
    }
}

/// Encode percepts into an SPM.
///
/// Distances are measured in multiples of each percept's contact radius, so `rho` is zero
/// when the object touches the observer. Percepts beyond the sensing range or outside the field of
/// view contribute nothing, so an empty input yields an all-zero tensor.
#[must_use]
pub fn encode<S: Scalar>(
    percepts: &[Percept<S>],
    spec: &SpmGridSpec,
    sharpness: Sharpness,
) -> SpmTensor<S> {
    let mut spm = SpmTensor::for_spec(spec);
    if percepts.is_empty() {
        return spm;
    }
    let cells = spec.n_rho * spec.n_theta;
    let mut counts = vec![0u32; cells];
    let inv_two_sigma_sq = 1.0 / (2.0 * spec.sigma * spec.sigma);

    for percept in percepts {
        let distance = (percept.forward * percept.forward + percept.right * percept.right).sqrt();
        if distance.value() >= spec.sensing_range {
            continue;
        }
        let bearing = if distance.value() < COINCIDENT_EPS {
            S::zero()
        } else {
            percept.right.atan2(percept.forward)
        };
        if bearing.value().abs() > spec.fov_half {
            continue;
        }

        let rho = (distance / percept.contact_radius).max(S::constant(1.0)).ln();
        let saliency = (rho * -sharpness.radial).exp();
        let closing = if distance.value() < COINCIDENT_EPS {
            S::zero()
        } else {
            -(percept.forward * percept.v_forward + percept.right * percept.v_right) / distance
        }
        .max(S::zero());
        let ttc_inv = closing / rho.exp();
        let risk = ((ttc_inv * sharpness.risk).exp() - 1.0).min(S::constant(1.0));

        for (i, &rho_c) in spec.rho_centers.iter().enumerate() {
            let dr = rho - rho_c;
            let dr_sq = dr * dr;
            if dr_sq.value() * inv_two_sigma_sq > KERNEL_CUTOFF {
                continue;
            }
            for (j, &theta_c) in spec.theta_centers.iter().enumerate() {
                let dt = bearing - theta_c;
                let exponent = (dr_sq + dt * dt) * inv_two_sigma_sq;
                if exponent.value() > KERNEL_CUTOFF {
                    continue;
                }
                let weight = (-exponent).exp();
                if weight.value() > spec.presence_threshold {
                    counts[i * spec.n_theta + j] += 1;
                }
                let cell_saliency = spm.get(i, j, Channel::Saliency).max(weight * saliency);
                spm.set(i, j, Channel::Saliency, cell_saliency);
                let cell_risk = spm.get(i, j, Channel::Risk).max(weight * risk);
                spm.set(i, j, Channel::Risk, cell_risk);
            }
        }
    }

    for (cell, &count) in counts.iter().enumerate() {
        if count > 0 {
            let occupancy = (f64::from(count) / spec.occupancy_normalizer).min(1.0);
            spm.set(
                cell / spec.n_theta,
                cell % spec.n_theta,
                Channel::Occupancy,
                S::constant(occupancy),
            );
        }
    }
    spm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::Dual;

    fn spec() -> SpmGridSpec {
        SpmGridSpec::new(&SpmConfig::default()).expect("spec")
    }

    fn unit_sharpness() -> Sharpness {
        Sharpness {
            radial: 5.0,
            risk: 1.0,
        }
    }

    fn at(distance: f64, bearing: f64) -> Percept<f64> {
        Percept::new(distance * bearing.cos(), distance * bearing.sin(), 0.0, 0.0, 1.0)
    }

    #[test]
    fn rejects_invalid_grids() {
        let zero_bins = SpmConfig {
            n_rho: 0,
            ..SpmConfig::default()
        };
        assert!(SpmGridSpec::new(&zero_bins).is_err());
        let zero_range = SpmConfig {
            sensing_range: 0.0,
            ..SpmConfig::default()
        };
        assert!(SpmGridSpec::new(&zero_range).is_err());
        let inverted = SpmConfig {
            risk_sharpness: SharpnessBounds::new(2.0, 1.0),
            ..SpmConfig::default()
        };
        assert!(SpmGridSpec::new(&inverted).is_err());
    }

    #[test]
    fn empty_input_is_all_zero() {
        let spec = spec();
        let spm = encode::<f64>(&[], &spec, unit_sharpness());
        assert_eq!(spm.dims(), (16, 16));
        assert!(spm.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn out_of_range_and_out_of_view_are_ignored() {
        let spec = spec();
        let behind = at(2.0, std::f64::consts::PI);
        let far = at(7.5, 0.0);
        let spm = encode(&[behind, far], &spec, unit_sharpness());
        assert!(spm.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn channels_stay_bounded() {
        let spec = spec();
        let mut percepts = Vec::new();
        for k in 0..40 {
            let bearing = -1.5 + k as f64 * 0.075;
            let mut p = at(0.2 + k as f64 * 0.15, bearing);
            p.v_forward = -30.0;
            percepts.push(p);
        }
        let spm = encode(&percepts, &spec, Sharpness {
            radial: 8.0,
            risk: 2.0,
        });
        assert!(spm.as_slice().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(spm.channel_max(Channel::Risk) > 0.9);
    }

    #[test]
    fn single_neighbor_peaks_in_its_analytic_bin() {
        let spec = spec();
        let rho_target = spec.rho_centers()[5];
        let theta_target = spec.theta_centers()[11];
        let distance = rho_target.exp();
        let spm = encode(&[at(distance, theta_target)], &spec, unit_sharpness());
        let expected = (
            spec.rho_bin_of(SpmGridSpec::rho(distance, 1.0)),
            spec.theta_bin_of(theta_target),
        );
        assert_eq!(expected, (5, 11));
        assert_eq!(spm.argmax(Channel::Saliency), Some(expected));
    }

    #[test]
    fn approaching_obstacle_ahead_carries_risk() {
        let spec = spec();
        // point two units ahead, combined radius one, closing at unit speed
        let percept = Percept::new(2.0, 0.0, -1.0, 0.0, 1.0);
        let spm = encode(&[percept], &spec, unit_sharpness());
        let (rho_bin, theta_bin) = spm.argmax(Channel::Risk).expect("risk present");
        assert_eq!(rho_bin, spec.rho_bin_of(std::f64::consts::LN_2));
        let bearing = spec.theta_centers()[theta_bin];
        assert!(bearing.abs() < 0.25, "risk should sit in a forward bin");
        let expected_risk = (0.5f64).exp() - 1.0;
        assert!(spm.channel_max(Channel::Risk) <= expected_risk + 1e-12);
        assert!(spm.channel_max(Channel::Risk) > 0.5 * expected_risk);
    }

    #[test]
    fn max_aggregation_ignores_weaker_duplicates() {
        let spec = spec();
        let strong = at(1.5, 0.3);
        let weak = at(4.0, 0.3);
        let alone = encode(&[strong], &spec, unit_sharpness());
        let both = encode(&[strong, weak, weak], &spec, unit_sharpness());
        let cell = alone.argmax(Channel::Saliency).expect("peak");
        assert_eq!(
            alone.get(cell.0, cell.1, Channel::Saliency),
            both.get(cell.0, cell.1, Channel::Saliency)
        );
    }

    #[test]
    fn dual_encoding_matches_plain_values() {
        let spec = spec();
        let plain = encode(&[at(2.5, -0.4)], &spec, unit_sharpness());
        let p = at(2.5, -0.4);
        let dual = Percept::new(
            Dual::variable(p.forward, 0),
            Dual::variable(p.right, 1),
            Dual::constant(0.0),
            Dual::constant(0.0),
            p.contact_radius,
        );
        let encoded = encode(&[dual], &spec, unit_sharpness());
        assert_eq!(encoded.values(), plain);
        assert!(encoded.is_finite());
    }

    #[test]
    fn contact_radius_sets_the_zero_of_rho() {
        let spec = spec();
        // obstacle contact sits at one agent radius, not at the two-body distance
        let obstacle = |distance: f64| Percept::new(distance, 0.0, 0.0, 0.0, 0.5);
        let near = encode(&[obstacle(0.55)], &spec, unit_sharpness());
        let far = encode(&[obstacle(0.95)], &spec, unit_sharpness());
        assert!(
            near.channel_max(Channel::Saliency) > far.channel_max(Channel::Saliency) + 0.1,
            "{} vs {}",
            near.channel_max(Channel::Saliency),
            far.channel_max(Channel::Saliency)
        );
        assert_ne!(near.argmax(Channel::Saliency), far.argmax(Channel::Saliency));

        let as_neighbor = |distance: f64| Percept::new(distance, 0.0, 0.0, 0.0, 1.0);
        let clipped = encode(&[as_neighbor(0.55), as_neighbor(0.95)], &spec, unit_sharpness());
        assert_eq!(
            encode(&[as_neighbor(0.55)], &spec, unit_sharpness()),
            encode(&[as_neighbor(0.95)], &spec, unit_sharpness())
        );
        assert_eq!(clipped.argmax(Channel::Saliency).map(|(rho, _)| rho), Some(0));
    }
}
