//! Second-order agent dynamics with quadratic drag and heading lag.
//!
//! `m·dv/dt = F − c·|v|·v`, `dp/dt = v`, `dθ/dt = k·wrap(atan2(v) − θ)`; the heading is
//! frozen below `min_speed` where the velocity bearing is undefined. Integrated with one
//! fixed RK4 step per tick.

use crate::WorldStateError;
use crate::geometry::{Vec2, wrap_angle};
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DynamicsConfig {
    /// Tick duration in seconds.
    pub dt: f64,
    pub mass: f64,
    /// Quadratic drag coefficient `c`.
    pub drag: f64,
    /// Heading alignment gain `k_align` (1/s).
    pub heading_gain: f64,
    /// Speed below which the heading holds still.
    pub min_speed: f64,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            dt: 0.1,
            mass: 1.0,
            drag: 0.5,
            heading_gain: 4.0,
            min_speed: 1e-3,
        }
    }
}

impl DynamicsConfig {
    pub fn validate(&self) -> Result<(), WorldStateError> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(WorldStateError::InvalidConfig("dt must be positive"));
        }
        if !(self.mass > 0.0) || !self.mass.is_finite() {
            return Err(WorldStateError::InvalidConfig("mass must be positive"));
        }
        if !(self.drag >= 0.0) || !(self.heading_gain >= 0.0) || !(self.min_speed >= 0.0) {
            return Err(WorldStateError::InvalidConfig(
                "drag, heading_gain and min_speed must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Position, velocity and heading of one agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct State<S> {
    pub px: S,
    pub py: S,
    pub vx: S,
    pub vy: S,
    pub theta: S,
}

impl<S: Scalar> State<S> {
    #[must_use]
    pub const fn new(px: S, py: S, vx: S, vy: S, theta: S) -> Self {
        Self {
            px,
            py,
            vx,
            vy,
            theta,
        }
    }

    /// `self + h·rate`, component-wise.
    fn advance(self, rate: &Self, h: f64) -> Self {
        Self {
            px: self.px + rate.px * h,
            py: self.py + rate.py * h,
            vx: self.vx + rate.vx * h,
            vy: self.vy + rate.vy * h,
            theta: self.theta + rate.theta * h,
        }
    }

    #[must_use]
    pub fn speed(&self) -> S {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}

impl State<f64> {
    #[must_use]
    pub fn from_parts(position: Vec2, velocity: Vec2, heading: f64) -> Self {
        Self::new(position.x, position.y, velocity.x, velocity.y, heading)
    }

    #[must_use]
    pub const fn position(&self) -> Vec2 {
        Vec2::new(self.px, self.py)
    }

    #[must_use]
    pub const fn velocity(&self) -> Vec2 {
        Vec2::new(self.vx, self.vy)
    }

    /// Lift into another scalar type with zero derivatives.
    #[must_use]
    pub fn lift<T: Scalar>(&self) -> State<T> {
        State::new(
            T::constant(self.px),
            T::constant(self.py),
            T::constant(self.vx),
            T::constant(self.vy),
            T::constant(self.theta),
        )
    }
}

fn rate<S: Scalar>(state: &State<S>, force: (S, S), params: &DynamicsConfig) -> State<S> {
    let speed = state.speed();
    let inv_mass = 1.0 / params.mass;
    let ax = (force.0 - state.vx * speed * params.drag) * inv_mass;
    let ay = (force.1 - state.vy * speed * params.drag) * inv_mass;
    let dtheta = if speed.value() < params.min_speed {
        S::zero()
    } else {
        wrap_angle(state.vy.atan2(state.vx) - state.theta) * params.heading_gain
    };
    State::new(state.vx, state.vy, ax, ay, dtheta)
}

/// Advance `state` by one tick under the constant force `action`.
#[must_use]
pub fn predict<S: Scalar>(state: State<S>, action: (S, S), params: &DynamicsConfig) -> State<S> {
    let h = params.dt;
    let k1 = rate(&state, action, params);
    let k2 = rate(&state.advance(&k1, h * 0.5), action, params);
    let k3 = rate(&state.advance(&k2, h * 0.5), action, params);
    let k4 = rate(&state.advance(&k3, h), action, params);
    let mut next = state
        .advance(&k1, h / 6.0)
        .advance(&k2, h / 3.0)
        .advance(&k3, h / 3.0)
        .advance(&k4, h / 6.0);
    next.theta = wrap_angle(next.theta);
    next
}
