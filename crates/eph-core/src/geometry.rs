//! Planar vectors, world topology and obstacle shapes.

use crate::WorldStateError;
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// Distances below this are treated as coincident points.
pub const COINCIDENT_EPS: f64 = 1e-9;

/// World-frame 2D vector.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Unit vector pointing at `angle` radians (counter-clockwise from +x).
    #[must_use]
    pub fn from_angle(angle: f64) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y
    }

    #[must_use]
    pub fn norm_sq(self) -> f64 {
        self.dot(self)
    }

    #[must_use]
    pub fn norm(self) -> f64 {
        self.norm_sq().sqrt()
    }

    /// Unit vector in the same direction, `None` for (near) zero vectors.
    #[must_use]
    pub fn normalized(self) -> Option<Self> {
        let n = self.norm();
        (n > COINCIDENT_EPS && n.is_finite()).then(|| self * (1.0 / n))
    }

    /// Scale down to `max_norm` if longer; shorter vectors are returned untouched.
    #[must_use]
    pub fn clamp_norm(self, max_norm: f64) -> Self {
        let n = self.norm();
        if n > max_norm && n > 0.0 {
            self * (max_norm / n)
        } else {
            self
        }
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Bearing of the vector in the world frame.
    #[must_use]
    pub fn angle(self) -> f64 {
        self.y.atan2(self.x)
    }
}

impl Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Neg for Vec2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

impl From<Vec2> for (f64, f64) {
    fn from(v: Vec2) -> Self {
        (v.x, v.y)
    }
}

/// Offset that maps `angle` into `(-π, π]`.
#[must_use]
pub fn signed_angle_offset(angle: f64) -> f64 {
    if !angle.is_finite() {
        return 0.0;
    }
    let wrapped = angle - TAU * (angle / TAU).round();
    let wrapped = if wrapped <= -PI { wrapped + TAU } else { wrapped };
    angle - wrapped
}

/// Wrap an angle into `(-π, π]`. NaN maps to zero.
#[must_use]
pub fn wrap_signed_angle(angle: f64) -> f64 {
    if angle.is_nan() {
        return 0.0;
    }
    angle - signed_angle_offset(angle)
}

/// Generic angle wrap; the shift is a constant so derivatives pass through unchanged.
#[must_use]
pub fn wrap_angle<S: Scalar>(angle: S) -> S {
    angle - signed_angle_offset(angle.value())
}

/// Wrap a coordinate into `[0, extent)`.
#[must_use]
pub fn wrap_coordinate(value: f64, extent: f64) -> f64 {
    if extent <= 0.0 {
        return 0.0;
    }
    let v = value.rem_euclid(extent);
    // rem_euclid can round up to `extent` for tiny negative inputs
    if v >= extent { 0.0 } else { v }
}

/// Rotate a world-frame offset into the egocentric frame of an agent facing `heading`.
///
/// Returns `(forward, right)`; positive `right` lies clockwise of forward.
#[must_use]
pub fn to_egocentric<S: Scalar>(dx: S, dy: S, heading: S) -> (S, S) {
    let (sin, cos) = (heading.sin(), heading.cos());
    (dx * cos + dy * sin, dx * sin - dy * cos)
}

/// How the world edges behave.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Opposite edges are identified; distances use the shortest wrapped displacement.
    #[default]
    Torus,
    /// Hard walls; agents are clamped inside and lose their wall-normal velocity.
    Bounded,
}

/// Rectangular world extent plus its topology.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WorldBounds {
    pub width: f64,
    pub height: f64,
    pub topology: Topology,
}

impl WorldBounds {
    pub fn new(width: f64, height: f64, topology: Topology) -> Result<Self, WorldStateError> {
        if !(width > 0.0 && height > 0.0) || !width.is_finite() || !height.is_finite() {
            return Err(WorldStateError::InvalidConfig(
                "world dimensions must be positive and finite",
            ));
        }
        Ok(Self {
            width,
            height,
            topology,
        })
    }

    #[must_use]
    pub fn is_torus(&self) -> bool {
        self.topology == Topology::Torus
    }

    fn axis(delta: f64, extent: f64) -> f64 {
        let half = extent * 0.5;
        if delta > half {
            delta - extent
        } else if delta < -half {
            delta + extent
        } else {
            delta
        }
    }

    /// Displacement from `from` to `to`, shortest across the seams on a torus.
    #[must_use]
    pub fn displacement(&self, from: Vec2, to: Vec2) -> Vec2 {
        let raw = to - from;
        match self.topology {
            Topology::Torus => Vec2::new(
                Self::axis(raw.x, self.width),
                Self::axis(raw.y, self.height),
            ),
            Topology::Bounded => raw,
        }
    }

    #[must_use]
    pub fn distance(&self, from: Vec2, to: Vec2) -> f64 {
        self.displacement(from, to).norm()
    }

    /// Map an integrated state back into the world: wrap on a torus, clamp against walls.
    #[must_use]
    pub fn confine(&self, position: Vec2, velocity: Vec2) -> (Vec2, Vec2) {
        match self.topology {
            Topology::Torus => (
                Vec2::new(
                    wrap_coordinate(position.x, self.width),
                    wrap_coordinate(position.y, self.height),
                ),
                velocity,
            ),
            Topology::Bounded => {
                let mut p = position;
                let mut v = velocity;
                if p.x < 0.0 || p.x > self.width {
                    p.x = p.x.clamp(0.0, self.width);
                    v.x = 0.0;
                }
                if p.y < 0.0 || p.y > self.height {
                    p.y = p.y.clamp(0.0, self.height);
                    v.y = 0.0;
                }
                (p, v)
            }
        }
    }
}

/// Static obstacle shapes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Obstacle {
    Point { center: Vec2 },
    Circle { center: Vec2, radius: f64 },
    Rect { min: Vec2, max: Vec2 },
}

impl Obstacle {
    pub fn validate(&self) -> Result<(), WorldStateError> {
        match *self {
            Self::Point { center } if !center.is_finite() => Err(
                WorldStateError::InvalidConfig("obstacle coordinates must be finite"),
            ),
            Self::Circle { center, radius } if !center.is_finite() || !(radius > 0.0) => Err(
                WorldStateError::InvalidConfig("circle obstacles need a positive radius"),
            ),
            Self::Rect { min, max }
                if !min.is_finite() || !max.is_finite() || !(min.x < max.x && min.y < max.y) =>
            {
                Err(WorldStateError::InvalidConfig(
                    "rect obstacles need min strictly below max",
                ))
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn center(&self) -> Vec2 {
        match *self {
            Self::Point { center } | Self::Circle { center, .. } => center,
            Self::Rect { min, max } => (min + max) * 0.5,
        }
    }

    /// Offset from `from` to the closest point on the obstacle boundary.
    ///
    /// For a point obstacle this is the offset to the point itself. Inside a circle or
    /// rectangle the offset points to the nearest edge.
    #[must_use]
    pub fn nearest_boundary_offset(&self, from: Vec2, bounds: &WorldBounds) -> Vec2 {
        let to_center = bounds.displacement(from, self.center());
        match *self {
            Self::Point { .. } => to_center,
            Self::Circle { radius, .. } => match to_center.normalized() {
                Some(dir) => to_center - dir * radius,
                None => Vec2::new(radius, 0.0),
            },
            Self::Rect { min, max } => {
                let half = (max - min) * 0.5;
                // agent position in the rectangle's local frame
                let local = -to_center;
                let inside = local.x.abs() < half.x && local.y.abs() < half.y;
                let nearest = if inside {
                    let gap_x = half.x - local.x.abs();
                    let gap_y = half.y - local.y.abs();
                    if gap_x <= gap_y {
                        Vec2::new(half.x.copysign(local.x), local.y)
                    } else {
                        Vec2::new(local.x, half.y.copysign(local.y))
                    }
                } else {
                    Vec2::new(
                        local.x.clamp(-half.x, half.x),
                        local.y.clamp(-half.y, half.y),
                    )
                };
                nearest - local
            }
        }
    }

    /// Whether `point` lies strictly inside the obstacle's area.
    #[must_use]
    pub fn contains(&self, point: Vec2, bounds: &WorldBounds) -> bool {
        let local = bounds.displacement(self.center(), point);
        match *self {
            Self::Point { .. } => false,
            Self::Circle { radius, .. } => local.norm_sq() < radius * radius,
            Self::Rect { min, max } => {
                let half = (max - min) * 0.5;
                local.x.abs() < half.x && local.y.abs() < half.y
            }
        }
    }
}
