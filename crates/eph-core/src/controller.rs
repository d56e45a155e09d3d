//! Free-energy action selection.
//!
//! For a candidate force `u` the objective is
//!
//! ```text
//! F(u) = −w_goal·v'(u)·d_goal
//!      + w_safety·Σ precision·(k₂·saliency' + k₃·risk')
//!      + w_surprise·½·Σ precision·(spm' − model(spm, u))²
//! ```
//!
//! where primes denote quantities one tick ahead: the agent is advanced by `u` through
//! [`crate::dynamics::predict`], neighbors keep their velocity and obstacles stay put. The
//! model output enters as a constant, so its own sensitivity to `u` is not differentiated.
//! `F` is minimized by a few steps of projected gradient descent with dual-number
//! gradients, warm-started at the saturated goal-aligned action.

use crate::WorldStateError;
use crate::dynamics::{DynamicsConfig, State, predict};
use crate::geometry::{Vec2, to_egocentric};
use crate::haze::PrecisionMap;
use crate::model::{BudgetedModel, ModelBudget, PredictiveModel};
use crate::scalar::{Dual, Scalar};
use crate::spm::{Channel, Percept, Sharpness, Spm, SpmGridSpec, SpmTensor, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fixed action emitted in baseline mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaselineAction {
    #[default]
    Zero,
    GoalAligned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    FreeEnergy,
    /// No optimization; used to collect data independently of the controller.
    Baseline { action: BaselineAction },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ObjectiveWeights {
    pub goal: f64,
    pub safety: f64,
    pub surprise: f64,
    /// `k₂`: weight of the proximity saliency channel inside the safety term.
    pub proximity: f64,
    /// `k₃`: weight of the collision risk channel inside the safety term.
    pub risk: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            goal: 1.0,
            safety: 1.0,
            surprise: 1.0,
            proximity: 1.0,
            risk: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    pub mode: ControlMode,
    /// Gradient steps per decision.
    pub iterations: u32,
    pub learning_rate: f64,
    /// Per-component bound on the gradient before each step.
    pub gradient_clip: f64,
    /// Radius of the feasible action disc.
    pub max_action: f64,
    pub weights: ObjectiveWeights,
    pub model_budget: ModelBudget,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ControlMode::FreeEnergy,
            iterations: 10,
            learning_rate: 1.0,
            gradient_clip: 10.0,
            max_action: 2.0,
            weights: ObjectiveWeights::default(),
            model_budget: ModelBudget::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), WorldStateError> {
        if !(self.max_action > 0.0) || !self.max_action.is_finite() {
            return Err(WorldStateError::InvalidConfig("max_action must be positive"));
        }
        if !(self.learning_rate > 0.0) || !(self.gradient_clip > 0.0) {
            return Err(WorldStateError::InvalidConfig(
                "learning_rate and gradient_clip must be positive",
            ));
        }
        let w = &self.weights;
        if [w.goal, w.safety, w.surprise, w.proximity, w.risk]
            .iter()
            .any(|v| !(*v >= 0.0) || !v.is_finite())
        {
            return Err(WorldStateError::InvalidConfig(
                "objective weights must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

/// Another agent as seen by the deciding agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// World-frame displacement from the deciding agent.
    pub offset: Vec2,
    pub velocity: Vec2,
}

/// Read-only view of the deciding agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentView {
    pub state: State<f64>,
    /// Unit preferred direction.
    pub goal: Vec2,
    pub previous_action: Vec2,
    pub sharpness: Sharpness,
}

/// Objects within sensing range of the deciding agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Surroundings<'a> {
    pub neighbors: &'a [Neighbor],
    /// World-frame offsets to the nearest boundary point of each sensed obstacle.
    pub obstacles: &'a [Vec2],
}

impl Surroundings<'_> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty() && self.obstacles.is_empty()
    }
}

/// Shared, read-only parameters for every decision in a tick.
#[derive(Debug, Clone, Copy)]
pub struct ControlContext<'a> {
    pub spec: &'a SpmGridSpec,
    pub dynamics: &'a DynamicsConfig,
    pub config: &'a ControllerConfig,
    /// Radius of one body. Neighbors touch at twice this, obstacles at once this.
    pub agent_radius: f64,
}

/// The three objective terms for one candidate action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveTerms<S> {
    pub goal: S,
    pub safety: S,
    pub surprise: S,
}

impl<S: Scalar> ObjectiveTerms<S> {
    #[must_use]
    pub fn total(&self) -> S {
        self.goal + self.safety + self.surprise
    }
}

/// Outcome of one action selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub action: Vec2,
    /// Objective at the last evaluated iterate.
    pub objective: f64,
    pub iterations: u32,
    pub numeric_anomaly: bool,
    pub model_fallback: bool,
}

impl Decision {
    const fn fixed(action: Vec2) -> Self {
        Self {
            action,
            objective: 0.0,
            iterations: 0,
            numeric_anomaly: false,
            model_fallback: false,
        }
    }
}

/// SPM the agent expects to see after applying `action` for one tick.
#[must_use]
pub fn predicted_spm<S: Scalar>(
    action: (S, S),
    agent: &AgentView,
    surroundings: &Surroundings<'_>,
    ctx: &ControlContext<'_>,
) -> (State<S>, SpmTensor<S>) {
    let next = predict(agent.state.lift::<S>(), action, ctx.dynamics);
    let shift_x = next.px - agent.state.px;
    let shift_y = next.py - agent.state.py;
    let dt = ctx.dynamics.dt;
    let neighbor_contact = 2.0 * ctx.agent_radius;

    let mut percepts =
        Vec::with_capacity(surroundings.neighbors.len() + surroundings.obstacles.len());
    for neighbor in surroundings.neighbors {
        let ahead = neighbor.offset + neighbor.velocity * dt;
        let dx = S::constant(ahead.x) - shift_x;
        let dy = S::constant(ahead.y) - shift_y;
        let rvx = S::constant(neighbor.velocity.x) - next.vx;
        let rvy = S::constant(neighbor.velocity.y) - next.vy;
        let (forward, right) = to_egocentric(dx, dy, next.theta);
        let (v_forward, v_right) = to_egocentric(rvx, rvy, next.theta);
        percepts.push(Percept::new(forward, right, v_forward, v_right, neighbor_contact));
    }
    for offset in surroundings.obstacles {
        let dx = S::constant(offset.x) - shift_x;
        let dy = S::constant(offset.y) - shift_y;
        let (forward, right) = to_egocentric(dx, dy, next.theta);
        let (v_forward, v_right) = to_egocentric(-next.vx, -next.vy, next.theta);
        percepts.push(Percept::new(forward, right, v_forward, v_right, ctx.agent_radius));
    }
    let spm = encode(&percepts, ctx.spec, agent.sharpness);
    (next, spm)
}

/// Evaluate the objective terms at `action`.
///
/// `model_target` is the predictive model's output for this action; `None` drops the
/// surprise term.
#[must_use]
pub fn evaluate<S: Scalar>(
    action: (S, S),
    agent: &AgentView,
    surroundings: &Surroundings<'_>,
    model_target: Option<&Spm>,
    precision: &PrecisionMap,
    ctx: &ControlContext<'_>,
) -> ObjectiveTerms<S> {
    let weights = &ctx.config.weights;
    let (next, spm) = predicted_spm(action, agent, surroundings, ctx);
    let goal = -(next.vx * agent.goal.x + next.vy * agent.goal.y) * weights.goal;

    let (n_rho, n_theta) = spm.dims();
    let mut safety = S::zero();
    let mut surprise = S::zero();
    for i in 0..n_rho {
        for j in 0..n_theta {
            let w = precision.get(i, j);
            let hazard = spm.get(i, j, Channel::Saliency) * weights.proximity
                + spm.get(i, j, Channel::Risk) * weights.risk;
            safety = safety + hazard * w;
            if let Some(target) = model_target {
                for channel in [Channel::Occupancy, Channel::Saliency, Channel::Risk] {
                    let err = spm.get(i, j, channel) - target.get(i, j, channel);
                    surprise = surprise + err * err * w;
                }
            }
        }
    }
    ObjectiveTerms {
        goal,
        safety: safety * weights.safety,
        surprise: surprise * (0.5 * weights.surprise),
    }
}

fn is_blank(spm: &Spm) -> bool {
    spm.as_slice().iter().all(|&v| v == 0.0)
}

/// Choose the force to apply this tick.
#[must_use]
pub fn select_action(
    agent: &AgentView,
    current_spm: &Spm,
    surroundings: &Surroundings<'_>,
    model: Option<&dyn PredictiveModel>,
    precision: &PrecisionMap,
    ctx: &ControlContext<'_>,
) -> Decision {
    let config = ctx.config;
    let saturated = agent.goal * config.max_action;
    match config.mode {
        ControlMode::Baseline {
            action: BaselineAction::Zero,
        } => return Decision::fixed(Vec2::ZERO),
        ControlMode::Baseline {
            action: BaselineAction::GoalAligned,
        } => return Decision::fixed(saturated),
        ControlMode::FreeEnergy => {}
    }

    // Nothing sensed now or after the goal-aligned push: every penalty is zero there.
    let unseen = surroundings.is_empty()
        || (is_blank(current_spm)
            && is_blank(&predicted_spm((saturated.x, saturated.y), agent, surroundings, ctx).1));
    if unseen {
        let terms = evaluate::<f64>(
            (saturated.x, saturated.y),
            agent,
            surroundings,
            None,
            precision,
            ctx,
        );
        return Decision {
            objective: terms.total(),
            ..Decision::fixed(saturated)
        };
    }

    let mut guard = BudgetedModel::new(model, config.model_budget);
    let mut action = saturated;
    let mut objective = f64::NAN;
    let mut iterations = 0;
    for _ in 0..config.iterations {
        let target = guard.predict(current_spm, action);
        let terms = evaluate(
            (Dual::variable(action.x, 0), Dual::variable(action.y, 1)),
            agent,
            surroundings,
            target.as_ref(),
            precision,
            ctx,
        );
        let total = terms.total();
        if !total.is_finite() {
            debug!(objective = total.re, "non-finite objective, keeping previous action");
            let previous = if agent.previous_action.is_finite() {
                agent.previous_action
            } else {
                Vec2::ZERO
            };
            return Decision {
                action: previous,
                objective: total.re,
                iterations,
                numeric_anomaly: true,
                model_fallback: guard.fallback().is_some(),
            };
        }
        objective = total.re;
        iterations += 1;

        let [gx, gy] = total.gradient();
        if gx == 0.0 && gy == 0.0 {
            break;
        }
        let clip = config.gradient_clip;
        let step = Vec2::new(gx.clamp(-clip, clip), gy.clamp(-clip, clip)) * config.learning_rate;
        action = (action - step).clamp_norm(config.max_action);
    }

    Decision {
        action,
        objective,
        iterations,
        numeric_anomaly: false,
        model_fallback: guard.fallback().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::haze::{HazeConfig, HazeField};
    use crate::model::{ModelError, PersistenceModel};
    use crate::spm::SpmConfig;

    struct Fixture {
        spec: SpmGridSpec,
        field: HazeField,
        dynamics: DynamicsConfig,
        config: ControllerConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let spec = SpmGridSpec::new(&SpmConfig::default()).expect("spec");
            let field = HazeField::new(&HazeConfig::default(), &spec).expect("field");
            Self {
                spec,
                field,
                dynamics: DynamicsConfig::default(),
                config: ControllerConfig::default(),
            }
        }

        fn ctx(&self) -> ControlContext<'_> {
            ControlContext {
                spec: &self.spec,
                dynamics: &self.dynamics,
                config: &self.config,
                agent_radius: 0.5,
            }
        }

        fn agent(&self, velocity: Vec2, goal: Vec2, nearest_rho: Option<f64>) -> AgentView {
            let precision = self.field.scalar_precision(&self.spec, nearest_rho);
            AgentView {
                state: State::from_parts(Vec2::ZERO, velocity, velocity.angle()),
                goal,
                previous_action: Vec2::new(0.3, 0.1),
                sharpness: self.field.sharpness(&self.spec, precision),
            }
        }
    }

    #[test]
    fn empty_surroundings_return_saturated_goal_action() {
        let fx = Fixture::new();
        let goal = Vec2::new(0.6, 0.8);
        let agent = fx.agent(Vec2::new(0.5, -0.2), goal, None);
        let decision = select_action(
            &agent,
            &Spm::for_spec(&fx.spec),
            &Surroundings::default(),
            Some(&PersistenceModel),
            &fx.field.precision_map(),
            &fx.ctx(),
        );
        assert_eq!(decision.action, Vec2::new(1.2, 1.6));
        assert_eq!(decision.iterations, 0);
        assert!(!decision.numeric_anomaly && !decision.model_fallback);
    }

    #[test]
    fn neighbors_behind_skip_the_descent() {
        let fx = Fixture::new();
        let goal = Vec2::new(1.0, 0.0);
        let agent = fx.agent(Vec2::new(0.5, 0.0), goal, Some(1.0));
        let neighbors = [Neighbor {
            offset: Vec2::new(-2.0, 0.0),
            velocity: Vec2::ZERO,
        }];
        let surroundings = Surroundings {
            neighbors: &neighbors,
            obstacles: &[],
        };
        let decision = select_action(
            &agent,
            &Spm::for_spec(&fx.spec),
            &surroundings,
            Some(&PersistenceModel),
            &fx.field.precision_map(),
            &fx.ctx(),
        );
        assert_eq!(decision.action, goal * fx.config.max_action);
        assert_eq!(decision.iterations, 0);
        assert!(!decision.model_fallback);
    }

    #[test]
    fn baseline_modes_skip_optimization() {
        let mut fx = Fixture::new();
        let agent = fx.agent(Vec2::new(1.0, 0.0), Vec2::new(0.0, 1.0), None);
        let obstacles = [Vec2::new(1.5, 0.0)];
        let surroundings = Surroundings {
            neighbors: &[],
            obstacles: &obstacles,
        };
        let precision = fx.field.precision_map();
        let spm = Spm::for_spec(&fx.spec);

        fx.config.mode = ControlMode::Baseline {
            action: BaselineAction::Zero,
        };
        let decision = select_action(&agent, &spm, &surroundings, None, &precision, &fx.ctx());
        assert_eq!(decision.action, Vec2::ZERO);

        fx.config.mode = ControlMode::Baseline {
            action: BaselineAction::GoalAligned,
        };
        let decision = select_action(&agent, &spm, &surroundings, None, &precision, &fx.ctx());
        assert_eq!(decision.action, Vec2::new(0.0, 2.0));
    }

    #[test]
    fn goal_term_rewards_motion_along_preferred_direction() {
        let fx = Fixture::new();
        let goal = Vec2::new(1.0, 0.0);
        let agent = fx.agent(Vec2::new(0.4, 0.1), goal, None);
        let precision = fx.field.precision_map();
        let ctx = fx.ctx();
        let empty = Surroundings::default();
        let at = |u: Vec2| evaluate::<f64>((u.x, u.y), &agent, &empty, None, &precision, &ctx).goal;

        let u = Vec2::new(0.5, 0.5);
        let h = 1e-5;
        let along = (at(u + goal * h) - at(u - goal * h)) / (2.0 * h);
        assert!(along < 0.0, "pushing along d_goal must lower the objective");
        let across = (at(u + Vec2::new(0.0, h)) - at(u - Vec2::new(0.0, h))) / (2.0 * h);

        let dual = evaluate(
            (Dual::variable(u.x, 0), Dual::variable(u.y, 1)),
            &agent,
            &empty,
            None,
            &precision,
            &ctx,
        );
        assert!((dual.goal.eps[0] - along).abs() < 1e-6);
        assert!((dual.goal.eps[1] - across).abs() < 1e-6);
    }

    #[test]
    fn full_objective_gradient_matches_finite_differences() {
        let fx = Fixture::new();
        let neighbors = [Neighbor {
            offset: Vec2::new(2.2, 0.9),
            velocity: Vec2::new(-0.6, 0.1),
        }];
        let obstacles = [Vec2::new(1.8, -1.1)];
        let surroundings = Surroundings {
            neighbors: &neighbors,
            obstacles: &obstacles,
        };
        let agent = fx.agent(Vec2::new(0.9, 0.2), Vec2::new(1.0, 0.0), Some(0.6));
        let precision = fx.field.precision_map();
        let ctx = fx.ctx();
        let target = Spm::for_spec(&fx.spec);
        let f = |u: (f64, f64)| {
            evaluate::<f64>(u, &agent, &surroundings, Some(&target), &precision, &ctx).total()
        };
        let u = (0.7, -0.3);
        let dual = evaluate(
            (Dual::variable(u.0, 0), Dual::variable(u.1, 1)),
            &agent,
            &surroundings,
            Some(&target),
            &precision,
            &ctx,
        )
        .total();
        let h = 1e-6;
        let gx = (f((u.0 + h, u.1)) - f((u.0 - h, u.1))) / (2.0 * h);
        let gy = (f((u.0, u.1 + h)) - f((u.0, u.1 - h))) / (2.0 * h);
        assert!((dual.eps[0] - gx).abs() <= 1e-4 * (1.0 + gx.abs()), "{} vs {gx}", dual.eps[0]);
        assert!((dual.eps[1] - gy).abs() <= 1e-4 * (1.0 + gy.abs()), "{} vs {gy}", dual.eps[1]);
    }

    #[test]
    fn obstacle_ahead_slows_forward_push() {
        let fx = Fixture::new();
        let goal = Vec2::new(1.0, 0.0);
        let precision = fx.field.precision_map();
        let spm = Spm::for_spec(&fx.spec);

        let free = fx.agent(Vec2::new(1.0, 0.0), goal, None);
        let unobstructed = select_action(
            &free,
            &spm,
            &Surroundings::default(),
            None,
            &precision,
            &fx.ctx(),
        );

        let obstacles = [Vec2::new(1.0, 0.0)];
        let blocked = fx.agent(Vec2::new(1.0, 0.0), goal, Some(std::f64::consts::LN_2));
        let surroundings = Surroundings {
            neighbors: &[],
            obstacles: &obstacles,
        };
        let avoided = select_action(&blocked, &spm, &surroundings, None, &precision, &fx.ctx());
        assert!(!avoided.numeric_anomaly);
        assert!(avoided.iterations > 0);
        assert!(
            avoided.action.x < unobstructed.action.x - 0.25,
            "forward push {} not reduced from {}",
            avoided.action.x,
            unobstructed.action.x
        );
        assert!(avoided.action.norm() <= fx.config.max_action + 1e-12);
    }

    #[test]
    fn non_finite_objective_keeps_previous_action() {
        let fx = Fixture::new();
        let obstacles = [Vec2::new(f64::NAN, 0.0)];
        let surroundings = Surroundings {
            neighbors: &[],
            obstacles: &obstacles,
        };
        let agent = fx.agent(Vec2::new(1.0, 0.0), Vec2::new(1.0, 0.0), Some(0.5));
        let decision = select_action(
            &agent,
            &Spm::for_spec(&fx.spec),
            &surroundings,
            None,
            &fx.field.precision_map(),
            &fx.ctx(),
        );
        assert!(decision.numeric_anomaly);
        assert_eq!(decision.action, agent.previous_action);
    }

    struct Broken;

    impl PredictiveModel for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn predict(&self, _current: &Spm, _action: Vec2) -> Result<Spm, ModelError> {
            Err(ModelError::Unavailable("offline".into()))
        }
    }

    #[test]
    fn model_failure_falls_back_without_aborting() {
        let fx = Fixture::new();
        let neighbors = [Neighbor {
            offset: Vec2::new(3.0, 0.5),
            velocity: Vec2::new(-1.0, 0.0),
        }];
        let surroundings = Surroundings {
            neighbors: &neighbors,
            obstacles: &[],
        };
        let agent = fx.agent(Vec2::new(0.5, 0.0), Vec2::new(1.0, 0.0), Some(1.0));
        let precision = fx.field.precision_map();
        let spm = Spm::for_spec(&fx.spec);

        let with_model = select_action(
            &agent,
            &spm,
            &surroundings,
            Some(&PersistenceModel),
            &precision,
            &fx.ctx(),
        );
        assert!(!with_model.model_fallback);

        let broken = select_action(&agent, &spm, &surroundings, Some(&Broken), &precision, &fx.ctx());
        let absent = select_action(&agent, &spm, &surroundings, None, &precision, &fx.ctx());
        assert!(broken.model_fallback);
        assert!(!absent.model_fallback);
        assert_eq!(broken.action, absent.action);
        assert!(broken.action.is_finite());
    }
}
