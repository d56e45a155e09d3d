//! Inference contract for external predictive models and the per-decision call budget.

use crate::geometry::Vec2;
use crate::spm::Spm;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Failures surfaced by a predictive model.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("model output shape {found:?} does not match input shape {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("model produced non-finite values")]
    NonFinite,
    #[error("model unavailable: {0}")]
    Unavailable(String),
}

/// Black-box predictor mapping `(current SPM, action)` to an expected SPM.
pub trait PredictiveModel: Send + Sync {
    fn name(&self) -> &'static str;
    fn predict(&self, current: &Spm, action: Vec2) -> Result<Spm, ModelError>;
}

/// Persistence forecast: the next SPM equals the current one whatever the action.
#[derive(Debug, Default, Clone, Copy)]
pub struct PersistenceModel;

impl PredictiveModel for PersistenceModel {
    fn name(&self) -> &'static str {
        "persistence"
    }

    fn predict(&self, current: &Spm, _action: Vec2) -> Result<Spm, ModelError> {
        Ok(current.clone())
    }
}

/// Limits applied to model calls within a single decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelBudget {
    pub max_calls: u32,
    /// Time the model itself may spend per decision, in microseconds.
    pub max_micros: u64,
}

impl Default for ModelBudget {
    fn default() -> Self {
        Self {
            max_calls: 10,
            max_micros: 2_000,
        }
    }
}

/// Why the surprise term was switched off mid-decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Fallback {
    CallsExhausted,
    TimeExhausted,
    Failed(String),
}

/// Wraps an optional model with a call/time budget for one decision.
///
/// Only time spent inside [`PredictiveModel::predict`] is charged against the budget. The
/// call that crosses it still returns its output; once a fallback fires the guard stays
/// latched and every later call returns `None`.
pub struct BudgetedModel<'a> {
    model: Option<&'a dyn PredictiveModel>,
    budget: ModelBudget,
    calls: u32,
    spent: Duration,
    fallback: Option<Fallback>,
}

impl<'a> BudgetedModel<'a> {
    #[must_use]
    pub fn new(model: Option<&'a dyn PredictiveModel>, budget: ModelBudget) -> Self {
        Self {
            model,
            budget,
            calls: 0,
            spent: Duration::ZERO,
            fallback: None,
        }
    }

    #[must_use]
    pub fn fallback(&self) -> Option<&Fallback> {
        self.fallback.as_ref()
    }

    fn latch(&mut self, model: &dyn PredictiveModel, reason: Fallback) {
        warn!(model = model.name(), reason = ?reason, "predictive model disabled for this decision");
        self.fallback = Some(reason);
    }

    /// Query the model, returning `None` once absent, exhausted or failed.
    pub fn predict(&mut self, current: &Spm, action: Vec2) -> Option<Spm> {
        let model = self.model?;
        if self.fallback.is_some() {
            return None;
        }
        if self.calls >= self.budget.max_calls {
            self.latch(model, Fallback::CallsExhausted);
            return None;
        }
        if self.spent >= Duration::from_micros(self.budget.max_micros) {
            self.latch(model, Fallback::TimeExhausted);
            return None;
        }
        self.calls += 1;
        let started = Instant::now();
        let predicted = model.predict(current, action);
        self.spent += started.elapsed();
        let checked = predicted.and_then(|output| {
            if output.dims() != current.dims() {
                Err(ModelError::ShapeMismatch {
                    expected: current.dims(),
                    found: output.dims(),
                })
            } else if !output.is_finite() {
                Err(ModelError::NonFinite)
            } else {
                Ok(output)
            }
        });
        match checked {
            Ok(output) => Some(output),
            Err(err) => {
                self.latch(model, Fallback::Failed(err.to_string()));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Shrinking;

    impl PredictiveModel for Shrinking {
        fn name(&self) -> &'static str {
            "shrinking"
        }

        fn predict(&self, _current: &Spm, _action: Vec2) -> Result<Spm, ModelError> {
            Ok(Spm::zeros(2, 2))
        }
    }

    struct Sluggish(Duration);

    impl PredictiveModel for Sluggish {
        fn name(&self) -> &'static str {
            "sluggish"
        }

        fn predict(&self, current: &Spm, _action: Vec2) -> Result<Spm, ModelError> {
            std::thread::sleep(self.0);
            Ok(current.clone())
        }
    }

    #[test]
    fn persistence_returns_input() {
        let spm = Spm::zeros(4, 4);
        let out = PersistenceModel.predict(&spm, Vec2::new(1.0, 0.0)).expect("predict");
        assert_eq!(out, spm);
    }

    #[test]
    fn absent_model_never_falls_back() {
        let mut guard = BudgetedModel::new(None, ModelBudget::default());
        assert!(guard.predict(&Spm::zeros(4, 4), Vec2::ZERO).is_none());
        assert!(guard.fallback().is_none());
        assert_eq!(guard.calls, 0);
    }

    #[test]
    fn call_budget_latches() {
        let budget = ModelBudget {
            max_calls: 2,
            max_micros: u64::MAX / 2,
        };
        let mut guard = BudgetedModel::new(Some(&PersistenceModel), budget);
        let spm = Spm::zeros(4, 4);
        assert!(guard.predict(&spm, Vec2::ZERO).is_some());
        assert!(guard.predict(&spm, Vec2::ZERO).is_some());
        assert!(guard.predict(&spm, Vec2::ZERO).is_none());
        assert_eq!(guard.fallback(), Some(&Fallback::CallsExhausted));
        assert_eq!(guard.calls, 2);
    }

    #[test]
    fn shape_mismatch_is_a_failure() {
        let mut guard = BudgetedModel::new(Some(&Shrinking), ModelBudget::default());
        assert!(guard.predict(&Spm::zeros(4, 4), Vec2::ZERO).is_none());
        assert!(matches!(guard.fallback(), Some(Fallback::Failed(_))));
    }

    #[test]
    fn slow_model_exhausts_time_budget() {
        let budget = ModelBudget {
            max_calls: 10,
            max_micros: 500,
        };
        let slow = Sluggish(Duration::from_millis(2));
        let mut guard = BudgetedModel::new(Some(&slow), budget);
        let spm = Spm::zeros(4, 4);
        assert!(guard.predict(&spm, Vec2::ZERO).is_some());
        assert!(guard.predict(&spm, Vec2::ZERO).is_none());
        assert_eq!(guard.fallback(), Some(&Fallback::TimeExhausted));
        assert_eq!(guard.calls, 1);
    }

    #[test]
    fn caller_work_between_calls_is_not_charged() {
        let budget = ModelBudget {
            max_calls: 3,
            max_micros: 1_000,
        };
        let mut guard = BudgetedModel::new(Some(&PersistenceModel), budget);
        let spm = Spm::zeros(4, 4);
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(2));
            assert!(guard.predict(&spm, Vec2::ZERO).is_some());
        }
        assert!(guard.fallback().is_none());
    }
}
