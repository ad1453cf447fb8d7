//! One-time goal negotiation and evaluation.
//!
//! Goals are created at session start from the configured thresholds
//! intersected with what the host supports. A goal fires at most once per
//! session, whether the host signals it or a metrics tick crosses it first.

use crate::host::ExerciseCapabilities;
use crate::{Goal, GoalMetric, MetricsSnapshot};
use std::time::Duration;

/// Built-in calorie goal applied to every session the host can measure
pub const BUILTIN_CALORIES_GOAL: f64 = 250.0;

/// Caller-supplied goal thresholds. Zero disables a goal.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GoalThresholds {
    pub distance_meters: f64,
    pub duration: Duration,
}

impl Default for GoalThresholds {
    fn default() -> Self {
        Self {
            distance_meters: 0.0,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GoalEvaluator {
    goals: Vec<Goal>,
}

impl GoalEvaluator {
    /// Build goals for the metrics the host can actually evaluate
    pub fn negotiate(thresholds: &GoalThresholds, capabilities: &ExerciseCapabilities) -> Self {
        let candidates = [
            (GoalMetric::Calories, BUILTIN_CALORIES_GOAL),
            (GoalMetric::Distance, thresholds.distance_meters),
            (GoalMetric::Duration, thresholds.duration.as_secs_f64()),
        ];

        let goals = candidates
            .into_iter()
            .filter(|(metric, threshold)| {
                let keep = *threshold > 0.0 && capabilities.supports_goal(*metric);
                if !keep {
                    tracing::debug!("Skipping {:?} goal (threshold {})", metric, threshold);
                }
                keep
            })
            .map(|(metric, threshold)| Goal::new(metric, threshold))
            .collect();

        Self { goals }
    }

    /// Restore goals reported by the host after a rebind
    pub fn from_goals(goals: Vec<Goal>) -> Self {
        Self { goals }
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    /// Check a metrics tick; returns goals met for the first time
    pub fn observe(&mut self, snapshot: &MetricsSnapshot) -> Vec<Goal> {
        let mut newly_met = Vec::new();
        for goal in self.goals.iter_mut().filter(|g| !g.met) {
            if goal.is_satisfied_by(snapshot.value_of(goal.metric)) {
                goal.met = true;
                newly_met.push(goal.clone());
            }
        }
        newly_met
    }

    /// Record a host-signalled achievement; `None` if already met or unknown
    pub fn mark_achieved(&mut self, metric: GoalMetric) -> Option<Goal> {
        let goal = self.goals.iter_mut().find(|g| g.metric == metric)?;
        if goal.met {
            return None;
        }
        goal.met = true;
        Some(goal.clone())
    }
}
