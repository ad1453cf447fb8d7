//! Sensor host collaborator interface.
//!
//! The session host is the long-lived process wired into the device's
//! heart-rate, motion and location sensors. It is consumed through the
//! `SensorHost` trait; updates flow back through a registered
//! `HostCallback`, which the controller adapts into a broadcast stream.

use crate::{
    ActivityType, Goal, GoalMetric, MetricType, MetricsSnapshot, Result, SessionId, SessionState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// What the host can measure for an activity type
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExerciseCapabilities {
    pub supported_metrics: HashSet<MetricType>,
    pub supported_goals: HashSet<GoalMetric>,
    pub supports_auto_pause: bool,
}

impl ExerciseCapabilities {
    /// Everything the controller knows how to use
    pub fn full() -> Self {
        Self {
            supported_metrics: [
                MetricType::HeartRate,
                MetricType::Calories,
                MetricType::Distance,
                MetricType::Duration,
                MetricType::Location,
            ]
            .into_iter()
            .collect(),
            supported_goals: [GoalMetric::Calories, GoalMetric::Distance, GoalMetric::Duration]
                .into_iter()
                .collect(),
            supports_auto_pause: true,
        }
    }

    pub fn supports(&self, metric: MetricType) -> bool {
        self.supported_metrics.contains(&metric)
    }

    /// A goal needs both the metric and the goal condition on the host
    pub fn supports_goal(&self, metric: GoalMetric) -> bool {
        self.supported_goals.contains(&metric) && self.supports(metric.metric_type())
    }
}

/// Warm-up request issued by `prepare`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WarmUpConfig {
    pub activity: ActivityType,
    pub metrics: Vec<MetricType>,
}

/// Full tracking request issued by `start`
#[derive(Clone, Debug, PartialEq)]
pub struct ExerciseConfig {
    pub session_id: SessionId,
    pub activity: ActivityType,
    pub metrics: Vec<MetricType>,
    pub goals: Vec<Goal>,
    pub auto_pause: bool,
}

/// Lifecycle state as the host reports it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Preparing,
    Active,
    UserPaused,
    AutoPaused,
    AutoResuming,
    Ending,
    Ended,
}

impl HostState {
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            HostState::Active
                | HostState::UserPaused
                | HostState::AutoPaused
                | HostState::AutoResuming
                | HostState::Ending
        )
    }

    pub fn as_session_state(self) -> SessionState {
        match self {
            HostState::Idle => SessionState::Idle,
            HostState::Preparing => SessionState::Preparing,
            HostState::Active | HostState::AutoResuming => SessionState::Active,
            HostState::UserPaused | HostState::AutoPaused => SessionState::Paused,
            HostState::Ending => SessionState::Ending,
            HostState::Ended => SessionState::Ended,
        }
    }
}

/// Snapshot of whatever session the host is currently running
#[derive(Clone, Debug, PartialEq)]
pub struct HostSessionInfo {
    pub session_id: Option<SessionId>,
    pub state: HostState,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics: Option<MetricsSnapshot>,
    pub goals: Vec<Goal>,
}

impl HostSessionInfo {
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: HostState::Idle,
            started_at: None,
            metrics: None,
            goals: Vec::new(),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state.is_in_progress()
    }
}

/// Notifications pushed by the host
#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    StateChanged(HostState),
    Metrics(MetricsSnapshot),
    GoalAchieved(GoalMetric),
    Failed(String),
}

/// Callback registered with the host; must not block
pub trait HostCallback: Send + Sync {
    fn on_event(&self, event: HostEvent);
}

/// The sensor/fitness capability provider
#[async_trait]
pub trait SensorHost: Send + Sync {
    async fn capabilities(&self, activity: ActivityType) -> Result<ExerciseCapabilities>;
    async fn prepare(&self, config: &WarmUpConfig) -> Result<()>;
    async fn start(&self, config: &ExerciseConfig) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn end(&self) -> Result<()>;
    async fn session_info(&self) -> Result<HostSessionInfo>;

    /// Replace the registered update callback
    fn set_callback(&self, callback: Arc<dyn HostCallback>);
    fn clear_callback(&self);
}
