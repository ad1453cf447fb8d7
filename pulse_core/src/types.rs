//! Core domain types for the Pulse session controller.
//!
//! This module defines the fundamental types used throughout the system:
//! - Session identity and lifecycle state
//! - Metric snapshots and active-duration reconstruction
//! - One-time goals
//! - Session summaries handed to the companion
//! - Connection state and the controller's update stream items

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

// ============================================================================
// Session Identity
// ============================================================================

static LAST_SESSION_ID: AtomicI64 = AtomicI64::new(0);

/// Time-derived session identifier. Zero is the "never initialized" sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl SessionId {
    /// The sentinel value carried by a default, uninitialized session
    pub const UNSET: SessionId = SessionId(0);

    /// Generate a new id from the wall clock (milliseconds).
    ///
    /// Ids are strictly increasing within a process even if the clock
    /// stalls or two sessions are created in the same millisecond.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut prev = LAST_SESSION_ID.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match LAST_SESSION_ID.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return SessionId(next),
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for SessionId {
    fn from(value: i64) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Activity and Metric Types
// ============================================================================

/// Kind of exercise the sensor host is asked to track
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    #[default]
    Running,
    Walking,
    Biking,
    Workout,
}

impl ActivityType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" | "run" => Some(ActivityType::Running),
            "walking" | "walk" => Some(ActivityType::Walking),
            "biking" | "cycling" | "bike" => Some(ActivityType::Biking),
            "workout" | "other" => Some(ActivityType::Workout),
            _ => None,
        }
    }
}

/// Metric types a sensor host may be able to measure
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    Calories,
    Distance,
    Duration,
    Location,
}

/// Metrics that can carry a goal
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalMetric {
    Calories,
    Distance,
    Duration,
}

impl GoalMetric {
    pub fn metric_type(self) -> MetricType {
        match self {
            GoalMetric::Calories => MetricType::Calories,
            GoalMetric::Distance => MetricType::Distance,
            GoalMetric::Duration => MetricType::Duration,
        }
    }
}

// ============================================================================
// Lifecycle State
// ============================================================================

/// State of the exercise session as seen by the controller
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Preparing,
    Active,
    Paused,
    Ending,
    Ended,
    Error(String),
}

impl SessionState {
    /// A session exists on the host and has not finished yet
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            SessionState::Active | SessionState::Paused | SessionState::Ending
        )
    }

    /// States from which a fresh session may be prepared or started
    pub fn accepts_new_session(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Ended | SessionState::Error(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
            SessionState::Error(_) => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error(message) => write!(f, "error ({})", message),
            other => f.write_str(other.name()),
        }
    }
}

/// Who caused a state transition
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOrigin {
    /// An explicit command issued through the controller
    User,
    /// The sensor host changed state on its own (auto-pause, external end)
    Host,
}

// ============================================================================
// Metrics
// ============================================================================

/// Active duration as reported by the host: a base value plus the instant
/// it was sampled.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ActiveDurationCheckpoint {
    pub base: Duration,
    pub checkpoint: DateTime<Utc>,
}

impl ActiveDurationCheckpoint {
    pub fn zero(at: DateTime<Utc>) -> Self {
        Self {
            base: Duration::ZERO,
            checkpoint: at,
        }
    }

    /// Reconstruct elapsed active time at `now`.
    ///
    /// While the session is running the clock keeps advancing from the
    /// checkpoint; while paused the base value is frozen.
    pub fn elapsed_at(&self, now: DateTime<Utc>, running: bool) -> Duration {
        if !running {
            return self.base;
        }
        let since = (now - self.checkpoint).to_std().unwrap_or_default();
        self.base + since
    }

    /// Fold the running clock into `base` and move the checkpoint to `now`
    pub fn advance_to(&self, now: DateTime<Utc>, running: bool) -> Self {
        Self {
            base: self.elapsed_at(now, running),
            checkpoint: now,
        }
    }
}

/// Accumulated session metrics, written only by host updates
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub heart_rate: Option<f64>,
    pub heart_rate_average: f64,
    pub calories_total: f64,
    pub distance_total: f64,
    pub active_duration: ActiveDurationCheckpoint,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn empty(at: DateTime<Utc>) -> Self {
        Self {
            heart_rate: None,
            heart_rate_average: 0.0,
            calories_total: 0.0,
            distance_total: 0.0,
            active_duration: ActiveDurationCheckpoint::zero(at),
            timestamp: at,
        }
    }

    /// Current value of the metric a goal tracks.
    ///
    /// Duration reads the folded `base`; callers advance the checkpoint first.
    pub fn value_of(&self, metric: GoalMetric) -> f64 {
        match metric {
            GoalMetric::Calories => self.calories_total,
            GoalMetric::Distance => self.distance_total,
            GoalMetric::Duration => self.active_duration.base.as_secs_f64(),
        }
    }
}

// ============================================================================
// Goals
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThanOrEqual,
}

/// A one-time threshold goal
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub metric: GoalMetric,
    pub threshold: f64,
    pub comparison: Comparison,
    pub one_time: bool,
    pub met: bool,
}

impl Goal {
    pub fn new(metric: GoalMetric, threshold: f64) -> Self {
        Self {
            metric,
            threshold,
            comparison: Comparison::GreaterThanOrEqual,
            one_time: true,
            met: false,
        }
    }

    pub fn is_satisfied_by(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::GreaterThanOrEqual => value >= self.threshold,
        }
    }
}

// ============================================================================
// Session and Summary
// ============================================================================

/// The session currently owned by the controller
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExerciseSession {
    pub id: SessionId,
    pub state: SessionState,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub metrics: MetricsSnapshot,
    pub goals: Vec<Goal>,
}

impl ExerciseSession {
    pub fn new(id: SessionId, started_at: DateTime<Utc>, goals: Vec<Goal>) -> Self {
        Self {
            id,
            state: SessionState::Active,
            start_timestamp: started_at,
            end_timestamp: None,
            metrics: MetricsSnapshot::empty(started_at),
            goals,
        }
    }
}

/// End-of-session record delivered to the companion
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub avg_heart_rate: i32,
    pub calories: f32,
    pub distance: f32,
    pub duration_sec: i64,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

impl SessionSummary {
    /// Build a summary from a finished session.
    ///
    /// Fails with `InvalidSession` for the zero sentinel id.
    pub fn from_session(session: &ExerciseSession) -> Result<Self> {
        if !session.id.is_valid() {
            return Err(Error::InvalidSession(session.id.get()));
        }
        let end = session.end_timestamp.unwrap_or(session.metrics.timestamp);
        Ok(Self {
            session_id: session.id,
            avg_heart_rate: session.metrics.heart_rate_average.round() as i32,
            calories: session.metrics.calories_total as f32,
            distance: session.metrics.distance_total as f32,
            duration_sec: session.metrics.active_duration.base.as_secs() as i64,
            start_timestamp: session.start_timestamp.timestamp_millis(),
            end_timestamp: end.timestamp_millis(),
        })
    }
}

// ============================================================================
// Binding and Update Stream
// ============================================================================

/// Connection from the observing process to the session host
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected(SessionState),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Items published on the controller's update stream
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    StateChanged {
        session_id: Option<SessionId>,
        state: SessionState,
        origin: TransitionOrigin,
    },
    Metrics {
        session_id: SessionId,
        snapshot: MetricsSnapshot,
    },
    GoalMet {
        session_id: SessionId,
        goal: Goal,
    },
}

/// Why a command did nothing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoOpReason {
    /// Start requested while a session is already running
    DuplicateStart,
    /// Pause/resume/end with no session in progress
    NothingInProgress,
    /// Command is not valid from the current state
    InvalidTransition,
}

/// Result of a lifecycle command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    NoOp(NoOpReason),
    /// The host failed; the message is recorded in `SessionState::Error`
    Failed(String),
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied)
    }
}
