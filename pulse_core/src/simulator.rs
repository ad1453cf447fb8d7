//! In-process sensor host used by the CLI and tests.
//!
//! Behaves like a session host: it owns the authoritative session state,
//! accumulates metrics, evaluates its own copy of the goals, and pushes
//! every change through the registered callback.

use crate::host::{
    ExerciseCapabilities, ExerciseConfig, HostCallback, HostEvent, HostSessionInfo, HostState,
    SensorHost, WarmUpConfig,
};
use crate::{ActivityType, Error, Goal, MetricsSnapshot, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Cumulative readings reported by the simulated sensors
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSample {
    pub heart_rate: Option<f64>,
    pub calories_total: f64,
    pub distance_total: f64,
    pub active: Duration,
}

struct HostInner {
    capabilities: ExerciseCapabilities,
    info: HostSessionInfo,
    heart_rate_sum: f64,
    heart_rate_count: u32,
    prepare_failure: Option<String>,
    start_failure: Option<String>,
    start_calls: usize,
}

pub struct SimulatedHost {
    inner: Mutex<HostInner>,
    callback: Mutex<Option<Arc<dyn HostCallback>>>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    /// A host that supports every metric and goal
    pub fn new() -> Self {
        Self::with_capabilities(ExerciseCapabilities::full())
    }

    pub fn with_capabilities(capabilities: ExerciseCapabilities) -> Self {
        Self {
            inner: Mutex::new(HostInner {
                capabilities,
                info: HostSessionInfo::idle(),
                heart_rate_sum: 0.0,
                heart_rate_count: 0,
                prepare_failure: None,
                start_failure: None,
                start_calls: 0,
            }),
            callback: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<HostEvent>) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => events.into_iter().for_each(|e| callback.on_event(e)),
            None => tracing::debug!("No callback registered, dropping {} host events", events.len()),
        }
    }

    /// Make the next `prepare` fail with the given message
    pub fn fail_prepare(&self, message: impl Into<String>) {
        self.lock().prepare_failure = Some(message.into());
    }

    /// Make the next `start` fail with the given message
    pub fn fail_start(&self, message: impl Into<String>) {
        self.lock().start_failure = Some(message.into());
    }

    pub fn state(&self) -> HostState {
        self.lock().info.state
    }

    /// Number of start requests that actually reached the host
    pub fn start_calls(&self) -> usize {
        self.lock().start_calls
    }

    /// Report new cumulative sensor readings.
    ///
    /// Emits a metrics update followed by a goal notification for every
    /// host-side goal the readings satisfy for the first time.
    pub fn report(&self, sample: MetricsSample) {
        let events = {
            let mut inner = self.lock();
            if !inner.info.state.is_in_progress() {
                tracing::debug!("Ignoring sensor sample outside of a session");
                return;
            }
            if let Some(hr) = sample.heart_rate {
                inner.heart_rate_sum += hr;
                inner.heart_rate_count += 1;
            }
            let now = Utc::now();
            let average = if inner.heart_rate_count > 0 {
                inner.heart_rate_sum / f64::from(inner.heart_rate_count)
            } else {
                0.0
            };
            let snapshot = MetricsSnapshot {
                heart_rate: sample.heart_rate,
                heart_rate_average: average,
                calories_total: sample.calories_total,
                distance_total: sample.distance_total,
                active_duration: crate::ActiveDurationCheckpoint {
                    base: sample.active,
                    checkpoint: now,
                },
                timestamp: now,
            };

            let mut events = vec![HostEvent::Metrics(snapshot.clone())];
            for goal in inner.info.goals.iter_mut().filter(|g| !g.met) {
                if goal.is_satisfied_by(snapshot.value_of(goal.metric)) {
                    goal.met = true;
                    events.push(HostEvent::GoalAchieved(goal.metric));
                }
            }
            inner.info.metrics = Some(snapshot);
            events
        };
        self.emit(events);
    }

    /// Pause on the host's own initiative (user stopped moving)
    pub fn auto_pause(&self) {
        if self.transition_if(HostState::Active, HostState::AutoPaused) {
            self.emit(vec![HostEvent::StateChanged(HostState::AutoPaused)]);
        }
    }

    /// Resume after an auto-pause
    pub fn auto_resume(&self) {
        if self.transition_if(HostState::AutoPaused, HostState::Active) {
            self.emit(vec![
                HostEvent::StateChanged(HostState::AutoResuming),
                HostEvent::StateChanged(HostState::Active),
            ]);
        }
    }

    /// End the session from the host side (e.g. from the watch face)
    pub fn end_externally(&self) {
        let ended = {
            let mut inner = self.lock();
            if inner.info.state.is_in_progress() {
                inner.info.state = HostState::Ended;
                true
            } else {
                false
            }
        };
        if ended {
            self.emit(vec![HostEvent::StateChanged(HostState::Ended)]);
        }
    }

    /// Push a host-side failure notification
    pub fn raise_error(&self, message: impl Into<String>) {
        self.emit(vec![HostEvent::Failed(message.into())]);
    }

    fn transition_if(&self, from: HostState, to: HostState) -> bool {
        let mut inner = self.lock();
        if inner.info.state == from {
            inner.info.state = to;
            true
        } else {
            false
        }
    }

    fn set_state(&self, state: HostState) {
        self.lock().info.state = state;
        self.emit(vec![HostEvent::StateChanged(state)]);
    }
}

#[async_trait]
impl SensorHost for SimulatedHost {
    async fn capabilities(&self, activity: ActivityType) -> Result<ExerciseCapabilities> {
        tracing::debug!("Capability query for {:?}", activity);
        Ok(self.lock().capabilities.clone())
    }

    async fn prepare(&self, config: &WarmUpConfig) -> Result<()> {
        {
            let mut inner = self.lock();
            if let Some(message) = inner.prepare_failure.take() {
                return Err(Error::Host(message));
            }
            if inner.info.state.is_in_progress() {
                return Err(Error::Host("cannot warm up during a session".into()));
            }
        }
        tracing::debug!("Warming up sensors: {:?}", config.metrics);
        self.set_state(HostState::Preparing);
        Ok(())
    }

    async fn start(&self, config: &ExerciseConfig) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.start_calls += 1;
            if let Some(message) = inner.start_failure.take() {
                return Err(Error::Host(message));
            }
            if inner.info.state.is_in_progress() {
                return Err(Error::Host("a session is already running".into()));
            }
            let now = Utc::now();
            inner.heart_rate_sum = 0.0;
            inner.heart_rate_count = 0;
            inner.info = HostSessionInfo {
                session_id: Some(config.session_id),
                state: HostState::Active,
                started_at: Some(now),
                metrics: Some(MetricsSnapshot::empty(now)),
                goals: config.goals.iter().cloned().map(reset_goal).collect(),
            };
        }
        self.emit(vec![HostEvent::StateChanged(HostState::Active)]);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, HostState::Active | HostState::AutoPaused) {
            return Err(Error::Host(format!("cannot pause from {:?}", state)));
        }
        self.set_state(HostState::UserPaused);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, HostState::UserPaused | HostState::AutoPaused) {
            return Err(Error::Host(format!("cannot resume from {:?}", state)));
        }
        self.set_state(HostState::Active);
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        if !self.state().is_in_progress() {
            return Err(Error::Host("no session to end".into()));
        }
        self.set_state(HostState::Ending);
        self.set_state(HostState::Ended);
        Ok(())
    }

    async fn session_info(&self) -> Result<HostSessionInfo> {
        Ok(self.lock().info.clone())
    }

    fn set_callback(&self, callback: Arc<dyn HostCallback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn clear_callback(&self) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn reset_goal(mut goal: Goal) -> Goal {
    goal.met = false;
    goal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GoalMetric, SessionId};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<HostEvent>>);

    impl HostCallback for Recorder {
        fn on_event(&self, event: HostEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn config(goals: Vec<Goal>) -> ExerciseConfig {
        ExerciseConfig {
            session_id: SessionId(7),
            activity: ActivityType::Running,
            metrics: vec![],
            goals,
            auto_pause: true,
        }
    }

    #[tokio::test]
    async fn test_host_goal_fires_once() {
        let host = SimulatedHost::new();
        let recorder = Arc::new(Recorder::default());
        host.set_callback(recorder.clone());
        host.start(&config(vec![Goal::new(GoalMetric::Calories, 100.0)]))
            .await
            .unwrap();

        for calories in [50.0, 120.0, 180.0] {
            host.report(MetricsSample {
                calories_total: calories,
                ..Default::default()
            });
        }

        let goal_events = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, HostEvent::GoalAchieved(_)))
            .count();
        assert_eq!(goal_events, 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_by_host() {
        let host = SimulatedHost::new();
        host.start(&config(vec![])).await.unwrap();
        assert!(host.start(&config(vec![])).await.is_err());
        assert_eq!(host.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_heart_rate_average() {
        let host = SimulatedHost::new();
        host.start(&config(vec![])).await.unwrap();
        host.report(MetricsSample {
            heart_rate: Some(120.0),
            ..Default::default()
        });
        host.report(MetricsSample {
            heart_rate: Some(140.0),
            ..Default::default()
        });

        let info = host.session_info().await.unwrap();
        assert_eq!(info.metrics.unwrap().heart_rate_average, 130.0);
    }

    #[tokio::test]
    async fn test_auto_pause_only_from_active() {
        let host = SimulatedHost::new();
        host.auto_pause();
        assert_eq!(host.state(), HostState::Idle);

        host.start(&config(vec![])).await.unwrap();
        host.auto_pause();
        assert_eq!(host.state(), HostState::AutoPaused);
        host.auto_resume();
        assert_eq!(host.state(), HostState::Active);
    }
}
