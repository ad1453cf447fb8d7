//! Exercise-session lifecycle controller.
//!
//! Owns the session state machine:
//!
//! ```text
//! Idle -> Preparing -> Active <-> Paused -> Ending -> Ended
//!            (any non-terminal state) -> Error
//! ```
//!
//! Commands are serialized through a command lock, wait for the binding to
//! supply a host, validate against both local and host state, and only then
//! dispatch. Explicit user transitions emit a `session` sync event; host
//! transitions (auto-pause, auto-resume, external end) update local state
//! without echoing anything back across the transport.
//!
//! Host callbacks land in a bounded broadcast buffer (`HostEventAdapter`)
//! that a spawned `EventPump` drains into the controller. Results are
//! republished on a replay-latest `SessionUpdate` stream.

use crate::binding::{Binding, HostHandle};
use crate::capability::CapabilityNegotiator;
use crate::config::Config;
use crate::goals::{GoalEvaluator, GoalThresholds};
use crate::host::{
    ExerciseConfig, HostCallback, HostEvent, HostSessionInfo, HostState, SensorHost, WarmUpConfig,
};
use crate::stream::{ReplayBroadcast, Subscription};
use crate::sync::SyncBridge;
use crate::wire::SessionTag;
use crate::{
    ActivityType, CommandOutcome, Error, ExerciseSession, MetricType, MetricsSnapshot, NoOpReason,
    Result, SessionId, SessionState, SessionSummary, SessionUpdate, TransitionOrigin,
};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Controller tuning, usually derived from `Config`
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub activity: ActivityType,
    /// Metrics without which a session cannot start
    pub required_metrics: Vec<MetricType>,
    /// Metrics tracked when the host supports them
    pub tracked_metrics: Vec<MetricType>,
    /// Metrics warmed up by `prepare`
    pub warm_up_metrics: Vec<MetricType>,
    pub thresholds: GoalThresholds,
    pub auto_pause: bool,
    pub update_buffer: usize,
    pub host_event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            activity: ActivityType::Running,
            required_metrics: vec![MetricType::HeartRate, MetricType::Calories],
            tracked_metrics: vec![
                MetricType::HeartRate,
                MetricType::Calories,
                MetricType::Distance,
                MetricType::Duration,
                MetricType::Location,
            ],
            warm_up_metrics: vec![MetricType::HeartRate, MetricType::Location],
            thresholds: GoalThresholds::default(),
            auto_pause: true,
            update_buffer: 64,
            host_event_buffer: 32,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            activity: config.exercise.activity,
            thresholds: GoalThresholds {
                distance_meters: config.exercise.distance_goal_meters,
                duration: Duration::from_secs(config.exercise.duration_goal_secs),
            },
            auto_pause: config.exercise.auto_pause,
            update_buffer: config.sync.update_buffer,
            host_event_buffer: config.sync.host_event_buffer,
            ..Self::default()
        }
    }
}

/// Adapts the host's callback interface into a bounded broadcast buffer.
///
/// Never blocks the host: when the pump falls behind, the oldest events
/// are dropped.
pub struct HostEventAdapter {
    tx: broadcast::Sender<HostEvent>,
}

impl HostEventAdapter {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

impl HostCallback for HostEventAdapter {
    fn on_event(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No event pump attached, host event dropped");
        }
    }
}

/// Handle to the task draining host events into the controller.
///
/// Dropping it cancels the subscription; the host session keeps running.
pub struct EventPump {
    handle: JoinHandle<()>,
}

impl EventPump {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ControllerState {
    state: SessionState,
    session: Option<ExerciseSession>,
    goals: GoalEvaluator,
    last_summary: Option<SessionSummary>,
}

pub struct SessionController {
    settings: SessionSettings,
    binding: Arc<Binding>,
    sync: Arc<SyncBridge>,
    updates: ReplayBroadcast<SessionUpdate>,
    events: Arc<HostEventAdapter>,
    inner: Mutex<ControllerState>,
    command_lock: tokio::sync::Mutex<()>,
}

impl SessionController {
    pub fn new(settings: SessionSettings, binding: Arc<Binding>, sync: Arc<SyncBridge>) -> Arc<Self> {
        let updates = ReplayBroadcast::new(settings.update_buffer);
        updates.publish(SessionUpdate::StateChanged {
            session_id: None,
            state: SessionState::Idle,
            origin: TransitionOrigin::User,
        });
        Arc::new(Self {
            events: Arc::new(HostEventAdapter::new(settings.host_event_buffer)),
            settings,
            binding,
            sync,
            updates,
            inner: Mutex::new(ControllerState {
                state: SessionState::Idle,
                session: None,
                goals: GoalEvaluator::default(),
                last_summary: None,
            }),
            command_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn session(&self) -> Option<ExerciseSession> {
        self.lock().session.clone()
    }

    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.lock().last_summary.clone()
    }

    /// Subscribe to state, metrics and goal updates (current value first)
    pub fn subscribe(&self) -> Subscription<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Start draining host callbacks into this controller
    pub fn spawn_event_pump(self: &Arc<Self>) -> EventPump {
        let mut rx = self.events.subscribe();
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => controller.handle_host_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event pump lagged, dropped {} oldest host events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        EventPump { handle }
    }

    /// Wait for the binding and make sure the host reports to us
    async fn host(&self, label: &'static str) -> Result<HostHandle> {
        let host: Arc<dyn SensorHost> = self.binding.host(label).await?;
        host.set_callback(Arc::clone(&self.events) as Arc<dyn HostCallback>);
        Ok(host)
    }

    fn transition(&self, inner: &mut ControllerState, state: SessionState, origin: TransitionOrigin) {
        if inner.state == state {
            return;
        }
        tracing::info!("Session state {} -> {} ({:?})", inner.state, state, origin);
        inner.state = state.clone();
        if let Some(session) = inner.session.as_mut() {
            session.state = state.clone();
        }
        self.updates.publish(SessionUpdate::StateChanged {
            session_id: inner.session.as_ref().map(|s| s.id),
            state,
            origin,
        });
    }

    /// Mirror a session the host is already running
    fn adopt(&self, inner: &mut ControllerState, info: &HostSessionInfo, session_id: SessionId) {
        let known = inner.session.as_ref().map(|s| s.id) == Some(session_id);
        if !known {
            let started_at = info.started_at.unwrap_or_else(Utc::now);
            let mut session = ExerciseSession::new(session_id, started_at, info.goals.clone());
            if let Some(metrics) = info.metrics.clone() {
                session.metrics = metrics;
            }
            inner.session = Some(session);
            inner.goals = GoalEvaluator::from_goals(info.goals.clone());
            inner.last_summary = None;
            tracing::info!("Adopted host session {}", session_id);
        }
        self.transition(inner, info.state.as_session_state(), TransitionOrigin::Host);
    }

    /// Record a host failure as the visible `Error` state
    fn fail(&self, message: String) -> CommandOutcome {
        tracing::warn!("Session host failure: {}", message);
        let mut inner = self.lock();
        self.transition(
            &mut inner,
            SessionState::Error(message.clone()),
            TransitionOrigin::User,
        );
        CommandOutcome::Failed(message)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Warm up the sensors ahead of `start`
    pub async fn prepare(&self) -> Result<CommandOutcome> {
        let _guard = self.command_lock.lock().await;
        let current = self.state();
        if !current.accepts_new_session() {
            tracing::debug!("prepare ignored in state {}", current);
            return Ok(CommandOutcome::NoOp(NoOpReason::InvalidTransition));
        }

        let host = self.host("prepare").await?;
        {
            let mut inner = self.lock();
            self.transition(&mut inner, SessionState::Preparing, TransitionOrigin::User);
        }

        let warm_up = WarmUpConfig {
            activity: self.settings.activity,
            metrics: self.settings.warm_up_metrics.clone(),
        };
        if let Err(e) = host.prepare(&warm_up).await {
            return Ok(self.fail(e.to_string()));
        }
        self.binding.refresh().await;
        Ok(CommandOutcome::Applied)
    }

    /// Start tracking a new session
    pub async fn start(&self, session_id: SessionId) -> Result<CommandOutcome> {
        if !session_id.is_valid() {
            tracing::warn!("Rejecting start with uninitialized session id");
            return Err(Error::InvalidSession(session_id.get()));
        }

        let _guard = self.command_lock.lock().await;
        {
            let inner = self.lock();
            if inner.state.is_in_progress() {
                tracing::info!("Start ignored, session already {}", inner.state);
                return Ok(CommandOutcome::NoOp(NoOpReason::DuplicateStart));
            }
            if !(inner.state.accepts_new_session() || inner.state == SessionState::Preparing) {
                return Ok(CommandOutcome::NoOp(NoOpReason::InvalidTransition));
            }
        }

        let host = self.host("start").await?;
        let info = match host.session_info().await {
            Ok(info) => info,
            Err(e) => return Ok(self.fail(e.to_string())),
        };
        if info.in_progress() {
            tracing::info!(
                "Start ignored, host already runs session {:?}",
                info.session_id
            );
            if let Some(running) = info.session_id {
                let mut inner = self.lock();
                self.adopt(&mut inner, &info, running);
            }
            return Ok(CommandOutcome::NoOp(NoOpReason::DuplicateStart));
        }

        let negotiator = CapabilityNegotiator::new(
            self.settings.activity,
            self.settings.required_metrics.clone(),
        );
        let capabilities = match negotiator.negotiate(host.as_ref()).await {
            Ok(caps) => caps,
            Err(e) => return Ok(self.fail(e.to_string())),
        };
        let goals = GoalEvaluator::negotiate(&self.settings.thresholds, &capabilities);

        let config = ExerciseConfig {
            session_id,
            activity: self.settings.activity,
            metrics: CapabilityNegotiator::tracked_metrics(
                &capabilities,
                &self.settings.tracked_metrics,
            ),
            goals: goals.goals().to_vec(),
            auto_pause: self.settings.auto_pause && capabilities.supports_auto_pause,
        };
        if let Err(e) = host.start(&config).await {
            return Ok(self.fail(e.to_string()));
        }

        {
            let mut inner = self.lock();
            inner.session = Some(ExerciseSession::new(
                session_id,
                Utc::now(),
                goals.goals().to_vec(),
            ));
            inner.goals = goals;
            inner.last_summary = None;
            self.transition(&mut inner, SessionState::Active, TransitionOrigin::User);
        }
        tracing::info!(
            "Session {} started with {} goals",
            session_id,
            config.goals.len()
        );

        self.sync.send_session_state(SessionTag::Start).await;
        self.binding.refresh().await;
        Ok(CommandOutcome::Applied)
    }

    pub async fn pause(&self) -> Result<CommandOutcome> {
        self.toggle_pause(true).await
    }

    pub async fn resume(&self) -> Result<CommandOutcome> {
        self.toggle_pause(false).await
    }

    async fn toggle_pause(&self, pause: bool) -> Result<CommandOutcome> {
        let label = if pause { "pause" } else { "resume" };
        let (from, to, tag) = if pause {
            (SessionState::Active, SessionState::Paused, SessionTag::Pause)
        } else {
            (SessionState::Paused, SessionState::Active, SessionTag::Resume)
        };

        let _guard = self.command_lock.lock().await;
        {
            let inner = self.lock();
            if inner.state != from {
                let reason = if inner.state.is_in_progress() {
                    NoOpReason::InvalidTransition
                } else {
                    NoOpReason::NothingInProgress
                };
                tracing::debug!("{} ignored in state {}", label, inner.state);
                return Ok(CommandOutcome::NoOp(reason));
            }
        }

        let host = self.host(label).await?;
        let info = match host.session_info().await {
            Ok(info) => info,
            Err(e) => return Ok(self.fail(e.to_string())),
        };
        if !info.in_progress() {
            tracing::info!("{} ignored, host has no session in progress", label);
            return Ok(CommandOutcome::NoOp(NoOpReason::NothingInProgress));
        }

        let dispatched = if pause { host.pause().await } else { host.resume().await };
        if let Err(e) = dispatched {
            return Ok(self.fail(e.to_string()));
        }

        {
            let mut inner = self.lock();
            self.transition(&mut inner, to, TransitionOrigin::User);
        }
        self.sync.send_session_state(tag).await;
        self.binding.refresh().await;
        Ok(CommandOutcome::Applied)
    }

    /// End the session and deliver its summary
    pub async fn end(&self) -> Result<CommandOutcome> {
        let _guard = self.command_lock.lock().await;
        {
            let inner = self.lock();
            if !matches!(inner.state, SessionState::Active | SessionState::Paused) {
                tracing::debug!("end ignored in state {}", inner.state);
                return Ok(CommandOutcome::NoOp(NoOpReason::NothingInProgress));
            }
        }

        let host = self.host("end").await?;
        let was_active = {
            let mut inner = self.lock();
            // The host may have ended the session while we waited for it
            let was_active = match inner.state {
                SessionState::Active => true,
                SessionState::Paused => false,
                _ => {
                    tracing::debug!("end ignored in state {}", inner.state);
                    return Ok(CommandOutcome::NoOp(NoOpReason::NothingInProgress));
                }
            };
            self.transition(&mut inner, SessionState::Ending, TransitionOrigin::User);
            was_active
        };
        self.sync.send_session_state(SessionTag::Stop).await;

        let final_metrics = match host.session_info().await {
            Ok(info) => {
                if info.in_progress() {
                    if let Err(e) = host.end().await {
                        return Ok(self.fail(e.to_string()));
                    }
                } else {
                    tracing::info!("Host already ended the session");
                }
                host.session_info().await.ok().and_then(|i| i.metrics)
            }
            Err(e) => return Ok(self.fail(e.to_string())),
        };

        self.finish(final_metrics, was_active, TransitionOrigin::User).await?;
        self.binding.refresh().await;
        Ok(CommandOutcome::Applied)
    }

    /// Close out the session: Ended, summary, delivery.
    ///
    /// A user end finishes from `Ending`, a host end from `Active`/`Paused`;
    /// any other state means the session was already closed out.
    async fn finish(
        &self,
        final_metrics: Option<MetricsSnapshot>,
        was_active: bool,
        origin: TransitionOrigin,
    ) -> Result<()> {
        let summary = {
            let mut inner = self.lock();
            let finishable = match origin {
                TransitionOrigin::User => inner.state == SessionState::Ending,
                TransitionOrigin::Host => {
                    matches!(inner.state, SessionState::Active | SessionState::Paused)
                }
            };
            if !finishable {
                tracing::debug!("Session already closed out in state {}", inner.state);
                return Ok(());
            }
            let Some(session) = inner.session.as_mut() else {
                return Err(Error::State("no session to finish".into()));
            };
            if let Some(metrics) = final_metrics {
                session.metrics = metrics;
            }
            let now = Utc::now();
            session.metrics.active_duration =
                session.metrics.active_duration.advance_to(now, was_active);
            session.end_timestamp = Some(now);
            let summary = SessionSummary::from_session(session)?;
            inner.last_summary = Some(summary.clone());
            self.transition(&mut inner, SessionState::Ended, origin);
            summary
        };

        tracing::info!(
            "Session {} ended: {:.0} kcal, {:.0} m, {} s",
            summary.session_id,
            summary.calories,
            summary.distance,
            summary.duration_sec
        );
        self.sync.send_summary(&summary).await?;
        Ok(())
    }

    /// Adopt whatever session the host is running after a UI restart
    pub async fn reattach(&self) -> Result<CommandOutcome> {
        let _guard = self.command_lock.lock().await;
        let host = self.host("reattach").await?;
        let info = match host.session_info().await {
            Ok(info) => info,
            Err(e) => return Ok(self.fail(e.to_string())),
        };

        let session_id = match info.session_id {
            Some(id) if info.in_progress() => id,
            _ => {
                tracing::debug!("Nothing to reattach to");
                return Ok(CommandOutcome::NoOp(NoOpReason::NothingInProgress));
            }
        };

        let mut inner = self.lock();
        self.adopt(&mut inner, &info, session_id);
        Ok(CommandOutcome::Applied)
    }

    /// Stop receiving host callbacks and unbind; the host session keeps running
    pub fn detach(&self) {
        if let Some(host) = self.binding.current_host() {
            host.clear_callback();
        }
        self.binding.disconnect();
    }

    // ========================================================================
    // Host events
    // ========================================================================

    async fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::Metrics(snapshot) => self.on_metrics(snapshot).await,
            HostEvent::GoalAchieved(metric) => {
                let mut inner = self.lock();
                let Some(session_id) = inner.session.as_ref().map(|s| s.id) else {
                    return;
                };
                if let Some(goal) = inner.goals.mark_achieved(metric) {
                    tracing::info!("Goal met: {:?} >= {}", goal.metric, goal.threshold);
                    let goals = inner.goals.goals().to_vec();
                    if let Some(session) = inner.session.as_mut() {
                        session.goals = goals;
                    }
                    self.updates.publish(SessionUpdate::GoalMet { session_id, goal });
                }
            }
            HostEvent::StateChanged(state) => self.on_host_state(state).await,
            HostEvent::Failed(message) => {
                let mut inner = self.lock();
                if !matches!(inner.state, SessionState::Ended | SessionState::Error(_)) {
                    tracing::warn!("Session host reported failure: {}", message);
                    self.transition(&mut inner, SessionState::Error(message), TransitionOrigin::Host);
                }
            }
        }
    }

    async fn on_metrics(&self, mut snapshot: MetricsSnapshot) {
        let (session_id, newly_met) = {
            let mut inner = self.lock();
            if !matches!(inner.state, SessionState::Active | SessionState::Paused) {
                tracing::debug!("Ignoring metrics outside an active session");
                return;
            }
            let running = inner.state == SessionState::Active;
            snapshot.active_duration = snapshot.active_duration.advance_to(Utc::now(), running);
            let newly_met = inner.goals.observe(&snapshot);
            let goals = inner.goals.goals().to_vec();
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            session.metrics = snapshot.clone();
            session.goals = goals;
            (session.id, newly_met)
        };

        let heart_rate = snapshot.heart_rate.map(|hr| hr.round() as i32).unwrap_or(0);
        self.sync
            .send_metrics(
                session_id,
                heart_rate,
                snapshot.calories_total.round() as i32,
                snapshot.active_duration.base.as_secs() as i32,
            )
            .await;

        self.updates.publish(SessionUpdate::Metrics {
            session_id,
            snapshot,
        });
        for goal in newly_met {
            tracing::info!("Goal met: {:?} >= {}", goal.metric, goal.threshold);
            self.updates.publish(SessionUpdate::GoalMet { session_id, goal });
        }
    }

    /// Host-initiated transitions; echoes of our own commands are skipped
    async fn on_host_state(&self, host_state: HostState) {
        let ended_externally = {
            let mut inner = self.lock();
            let local = inner.state.clone();
            match (host_state, local) {
                (HostState::AutoPaused, SessionState::Active) => {
                    self.transition(&mut inner, SessionState::Paused, TransitionOrigin::Host);
                    None
                }
                (HostState::AutoResuming, SessionState::Paused) => {
                    self.transition(&mut inner, SessionState::Active, TransitionOrigin::Host);
                    None
                }
                (HostState::Ended, SessionState::Active) => Some(true),
                (HostState::Ended, SessionState::Paused) => Some(false),
                (other, local) => {
                    tracing::trace!("Host state {:?} needs no action in {}", other, local);
                    None
                }
            }
        };

        if let Some(was_active) = ended_externally {
            tracing::info!("Session host ended the session on its own");
            let final_metrics = match self.binding.current_host() {
                Some(host) => host.session_info().await.ok().and_then(|i| i.metrics),
                None => None,
            };
            if let Err(e) = self.finish(final_metrics, was_active, TransitionOrigin::Host).await {
                tracing::warn!("Unable to finish externally ended session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ExerciseCapabilities;
    use crate::simulator::{MetricsSample, SimulatedHost};
    use crate::transport::{InboundFrame, MemoryNetwork, NodeId, Transport};
    use crate::wire::{SyncMessage, SUMMARY_PATH};
    use crate::{ConnectionState, GoalMetric};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct Harness {
        controller: Arc<SessionController>,
        binding: Arc<Binding>,
        host: Arc<SimulatedHost>,
        network: Arc<MemoryNetwork>,
        companion_id: NodeId,
        companion_rx: UnboundedReceiver<InboundFrame>,
        pump: EventPump,
    }

    async fn harness() -> Harness {
        crate::logging::init_test();
        let network = MemoryNetwork::new();
        let (wrist, _wrist_rx) = network.join();
        let (companion, companion_rx) = network.join();
        wrist.init().await.unwrap();

        let sync = Arc::new(SyncBridge::new(Arc::new(wrist)));
        let binding = Arc::new(Binding::new());
        let controller =
            SessionController::new(SessionSettings::default(), binding.clone(), sync);
        let pump = controller.spawn_event_pump();

        let host = Arc::new(SimulatedHost::new());
        binding.connect(host.clone()).await;

        Harness {
            controller,
            binding,
            host,
            network,
            companion_id: companion.local_id(),
            companion_rx,
            pump,
        }
    }

    /// Controller with no companion and no pump
    fn bare_controller() -> (Arc<SessionController>, Arc<Binding>) {
        crate::logging::init_test();
        let network = MemoryNetwork::new();
        let (wrist, _rx) = network.join();
        let sync = Arc::new(SyncBridge::new(Arc::new(wrist)));
        let binding = Arc::new(Binding::new());
        let controller =
            SessionController::new(SessionSettings::default(), binding.clone(), sync);
        (controller, binding)
    }

    fn drain(rx: &mut UnboundedReceiver<InboundFrame>) -> Vec<SyncMessage> {
        let mut messages = Vec::new();
        while let Ok(inbound) = rx.try_recv() {
            messages.push(SyncMessage::decode(&inbound.frame).unwrap());
        }
        messages
    }

    fn tags(messages: &[SyncMessage]) -> Vec<SessionTag> {
        messages
            .iter()
            .filter_map(|m| match m {
                SyncMessage::SessionState(tag) => Some(*tag),
                _ => None,
            })
            .collect()
    }

    fn summary_count(messages: &[SyncMessage]) -> usize {
        messages.iter().filter(|m| m.path() == SUMMARY_PATH).count()
    }

    fn states(updates: &[SessionUpdate]) -> Vec<SessionState> {
        updates
            .iter()
            .filter_map(|u| match u {
                SessionUpdate::StateChanged { state, .. } => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Receive until `pred` matches, returning everything seen
    async fn collect_until<F>(sub: &mut Subscription<SessionUpdate>, pred: F) -> Vec<SessionUpdate>
    where
        F: Fn(&SessionUpdate) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            let mut seen = Vec::new();
            loop {
                let update = sub.recv().await.expect("update stream closed");
                let done = pred(&update);
                seen.push(update);
                if done {
                    return seen;
                }
            }
        })
        .await
        .expect("timed out waiting for update")
    }

    fn is_metrics(total: f64) -> impl Fn(&SessionUpdate) -> bool {
        move |u| {
            matches!(u, SessionUpdate::Metrics { snapshot, .. } if snapshot.calories_total == total)
        }
    }

    fn sample(calories: f64) -> MetricsSample {
        MetricsSample {
            heart_rate: Some(140.0),
            calories_total: calories,
            distance_total: calories * 5.0,
            active: Duration::from_secs((calories * 2.0) as u64),
        }
    }

    #[tokio::test]
    async fn test_full_session() {
        let mut h = harness().await;
        let mut observer = h.controller.subscribe();
        let mut seen = Vec::new();

        assert!(h.controller.prepare().await.unwrap().is_applied());
        assert!(h.controller.start(SessionId(1000)).await.unwrap().is_applied());
        for total in [50.0, 180.0, 260.0] {
            h.host.report(sample(total));
            seen.extend(collect_until(&mut observer, is_metrics(total)).await);
        }
        assert!(h.controller.end().await.unwrap().is_applied());
        while let Some(update) = observer.try_recv() {
            seen.push(update);
        }

        assert_eq!(
            states(&seen),
            vec![
                SessionState::Idle,
                SessionState::Preparing,
                SessionState::Active,
                SessionState::Ending,
                SessionState::Ended,
            ]
        );
        let goals: Vec<_> = seen
            .iter()
            .filter_map(|u| match u {
                SessionUpdate::GoalMet { goal, .. } => Some(goal.metric),
                _ => None,
            })
            .collect();
        assert_eq!(goals, vec![GoalMetric::Calories]);

        let summary = h.controller.last_summary().unwrap();
        assert_eq!(summary.session_id, SessionId(1000));
        assert_eq!(summary.calories, 260.0);
        assert_eq!(summary.avg_heart_rate, 140);

        let messages = drain(&mut h.companion_rx);
        assert_eq!(tags(&messages), vec![SessionTag::Start, SessionTag::Stop]);
        assert_eq!(summary_count(&messages), 1);
        assert!(messages
            .iter()
            .any(|m| matches!(m, SyncMessage::MetricsUpdate(p) if p.calories == 260 && p.session_id == 1000)));
    }

    #[tokio::test]
    async fn test_double_start_is_single_session() {
        let mut h = harness().await;
        assert!(h.controller.start(SessionId(1000)).await.unwrap().is_applied());
        assert_eq!(
            h.controller.start(SessionId(2000)).await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::DuplicateStart)
        );
        assert_eq!(h.controller.session().unwrap().id, SessionId(1000));
        assert_eq!(h.host.start_calls(), 1);
        assert_eq!(tags(&drain(&mut h.companion_rx)), vec![SessionTag::Start]);
    }

    fn running_config(id: i64) -> ExerciseConfig {
        ExerciseConfig {
            session_id: SessionId(id),
            activity: ActivityType::Running,
            metrics: vec![],
            goals: vec![],
            auto_pause: false,
        }
    }

    #[tokio::test]
    async fn test_start_ignored_when_host_already_running() {
        let mut h = harness().await;
        h.host.start(&running_config(77)).await.unwrap();

        assert_eq!(
            h.controller.start(SessionId(1000)).await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::DuplicateStart)
        );
        assert_eq!(h.controller.state(), SessionState::Active);
        assert_eq!(h.controller.session().unwrap().id, SessionId(77));
        assert_eq!(h.host.start_calls(), 1);
        // Adopting is not a user start
        assert!(tags(&drain(&mut h.companion_rx)).is_empty());
    }

    #[tokio::test]
    async fn test_start_after_restart_adopts_host_session() {
        let host = Arc::new(SimulatedHost::new());
        host.start(&running_config(1000)).await.unwrap();
        host.report(sample(90.0));

        let (controller, binding) = bare_controller();
        binding.connect(host.clone()).await;

        assert_eq!(
            controller.start(SessionId(2000)).await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::DuplicateStart)
        );
        assert_eq!(controller.state(), SessionState::Active);
        let session = controller.session().unwrap();
        assert_eq!(session.id, SessionId(1000));
        assert_eq!(session.metrics.calories_total, 90.0);

        assert!(controller.end().await.unwrap().is_applied());
        assert_eq!(controller.state(), SessionState::Ended);
        assert_eq!(host.state(), HostState::Ended);
        let summary = controller.last_summary().unwrap();
        assert_eq!(summary.session_id, SessionId(1000));
        assert_eq!(summary.calories, 90.0);
        assert_eq!(host.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_session_id_rejected_before_dispatch() {
        let mut h = harness().await;
        assert!(matches!(
            h.controller.start(SessionId::UNSET).await,
            Err(Error::InvalidSession(0))
        ));
        assert_eq!(h.host.start_calls(), 0);
        assert!(drain(&mut h.companion_rx).is_empty());
        assert!(h.controller.last_summary().is_none());
    }

    #[tokio::test]
    async fn test_commands_without_session_are_no_ops() {
        let mut h = harness().await;
        let mut observer = h.controller.subscribe();
        // Replayed Idle
        assert!(observer.try_recv().is_some());

        assert_eq!(
            h.controller.end().await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::NothingInProgress)
        );
        assert_eq!(
            h.controller.pause().await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::NothingInProgress)
        );
        assert_eq!(
            h.controller.resume().await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::NothingInProgress)
        );
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(observer.try_recv().is_none());
        assert!(drain(&mut h.companion_rx).is_empty());
    }

    #[tokio::test]
    async fn test_double_pause_emits_one_event() {
        let mut h = harness().await;
        h.controller.start(SessionId(1000)).await.unwrap();
        assert!(h.controller.pause().await.unwrap().is_applied());
        assert_eq!(
            h.controller.pause().await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::InvalidTransition)
        );
        assert_eq!(h.controller.state(), SessionState::Paused);
        assert!(h.controller.resume().await.unwrap().is_applied());

        assert_eq!(
            tags(&drain(&mut h.companion_rx)),
            vec![SessionTag::Start, SessionTag::Pause, SessionTag::Resume]
        );
    }

    #[tokio::test]
    async fn test_auto_pause_does_not_echo() {
        let mut h = harness().await;
        let mut observer = h.controller.subscribe();
        h.controller.start(SessionId(1000)).await.unwrap();

        h.host.auto_pause();
        let seen = collect_until(&mut observer, |u| {
            matches!(u, SessionUpdate::StateChanged { state: SessionState::Paused, .. })
        })
        .await;
        assert!(matches!(
            seen.last(),
            Some(SessionUpdate::StateChanged {
                origin: TransitionOrigin::Host,
                ..
            })
        ));

        h.host.auto_resume();
        collect_until(&mut observer, |u| {
            matches!(
                u,
                SessionUpdate::StateChanged {
                    state: SessionState::Active,
                    origin: TransitionOrigin::Host,
                    ..
                }
            )
        })
        .await;

        assert_eq!(tags(&drain(&mut h.companion_rx)), vec![SessionTag::Start]);
    }

    #[tokio::test]
    async fn test_companion_unreachable_still_completes() {
        let mut h = harness().await;
        h.network.set_reachable(&h.companion_id, false);

        h.controller.start(SessionId(1000)).await.unwrap();
        assert!(h.controller.end().await.unwrap().is_applied());
        assert_eq!(h.controller.state(), SessionState::Ended);
        assert_eq!(
            h.controller.last_summary().unwrap().session_id,
            SessionId(1000)
        );
        assert!(drain(&mut h.companion_rx).is_empty());
    }

    #[tokio::test]
    async fn test_prepare_failure_becomes_error_state() {
        let h = harness().await;
        h.host.fail_prepare("heart rate sensor unavailable");

        let outcome = h.controller.prepare().await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Failed(_)));
        assert_eq!(
            h.controller.state(),
            SessionState::Error("Sensor host error: heart rate sensor unavailable".into())
        );

        // Error accepts a fresh session
        assert!(h.controller.start(SessionId(1001)).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_missing_capability_blocks_start() {
        let (controller, binding) = bare_controller();
        let mut caps = ExerciseCapabilities::full();
        caps.supported_metrics.remove(&MetricType::HeartRate);
        let host = Arc::new(SimulatedHost::with_capabilities(caps));
        binding.connect(host.clone()).await;

        let outcome = controller.start(SessionId(5)).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Failed(_)));
        assert!(matches!(controller.state(), SessionState::Error(_)));
        assert_eq!(host.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_waits_for_binding() {
        let (controller, binding) = bare_controller();

        let pending = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.start(SessionId(9)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(binding.pending_commands(), 1);
        assert_eq!(controller.state(), SessionState::Idle);

        binding.connect(Arc::new(SimulatedHost::new())).await;
        let outcome = pending.await.unwrap().unwrap();
        assert!(outcome.is_applied());
        assert_eq!(controller.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_reattach_after_ui_restart() {
        let h = harness().await;
        h.controller.start(SessionId(1000)).await.unwrap();
        h.host.report(sample(120.0));

        // The observing process goes away; the host keeps running
        h.controller.detach();
        let Harness {
            controller,
            host,
            pump,
            ..
        } = h;
        drop(pump);
        drop(controller);
        assert!(host.state().is_in_progress());

        let (revived, binding) = bare_controller();
        binding.connect(host.clone()).await;

        assert!(revived.reattach().await.unwrap().is_applied());
        assert_eq!(revived.state(), SessionState::Active);
        let session = revived.session().unwrap();
        assert_eq!(session.id, SessionId(1000));
        assert_eq!(session.metrics.calories_total, 120.0);
        assert!(session.goals.iter().any(|g| g.metric == GoalMetric::Calories));

        assert_eq!(
            revived.start(SessionId(2000)).await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::DuplicateStart)
        );
        revived.end().await.unwrap();
        assert_eq!(
            revived.last_summary().unwrap().session_id,
            SessionId(1000)
        );
    }

    #[tokio::test]
    async fn test_reattach_with_nothing_running() {
        let (controller, binding) = bare_controller();
        binding.connect(Arc::new(SimulatedHost::new())).await;
        assert_eq!(
            controller.reattach().await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::NothingInProgress)
        );
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_host_initiated_end_sends_summary_without_stop() {
        let mut h = harness().await;
        let mut observer = h.controller.subscribe();
        h.controller.start(SessionId(1000)).await.unwrap();

        h.host.end_externally();
        collect_until(&mut observer, |u| {
            matches!(
                u,
                SessionUpdate::StateChanged {
                    state: SessionState::Ended,
                    origin: TransitionOrigin::Host,
                    ..
                }
            )
        })
        .await;

        // The summary goes out right after Ended is published
        tokio::time::sleep(Duration::from_millis(20)).await;
        let messages = drain(&mut h.companion_rx);
        assert_eq!(tags(&messages), vec![SessionTag::Start]);
        assert_eq!(summary_count(&messages), 1);
    }

    #[tokio::test]
    async fn test_late_host_end_does_not_resend_summary() {
        let mut h = harness().await;
        h.controller.start(SessionId(1000)).await.unwrap();
        assert!(h.controller.end().await.unwrap().is_applied());
        let summary = h.controller.last_summary().unwrap();
        let mut observer = h.controller.subscribe();
        // Replayed Ended
        assert!(observer.try_recv().is_some());

        // Host end observed after the user end already closed the session
        h.controller
            .finish(None, true, TransitionOrigin::Host)
            .await
            .unwrap();
        h.controller.on_host_state(HostState::Ended).await;
        h.controller
            .finish(None, false, TransitionOrigin::User)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.controller.state(), SessionState::Ended);
        assert_eq!(h.controller.last_summary().unwrap(), summary);
        assert!(observer.try_recv().is_none());
        let messages = drain(&mut h.companion_rx);
        assert_eq!(summary_count(&messages), 1);
        assert_eq!(tags(&messages), vec![SessionTag::Start, SessionTag::Stop]);
    }

    #[tokio::test]
    async fn test_end_after_host_ended_is_no_op() {
        let mut h = harness().await;
        let mut observer = h.controller.subscribe();
        h.controller.start(SessionId(1000)).await.unwrap();

        h.host.end_externally();
        collect_until(&mut observer, |u| {
            matches!(u, SessionUpdate::StateChanged { state: SessionState::Ended, .. })
        })
        .await;
        assert_eq!(
            h.controller.end().await.unwrap(),
            CommandOutcome::NoOp(NoOpReason::NothingInProgress)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let messages = drain(&mut h.companion_rx);
        assert_eq!(summary_count(&messages), 1);
        assert_eq!(tags(&messages), vec![SessionTag::Start]);
    }

    #[tokio::test]
    async fn test_detach_stops_host_callbacks() {
        let h = harness().await;
        h.controller.start(SessionId(1000)).await.unwrap();

        h.controller.detach();
        assert_eq!(h.binding.state(), ConnectionState::Disconnected);
        h.host.report(sample(150.0));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.pump.is_running());
        assert_eq!(h.controller.session().unwrap().metrics.calories_total, 0.0);
        assert_eq!(h.host.state(), HostState::Active);
    }

    #[tokio::test]
    async fn test_metrics_duration_counts_time_since_checkpoint() {
        let mut h = harness().await;
        h.controller.start(SessionId(1000)).await.unwrap();
        let reported = |calories: f64| {
            let mut snapshot = MetricsSnapshot::empty(Utc::now());
            snapshot.calories_total = calories;
            snapshot.active_duration = crate::ActiveDurationCheckpoint {
                base: Duration::from_secs(30),
                checkpoint: Utc::now() - chrono::Duration::seconds(90),
            };
            HostEvent::Metrics(snapshot)
        };

        h.controller.handle_host_event(reported(10.0)).await;
        let active = h.controller.session().unwrap().metrics.active_duration.base;
        assert!(active >= Duration::from_secs(120));
        assert!(active < Duration::from_secs(125));
        let sent: Vec<i32> = drain(&mut h.companion_rx)
            .into_iter()
            .filter_map(|m| match m {
                SyncMessage::MetricsUpdate(p) => Some(p.duration_sec),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![120]);

        // Paused time is not counted
        h.controller.pause().await.unwrap();
        h.controller.handle_host_event(reported(20.0)).await;
        let session = h.controller.session().unwrap();
        assert_eq!(session.metrics.calories_total, 20.0);
        assert_eq!(session.metrics.active_duration.base, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_host_failure_event_sets_error() {
        let h = harness().await;
        let mut observer = h.controller.subscribe();
        h.controller.start(SessionId(1000)).await.unwrap();

        h.host.raise_error("sensor disconnected");
        collect_until(&mut observer, |u| {
            matches!(u, SessionUpdate::StateChanged { state: SessionState::Error(_), .. })
        })
        .await;
        assert_eq!(
            h.controller.state(),
            SessionState::Error("sensor disconnected".into())
        );
    }

    #[tokio::test]
    async fn test_dropping_pump_leaves_host_session_running() {
        let h = harness().await;
        h.controller.start(SessionId(1000)).await.unwrap();
        assert!(h.pump.is_running());

        let Harness { host, pump, .. } = h;
        drop(pump);
        assert_eq!(host.state(), HostState::Active);
    }
}
