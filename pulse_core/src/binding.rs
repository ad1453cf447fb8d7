//! Binding between the observing process and the session host.
//!
//! The host outlives the UI. Commands ask the binding for a host handle;
//! while disconnected they are parked on a FIFO pending queue that is
//! drained on the `Disconnected -> Connected` edge. Disconnecting only drops
//! the handle, it never touches the running session.

use crate::host::SensorHost;
use crate::{ConnectionState, Error, Result, SessionState};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};

pub type HostHandle = Arc<dyn SensorHost>;

struct PendingCommand {
    label: &'static str,
    waiter: oneshot::Sender<HostHandle>,
}

#[derive(Default)]
struct BindingInner {
    host: Option<HostHandle>,
    pending: VecDeque<PendingCommand>,
}

pub struct Binding {
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<BindingInner>,
}

impl Default for Binding {
    fn default() -> Self {
        Self::new()
    }
}

impl Binding {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            inner: Mutex::new(BindingInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BindingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replay-latest view of the connection
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn pending_commands(&self) -> usize {
        self.lock().pending.len()
    }

    /// Bind to a host and release every parked command in order
    pub async fn connect(&self, host: HostHandle) {
        let session_state = host_state(host.as_ref()).await;

        let drained = {
            let mut inner = self.lock();
            inner.host = Some(Arc::clone(&host));
            std::mem::take(&mut inner.pending)
        };
        self.state_tx
            .send_replace(ConnectionState::Connected(session_state.clone()));
        tracing::info!(
            "Bound to session host (host state: {}), releasing {} pending commands",
            session_state,
            drained.len()
        );

        for command in drained {
            if command.waiter.send(Arc::clone(&host)).is_err() {
                tracing::debug!("Pending {} was abandoned before connect", command.label);
            }
        }
    }

    /// Drop the host handle. The host keeps running its session.
    pub fn disconnect(&self) {
        let was_connected = self.lock().host.take().is_some();
        if was_connected {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            tracing::info!("Unbound from session host");
        }
    }

    /// Re-read the host state into `Connected(state)`
    pub async fn refresh(&self) {
        let host = self.lock().host.clone();
        if let Some(host) = host {
            let state = host_state(host.as_ref()).await;
            self.state_tx.send_replace(ConnectionState::Connected(state));
        }
    }

    /// The bound host, without waiting
    pub fn current_host(&self) -> Option<HostHandle> {
        self.lock().host.clone()
    }

    /// Get the host, waiting for the next connect if currently unbound
    pub async fn host(&self, label: &'static str) -> Result<HostHandle> {
        let rx = {
            let mut inner = self.lock();
            if let Some(host) = &inner.host {
                return Ok(Arc::clone(host));
            }
            let (waiter, rx) = oneshot::channel();
            inner.pending.push_back(PendingCommand { label, waiter });
            tracing::debug!("{} queued until the session host is bound", label);
            rx
        };
        rx.await
            .map_err(|_| Error::State(format!("binding dropped before {} could run", label)))
    }
}

async fn host_state(host: &dyn SensorHost) -> SessionState {
    match host.session_info().await {
        Ok(info) => info.state.as_session_state(),
        Err(e) => {
            tracing::warn!("Unable to read host session state: {}", e);
            SessionState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ExerciseConfig;
    use crate::simulator::SimulatedHost;
    use crate::{ActivityType, SessionId};
    use std::time::Duration;

    #[tokio::test]
    async fn test_command_waits_for_connect() {
        let binding = Arc::new(Binding::new());
        let waiting = {
            let binding = Arc::clone(&binding);
            tokio::spawn(async move { binding.host("start").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(binding.pending_commands(), 1);
        assert!(!waiting.is_finished());

        binding.connect(Arc::new(SimulatedHost::new())).await;
        waiting.await.unwrap().unwrap();
        assert_eq!(binding.pending_commands(), 0);
        assert_eq!(binding.state(), ConnectionState::Connected(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_host_session() {
        let binding = Binding::new();
        let host = Arc::new(SimulatedHost::new());
        binding.connect(host.clone()).await;

        host.start(&ExerciseConfig {
            session_id: SessionId(42),
            activity: ActivityType::Running,
            metrics: vec![],
            goals: vec![],
            auto_pause: false,
        })
        .await
        .unwrap();

        let mut rx = binding.subscribe();
        binding.disconnect();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Disconnected);
        assert!(host.state().is_in_progress());

        binding.connect(host.clone()).await;
        assert_eq!(binding.state(), ConnectionState::Connected(SessionState::Active));
    }

    #[tokio::test]
    async fn test_abandoned_command_does_not_block_connect() {
        let binding = Arc::new(Binding::new());
        let abandoned = {
            let binding = Arc::clone(&binding);
            tokio::spawn(async move { binding.host("pause").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        binding.connect(Arc::new(SimulatedHost::new())).await;
        assert_eq!(binding.pending_commands(), 0);
        assert!(binding.host("resume").await.is_ok());
    }
}
