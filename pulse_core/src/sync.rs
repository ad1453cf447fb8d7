//! Best-effort sync between the wrist host and its paired devices.
//!
//! Every outbound message is encoded once and sent to each reachable node
//! independently. Per-node results are logged and counted in a
//! `DeliveryReport`; nothing is retried and nothing feeds back into the
//! session state machine. The inbound side handles the theme message.

use crate::theme::ThemeStore;
use crate::transport::{InboundFrame, Transport};
use crate::wire::{MetricsPayload, SessionTag, SummaryPayload, SyncMessage, ThemePayload, WireFrame};
use crate::{Error, Result, SessionId, SessionSummary};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outcome of one fan-out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn reached_any(&self) -> bool {
        self.delivered > 0
    }
}

pub struct SyncBridge {
    transport: Arc<dyn Transport>,
    theme: Option<Arc<ThemeStore>>,
}

impl SyncBridge {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            theme: None,
        }
    }

    /// Persist inbound theme updates into this store
    pub fn with_theme_store(mut self, theme: Arc<ThemeStore>) -> Self {
        self.theme = Some(theme);
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn send_session_state(&self, tag: SessionTag) -> DeliveryReport {
        self.broadcast(SyncMessage::SessionState(tag)).await
    }

    pub async fn send_metrics(
        &self,
        session_id: SessionId,
        heart_rate: i32,
        calories: i32,
        duration_sec: i32,
    ) -> DeliveryReport {
        self.broadcast(SyncMessage::MetricsUpdate(MetricsPayload {
            session_id: session_id.get(),
            heart_rate,
            calories,
            duration_sec,
            timestamp: Utc::now().timestamp_millis(),
        }))
        .await
    }

    /// Send the end-of-session summary; refuses the zero session id
    pub async fn send_summary(&self, summary: &SessionSummary) -> Result<DeliveryReport> {
        if !summary.session_id.is_valid() {
            tracing::warn!("Refusing to send summary for uninitialized session");
            return Err(Error::InvalidSession(summary.session_id.get()));
        }
        let report = self
            .broadcast(SyncMessage::Summary(SummaryPayload::from(summary)))
            .await;
        if !report.reached_any() {
            tracing::warn!(
                "Summary for session {} was not delivered to any companion",
                summary.session_id
            );
        }
        Ok(report)
    }

    /// Companion side: push the user's customization to the host
    pub async fn send_theme(&self, character_id: i32, background_id: i32) -> DeliveryReport {
        self.broadcast(SyncMessage::ThemeUpdate(ThemePayload {
            character_id,
            background_id,
        }))
        .await
    }

    async fn broadcast(&self, message: SyncMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to encode '{}' message: {}", message.path(), e);
                return report;
            }
        };

        let nodes = match self.transport.reachable_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!("Unable to list paired nodes for '{}': {}", frame.path, e);
                return report;
            }
        };
        if nodes.is_empty() {
            tracing::debug!("No paired node reachable, dropping '{}'", frame.path);
            return report;
        }

        for node in &nodes {
            report.attempted += 1;
            match self.transport.send(node, &frame).await {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::debug!("Sent '{}' to {}", frame.path, node);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("Failed to send '{}' to {}: {}", frame.path, node, e);
                }
            }
        }
        report
    }

    /// Host side: apply a theme message from the companion
    pub fn on_theme_received(&self, payload: ThemePayload) -> Result<bool> {
        match &self.theme {
            Some(store) => store.apply(payload.into()),
            None => {
                tracing::debug!("No theme store attached, ignoring theme update");
                Ok(false)
            }
        }
    }

    /// Dispatch one inbound frame
    pub fn on_message(&self, frame: &WireFrame) -> Result<()> {
        match SyncMessage::decode(frame)? {
            SyncMessage::ThemeUpdate(payload) => {
                self.on_theme_received(payload)?;
            }
            other => {
                tracing::debug!("Host ignores inbound '{}' message", other.path());
            }
        }
        Ok(())
    }

    /// Drain an inbox until the transport closes it
    pub async fn run_inbound(&self, mut inbox: mpsc::UnboundedReceiver<InboundFrame>) {
        while let Some(inbound) = inbox.recv().await {
            if let Err(e) = self.on_message(&inbound.frame) {
                tracing::warn!("Dropping inbound message from {}: {}", inbound.from, e);
            }
        }
        tracing::debug!("Inbound channel closed");
    }
}
