//! Companion-side receiver for host sync messages.
//!
//! Keeps the latest state tag and metrics for display and journals every
//! summary it receives. Messages may arrive out of order across paths and
//! may be duplicated across nodes; neither is corrected here.

use crate::journal::SummarySink;
use crate::transport::InboundFrame;
use crate::wire::{MetricsPayload, SessionTag, SyncMessage, WireFrame};
use crate::{Result, SessionSummary};
use tokio::sync::mpsc;

/// What a single inbound frame turned into
#[derive(Clone, Debug, PartialEq)]
pub enum CompanionEvent {
    SessionState(SessionTag),
    Metrics(MetricsPayload),
    Summary(SessionSummary),
    /// Decodable but not meant for the companion
    Ignored(&'static str),
}

pub struct CompanionReceiver {
    journal: Box<dyn SummarySink>,
    last_tag: Option<SessionTag>,
    last_metrics: Option<MetricsPayload>,
    summaries_received: usize,
}

impl CompanionReceiver {
    pub fn new(journal: Box<dyn SummarySink>) -> Self {
        Self {
            journal,
            last_tag: None,
            last_metrics: None,
            summaries_received: 0,
        }
    }

    pub fn last_tag(&self) -> Option<SessionTag> {
        self.last_tag
    }

    pub fn last_metrics(&self) -> Option<&MetricsPayload> {
        self.last_metrics.as_ref()
    }

    pub fn summaries_received(&self) -> usize {
        self.summaries_received
    }

    pub fn handle_frame(&mut self, frame: &WireFrame) -> Result<CompanionEvent> {
        let event = match SyncMessage::decode(frame)? {
            SyncMessage::SessionState(tag) => {
                tracing::info!("Host session is now {:?}", tag);
                self.last_tag = Some(tag);
                CompanionEvent::SessionState(tag)
            }
            SyncMessage::MetricsUpdate(payload) => {
                tracing::debug!(
                    "Session {}: {} bpm, {} kcal, {} s",
                    payload.session_id,
                    payload.heart_rate,
                    payload.calories,
                    payload.duration_sec
                );
                self.last_metrics = Some(payload.clone());
                CompanionEvent::Metrics(payload)
            }
            SyncMessage::Summary(payload) => {
                let summary = SessionSummary::try_from(payload)?;
                self.journal.append(&summary)?;
                self.summaries_received += 1;
                tracing::info!("Received summary for session {}", summary.session_id);
                CompanionEvent::Summary(summary)
            }
            other => CompanionEvent::Ignored(other.path()),
        };
        Ok(event)
    }

    /// Drain an inbox until it closes; bad frames are logged and skipped
    pub async fn run(&mut self, mut inbox: mpsc::UnboundedReceiver<InboundFrame>) {
        while let Some(inbound) = inbox.recv().await {
            if let Err(e) = self.handle_frame(&inbound.frame) {
                tracing::warn!("Dropping frame from {}: {}", inbound.from, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{read_summaries, JsonlSummaryJournal};
    use crate::wire::{SummaryPayload, ThemePayload};
    use crate::SessionId;

    fn summary_frame(id: i64) -> WireFrame {
        SyncMessage::Summary(SummaryPayload {
            session_id: id,
            avg_heart_rate: 150,
            calories: 260.0,
            distance: 2000.0,
            duration_sec: 600,
            start_timestamp: 1_000,
            end_timestamp: 601_000,
        })
        .encode()
        .unwrap()
    }

    #[test]
    fn test_tracks_latest_state_and_metrics() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut receiver = CompanionReceiver::new(Box::new(JsonlSummaryJournal::new(
            temp_dir.path().join("s.jsonl"),
        )));

        let start = SyncMessage::SessionState(SessionTag::Start).encode().unwrap();
        assert_eq!(
            receiver.handle_frame(&start).unwrap(),
            CompanionEvent::SessionState(SessionTag::Start)
        );

        let metrics = MetricsPayload {
            session_id: 1000,
            heart_rate: 151,
            calories: 42,
            duration_sec: 120,
            timestamp: 5,
        };
        receiver
            .handle_frame(&SyncMessage::MetricsUpdate(metrics.clone()).encode().unwrap())
            .unwrap();

        assert_eq!(receiver.last_tag(), Some(SessionTag::Start));
        assert_eq!(receiver.last_metrics(), Some(&metrics));
    }

    #[test]
    fn test_summaries_journaled_without_dedup() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("s.jsonl");
        let mut receiver = CompanionReceiver::new(Box::new(JsonlSummaryJournal::new(&path)));

        receiver.handle_frame(&summary_frame(1000)).unwrap();
        receiver.handle_frame(&summary_frame(1000)).unwrap();

        assert_eq!(receiver.summaries_received(), 2);
        let entries = read_summaries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].summary.session_id, SessionId(1000));
    }

    #[test]
    fn test_zero_id_summary_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("s.jsonl");
        let mut receiver = CompanionReceiver::new(Box::new(JsonlSummaryJournal::new(&path)));

        assert!(receiver.handle_frame(&summary_frame(0)).is_err());
        assert_eq!(receiver.summaries_received(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_run_drains_inbox_until_closed() {
        use crate::transport::{MemoryNetwork, Transport};

        let network = MemoryNetwork::new();
        let (wrist, _wrist_rx) = network.join();
        let (phone, phone_rx) = network.join();
        wrist.init().await.unwrap();

        let start = SyncMessage::SessionState(SessionTag::Start).encode().unwrap();
        for frame in [start, summary_frame(1000), summary_frame(0), summary_frame(1001)] {
            wrist.send(&phone.local_id(), &frame).await.unwrap();
        }
        network.leave(&phone.local_id());

        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("s.jsonl");
        let mut receiver = CompanionReceiver::new(Box::new(JsonlSummaryJournal::new(&path)));
        tokio::time::timeout(std::time::Duration::from_secs(2), receiver.run(phone_rx))
            .await
            .expect("run did not return after the inbox closed");

        // The zero-id summary is dropped, the rest still land
        assert_eq!(receiver.summaries_received(), 2);
        assert_eq!(receiver.last_tag(), Some(SessionTag::Start));
        let ids: Vec<_> = read_summaries(&path)
            .unwrap()
            .into_iter()
            .map(|e| e.summary.session_id)
            .collect();
        assert_eq!(ids, vec![SessionId(1000), SessionId(1001)]);
    }

    #[test]
    fn test_theme_echo_is_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut receiver = CompanionReceiver::new(Box::new(JsonlSummaryJournal::new(
            temp_dir.path().join("s.jsonl"),
        )));
        let frame = SyncMessage::ThemeUpdate(ThemePayload::default())
            .encode()
            .unwrap();
        assert_eq!(
            receiver.handle_frame(&frame).unwrap(),
            CompanionEvent::Ignored("theme")
        );
    }
}
