//! Wire format for host/companion sync messages.
//!
//! Messages travel on a path-addressed channel. The path selects the
//! payload type; payloads are compact camelCase JSON.

use crate::{Error, Result, SessionId, SessionSummary};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const SESSION_PATH: &str = "session";
pub const METRICS_PATH: &str = "metrics";
pub const SUMMARY_PATH: &str = "summary";
pub const THEME_PATH: &str = "theme";

/// Lifecycle transition announced to the companion
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionTag {
    Start,
    Pause,
    Resume,
    Stop,
}

#[derive(Serialize, Deserialize)]
struct SessionStatePayload {
    tag: SessionTag,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub session_id: i64,
    pub heart_rate: i32,
    pub calories: i32,
    pub duration_sec: i32,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPayload {
    pub session_id: i64,
    pub avg_heart_rate: i32,
    pub calories: f32,
    pub distance: f32,
    pub duration_sec: i64,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

impl From<&SessionSummary> for SummaryPayload {
    fn from(summary: &SessionSummary) -> Self {
        Self {
            session_id: summary.session_id.get(),
            avg_heart_rate: summary.avg_heart_rate,
            calories: summary.calories,
            distance: summary.distance,
            duration_sec: summary.duration_sec,
            start_timestamp: summary.start_timestamp,
            end_timestamp: summary.end_timestamp,
        }
    }
}

impl TryFrom<SummaryPayload> for SessionSummary {
    type Error = Error;

    fn try_from(payload: SummaryPayload) -> Result<Self> {
        if payload.session_id == 0 {
            return Err(Error::InvalidSession(0));
        }
        Ok(SessionSummary {
            session_id: SessionId(payload.session_id),
            avg_heart_rate: payload.avg_heart_rate,
            calories: payload.calories,
            distance: payload.distance,
            duration_sec: payload.duration_sec,
            start_timestamp: payload.start_timestamp,
            end_timestamp: payload.end_timestamp,
        })
    }
}

/// Customization pushed from the companion to the host
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ThemePayload {
    pub character_id: i32,
    pub background_id: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncMessage {
    SessionState(SessionTag),
    MetricsUpdate(MetricsPayload),
    Summary(SummaryPayload),
    ThemeUpdate(ThemePayload),
}

/// An encoded message as handed to the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    pub path: String,
    pub payload: Vec<u8>,
    pub urgent: bool,
}

impl SyncMessage {
    pub fn path(&self) -> &'static str {
        match self {
            SyncMessage::SessionState(_) => SESSION_PATH,
            SyncMessage::MetricsUpdate(_) => METRICS_PATH,
            SyncMessage::Summary(_) => SUMMARY_PATH,
            SyncMessage::ThemeUpdate(_) => THEME_PATH,
        }
    }

    /// Everything but theme updates jumps ahead of background traffic
    pub fn is_urgent(&self) -> bool {
        !matches!(self, SyncMessage::ThemeUpdate(_))
    }

    pub fn encode(&self) -> Result<WireFrame> {
        let payload = match self {
            SyncMessage::SessionState(tag) => serde_json::to_vec(&SessionStatePayload { tag: *tag })?,
            SyncMessage::MetricsUpdate(p) => serde_json::to_vec(p)?,
            SyncMessage::Summary(p) => serde_json::to_vec(p)?,
            SyncMessage::ThemeUpdate(p) => serde_json::to_vec(p)?,
        };
        Ok(WireFrame {
            path: self.path().to_string(),
            payload,
            urgent: self.is_urgent(),
        })
    }

    pub fn decode(frame: &WireFrame) -> Result<Self> {
        match frame.path.as_str() {
            SESSION_PATH => {
                let p: SessionStatePayload = parse(frame)?;
                Ok(SyncMessage::SessionState(p.tag))
            }
            METRICS_PATH => Ok(SyncMessage::MetricsUpdate(parse(frame)?)),
            SUMMARY_PATH => Ok(SyncMessage::Summary(parse(frame)?)),
            THEME_PATH => Ok(SyncMessage::ThemeUpdate(parse(frame)?)),
            other => Err(Error::Codec(format!("unknown path '{}'", other))),
        }
    }
}

fn parse<T: DeserializeOwned>(frame: &WireFrame) -> Result<T> {
    serde_json::from_slice(&frame.payload)
        .map_err(|e| Error::Codec(format!("bad '{}' payload: {}", frame.path, e)))
}
