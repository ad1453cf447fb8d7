#![forbid(unsafe_code)]

//! Core of the Pulse exercise-session system.
//!
//! This crate provides:
//! - Domain types (sessions, metrics, goals, summaries)
//! - The session controller and its replay-latest update stream
//! - Host binding, capability negotiation and goal evaluation
//! - Host/companion sync (wire codec, transport seam, companion receiver)
//! - Persistence (theme store, summary journal, CSV rollup)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod stream;
pub mod host;
pub mod simulator;
pub mod capability;
pub mod goals;
pub mod binding;
pub mod wire;
pub mod transport;
pub mod theme;
pub mod sync;
pub mod controller;
pub mod companion;
pub mod journal;
pub mod rollup;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use binding::Binding;
pub use controller::{EventPump, SessionController, SessionSettings};
pub use sync::{DeliveryReport, SyncBridge};
pub use companion::{CompanionEvent, CompanionReceiver};
pub use journal::{JsonlSummaryJournal, SummarySink};
pub use theme::{Theme, ThemeStore};
