//! Focus Flux - real-time concentration streaming engine
//!
//! Flux turns a stream of EEG-derived metrics into per-session signals through
//! an asynchronous pipeline: source ingestion → calibration → dip detection →
//! subscriber fan-out.
//!
//! ## Modules
//!
//! - **Sources**: live device adapter and recording replay / tail
//! - **Calibration**: personal baseline from a fixed sampling window
//! - **Orchestrator**: per-session pump wiring sources to detection and broadcast
//! - **Registry**: per-session subscriber fan-out
//! - **Connection**: subscriber command loop

pub mod calibration;
pub mod config;
pub mod connection;
pub mod detector;
pub mod error;
pub mod exercise;
pub mod message;
pub mod orchestrator;
pub mod recorder;
pub mod recording;
pub mod registry;
pub mod source;
pub mod types;

pub use calibration::{CalibrationController, CalibrationProgress, CalibrationSummary};
pub use config::FocusConfig;
pub use connection::{parse_command, ConnectionHandler};
pub use detector::DipDetector;
pub use error::FocusError;
pub use message::{InboundCommand, OutboundMessage};
pub use orchestrator::SessionOrchestrator;
pub use registry::{SessionRegistry, SubscriberHandle, Subscription};
pub use source::{FileReplaySource, LiveDeviceSource, MetricSource, SourceFactory};
pub use types::{MetricEvent, Session, SessionId, SessionState};

/// Flux version reported by the CLI
pub const FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name used in logs and reports
pub const PRODUCER_NAME: &str = "focus-flux";
