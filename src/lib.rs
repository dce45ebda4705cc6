//! # Railsight - Obstacle Tracking and Safety Decision Core
//!
//! Real-time core of a railway obstacle-avoidance perception pipeline.
//!
//! Per frame tick the pipeline runs three tightly coupled stages:
//!
//! - **Tracking**: bounded track store, two-stage association (geometric
//!   overlap, then appearance), adaptive Kalman motion estimation with ghost
//!   propagation under occlusion, EMA appearance embeddings.
//! - **Behavior**: multi-scenario kinematic trajectory forecasts, context-aware
//!   Bayesian intent inference with temporal smoothing, time-to-collision with
//!   confidence bounds, cross-validation against an independent motion estimate
//!   and a weighted per-track risk score.
//! - **Safety**: mode-aware decision tree (NOMINAL / DEGRADED / FAULT) with an
//!   unconditional hardware emergency-stop bypass and an append-only audit trail.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use railsight::{Pipeline, PipelineConfig, TickInput, EgoState, SceneContext, ModeStatus};
//! use railsight::safety::{AuditLog, LoggingEmergencyStop};
//!
//! let audit = Arc::new(AuditLog::new());
//! let mut pipeline = Pipeline::new(
//!     PipelineConfig::default(),
//!     Arc::new(LoggingEmergencyStop),
//!     audit.clone(),
//! ).unwrap();
//!
//! let output = pipeline.tick(TickInput {
//!     tick: 0,
//!     timestamp: 0.0,
//!     detections: Some(vec![]),
//!     ego: EgoState::stationary(),
//!     scene: SceneContext::OpenTrack,
//!     motion_reference: None,
//!     mode: ModeStatus::nominal(),
//! });
//! println!("{:?}", output.decision.action());
//! ```

// Internal modules (numeric building blocks)
pub(crate) mod internal;

// Public modules
pub mod config;
pub mod detection;
pub mod distances;
pub mod filter;
pub mod track;
pub mod store;
pub mod matching;
pub mod appearance;
pub mod tracker;
pub mod behavior;
pub mod safety;
pub mod outbound;
pub mod pipeline;
pub mod utils;

// Re-exports for convenience
pub use config::PipelineConfig;
pub use detection::{BBox3D, Category, Detection, PoseSample, RepresentationRef};
pub use track::{Track, TrackId, TrackSnapshot, TrackState, TrackSummary};
pub use store::TrackStore;
pub use tracker::{TickTracking, Tracker};
pub use behavior::{
    BehaviorEngine, BehaviorOutput, EgoState, Intent, IntentState, MotionReference, Prediction,
    SceneContext, TtcResult, ValidationStatus,
};
pub use safety::{
    Action, AuditEntry, AuditSink, EmergencyStop, ModeStatus, SafetyDecision, SafetyEngine,
    SystemMode,
};
pub use outbound::{OutboundMessage, OutboundQueue};
pub use pipeline::{Pipeline, PipelinedRunner, Stage, TickInput, TickOutput};

// Error types
pub use crate::error::{Error, Result};

mod error {
    use thiserror::Error;

    use crate::pipeline::Stage;
    use crate::track::TrackId;

    /// Errors that can occur in the railsight core
    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Invalid detection: {0}")]
        InvalidDetection(String),

        #[error("Track store capacity exhausted (capacity {capacity})")]
        CapacityExhausted { capacity: usize },

        #[error("Unknown track: {0}")]
        UnknownTrack(TrackId),

        #[error("Hardware fault: {0}")]
        HardwareFault(String),

        #[error("Stage {stage} exceeded its tick budget")]
        Timeout { stage: Stage },

        #[error("Channel closed: {0}")]
        ChannelClosed(String),

        #[error("IO error: {0}")]
        IoError(#[from] std::io::Error),

        #[error("JSON error: {0}")]
        Json(#[from] serde_json::Error),
    }

    /// Result type for railsight operations
    pub type Result<T> = std::result::Result<T, Error>;
}
