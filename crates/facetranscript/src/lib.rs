//! facetranscript: capture a face from a camera and store it per user.
//!
//! [`FaceDatabase`] drives capture and storage, [`FaceTrainer`] loads the
//! stored faces back as RGB arrays, and [`Config`] holds the layered
//! runtime settings.

pub mod config;
pub mod orchestrator;
pub mod trainer;

pub use config::{Config, ConfigError};
pub use orchestrator::{open_user_database, FaceDatabase, FaceDatabaseError};
pub use trainer::{FaceTrainer, TrainerError};

pub use facetranscript_core::{CaptureOutcome, CapturedFace};
pub use facetranscript_store::{StoreError, UserRecord, UserRecords, UserSummary};
