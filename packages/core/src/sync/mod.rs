//! Partner exam synchronization.

pub mod engine;
pub mod error;
pub mod mapper;
pub mod provider;

pub use engine::{ExamSynced, RecordError, StopReason, SyncConfig, SyncEngine, SyncReport};
pub use error::{ErrorClass, SyncError};
pub use provider::{ExamPage, ExamSource};
