//! Sync error taxonomy.
//!
//! Every failure seen during a cycle is classified into one of four
//! classes. Only [`SyncError::Unauthorized`] aborts a cycle; the others are
//! recorded per record (or per page) in the cycle report.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repository::StoreError;
use crate::schema::is_extended_field;
use crate::services::partner::PartnerError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// A write referenced a field the local schema does not have yet.
    #[error("Schema drift on field '{field}'")]
    SchemaDrift { field: String },

    #[error("Transient network failure: {message}")]
    TransientNetwork { message: String },

    /// Constraint violation or malformed partner payload.
    #[error("Data integrity error: {message}")]
    DataIntegrity { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },
}

impl SyncError {
    pub fn data_integrity(message: impl Into<String>) -> Self {
        SyncError::DataIntegrity { message: message.into() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::SchemaDrift { .. } => ErrorClass::SchemaDrift,
            SyncError::TransientNetwork { .. } => ErrorClass::TransientNetwork,
            SyncError::DataIntegrity { .. } => ErrorClass::DataIntegrity,
            SyncError::Unauthorized { .. } => ErrorClass::Unauthorized,
        }
    }

    /// True when retrying the record with the basic tier can succeed.
    pub fn is_recoverable_drift(&self) -> bool {
        match self {
            SyncError::SchemaDrift { field } => is_extended_field(field),
            _ => false,
        }
    }
}

/// Serializable tag of a [`SyncError`], carried in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    SchemaDrift,
    TransientNetwork,
    DataIntegrity,
    Unauthorized,
}

impl From<PartnerError> for SyncError {
    fn from(err: PartnerError) -> Self {
        match err {
            PartnerError::Unauthorized { message } => SyncError::Unauthorized { message },
            PartnerError::Transient { message } => SyncError::TransientNetwork { message },
            other @ (PartnerError::Rejected { .. } | PartnerError::Malformed { .. }) => {
                SyncError::DataIntegrity { message: other.to_string() }
            }
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownColumn { field } => SyncError::SchemaDrift { field },
            StoreError::Integrity { message } => SyncError::DataIntegrity { message },
            StoreError::Unauthorized { message } => SyncError::Unauthorized { message },
            // Storage failures other than the above are reported verbatim
            // and counted against the error budget.
            StoreError::Database { message } => SyncError::DataIntegrity { message },
        }
    }
}
