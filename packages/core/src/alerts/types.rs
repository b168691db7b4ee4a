//! Alert data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Critical,
    Maintenance,
    FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertUrgency {
    High,
    Medium,
    Low,
}

/// Alert lifecycle. `Pending` is the only initial state; `Resolved` and
/// `Ignored` are terminal unless an operator forces an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Resolved,
    Ignored,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!(
                        "Invalid {} '{}'. Must be one of: {}",
                        stringify!($ty),
                        other,
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

str_enum!(AlertType {
    Critical => "critical",
    Maintenance => "maintenance",
    FollowUp => "follow_up",
});

str_enum!(AlertUrgency {
    High => "high",
    Medium => "medium",
    Low => "low",
});

str_enum!(AlertStatus {
    Pending => "pending",
    Resolved => "resolved",
    Ignored => "ignored",
});

impl AlertStatus {
    /// Transitions allowed without an operator override.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::Pending, AlertStatus::Resolved) | (AlertStatus::Pending, AlertStatus::Ignored)
        )
    }

    /// Whether entering this status stamps `resolved_at`.
    pub fn is_closed(&self) -> bool {
        !matches!(self, AlertStatus::Pending)
    }
}

/// A stored alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub alert_type: AlertType,
    pub urgency: AlertUrgency,
    pub title: String,
    pub message: String,
    pub patient_id: Option<i64>,
    pub exam_id: Option<i64>,
    /// Key of the rule that raised the alert.
    pub rule_key: String,
    pub status: AlertStatus,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// An alert about to be created by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub urgency: AlertUrgency,
    pub title: String,
    pub message: String,
    pub patient_id: Option<i64>,
    pub exam_id: Option<i64>,
    pub rule_key: String,
    pub payload: serde_json::Value,
}

/// Filters accepted by alert listings. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertFilter {
    #[serde(rename = "type")]
    pub alert_type: Option<AlertType>,
    pub urgency: Option<AlertUrgency>,
    pub status: Option<AlertStatus>,
    pub patient_id: Option<i64>,
    pub limit: Option<i64>,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionReport {
    pub deleted: u64,
    pub cutoff: DateTime<Utc>,
}
