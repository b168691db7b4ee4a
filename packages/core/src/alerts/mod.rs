//! Clinical alerting.

pub mod engine;
pub mod rules;
pub mod types;

pub use engine::{AlertEngine, AlertError, DEFAULT_RETENTION_DAYS};
pub use rules::{evaluate_all, AlertRule, RuleContext, RuleThresholds, ALERT_RULES};
pub use types::{Alert, AlertFilter, AlertStatus, AlertType, AlertUrgency, NewAlert, RetentionReport};
