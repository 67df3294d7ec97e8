//! Human-readable status conditions.
//!
//! Every object surfaces the outcome of its latest reconciliation as a list
//! of conditions rather than propagating errors up the stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One status condition on an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition type, e.g. `PodScheduled` or `Progressing`.
    pub condition_type: String,

    pub status: bool,

    /// Machine-readable camel-case reason.
    pub reason: String,

    /// Free-form human-readable detail.
    pub message: String,

    /// When `status` last changed. Updating reason or message alone does
    /// not move this timestamp.
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Inserts or updates a condition by type.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        Some(existing) => {
            let transition = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition,
                ..condition
            };
        }
        None => conditions.push(condition),
    }
}

/// Looks up a condition by type.
#[must_use]
pub fn get_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}
