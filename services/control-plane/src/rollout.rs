//! Rollout step computation.
//!
//! Pure arithmetic shared by the deployment controller: given the current
//! shape of a rollout, compute how far the new replica set may scale up and
//! how far the old ones may scale down without breaking the surge and
//! unavailability bounds.

use tiller_api::RolloutStrategy;

/// Observed shape of a rollout, re-captured on every reconciliation tick.
///
/// `*_intent` counts come from replica set specs (pods that exist or are
/// about to), `*_available` counts from actual pods whose readiness has
/// held for the configured minimum duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolloutShape {
    pub desired: u32,
    pub new_intent: u32,
    pub old_intent: u32,
    pub new_available: u32,
    pub old_available: u32,
}

/// One bounded step of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutStep {
    /// Target replica count for the new replica set.
    pub scale_new_to: u32,

    /// How many replicas to take away from old replica sets, oldest first.
    pub scale_old_down_by: u32,
}

/// Computes the next step while honoring both bounds:
///
/// - total intent never exceeds `desired + max_surge`
/// - available pods never drop below `desired - max_unavailable`
///
/// Old replicas that are already unavailable are free to remove; removing
/// them cannot reduce availability.
#[must_use]
pub fn plan_step(shape: &RolloutShape, strategy: &RolloutStrategy) -> RolloutStep {
    let total_intent = shape.new_intent + shape.old_intent;
    let surge_room = (shape.desired + strategy.max_surge).saturating_sub(total_intent);
    let scale_new_to = shape
        .desired
        .min(shape.new_intent.saturating_add(surge_room));

    let min_available = shape.desired.saturating_sub(strategy.max_unavailable);
    let available = shape.new_available + shape.old_available;
    let removable_for_availability = available.saturating_sub(min_available);
    let old_unavailable = shape.old_intent.saturating_sub(shape.old_available);

    let scale_old_down_by = shape
        .old_intent
        .min(old_unavailable.saturating_add(removable_for_availability));

    RolloutStep {
        scale_new_to,
        scale_old_down_by,
    }
}

/// Returns true once the rollout has nothing left to do.
#[must_use]
pub fn is_complete(shape: &RolloutShape) -> bool {
    shape.old_intent == 0
        && shape.new_intent == shape.desired
        && shape.new_available >= shape.desired
}
