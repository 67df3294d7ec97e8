//! Horizontal autoscaler reconciliation.
//!
//! Every evaluation period the controller recomputes the desired replica
//! count from current metric values: per metric
//! `ceil(current * value / target)`, overall the max across metrics,
//! clamped to the spec bounds. Scale-up applies immediately within the
//! rate-limit policy (the larger of the percent and absolute allowances);
//! scale-down applies the maximum of all recommendations in the trailing
//! stabilization window, so a brief dip never tears capacity down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tiller_api::{
    set_condition, Condition, HpaSpec, Kind, Object, ObjectKey, Payload, ScaleUpPolicy,
};
use tiller_runtime::{ReconcileAction, ReconcileError, Reconciler};
use tiller_store::{ObjectStore, StoreError, WatchEvent, WatchFilter};
use tokio::time::Instant;
use tracing::{debug, info};

use super::mark_degraded;
use crate::external::MetricsSource;

const CONDITION_ABLE_TO_SCALE: &str = "AbleToScale";

/// Bound on one metrics-source round trip.
const METRIC_TIMEOUT: Duration = Duration::from_secs(5);

/// One desired-replica recommendation, kept for the stabilization window.
#[derive(Debug, Clone, Copy)]
struct Recommendation {
    at: Instant,
    replicas: u32,
}

pub struct AutoscalerController {
    store: ObjectStore,
    metrics: Arc<dyn MetricsSource>,
    interval: Duration,
    history: Mutex<HashMap<ObjectKey, Vec<Recommendation>>>,
}

impl AutoscalerController {
    #[must_use]
    pub fn new(store: ObjectStore, metrics: Arc<dyn MetricsSource>, interval: Duration) -> Self {
        Self {
            store,
            metrics,
            interval,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Records a recommendation and returns the max over the trailing
    /// stabilization window.
    fn stabilized(&self, key: &ObjectKey, replicas: u32, window: Duration) -> u32 {
        let now = Instant::now();
        let mut history = self.history.lock().expect("history lock poisoned");
        let entries = history.entry(key.clone()).or_default();
        entries.push(Recommendation { at: now, replicas });
        entries.retain(|r| now.duration_since(r.at) <= window);
        entries.iter().map(|r| r.replicas).max().unwrap_or(replicas)
    }

    fn forget(&self, key: &ObjectKey) {
        self.history
            .lock()
            .expect("history lock poisoned")
            .remove(key);
    }

    fn write_status(
        &self,
        object: &Object,
        current: u32,
        desired: u32,
        scaled: bool,
        condition: Condition,
    ) -> Result<(), StoreError> {
        let Some(hpa) = object.as_hpa() else {
            return Ok(());
        };
        let mut status = hpa.status.clone();
        status.current_replicas = current;
        status.desired_replicas = desired;
        if scaled {
            status.last_scale_time = Some(Utc::now());
        }
        set_condition(&mut status.conditions, condition);
        if status == hpa.status {
            return Ok(());
        }
        let mut updated = object.clone();
        if let Some(h) = updated.as_hpa_mut() {
            h.status = status;
        }
        self.store.update(updated)?;
        Ok(())
    }
}

/// The largest single-period growth the policy allows.
fn scale_up_allowance(current: u32, policy: &ScaleUpPolicy) -> u32 {
    let by_percent = current.saturating_mul(policy.max_percent) / 100;
    by_percent.max(policy.max_pods)
}

fn replicas_of(target: &Object) -> Option<u32> {
    match &target.payload {
        Payload::Deployment(d) => Some(d.spec.replicas),
        Payload::ReplicaSet(rs) => Some(rs.spec.replicas),
        Payload::StatefulSet(s) => Some(s.spec.replicas),
        _ => None,
    }
}

fn set_replicas(target: &mut Object, replicas: u32) {
    match &mut target.payload {
        Payload::Deployment(d) => d.spec.replicas = replicas,
        Payload::ReplicaSet(rs) => rs.spec.replicas = replicas,
        Payload::StatefulSet(s) => s.spec.replicas = replicas,
        _ => {}
    }
}

/// Desired replicas for one metric reading.
fn desired_for_metric(current: u32, value: f64, target: f64) -> u32 {
    (f64::from(current) * value / target).ceil() as u32
}

#[async_trait]
impl Reconciler for AutoscalerController {
    fn name(&self) -> &'static str {
        "autoscaler"
    }

    fn watches(&self) -> Vec<WatchFilter> {
        vec![WatchFilter::kind(Kind::HorizontalPodAutoscaler)]
    }

    fn enqueue_for(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        vec![event.key()]
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction, ReconcileError> {
        let object = match self.store.get(key) {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => {
                self.forget(key);
                return Ok(ReconcileAction::done());
            }
            Err(err) => return Err(err.into()),
        };
        let Some(hpa) = object.as_hpa() else {
            return Ok(ReconcileAction::done());
        };
        if object.meta.is_deleting() {
            return Ok(ReconcileAction::done());
        }
        let spec: HpaSpec = hpa.spec.clone();

        let target_key = ObjectKey::new(
            spec.target_ref.kind,
            object.meta.namespace.clone(),
            spec.target_ref.name.clone(),
        );
        let target = match self.store.get(&target_key) {
            Ok(target) => target,
            Err(StoreError::NotFound(_)) => {
                self.write_status(
                    &object,
                    0,
                    0,
                    false,
                    Condition::new(
                        CONDITION_ABLE_TO_SCALE,
                        false,
                        "TargetMissing",
                        format!("scale target {target_key} not found"),
                    ),
                )?;
                return Ok(ReconcileAction::requeue_after(self.interval));
            }
            Err(err) => return Err(err.into()),
        };
        let Some(current) = replicas_of(&target) else {
            return Err(ReconcileError::Fatal(format!(
                "target {target_key} is not a scalable kind"
            )));
        };

        let mut recommendation = 0u32;
        for metric in &spec.metrics {
            let value = tokio::time::timeout(
                METRIC_TIMEOUT,
                self.metrics.current_value(&target_key, &metric.name),
            )
            .await
            .map_err(|_| {
                ReconcileError::Transient(format!("metric {} timed out", metric.name))
            })?
            .map_err(|err| ReconcileError::Transient(err.to_string()))?;
            let desired = desired_for_metric(current, value, metric.target_value);
            debug!(hpa = %key, metric = %metric.name, value, desired, "metric evaluated");
            recommendation = recommendation.max(desired);
        }
        let recommendation = recommendation.clamp(spec.min_replicas, spec.max_replicas);

        let window = Duration::from_secs(spec.behavior.scale_down_stabilization_seconds);
        let stabilized = self.stabilized(key, recommendation, window);

        let next = if recommendation > current {
            let limit = current + scale_up_allowance(current, &spec.behavior.scale_up);
            recommendation.min(limit)
        } else {
            // A lower value only lands once the whole window agrees.
            stabilized.min(current)
        };

        let scaled = next != current;
        if scaled {
            info!(hpa = %key, target = %target_key, from = current, to = next, "scaling target");
            let mut updated = target.clone();
            set_replicas(&mut updated, next);
            self.store.update(updated)?;
        }

        self.write_status(
            &object,
            current,
            next,
            scaled,
            Condition::new(
                CONDITION_ABLE_TO_SCALE,
                true,
                if scaled { "SucceededRescale" } else { "ReadyForNewScale" },
                "",
            ),
        )?;
        Ok(ReconcileAction::requeue_after(self.interval))
    }

    fn on_retries_exhausted(&self, key: &ObjectKey) {
        mark_degraded(&self.store, key, "metric evaluation kept failing");
    }
}
