//! Kubernetes Event recording for the uesim controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the controller can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ConfigApplied")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "uesim-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored — no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// New configuration was rendered and pushed into the workload
    pub const CONFIG_APPLIED: &str = "ConfigApplied";
    /// The managed service was restarted to pick up new configuration
    pub const SERVICE_RESTARTED: &str = "ServiceRestarted";
    /// Mandatory relation data has not arrived yet
    pub const RELATION_DATA_MISSING: &str = "RelationDataMissing";
    /// Rendered configuration failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Config push or service restart failed on the workload side
    pub const WORKLOAD_ERROR: &str = "WorkloadError";
    /// The start-ue action completed successfully
    pub const UE_STARTED: &str = "UeStarted";
    /// The start-ue action failed or timed out
    pub const UE_START_FAILED: &str = "UeStartFailed";
    /// The stop-ue action completed successfully
    pub const UE_STOPPED: &str = "UeStopped";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Operator-triggered UE start
    pub const START_UE: &str = "StartUe";
    /// Operator-triggered UE stop
    pub const STOP_UE: &str = "StopUe";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::CONFIG_APPLIED, "ConfigApplied");
        assert_eq!(reasons::SERVICE_RESTARTED, "ServiceRestarted");
        assert_eq!(reasons::UE_STARTED, "UeStarted");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Normal,
                reasons::CONFIG_APPLIED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
