//! UESimulator controller implementation
//!
//! This module implements the reconciliation logic for UESimulator
//! resources. It follows the Kubernetes controller pattern: observe the
//! workload and relation data, render the desired configuration, compare
//! it against what the workload currently carries, and apply the
//! difference (config push plus service restart).
//!
//! Reconciliation is stateless: every pass derives the full desired state
//! from the CR spec and the relation ConfigMap, so a missed event or an
//! operator restart only delays convergence until the next trigger.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use uesim_common::crd::{Condition, ConditionStatus, UESimulator, UESimulatorStatus, UePhase};
use uesim_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
#[cfg(test)]
use uesim_common::events::NoopEventPublisher;
use uesim_common::{Error, Result, UE_GTP_PORT, UE_SERVICE_NAME};

use crate::relation::{GnbRelationData, RelationIndex};
use crate::render::{render, DesiredConfig, RenderedConfig};
use crate::workload::{PodWorkloadClient, WorkloadClient, WorkloadReadiness};

/// Field manager for status patches
const CONTROLLER_NAME: &str = "uesim-controller";

/// Requeue while waiting for the workload container
const WAITING_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue while blocked on absent relation data
const BLOCKED_REQUEUE: Duration = Duration::from_secs(30);
/// Periodic drift check while Active
const ACTIVE_REQUEUE: Duration = Duration::from_secs(60);

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting Kubernetes client operations for UESimulator
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UeKubeClient: Send + Sync {
    /// Get a UESimulator by name and namespace
    async fn get_uesimulator(&self, name: &str, namespace: &str)
        -> Result<Option<UESimulator>>;

    /// Patch the status of a UESimulator
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &UESimulatorStatus,
    ) -> Result<()>;

    /// Read the relation ConfigMap's key/value data.
    ///
    /// `None` when the ConfigMap does not exist (relation not established).
    async fn get_relation_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// Server-side apply the per-unit Service exposing the UE GTP port.
    ///
    /// The Service carries an owner reference to the unit, so garbage
    /// collection removes it when the unit is deleted.
    async fn ensure_gtp_service(&self, ue: &UESimulator) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct UeKubeClientImpl {
    client: Client,
}

impl UeKubeClientImpl {
    /// Create a new UeKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UeKubeClient for UeKubeClientImpl {
    async fn get_uesimulator(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<UESimulator>> {
        let api: Api<UESimulator> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ue) => Ok(Some(ue)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &UESimulatorStatus,
    ) -> Result<()> {
        let api: Api<UESimulator> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn get_relation_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm.data.unwrap_or_default())),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_gtp_service(&self, ue: &UESimulator) -> Result<()> {
        let name = ue.name_any();
        let namespace = ue.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);

        api.patch(
            &name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(&gtp_service(ue)),
        )
        .await?;

        Ok(())
    }
}

/// Build the per-unit Service exposing the UE GTP tunnel (UDP).
///
/// Selector and labels use the `app.kubernetes.io/name` convention the
/// workload pod is expected to carry.
fn gtp_service(ue: &UESimulator) -> Service {
    let name = ue.name_any();
    let labels = BTreeMap::from([("app.kubernetes.io/name".to_string(), name.clone())]);

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: ue.metadata.namespace.clone(),
            labels: Some(labels.clone()),
            owner_references: ue.controller_owner_ref(&()).map(|or| vec![or]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("ue-gtp".to_string()),
                port: UE_GTP_PORT,
                protocol: Some("UDP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds
/// resources that are expensive to create (like Kubernetes clients)
/// and shared state (like the relation index).
pub struct UeContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn UeKubeClient>,
    /// Client driving the UE workload container
    pub workload: Arc<dyn WorkloadClient>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Relation ConfigMap index (shared with the watch mapper)
    pub relations: Arc<RelationIndex>,
}

impl UeContext {
    /// Create a new UeContext with the given dependencies
    pub fn new(
        kube: Arc<dyn UeKubeClient>,
        workload: Arc<dyn WorkloadClient>,
        events: Arc<dyn EventPublisher>,
        relations: Arc<RelationIndex>,
    ) -> Self {
        Self {
            kube,
            workload,
            events,
            relations,
        }
    }

    /// Create a new UeContext from a Kubernetes client
    pub fn from_client(client: Client) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self {
            kube: Arc::new(UeKubeClientImpl::new(client.clone())),
            workload: Arc::new(PodWorkloadClient::new(client)),
            events,
            relations: Arc::new(RelationIndex::new()),
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn UeKubeClient>, workload: Arc<dyn WorkloadClient>) -> Self {
        Self {
            kube,
            workload,
            events: Arc::new(NoopEventPublisher),
            relations: Arc::new(RelationIndex::new()),
        }
    }
}

// =============================================================================
// UESimulator reconciliation
// =============================================================================

/// Reconcile a UESimulator resource
///
/// Called on CR events, relation ConfigMap events mapped through the
/// relation index, and periodic requeues. Derives the desired workload
/// configuration and converges the container to it.
///
/// # Returns
///
/// An `Action` indicating when to requeue, or an `Error` if reconciliation
/// failed.
#[instrument(skip(ue, ctx), fields(unit = %ue.name_any()))]
pub async fn reconcile(ue: Arc<UESimulator>, ctx: Arc<UeContext>) -> Result<Action> {
    let name = ue.name_any();
    info!("reconciling unit");

    let namespace = match ue.metadata.namespace.as_deref() {
        Some(ns) => ns,
        None => {
            error!("UESimulator is missing namespace");
            return Ok(Action::await_change());
        }
    };

    // Keep the relation index current so ConfigMap events map back to this
    // unit. Idempotent, also covers crash recovery.
    ctx.relations.put(namespace, &name, &ue.spec.gnb_relation);

    // The GTP Service is part of the unit's desired state regardless of
    // workload readiness. Apply is idempotent; deletion is handled by the
    // owner reference.
    if let Err(e) = ctx.kube.ensure_gtp_service(&ue).await {
        return fail_on_kube_error(&ue, &ctx, e).await;
    }

    // Step 1: workload readiness gate. Nothing can be applied to a
    // container that is not running; a later pod event retriggers us.
    let pod = ue.workload_pod();
    match ctx.workload.is_ready(namespace, &pod).await {
        WorkloadReadiness::Ready => {}
        readiness => {
            debug!(?readiness, pod = %pod, "workload not ready");
            update_status(
                &ue,
                &ctx,
                StatusUpdate::waiting(&ue, "Waiting for workload container"),
            )
            .await?;
            return Ok(Action::requeue(WAITING_REQUEUE));
        }
    }

    // Step 2: relation data. Absent ConfigMap or absent mandatory keys is
    // a normal transient state (the gNB peer has not published yet);
    // malformed values require an external fix.
    let relation = &ue.spec.gnb_relation;
    let data = match ctx.kube.get_relation_data(namespace, relation).await {
        Ok(data) => data,
        Err(e) => return fail_on_kube_error(&ue, &ctx, e).await,
    };
    let gnb = match data {
        None => {
            return block_on_missing_relation(
                &ue,
                &ctx,
                &format!("Relation ConfigMap '{}' not found", relation),
            )
            .await;
        }
        Some(map) => match GnbRelationData::from_map(relation, &map) {
            Ok(gnb) => gnb,
            Err(e @ Error::MissingRelationData { .. }) => {
                return block_on_missing_relation(&ue, &ctx, &e.to_string()).await;
            }
            Err(e) => return block_on_invalid_config(&ue, &ctx, e).await,
        },
    };

    // Step 3: render the desired configuration. Validation failures become
    // Blocked without touching the workload.
    let desired = DesiredConfig::new(&gnb, &ue.spec);
    let rendered = match render(&desired) {
        Ok(rendered) => rendered,
        Err(e) => return block_on_invalid_config(&ue, &ctx, e).await,
    };

    // Step 4: compare against the config the workload currently carries
    // and push only on difference.
    apply_config(&ue, &ctx, namespace, &pod, &rendered).await?;

    Ok(Action::requeue(ACTIVE_REQUEUE))
}

/// Error policy for the UESimulator controller
///
/// This function is called when reconciliation fails. It determines the
/// requeue strategy based on error type:
/// - Retryable errors (transient): backoff starting at 30 seconds
/// - Non-retryable errors (permanent): await spec change, don't retry
pub fn error_policy(ue: Arc<UESimulator>, error: &Error, _ctx: Arc<UeContext>) -> Action {
    error!(
        ?error,
        unit = %ue.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(BLOCKED_REQUEUE)
    } else {
        Action::await_change()
    }
}

/// Handle unit deletion by removing it from the relation index
pub fn cleanup_unit(ue: &UESimulator, ctx: &UeContext) {
    let name = ue.name_any();
    let namespace = match ue.metadata.namespace.as_deref() {
        Some(ns) => ns,
        None => {
            warn!(unit = %name, "UESimulator missing namespace during cleanup, skipping");
            return;
        }
    };

    info!(unit = %name, namespace = %namespace, "removing unit from relation index");
    ctx.relations.remove_unit(namespace, &name);
}

/// Set Blocked for absent relation data and requeue.
///
/// Also retriggered by the ConfigMap watch the moment the data arrives, so
/// the requeue only backstops a missed event.
async fn block_on_missing_relation(
    ue: &UESimulator,
    ctx: &UeContext,
    message: &str,
) -> Result<Action> {
    if !is_status_unchanged(ue, UePhase::Blocked, message) {
        ctx.events
            .publish(
                &ue.object_ref(&()),
                EventType::Warning,
                reasons::RELATION_DATA_MISSING,
                actions::RECONCILE,
                Some(message.to_string()),
            )
            .await;
        warn!(%message, "blocked on relation data");
    } else {
        debug!(%message, "still blocked on relation data");
    }

    update_status(
        ue,
        ctx,
        StatusUpdate::blocked(ue, message, reasons::RELATION_DATA_MISSING),
    )
    .await?;
    Ok(Action::requeue(BLOCKED_REQUEUE))
}

/// Set Blocked for a validation failure and stop retrying.
///
/// Invalid values never fix themselves; a spec or relation data change is
/// required, and either produces a fresh watch event.
async fn block_on_invalid_config(
    ue: &UESimulator,
    ctx: &UeContext,
    error: Error,
) -> Result<Action> {
    let message = error.to_string();
    if !is_status_unchanged(ue, UePhase::Blocked, &message) {
        ctx.events
            .publish(
                &ue.object_ref(&()),
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(message.clone()),
            )
            .await;
        warn!(error = %message, "configuration validation failed");
    } else {
        debug!(error = %message, "configuration still invalid");
    }

    update_status(
        ue,
        ctx,
        StatusUpdate::blocked(ue, &message, reasons::VALIDATION_FAILED),
    )
    .await?;
    Ok(Action::await_change())
}

/// Converge the workload onto the rendered configuration.
///
/// Reads the fingerprint of the config currently in the container; when it
/// already matches, the workload is left untouched. Otherwise the new
/// content is pushed and the service restarted. A failed write never
/// triggers a restart.
async fn apply_config(
    ue: &UESimulator,
    ctx: &UeContext,
    namespace: &str,
    pod: &str,
    rendered: &RenderedConfig,
) -> Result<()> {
    let current = match ctx.workload.read_config_fingerprint(namespace, pod).await {
        Ok(current) => current,
        Err(e) => return fail_on_workload_error(ue, ctx, e).await,
    };

    if current.as_deref() == Some(rendered.fingerprint.as_str()) {
        debug!(fingerprint = %rendered.fingerprint, "config unchanged, workload untouched");
        update_status(ue, ctx, StatusUpdate::active(&rendered.fingerprint)).await?;
        return Ok(());
    }

    if let Err(e) = ctx.workload.write_config(namespace, pod, &rendered.content).await {
        return fail_on_workload_error(ue, ctx, e).await;
    }
    ctx.events
        .publish(
            &ue.object_ref(&()),
            EventType::Normal,
            reasons::CONFIG_APPLIED,
            actions::RECONCILE,
            Some(format!("Applied config {}", rendered.fingerprint)),
        )
        .await;

    if let Err(e) = ctx.workload.restart_service(namespace, pod).await {
        return fail_on_workload_error(ue, ctx, e).await;
    }
    ctx.events
        .publish(
            &ue.object_ref(&()),
            EventType::Normal,
            reasons::SERVICE_RESTARTED,
            actions::RECONCILE,
            None,
        )
        .await;

    // Re-check after the restart: the config was applied, but Active is
    // only honest if the workload actually came back.
    if ctx.workload.is_ready(namespace, pod).await != WorkloadReadiness::Ready {
        let message = "Workload did not come back after restart";
        update_status(
            ue,
            ctx,
            StatusUpdate::error(message, Some(rendered.fingerprint.clone())),
        )
        .await?;
        return Err(Error::restart(UE_SERVICE_NAME, message));
    }

    info!(fingerprint = %rendered.fingerprint, "new configuration applied");
    update_status(ue, ctx, StatusUpdate::active(&rendered.fingerprint)).await?;
    Ok(())
}

/// Record a workload-side failure in status and propagate the error so the
/// error policy schedules the retry.
async fn fail_on_workload_error(ue: &UESimulator, ctx: &UeContext, error: Error) -> Result<()> {
    let message = error.to_string();
    if !is_status_unchanged(ue, UePhase::Blocked, &message) {
        ctx.events
            .publish(
                &ue.object_ref(&()),
                EventType::Warning,
                reasons::WORKLOAD_ERROR,
                actions::RECONCILE,
                Some(message.clone()),
            )
            .await;
        error!(error = %message, "workload operation failed");
    } else {
        debug!(error = %message, "workload operation still failing");
    }

    update_status(
        ue,
        ctx,
        StatusUpdate::blocked(ue, &message, reasons::WORKLOAD_ERROR),
    )
    .await?;
    Err(error)
}

/// Record a Kubernetes API failure in status before propagating it, so a
/// unit whose relation reads keep failing does not linger at Active.
///
/// The status patch rides the same API connection that just failed, so its
/// own failure is logged and dropped instead of masking the original error.
async fn fail_on_kube_error(ue: &UESimulator, ctx: &UeContext, error: Error) -> Result<Action> {
    let message = error.to_string();
    error!(error = %message, "kubernetes api operation failed");

    let update = StatusUpdate::error(&message, previous_fingerprint(ue));
    if let Err(patch_error) = update_status(ue, ctx, update).await {
        warn!(error = %patch_error, "could not record api failure in status");
    }

    Err(error)
}

// =============================================================================
// Status update helpers
// =============================================================================

/// Status update configuration for UESimulator
struct StatusUpdate<'a> {
    phase: UePhase,
    message: &'a str,
    condition_status: ConditionStatus,
    reason: &'a str,
    fingerprint: Option<String>,
}

impl<'a> StatusUpdate<'a> {
    fn waiting(ue: &UESimulator, message: &'a str) -> Self {
        Self {
            phase: UePhase::Waiting,
            message,
            condition_status: ConditionStatus::False,
            reason: "WorkloadNotReady",
            fingerprint: previous_fingerprint(ue),
        }
    }

    fn blocked(ue: &UESimulator, message: &'a str, reason: &'a str) -> Self {
        Self {
            phase: UePhase::Blocked,
            message,
            condition_status: ConditionStatus::False,
            reason,
            fingerprint: previous_fingerprint(ue),
        }
    }

    fn active(fingerprint: &str) -> Self {
        Self {
            phase: UePhase::Active,
            message: "Unit is operational",
            condition_status: ConditionStatus::True,
            reason: reasons::CONFIG_APPLIED,
            fingerprint: Some(fingerprint.to_string()),
        }
    }

    fn error(message: &'a str, fingerprint: Option<String>) -> Self {
        Self {
            phase: UePhase::Error,
            message,
            condition_status: ConditionStatus::False,
            reason: reasons::WORKLOAD_ERROR,
            fingerprint,
        }
    }
}

/// The fingerprint last recorded in status, carried through Waiting and
/// Blocked so the record of what was applied survives transient phases.
fn previous_fingerprint(ue: &UESimulator) -> Option<String> {
    ue.status.as_ref().and_then(|s| s.config_fingerprint.clone())
}

/// Check if the unit status already matches — avoids update loop.
///
/// Skip redundant patches because `Condition::new()` stamps a fresh
/// `lastTransitionTime` on every call, making every merge patch "different"
/// and generating a watch event that triggers another reconcile.
fn is_status_unchanged(ue: &UESimulator, phase: UePhase, message: &str) -> bool {
    ue.status
        .as_ref()
        .map(|s| s.phase == phase && s.message.as_deref() == Some(message))
        .unwrap_or(false)
}

/// Update UESimulator status with the given configuration.
///
/// Skips the patch if phase and message already match the current status,
/// preventing a self-triggering reconcile storm.
async fn update_status(
    ue: &UESimulator,
    ctx: &UeContext,
    update: StatusUpdate<'_>,
) -> Result<()> {
    if is_status_unchanged(ue, update.phase, update.message) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    let name = ue.name_any();
    let namespace = ue.namespace().unwrap_or_default();

    let mut status = UESimulatorStatus::with_phase(update.phase)
        .message(update.message)
        .observed_generation(ue.metadata.generation)
        .condition(Condition::new(
            "Ready",
            update.condition_status,
            update.reason,
            update.message,
        ));

    if let Some(fingerprint) = update.fingerprint {
        status = status.config_fingerprint(fingerprint);
    }

    ctx.kube.patch_status(&name, &namespace, &status).await
}
