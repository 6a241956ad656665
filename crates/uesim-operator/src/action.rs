//! On-demand UE actions over HTTP
//!
//! Exposes operator-triggered actions (`start-ue`, `stop-ue`) as
//! synchronous endpoints. Each invocation re-reads the unit fresh from the
//! API server, gates on the unit being Active, runs the corresponding
//! supervisor command in the workload and returns its captured result.
//!
//! Actions never touch the unit status: a failed or timed-out action is
//! reported to the caller (and as a Kubernetes Event), while the
//! reconciler remains the only writer of `.status`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kube::runtime::events::EventType;
use kube::Resource;
use serde::Serialize;
use tracing::{info, warn};

use uesim_common::crd::{UESimulator, UePhase};
use uesim_common::events::{actions, reasons};
use uesim_common::Error;

use crate::controller::UeContext;
use crate::workload::ActionOutput;

/// Result of an action invocation, returned to the caller as JSON.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    /// Whether the action completed successfully
    pub success: bool,
    /// Whether the action was cut off by its timeout
    pub timed_out: bool,
    /// Exit code of the supervisor command, when one was reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl ActionResponse {
    fn from_output(output: ActionOutput) -> Self {
        Self {
            success: output.success,
            timed_out: false,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    fn timed_out(message: String) -> Self {
        Self {
            success: false,
            timed_out: true,
            exit_code: None,
            stdout: String::new(),
            stderr: message,
        }
    }
}

/// Error surface of the action API.
#[derive(Debug)]
enum ApiError {
    /// The named unit does not exist
    NotFound(String),
    /// The unit exists but is not in a phase that allows actions
    NotActive(String),
    /// Kubernetes or workload transport failure
    Internal(Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::NotActive(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Internal(e)
    }
}

/// Build the action API router.
pub fn action_router(ctx: Arc<UeContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/units/{namespace}/{name}/actions/start-ue", post(start_ue))
        .route("/units/{namespace}/{name}/actions/stop-ue", post(stop_ue))
        .with_state(ctx)
}

/// Bind and serve the action API until the process exits.
pub async fn serve(ctx: Arc<UeContext>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "action API listening");
    axum::serve(listener, action_router(ctx)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn start_ue(
    State(ctx): State<Arc<UeContext>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ActionResponse>, ApiError> {
    run_start_ue(&ctx, &namespace, &name).await.map(Json)
}

async fn stop_ue(
    State(ctx): State<Arc<UeContext>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ActionResponse>, ApiError> {
    run_stop_ue(&ctx, &namespace, &name).await.map(Json)
}

/// Fetch the unit fresh and verify it currently allows actions.
///
/// Actions only make sense against a configured, operational workload;
/// anything else is reported to the caller instead of being attempted.
async fn load_active_unit(
    ctx: &UeContext,
    namespace: &str,
    name: &str,
) -> Result<UESimulator, ApiError> {
    let ue = ctx
        .kube
        .get_uesimulator(name, namespace)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unit '{}/{}' not found", namespace, name)))?;

    let phase = ue.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if phase != UePhase::Active {
        return Err(ApiError::NotActive(format!(
            "unit '{}/{}' is {} and cannot run actions",
            namespace, name, phase
        )));
    }
    Ok(ue)
}

/// Execute the start-ue action against an Active unit.
async fn run_start_ue(
    ctx: &UeContext,
    namespace: &str,
    name: &str,
) -> Result<ActionResponse, ApiError> {
    let ue = load_active_unit(ctx, namespace, name).await?;
    let pod = ue.workload_pod();

    info!(unit = %name, namespace = %namespace, "running start-ue");
    let response = match ctx.workload.run_start_ue(namespace, &pod).await {
        Ok(output) => ActionResponse::from_output(output),
        Err(e) if e.is_timeout() => {
            warn!(unit = %name, error = %e, "start-ue timed out");
            ActionResponse::timed_out(e.to_string())
        }
        Err(e) => return Err(e.into()),
    };

    let (type_, reason, note) = if response.success {
        (EventType::Normal, reasons::UE_STARTED, None)
    } else {
        let note = if response.timed_out {
            response.stderr.clone()
        } else {
            format!("exit code {:?}: {}", response.exit_code, response.stderr.trim())
        };
        (EventType::Warning, reasons::UE_START_FAILED, Some(note))
    };
    ctx.events
        .publish(&ue.object_ref(&()), type_, reason, actions::START_UE, note)
        .await;

    Ok(response)
}

/// Execute the stop-ue action against an Active unit.
async fn run_stop_ue(
    ctx: &UeContext,
    namespace: &str,
    name: &str,
) -> Result<ActionResponse, ApiError> {
    let ue = load_active_unit(ctx, namespace, name).await?;
    let pod = ue.workload_pod();

    info!(unit = %name, namespace = %namespace, "running stop-ue");
    let response = match ctx.workload.run_stop_ue(namespace, &pod).await {
        Ok(output) => ActionResponse::from_output(output),
        Err(e) if e.is_timeout() => ActionResponse::timed_out(e.to_string()),
        Err(e) => return Err(e.into()),
    };

    if response.success {
        ctx.events
            .publish(
                &ue.object_ref(&()),
                EventType::Normal,
                reasons::UE_STOPPED,
                actions::STOP_UE,
                None,
            )
            .await;
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockUeKubeClient;
    use crate::workload::MockWorkloadClient;
    use kube::api::ObjectMeta;
    use uesim_common::crd::{UESimulatorSpec, UESimulatorStatus};

    fn unit_with_phase(phase: UePhase) -> UESimulator {
        UESimulator {
            metadata: ObjectMeta {
                name: Some("ue-0".to_string()),
                namespace: Some("ran".to_string()),
                ..Default::default()
            },
            spec: UESimulatorSpec {
                gnb_relation: "gnb-data".to_string(),
                supi: "imsi-001010000000001".to_string(),
                usim_key: "465B5CE8B199B49FAA5F0A2EE238A6BC".to_string(),
                usim_opc: "E8ED289DEBA952E4283B54E88E6183CA".to_string(),
                imei: "356938035643803".to_string(),
                sst: 1,
                sd: "010203".to_string(),
                apn: "internet".to_string(),
                pod_name: None,
            },
            status: Some(UESimulatorStatus::with_phase(phase)),
        }
    }

    fn ctx_with(kube: MockUeKubeClient, workload: MockWorkloadClient) -> Arc<UeContext> {
        Arc::new(UeContext::for_testing(Arc::new(kube), Arc::new(workload)))
    }

    /// Story: start-ue against an unknown unit is a 404, workload untouched.
    #[tokio::test]
    async fn story_start_ue_unknown_unit_is_not_found() {
        let mut kube = MockUeKubeClient::new();
        kube.expect_get_uesimulator().returning(|_, _| Ok(None));
        let ctx = ctx_with(kube, MockWorkloadClient::new());

        let err = run_start_ue(&ctx, "ran", "ghost")
            .await
            .expect_err("action should fail");
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    /// Story: a unit that is not Active rejects actions without touching
    /// the workload.
    #[tokio::test]
    async fn story_start_ue_requires_active_unit() {
        let mut kube = MockUeKubeClient::new();
        kube.expect_get_uesimulator()
            .returning(|_, _| Ok(Some(unit_with_phase(UePhase::Waiting))));
        let ctx = ctx_with(kube, MockWorkloadClient::new());

        let err = run_start_ue(&ctx, "ran", "ue-0")
            .await
            .expect_err("action should fail");
        match err {
            ApiError::NotActive(msg) => assert!(msg.contains("Waiting")),
            other => panic!("expected NotActive, got {:?}", other),
        }
    }

    /// Story: successful start-ue returns the captured workload output.
    #[tokio::test]
    async fn story_start_ue_returns_workload_output() {
        let mut kube = MockUeKubeClient::new();
        kube.expect_get_uesimulator()
            .returning(|_, _| Ok(Some(unit_with_phase(UePhase::Active))));
        let mut workload = MockWorkloadClient::new();
        workload.expect_run_start_ue().times(1).returning(|_, _| {
            Ok(ActionOutput {
                success: true,
                exit_code: Some(0),
                stdout: "PDU session established\n".to_string(),
                stderr: String::new(),
            })
        });
        let ctx = ctx_with(kube, workload);

        let response = run_start_ue(&ctx, "ran", "ue-0")
            .await
            .expect("action should succeed");
        assert!(response.success);
        assert!(!response.timed_out);
        assert_eq!(response.exit_code, Some(0));
        assert!(response.stdout.contains("PDU session established"));
    }

    /// Story: a timed-out start-ue is an explicit failure result, not an
    /// HTTP error, and the unit status is never patched.
    #[tokio::test]
    async fn story_start_ue_timeout_is_explicit_failure() {
        let mut kube = MockUeKubeClient::new();
        kube.expect_get_uesimulator()
            .returning(|_, _| Ok(Some(unit_with_phase(UePhase::Active))));
        let mut workload = MockWorkloadClient::new();
        workload.expect_run_start_ue().returning(|_, _| {
            Err(Error::action_timeout(
                "start-ue",
                "UE registration did not complete within 115s",
            ))
        });
        let ctx = ctx_with(kube, workload);

        let response = run_start_ue(&ctx, "ran", "ue-0")
            .await
            .expect("timeout is a result, not a transport error");
        assert!(!response.success);
        assert!(response.timed_out);
    }

    /// Story: a failed start-ue carries the workload's exit code and
    /// stderr back to the caller.
    #[tokio::test]
    async fn story_start_ue_failure_carries_diagnostics() {
        let mut kube = MockUeKubeClient::new();
        kube.expect_get_uesimulator()
            .returning(|_, _| Ok(Some(unit_with_phase(UePhase::Active))));
        let mut workload = MockWorkloadClient::new();
        workload.expect_run_start_ue().returning(|_, _| {
            Ok(ActionOutput {
                success: false,
                exit_code: Some(2),
                stdout: String::new(),
                stderr: "RRC connection refused\n".to_string(),
            })
        });
        let ctx = ctx_with(kube, workload);

        let response = run_start_ue(&ctx, "ran", "ue-0")
            .await
            .expect("failure is a result, not a transport error");
        assert!(!response.success);
        assert_eq!(response.exit_code, Some(2));
        assert!(response.stderr.contains("RRC connection refused"));
    }

    /// Story: stop-ue against an Active unit runs the supervisor stop.
    #[tokio::test]
    async fn story_stop_ue_runs_against_active_unit() {
        let mut kube = MockUeKubeClient::new();
        kube.expect_get_uesimulator()
            .returning(|_, _| Ok(Some(unit_with_phase(UePhase::Active))));
        let mut workload = MockWorkloadClient::new();
        workload.expect_run_stop_ue().times(1).returning(|_, _| {
            Ok(ActionOutput {
                success: true,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        });
        let ctx = ctx_with(kube, workload);

        let response = run_stop_ue(&ctx, "ran", "ue-0")
            .await
            .expect("action should succeed");
        assert!(response.success);
    }

    #[test]
    fn action_response_serializes_camel_case() {
        let response = ActionResponse {
            success: false,
            timed_out: true,
            exit_code: None,
            stdout: String::new(),
            stderr: "timed out".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["timedOut"], serde_json::Value::Bool(true));
        assert!(json.get("exitCode").is_none());
    }
}
