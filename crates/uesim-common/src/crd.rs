//! UESimulator Custom Resource Definition
//!
//! A UESimulator represents one managed UE simulator workload: the
//! subscriber identity and slice configuration it should run with, and a
//! reference to the relation ConfigMap carrying the peer gNB's radio data.
//!
//! The workload pod itself is scheduled externally; the operator only
//! configures and drives the process inside it.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a UESimulator unit
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "uesim.dev",
    version = "v1alpha1",
    kind = "UESimulator",
    plural = "uesimulators",
    shortname = "ue",
    status = "UESimulatorStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UESimulatorSpec {
    /// Name of the ConfigMap (same namespace) published by the gNB peer,
    /// carrying relation data keys `address` and `plmn-id`
    pub gnb_relation: String,

    /// SUPI/IMSI of the simulated subscriber (format: `imsi-` + 15 digits)
    pub supi: String,

    /// USIM permanent key K (32 hex chars)
    pub usim_key: String,

    /// USIM operator code OPc (32 hex chars)
    pub usim_opc: String,

    /// IMEI of the simulated device (15 digits)
    pub imei: String,

    /// Slice/Service Type for the default PDU session (0-255)
    #[serde(default = "default_sst")]
    pub sst: u8,

    /// Slice Differentiator for the default PDU session (6 hex chars)
    #[serde(default = "default_sd")]
    pub sd: String,

    /// Access Point Name for the default PDU session
    #[serde(default = "default_apn")]
    pub apn: String,

    /// Name of the externally scheduled workload pod.
    /// Defaults to the UESimulator's own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

fn default_sst() -> u8 {
    1
}

fn default_sd() -> String {
    "010203".to_string()
}

fn default_apn() -> String {
    "internet".to_string()
}

impl UESimulator {
    /// The workload pod this unit manages (spec override or the CR name)
    pub fn workload_pod(&self) -> String {
        self.spec
            .pod_name
            .clone()
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }
}

/// Unit lifecycle phase, the externally visible reconciliation outcome
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UePhase {
    /// A transient dependency is not available yet (container not ready)
    #[default]
    Waiting,
    /// Reconciliation cannot proceed without external input
    /// (relation data absent, invalid configuration, workload failure)
    Blocked,
    /// Workload carries the current configuration and is operational
    Active,
    /// Unexpected operational failure
    Error,
}

impl std::fmt::Display for UePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Blocked => write!(f, "Blocked"),
            Self::Active => write!(f, "Active"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// A single condition in the unit status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. Ready, Configured)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Status for a UESimulator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UESimulatorStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current unit phase
    #[serde(default)]
    pub phase: UePhase,

    /// Human-readable reason for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the unit state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// SHA-256 fingerprint of the configuration last applied to the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_fingerprint: Option<String>,
}

impl UESimulatorStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: UePhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Append a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Set the applied config fingerprint and return self for chaining
    pub fn config_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.config_fingerprint = Some(fingerprint.into());
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}
