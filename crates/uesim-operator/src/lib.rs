//! uesim-operator - Kubernetes operator for simulated 5G UE workloads
//!
//! Manages UESimulator resources: watches the peer gNB's relation
//! ConfigMap, renders the UERANSIM configuration for each unit, pushes it
//! into the workload container and keeps the unit status honest. An HTTP
//! API exposes on-demand actions (start-ue, stop-ue) against Active units.

pub mod action;
pub mod controller;
pub mod relation;
pub mod render;
pub mod workload;

pub use controller::{cleanup_unit, error_policy, reconcile, UeContext};
