//! uesim-operator - Kubernetes operator managing simulated 5G UE workloads

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use uesim_common::crd::UESimulator;
use uesim_common::DEFAULT_ACTION_PORT;
use uesim_operator::action;
use uesim_operator::controller::{cleanup_unit, error_policy, reconcile, UeContext};

/// uesim - CRD-driven Kubernetes operator for UERANSIM UE simulators
#[derive(Parser, Debug)]
#[command(name = "uesim-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Port for the action HTTP API (falls back to UESIM_ACTION_PORT)
    #[arg(long)]
    action_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let crd = serde_yaml::to_string(&UESimulator::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let action_port = match cli.action_port {
        Some(port) => port,
        None => match std::env::var("UESIM_ACTION_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid UESIM_ACTION_PORT: {}", value))?,
            Err(_) => DEFAULT_ACTION_PORT,
        },
    };

    run_controller(action_port).await
}

/// Ensure the UESimulator CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("uesim-controller").force();

    tracing::info!("Installing UESimulator CRD...");
    crds.patch(
        "uesimulators.uesim.dev",
        &params,
        &Patch::Apply(&UESimulator::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install UESimulator CRD: {}", e))?;

    tracing::info!("UESimulator CRD installed/updated");
    Ok(())
}

/// Run the controller: reconcile UESimulator units, map relation ConfigMap
/// events back to the affected units, and serve the action API.
async fn run_controller(action_port: u16) -> anyhow::Result<()> {
    tracing::info!("uesim controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(UeContext::from_client(client.clone()));

    // Action API runs alongside the controller on the same context so
    // actions see the same clients and relation index.
    let action_server = action::serve(ctx.clone(), action_port);

    let units: Api<UESimulator> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client.clone());

    // Without finalizers, deleted units never hit reconcile. A plain
    // watcher prunes their relation index entries instead.
    let cleanup_ctx = ctx.clone();
    let cleanup_watcher = kube::runtime::watcher(
        Api::<UESimulator>::all(client.clone()),
        WatcherConfig::default(),
    )
    .default_backoff()
    .for_each(move |event| {
        let ctx = cleanup_ctx.clone();
        async move {
            match event {
                Ok(watcher::Event::Delete(ue)) => cleanup_unit(&ue, &ctx),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "unit cleanup watcher error"),
            }
        }
    });

    tracing::info!("Starting UESimulator controller");

    // Clone the relation index for the watch mapper closure
    let relations_for_watch = ctx.relations.clone();

    let controller = Controller::new(units, WatcherConfig::default())
        // Relation data lives in ConfigMaps written by the gNB side. Map
        // each ConfigMap event to the units reading it so new or changed
        // relation data retriggers them immediately.
        .watches(config_maps, WatcherConfig::default(), move |cm| {
            let namespace = cm.metadata.namespace.clone().unwrap_or_default();
            let name = cm.metadata.name.clone().unwrap_or_default();
            let units = relations_for_watch.units_for(&namespace, &name);

            if !units.is_empty() {
                tracing::debug!(
                    configmap = %name,
                    namespace = %namespace,
                    affected = units.len(),
                    "relation data changed, retriggering units"
                );
            }

            units
                .into_iter()
                .map(move |unit| ObjectRef::<UESimulator>::new(&unit).within(&namespace))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Unit reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Unit reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = controller => {
            tracing::info!("Unit controller completed");
        }
        _ = cleanup_watcher => {
            tracing::info!("Cleanup watcher completed");
        }
        result = action_server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Action API server failed");
            }
        }
    }

    tracing::info!("uesim controller shutting down");
    Ok(())
}
