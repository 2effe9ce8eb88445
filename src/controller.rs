//! Kubernetes controller wiring
//!
//! Hosts the actuators on kube-runtime controllers:
//! - Cluster: Apply reconciles and publishes `status.apiEndpoints`, Cleanup deletes
//! - Machine: Apply creates or updates depending on existence, Cleanup deletes
//!
//! Both resources carry a finalizer so cloud resources are released before
//! the object disappears. Machine events re-trigger their cluster, which lets
//! a cluster blocked on live machines finish deleting once they are gone.

use crate::actuators::{ClusterActuator, MachineActuator};
use crate::crd::{Cluster, Machine, CLUSTER_NAME_LABEL};
use crate::domain::MachineLister;
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{self, finalizer, Event as Finalizer};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CLUSTER_FINALIZER: &str = "cluster.cluster.k8s.io";
pub const MACHINE_FINALIZER: &str = "machine.cluster.k8s.io";

/// Port published in cluster API endpoints
pub const API_ENDPOINT_PORT: u16 = 443;

/// Must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

const BACKOFF: Duration = Duration::from_secs(15);
const RESYNC: Duration = Duration::from_secs(300);

// =============================================================================
// Context
// =============================================================================

/// Shared state handed to every reconcile call
pub struct Context {
    pub client: Client,
    pub clusters: ClusterActuator,
    pub machines: MachineActuator,
    pub metrics: Metrics,
    /// Cancelled on shutdown; aborts in-flight cloud waits
    pub shutdown: CancellationToken,
}

// =============================================================================
// Machine Lister
// =============================================================================

/// Lists Machine objects by their cluster label, across namespaces
#[derive(Clone)]
pub struct KubeMachineLister {
    api: Api<Machine>,
}

impl KubeMachineLister {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl MachineLister for KubeMachineLister {
    async fn machines_for_cluster(&self, cluster: &str) -> Result<Vec<String>> {
        let params = ListParams::default().labels(&format!("{}={}", CLUSTER_NAME_LABEL, cluster));
        let machines = self.api.list(&params).await?;
        Ok(machines.items.iter().map(|m| m.name_any()).collect())
    }
}

// =============================================================================
// Cluster Reconciliation
// =============================================================================

pub async fn reconcile_cluster(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(cluster) => apply_cluster(&api, &cluster, &ctx).await,
            Finalizer::Cleanup(cluster) => cleanup_cluster(&cluster, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply_cluster(api: &Api<Cluster>, cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    let started = Instant::now();
    let outcome = ctx
        .clusters
        .reconcile(cluster, ctx.shutdown.child_token())
        .await;
    ctx.metrics
        .observe("cluster", "reconcile", outcome.is_ok(), started.elapsed());

    let status = match &outcome {
        Ok(addresses) => json!({
            "status": {
                "apiEndpoints": addresses
                    .iter()
                    .map(|a| json!({ "host": a.to_string(), "port": API_ENDPOINT_PORT }))
                    .collect::<Vec<_>>(),
                "errorMessage": null,
            }
        }),
        Err(e) => json!({ "status": { "errorMessage": e.to_string() } }),
    };
    if let Err(e) = api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await
    {
        warn!(cluster = %name, error = %e, "Failed to update cluster status");
    }

    outcome?;
    Ok(Action::requeue(RESYNC))
}

async fn cleanup_cluster(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let started = Instant::now();
    let outcome = ctx
        .clusters
        .delete(cluster, ctx.shutdown.child_token())
        .await;
    ctx.metrics
        .observe("cluster", "delete", outcome.is_ok(), started.elapsed());
    outcome?;
    Ok(Action::await_change())
}

// =============================================================================
// Machine Reconciliation
// =============================================================================

pub async fn reconcile_machine(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_default();
    let api: Api<Machine> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, MACHINE_FINALIZER, machine, |event| async {
        match event {
            Finalizer::Apply(machine) => apply_machine(&machine, &ctx).await,
            Finalizer::Cleanup(machine) => cleanup_machine(&machine, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// The Cluster a machine belongs to, `None` when it no longer exists
async fn owning_cluster(machine: &Machine, ctx: &Context) -> Result<Option<Cluster>> {
    let cluster_name = machine
        .cluster_name()
        .ok_or_else(|| Error::InvalidProviderSpec {
            kind: "Machine".to_string(),
            name: machine.name_any(),
            reason: format!("missing {} label", CLUSTER_NAME_LABEL),
        })?;
    let namespace = machine.namespace().unwrap_or_default();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    Ok(api.get_opt(cluster_name).await?)
}

async fn apply_machine(machine: &Machine, ctx: &Context) -> Result<Action> {
    let name = machine.name_any();
    let cluster = owning_cluster(machine, ctx)
        .await?
        .ok_or_else(|| Error::not_found("Cluster", machine.cluster_name().unwrap_or_default()))?;

    let started = Instant::now();
    let cancel = ctx.shutdown.child_token();
    let (action, outcome) = match ctx.machines.exists(&cluster, machine, cancel.clone()).await {
        Ok(true) => ("update", ctx.machines.update(&cluster, machine, cancel).await),
        Ok(false) => ("create", ctx.machines.create(&cluster, machine, cancel).await),
        Err(e) => ("exists", Err(e)),
    };
    ctx.metrics
        .observe("machine", action, outcome.is_ok(), started.elapsed());
    outcome?;

    debug!(machine = %name, action, "Machine converged");
    Ok(Action::requeue(RESYNC))
}

async fn cleanup_machine(machine: &Machine, ctx: &Context) -> Result<Action> {
    let Some(cluster) = owning_cluster(machine, ctx).await? else {
        warn!(machine = %machine.name_any(), "Cluster already gone, releasing machine");
        return Ok(Action::await_change());
    };

    let started = Instant::now();
    let outcome = ctx
        .machines
        .delete(&cluster, machine, ctx.shutdown.child_token())
        .await;
    ctx.metrics
        .observe("machine", "delete", outcome.is_ok(), started.elapsed());
    outcome?;
    Ok(Action::await_change())
}

// =============================================================================
// Error Policy
// =============================================================================

/// Requeue behaviour for a failed reconcile
pub fn requeue_action(error: &Error) -> Action {
    let inner = match error {
        Error::Finalizer(e) => match e.as_ref() {
            finalizer::Error::ApplyFailed(inner) | finalizer::Error::CleanupFailed(inner) => inner,
            _ => error,
        },
        _ => error,
    };

    match inner.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(BACKOFF),
        ErrorAction::RequeueAfter(after) => Action::requeue(after),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

pub fn cluster_error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(cluster = %cluster.name_any(), error = %error, "Cluster reconcile failed");
    requeue_action(error)
}

pub fn machine_error_policy(machine: Arc<Machine>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(machine = %machine.name_any(), error = %error, "Machine reconcile failed");
    requeue_action(error)
}

// =============================================================================
// Runner
// =============================================================================

/// Run the cluster and machine controllers until shutdown
pub async fn run(ctx: Arc<Context>) {
    let clusters: Api<Cluster> = Api::all(ctx.client.clone());
    let machines: Api<Machine> = Api::all(ctx.client.clone());

    let cluster_ctrl = Controller::new(clusters, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .watches(
            machines.clone(),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            |machine| {
                let namespace = machine.namespace();
                machine.cluster_name().map(|cluster| {
                    let reference = ObjectRef::<Cluster>::new(cluster);
                    match namespace {
                        Some(ns) => reference.within(&ns),
                        None => reference,
                    }
                })
            },
        )
        .shutdown_on_signal()
        .run(reconcile_cluster, cluster_error_policy, ctx.clone())
        .for_each(log_reconcile_result("Cluster"));

    let machine_ctrl = Controller::new(machines, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile_machine, machine_error_policy, ctx)
        .for_each(log_reconcile_result("Machine"));

    info!("- Cluster controller");
    info!("- Machine controller");
    futures::join!(cluster_ctrl, machine_ctrl);
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => debug!(?object, "{} reconciliation completed", controller),
            Err(e) => debug!(error = ?e, "{} reconciliation error", controller),
        }
        std::future::ready(())
    }
}
