/*
 * Copyright (C) 2024 The Deploycontrol Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::deploycontrol::controller::cluster::{ClientError, ClusterCache, ClusterClient};
use crate::deploycontrol::controller::queue::DelayQueue;
use crate::deploycontrol::controller::status::ConditionReason;
use crate::deploycontrol::k8s::deployment::{
    Deployment, DeploymentSpec, LabelSelector, PodTemplateSpec,
};
use crate::deploycontrol::k8s::deploydaemon::{
    ClusterRef, DeployDaemon, DEPLOY_DAEMON_API_VERSION, DEPLOY_DAEMON_KIND,
};
use crate::deploycontrol::k8s::pod::{
    ContainerSpec, ObjectMeta, OwnerReference, PodSpec, LABEL_EXPOSE,
};
use crate::deploycontrol::logger::{log_debug, log_error, log_info, log_warn};
use crate::deploycontrol::util::{normalize_namespace, split_namespace_key};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "reconciler";

/// Non-error outcomes of a single reconcile pass.
///
/// `Deferred` is the deferral-gate sentinel: the caller must neither requeue
/// with backoff nor log a failure, because re-entry is owned by the delay
/// queue and the watch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Desired and observed state converged and the status write succeeded.
    Converged,
    /// Nothing to do for this event (object gone or key unreadable).
    Skipped,
    /// Reconciliation is parked until the scheduler delay elapses.
    Deferred { resume_after: Duration },
}

/// Retryable reconcile failures; the worker requeues the key with backoff.
#[derive(Debug)]
pub enum ReconcileError {
    /// The recorded backing deployment is absent from the cache: not yet
    /// propagated, or deleted out-of-band.
    DeploymentMissing { namespace: String, name: String },
    /// The backing deployment could not be read from the cache.
    DeploymentLookup {
        name: String,
        source: Box<dyn Error + Send + Sync>,
    },
    /// The status write failed; convergence cannot be recorded.
    StatusWrite(ClientError),
    /// Convergence has not been reached yet; retry until ready.
    Ongoing { reason: String },
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::DeploymentMissing { namespace, name } => {
                write!(f, "deployment '{}/{}' not found in cache", namespace, name)
            }
            ReconcileError::DeploymentLookup { name, source } => {
                write!(f, "deployment '{}' cache lookup failed: {}", name, source)
            }
            ReconcileError::StatusWrite(err) => write!(f, "status update failed: {}", err),
            ReconcileError::Ongoing { reason } => write!(f, "sync is ongoing: {}", reason),
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReconcileError::DeploymentLookup { source, .. } => Some(source.as_ref()),
            ReconcileError::StatusWrite(err) => Some(err),
            ReconcileError::DeploymentMissing { .. } | ReconcileError::Ongoing { .. } => None,
        }
    }
}

/// Idempotent state machine converging one DeployDaemon toward its spec.
#[derive(Clone)]
pub struct Reconciler {
    cache: Arc<dyn ClusterCache>,
    client: Arc<dyn ClusterClient>,
    delay_queue: DelayQueue,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn ClusterCache>,
        client: Arc<dyn ClusterClient>,
        delay_queue: DelayQueue,
    ) -> Self {
        Self {
            cache,
            client,
            delay_queue,
        }
    }

    /// Runs one reconcile pass for a `namespace/name` key.
    ///
    /// Safe to re-run with stale input: provisioning is anchored on the
    /// status cluster ref and every mutation targets the object's own copy.
    pub fn reconcile(&self, key: &str) -> Result<ReconcileOutcome, ReconcileError> {
        let Some((namespace, name)) = split_namespace_key(key) else {
            log_error(COMPONENT, "invalid resource key", &[("key", key)]);
            return Ok(ReconcileOutcome::Skipped);
        };

        let mut daemon = match self.cache.deploy_daemon(&namespace, &name) {
            Ok(Some(daemon)) => daemon,
            Ok(None) => {
                log_debug(COMPONENT, "deploydaemon no longer exists", &[("key", key)]);
                return Ok(ReconcileOutcome::Skipped);
            }
            Err(err) => {
                // Cache failures are transient; the next watch event retries.
                log_error(
                    COMPONENT,
                    "deploydaemon cache lookup failed",
                    &[("key", key), ("error", &err.to_string())],
                );
                return Ok(ReconcileOutcome::Skipped);
            }
        };

        if let Some(outcome) = self.defer_if_scheduled(&mut daemon, key) {
            return Ok(outcome);
        }

        let deployment = self.ensure_deployment(&mut daemon, &namespace, key)?;

        match deployment.as_ref() {
            Some(deployment) => self.sync(&mut daemon, deployment, &namespace),
            None => log_warn(
                COMPONENT,
                "no deployment to sync; waiting for the next cycle",
                &[("key", key)],
            ),
        }

        match self.client.update_deploy_daemon_status(&daemon) {
            Err(err) => {
                log_error(
                    COMPONENT,
                    "deploydaemon status update failed",
                    &[("key", key), ("error", &err.to_string())],
                );
                Err(ReconcileError::StatusWrite(err))
            }
            Ok(()) if daemon.is_ready() => Ok(ReconcileOutcome::Converged),
            Ok(()) => Err(ReconcileError::Ongoing {
                reason: daemon.status.conditions.reason.clone(),
            }),
        }
    }

    /// Deferral gate: parks the key in the delay queue while `deferUntil`
    /// is set. Unparseable durations are logged and reconciliation falls
    /// through to normal processing.
    fn defer_if_scheduled(&self, daemon: &mut DeployDaemon, key: &str) -> Option<ReconcileOutcome> {
        if daemon.spec.defer_until.is_empty() {
            return None;
        }

        let wait = match humantime::parse_duration(&daemon.spec.defer_until) {
            Ok(wait) => wait,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "unparseable deferUntil duration; ignoring deferral",
                    &[
                        ("key", key),
                        ("deferUntil", &daemon.spec.defer_until),
                        ("error", &err.to_string()),
                    ],
                );
                return None;
            }
        };

        daemon.set_condition(
            false,
            ConditionReason::WaitingScheduler,
            "reconciliation deferred until the scheduler delay elapses",
        );
        if let Err(err) = self.client.update_deploy_daemon_status(daemon) {
            // Not retried here; the condition is re-written when the delay
            // worker releases the key.
            log_error(
                COMPONENT,
                "status update for deferral failed",
                &[("key", key), ("error", &err.to_string())],
            );
        }
        self.delay_queue.add_after(key, wait);
        log_debug(
            COMPONENT,
            "deploydaemon parked in delay queue",
            &[("key", key), ("deferUntil", &daemon.spec.defer_until)],
        );
        Some(ReconcileOutcome::Deferred { resume_after: wait })
    }

    /// Provisioning step: creates the backing deployment exactly once,
    /// reserving its name in the status anchor before the create call, or
    /// fetches the already-recorded deployment from the cache.
    fn ensure_deployment(
        &self,
        daemon: &mut DeployDaemon,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Deployment>, ReconcileError> {
        if daemon.provisioned() {
            let deployment_name = daemon
                .status
                .cluster_ref
                .as_ref()
                .map(|cluster| cluster.deployment_name.clone())
                .unwrap_or_default();
            return match self.cache.deployment(namespace, &deployment_name) {
                Ok(Some(deployment)) => Ok(Some(deployment)),
                Ok(None) => Err(ReconcileError::DeploymentMissing {
                    namespace: namespace.to_string(),
                    name: deployment_name,
                }),
                Err(err) => Err(ReconcileError::DeploymentLookup {
                    name: deployment_name,
                    source: err,
                }),
            };
        }

        let deployment_name = daemon.derived_deployment_name();
        // The name is reserved in status before the create call so a retry
        // after a crash sees "already provisioned" even if the create result
        // was lost. A crash in between can orphan one create attempt.
        daemon.status.cluster_ref = Some(ClusterRef {
            name: daemon.workload_name(),
            namespace: normalize_namespace(Some(namespace)),
            deployment_name: deployment_name.clone(),
        });
        daemon.set_condition(
            false,
            ConditionReason::WaitingDeployment,
            "waiting for the backing deployment to be created",
        );

        let template = build_deployment(daemon, namespace);
        log_info(
            COMPONENT,
            "creating backing deployment",
            &[("key", key), ("deployment", &deployment_name)],
        );
        match self.client.create_deployment(&template) {
            Ok(created) => Ok(Some(created)),
            Err(err) => {
                // The cycle still writes status; the pending condition makes
                // the caller retry with backoff.
                log_error(
                    COMPONENT,
                    "backing deployment create failed",
                    &[
                        ("key", key),
                        ("deployment", &deployment_name),
                        ("error", &err.to_string()),
                    ],
                );
                Ok(None)
            }
        }
    }

    /// Runs the deployment and pod-exposure phases, folding the first
    /// pending reason into the object's condition.
    fn sync(&self, daemon: &mut DeployDaemon, deployment: &Deployment, namespace: &str) {
        daemon.status.deployment_status = Some(deployment.observed_status());

        if let Some(reason) = self.sync_deployment(daemon, deployment, namespace) {
            daemon.set_condition(false, reason, "waiting for the deployment to settle");
            return;
        }
        if let Some(reason) = self.sync_pod_exposure(daemon, namespace) {
            daemon.set_condition(false, reason, "waiting for pod exposure labels to sync");
            return;
        }
        daemon.set_condition(
            true,
            ConditionReason::Synced,
            "deployment and pods converged",
        );
    }

    /// Replica-count and readiness phase. A scale change must be observed to
    /// complete before readiness is evaluated, so the two checks never run
    /// in the same cycle.
    fn sync_deployment(
        &self,
        daemon: &DeployDaemon,
        deployment: &Deployment,
        namespace: &str,
    ) -> Option<ConditionReason> {
        if deployment.spec.replicas != daemon.spec.replica_count {
            let mut scaled = deployment.clone();
            scaled.spec.replicas = daemon.spec.replica_count;
            log_info(
                COMPONENT,
                "scaling deployment to the desired replica count",
                &[
                    ("namespace", namespace),
                    (
                        "deployment",
                        scaled.metadata.name.as_deref().unwrap_or_default(),
                    ),
                    ("replicas", &daemon.spec.replica_count.to_string()),
                ],
            );
            if let Err(err) = self.client.update_deployment(&scaled) {
                log_error(
                    COMPONENT,
                    "deployment scale update failed",
                    &[("namespace", namespace), ("error", &err.to_string())],
                );
            }
            return Some(ConditionReason::WaitingScale);
        }

        let status = deployment.observed_status();
        if status.ready_replicas != status.available_replicas {
            return Some(ConditionReason::WaitingPodsReady);
        }
        None
    }

    /// Exposure phase: drives every owned pod's `expose` label toward
    /// `spec.exposure`. Per-pod update failures are best-effort; only a
    /// failed pod listing aborts the phase.
    fn sync_pod_exposure(&self, daemon: &DeployDaemon, namespace: &str) -> Option<ConditionReason> {
        let selector = daemon.selector_labels();
        let pods = match self.cache.pods(namespace, &selector) {
            Ok(pods) => pods,
            Err(err) => {
                log_error(
                    COMPONENT,
                    "pod listing failed; exposure sync aborted",
                    &[("namespace", namespace), ("error", &err.to_string())],
                );
                return Some(ConditionReason::WaitingPodExpose);
            }
        };

        for pod in pods {
            if pod.metadata.labels.get(LABEL_EXPOSE) == Some(&daemon.spec.exposure) {
                continue;
            }
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            log_info(
                COMPONENT,
                "syncing pod exposure label",
                &[
                    ("namespace", namespace),
                    ("pod", &pod_name),
                    ("expose", &daemon.spec.exposure),
                ],
            );
            let mut updated = pod;
            updated
                .metadata
                .labels
                .insert(LABEL_EXPOSE.to_string(), daemon.spec.exposure.clone());
            if let Err(err) = self.client.update_pod(&updated) {
                log_error(
                    COMPONENT,
                    "pod exposure update failed",
                    &[
                        ("namespace", namespace),
                        ("pod", &pod_name),
                        ("error", &err.to_string()),
                    ],
                );
            }
        }
        None
    }
}

/// Renders the deployment template for a DeployDaemon: derived name, the
/// app/version selector, the exposure label on the pod template, and an
/// owner reference for cluster-side cascading deletion.
fn build_deployment(daemon: &DeployDaemon, namespace: &str) -> Deployment {
    let workload = daemon.workload_name();
    let labels = daemon.selector_labels();
    let selector = LabelSelector {
        match_labels: labels.clone(),
    };
    let mut template_labels = labels.clone();
    template_labels.insert(LABEL_EXPOSE.to_string(), daemon.spec.exposure.clone());

    Deployment {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        metadata: ObjectMeta {
            name: Some(daemon.derived_deployment_name()),
            namespace: Some(normalize_namespace(Some(namespace))),
            labels,
            owner_references: vec![OwnerReference {
                api_version: DEPLOY_DAEMON_API_VERSION.to_string(),
                kind: DEPLOY_DAEMON_KIND.to_string(),
                name: workload,
                controller: Some(true),
            }],
            resource_version: None,
        },
        spec: DeploymentSpec {
            replicas: daemon.spec.replica_count,
            selector,
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels: template_labels,
                    ..Default::default()
                },
                spec: PodSpec {
                    containers: vec![ContainerSpec {
                        name: "nginx".to_string(),
                        image: Some("nginx:latest".to_string()),
                    }],
                },
            },
        },
        status: None,
    }
}
