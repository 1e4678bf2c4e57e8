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

use crate::deploycontrol::controller::cluster::{ClusterCache, ClusterClient, WatchEvent};
use crate::deploycontrol::controller::queue::{DelayQueue, WorkQueue};
use crate::deploycontrol::controller::reconcile::{ReconcileOutcome, Reconciler};
use crate::deploycontrol::controller::status::ConditionReason;
use crate::deploycontrol::k8s::deploydaemon::DeployDaemon;
use crate::deploycontrol::logger::{log_debug, log_error, log_info, log_warn};
use crate::deploycontrol::util::{namespace_key, split_namespace_key};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller";
const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Supervisor-level failures.
#[derive(Debug)]
pub enum ControllerError {
    /// Shutdown was requested before the cache finished its initial sync.
    CacheSyncAborted,
}

impl Display for ControllerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::CacheSyncAborted => {
                write!(f, "shutdown requested before caches finished syncing")
            }
        }
    }
}

impl Error for ControllerError {}

/// Controller supervisor: owns the work and delay queues, wires the watch
/// event feed into key enqueues, and drives the reconcile and delay worker
/// loops.
pub struct Controller {
    cache: Arc<dyn ClusterCache>,
    client: Arc<dyn ClusterClient>,
    work_queue: WorkQueue,
    delay_queue: DelayQueue,
    reconciler: Reconciler,
}

impl Controller {
    pub fn new(cache: Arc<dyn ClusterCache>, client: Arc<dyn ClusterClient>) -> Arc<Self> {
        let work_queue = WorkQueue::new();
        let delay_queue = DelayQueue::new();
        let reconciler = Reconciler::new(cache.clone(), client.clone(), delay_queue.clone());
        Arc::new(Self {
            cache,
            client,
            work_queue,
            delay_queue,
            reconciler,
        })
    }

    /// Watch-feed adapter: translates an add/update event into an idempotent
    /// key enqueue. There is exactly one handler, invoked synchronously by
    /// the feed.
    pub fn handle_event(&self, event: &WatchEvent<DeployDaemon>) {
        self.observe(&event.object);
    }

    /// Enqueues the object's `namespace/name` key into the work queue.
    pub fn observe(&self, daemon: &DeployDaemon) {
        let Some(name) = daemon.metadata.name.as_deref() else {
            log_error(COMPONENT, "observed deploydaemon without a name", &[]);
            return;
        };
        let key = namespace_key(daemon.metadata.namespace.as_deref(), name);
        self.work_queue.add(&key);
    }

    /// Runs the controller until `shutdown` fires: waits for the initial
    /// cache sync, launches `workers` reconcile workers plus one delay
    /// worker, then drains the queues on shutdown. In-flight reconciles are
    /// allowed to finish.
    pub async fn run(
        self: &Arc<Self>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError> {
        log_info(COMPONENT, "starting deploydaemon controller", &[]);
        self.wait_for_cache_sync(&shutdown).await?;

        let workers = workers.max(1);
        log_info(
            COMPONENT,
            "starting workers",
            &[("workers", &workers.to_string())],
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers + 1);
        for worker in 0..workers {
            let controller = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                controller.run_worker(worker).await;
            }));
        }
        let controller = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            controller.run_delay_worker().await;
        }));

        shutdown.cancelled().await;
        log_info(COMPONENT, "shutting down workers", &[]);
        self.work_queue.shut_down();
        self.delay_queue.shut_down();
        for handle in handles {
            let _ = handle.await;
        }
        log_info(COMPONENT, "workers stopped", &[]);
        Ok(())
    }

    async fn wait_for_cache_sync(&self, shutdown: &CancellationToken) -> Result<(), ControllerError> {
        log_info(COMPONENT, "waiting for informer caches to sync", &[]);
        while !self.cache.has_synced() {
            if shutdown.is_cancelled() {
                return Err(ControllerError::CacheSyncAborted);
            }
            tokio::time::sleep(CACHE_SYNC_POLL).await;
        }
        Ok(())
    }

    async fn run_worker(&self, worker: usize) {
        let worker_label = worker.to_string();
        log_debug(COMPONENT, "reconcile worker started", &[("worker", &worker_label)]);
        while self.process_next_work_item().await {}
        log_debug(COMPONENT, "reconcile worker stopped", &[("worker", &worker_label)]);
    }

    /// Processes one work-queue item; returns false once the queue has shut
    /// down.
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.work_queue.get().await else {
            return false;
        };

        match self.reconciler.reconcile(&key) {
            Ok(ReconcileOutcome::Converged) => {
                self.work_queue.forget(&key);
                log_info(COMPONENT, "successfully synced", &[("key", &key)]);
            }
            Ok(ReconcileOutcome::Skipped) => {
                self.work_queue.forget(&key);
                log_debug(COMPONENT, "dropped key without work", &[("key", &key)]);
            }
            Ok(ReconcileOutcome::Deferred { resume_after }) => {
                // Deferral is not a failure: no backoff, no error log; the
                // delay queue owns re-entry.
                log_debug(
                    COMPONENT,
                    "reconcile deferred",
                    &[
                        ("key", &key),
                        ("resumeAfter", &format!("{:?}", resume_after)),
                    ],
                );
            }
            Err(err) => {
                self.work_queue.add_rate_limited(&key);
                log_warn(
                    COMPONENT,
                    "reconcile failed; requeued with backoff",
                    &[
                        ("key", &key),
                        ("requeues", &self.work_queue.num_requeues(&key).to_string()),
                        ("error", &err.to_string()),
                    ],
                );
            }
        }

        self.work_queue.done(&key);
        true
    }

    async fn run_delay_worker(&self) {
        log_debug(COMPONENT, "delay worker started", &[]);
        while self.process_next_delay_item().await {}
        log_debug(COMPONENT, "delay worker stopped", &[]);
    }

    /// Handles one released delay-queue key: clears the deferral marker and
    /// writes the object update. The resulting watch update event is the
    /// sole mechanism that re-enqueues the key; a broken watch pipeline
    /// stalls deferred objects.
    async fn process_next_delay_item(&self) -> bool {
        let Some(key) = self.delay_queue.get().await else {
            return false;
        };
        log_info(
            COMPONENT,
            "scheduler delay elapsed; releasing deploydaemon",
            &[("key", &key)],
        );

        let Some((namespace, name)) = split_namespace_key(&key) else {
            log_error(COMPONENT, "invalid key in delay queue", &[("key", &key)]);
            return true;
        };

        match self.cache.deploy_daemon(&namespace, &name) {
            Ok(Some(mut daemon)) => {
                daemon.spec.defer_until.clear();
                daemon.set_condition(
                    false,
                    ConditionReason::WaitingSchedulerRelease,
                    "scheduler delay complete; waiting for the update event",
                );
                if let Err(err) = self.client.update_deploy_daemon(&daemon) {
                    log_error(
                        COMPONENT,
                        "clearing deferUntil failed",
                        &[("key", &key), ("error", &err.to_string())],
                    );
                }
            }
            Ok(None) => {
                log_debug(
                    COMPONENT,
                    "deploydaemon deleted while deferred",
                    &[("key", &key)],
                );
            }
            Err(err) => {
                log_error(
                    COMPONENT,
                    "deploydaemon cache lookup failed in delay worker",
                    &[("key", &key), ("error", &err.to_string())],
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploycontrol::controller::cluster::{CacheError, ClientError};
    use crate::deploycontrol::k8s::deployment::Deployment;
    use crate::deploycontrol::k8s::deploydaemon::DeployDaemonSpec;
    use crate::deploycontrol::k8s::pod::{ObjectMeta, Pod};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Default)]
    struct StaticCluster {
        daemons: Mutex<HashMap<String, DeployDaemon>>,
        synced: AtomicBool,
        daemon_updates: Mutex<Vec<DeployDaemon>>,
    }

    impl ClusterCache for StaticCluster {
        fn deploy_daemon(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<DeployDaemon>, CacheError> {
            let key = format!("{}/{}", namespace, name);
            Ok(self.daemons.lock().unwrap().get(&key).cloned())
        }

        fn deployment(&self, _: &str, _: &str) -> Result<Option<Deployment>, CacheError> {
            Ok(None)
        }

        fn pods(&self, _: &str, _: &HashMap<String, String>) -> Result<Vec<Pod>, CacheError> {
            Ok(Vec::new())
        }

        fn has_synced(&self) -> bool {
            self.synced.load(Ordering::SeqCst)
        }
    }

    impl ClusterClient for StaticCluster {
        fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClientError> {
            Ok(deployment.clone())
        }

        fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClientError> {
            Ok(deployment.clone())
        }

        fn update_pod(&self, pod: &Pod) -> Result<Pod, ClientError> {
            Ok(pod.clone())
        }

        fn update_deploy_daemon(&self, daemon: &DeployDaemon) -> Result<DeployDaemon, ClientError> {
            self.daemon_updates.lock().unwrap().push(daemon.clone());
            let key = format!(
                "{}/{}",
                daemon.metadata.namespace.clone().unwrap_or_default(),
                daemon.metadata.name.clone().unwrap_or_default()
            );
            self.daemons.lock().unwrap().insert(key, daemon.clone());
            Ok(daemon.clone())
        }

        fn update_deploy_daemon_status(&self, _: &DeployDaemon) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn sample_daemon(name: &str) -> DeployDaemon {
        DeployDaemon {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: DeployDaemonSpec {
                replica_count: 1,
                version: "v1".to_string(),
                exposure: "public".to_string(),
                defer_until: String::new(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_aborts_when_shutdown_precedes_cache_sync() {
        let cluster = Arc::new(StaticCluster::default());
        let controller = Controller::new(cluster.clone(), cluster);
        let token = CancellationToken::new();
        token.cancel();

        let result = controller.run(2, token).await;
        assert!(matches!(result, Err(ControllerError::CacheSyncAborted)));
    }

    #[tokio::test]
    async fn run_stops_cleanly_on_shutdown() {
        let cluster = Arc::new(StaticCluster::default());
        cluster.synced.store(true, Ordering::SeqCst);
        let controller = Controller::new(cluster.clone(), cluster);
        let token = CancellationToken::new();

        let run = {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            tokio::spawn(async move { controller.run(2, token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let result = timeout(Duration::from_secs(2), run)
            .await
            .expect("run did not stop")
            .expect("run task panicked");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn observe_enqueues_the_namespace_name_key() {
        let cluster = Arc::new(StaticCluster::default());
        let controller = Controller::new(cluster.clone(), cluster);
        let daemon = sample_daemon("demo");

        controller.observe(&daemon);
        controller.handle_event(&WatchEvent {
            event_type: "MODIFIED".to_string(),
            object: daemon,
        });

        // Both events coalesce into a single queued delivery.
        let key = controller.work_queue.get().await.expect("queued key");
        assert_eq!(key, "default/demo");
        controller.work_queue.done(&key);
        assert_eq!(controller.work_queue.len(), 0);
    }

    #[tokio::test]
    async fn delay_worker_clears_the_deferral_marker() {
        let cluster = Arc::new(StaticCluster::default());
        let mut daemon = sample_daemon("demo");
        daemon.spec.defer_until = "5m".to_string();
        cluster
            .daemons
            .lock()
            .unwrap()
            .insert("default/demo".to_string(), daemon);
        let controller = Controller::new(cluster.clone(), cluster.clone());

        controller.delay_queue.add_after("default/demo", Duration::ZERO);
        assert!(controller.process_next_delay_item().await);

        let updates = cluster.daemon_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].spec.defer_until.is_empty());
        assert_eq!(
            updates[0].status.conditions.reason,
            "waiting-scheduler-release"
        );
        assert!(!updates[0].status.conditions.ready);
    }

    #[tokio::test]
    async fn delay_worker_tolerates_deleted_objects() {
        let cluster = Arc::new(StaticCluster::default());
        cluster.synced.store(true, Ordering::SeqCst);
        let controller = Controller::new(cluster.clone(), cluster.clone());

        controller.delay_queue.add_after("default/gone", Duration::ZERO);
        assert!(controller.process_next_delay_item().await);
        assert!(cluster.daemon_updates.lock().unwrap().is_empty());
    }
}
