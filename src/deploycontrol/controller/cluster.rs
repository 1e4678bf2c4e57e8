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

use crate::deploycontrol::k8s::deployment::Deployment;
use crate::deploycontrol::k8s::deploydaemon::DeployDaemon;
use crate::deploycontrol::k8s::pod::Pod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Errors surfaced by cache reads; opaque to the reconciler, which treats
/// every lookup failure as transient.
pub type CacheError = Box<dyn Error + Send + Sync>;

/// Generic Kubernetes-style watch event delivered by the external watch feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: T,
}

/// Read access to the eventually-consistent local mirror of cluster state.
///
/// Implementations must hand out owned copies: the underlying cache is shared
/// read-only state across all workers, and the reconciler mutates the copies
/// it receives.
pub trait ClusterCache: Send + Sync {
    fn deploy_daemon(&self, namespace: &str, name: &str)
        -> Result<Option<DeployDaemon>, CacheError>;

    fn deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, CacheError>;

    /// Lists pods in the namespace whose labels match every selector entry.
    fn pods(
        &self,
        namespace: &str,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>, CacheError>;

    /// Whether the initial watch-driven cache population has completed.
    fn has_synced(&self) -> bool;
}

/// Write access against the cluster API for the backing workload, its pods,
/// and the DeployDaemon object itself.
pub trait ClusterClient: Send + Sync {
    fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClientError>;

    fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, ClientError>;

    fn update_pod(&self, pod: &Pod) -> Result<Pod, ClientError>;

    /// Full-object update; used by the delay worker to clear `deferUntil`.
    /// The resulting watch update event is the deferred object's only way
    /// back into the work queue.
    fn update_deploy_daemon(&self, daemon: &DeployDaemon) -> Result<DeployDaemon, ClientError>;

    /// Status-subresource update; the reconciler's convergence report.
    fn update_deploy_daemon_status(&self, daemon: &DeployDaemon) -> Result<(), ClientError>;
}

/// Cluster API failure, with "not found" distinguishable from other errors.
#[derive(Debug)]
pub enum ClientError {
    NotFound { kind: String, name: String },
    Api(Box<dyn Error + Send + Sync>),
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotFound { kind, name } => {
                write!(f, "{} '{}' not found", kind, name)
            }
            ClientError::Api(err) => write!(f, "cluster API error: {}", err),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::NotFound { .. } => None,
            ClientError::Api(err) => Some(err.as_ref()),
        }
    }
}
