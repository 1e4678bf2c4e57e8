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

use crate::deploycontrol::k8s::deployment::DeploymentStatus;
use crate::deploycontrol::k8s::pod::{ObjectMeta, LABEL_APP, LABEL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// API group/version stamped onto owner references for managed objects.
pub const DEPLOY_DAEMON_API_VERSION: &str = "deploycontrol.io/v1alpha1";
/// Kind of the custom resource.
pub const DEPLOY_DAEMON_KIND: &str = "DeployDaemon";

/// Desired state requested by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployDaemonSpec {
    /// Authoritative replica count for the backing deployment.
    #[serde(rename = "replicaCount", default)]
    pub replica_count: i32,
    /// Version label; derives the deployment name and the pod selector.
    #[serde(default)]
    pub version: String,
    /// Label value propagated onto every owned pod's `expose` label.
    #[serde(default)]
    pub exposure: String,
    /// Optional humantime duration; while non-empty, reconciliation is
    /// deferred until the duration has elapsed and the field is cleared.
    #[serde(rename = "deferUntil", default)]
    pub defer_until: String,
}

/// Single flattened condition summarizing convergence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Provisioning anchor recorded once the backing deployment has been named.
///
/// Its presence is the sole "already provisioned" signal across process
/// restarts; `deployment_name` is written once and never changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "deploymentName", default)]
    pub deployment_name: String,
}

/// Observed status written back by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployDaemonStatus {
    #[serde(default)]
    pub conditions: Condition,
    #[serde(rename = "clusterRef", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<ClusterRef>,
    #[serde(
        rename = "deploymentStatus",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deployment_status: Option<DeploymentStatus>,
}

/// The DeployDaemon custom resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployDaemon {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeployDaemonSpec,
    #[serde(default)]
    pub status: DeployDaemonStatus,
}

impl DeployDaemon {
    /// Derived workload name used as the `app` label on the deployment and
    /// its pods. This is the object name itself; the deployment name adds a
    /// version suffix on top.
    pub fn workload_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Canonical backing deployment name, `<workload-name>-<version>`.
    pub fn derived_deployment_name(&self) -> String {
        format!("{}-{}", self.workload_name(), self.spec.version)
    }

    /// Selector identifying the pods owned by the backing deployment.
    pub fn selector_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_APP.to_string(), self.workload_name());
        labels.insert(LABEL_VERSION.to_string(), self.spec.version.clone());
        labels
    }

    /// Whether the provisioning anchor has been recorded.
    pub fn provisioned(&self) -> bool {
        self.status
            .cluster_ref
            .as_ref()
            .map(|cluster| !cluster.deployment_name.is_empty())
            .unwrap_or(false)
    }
}
