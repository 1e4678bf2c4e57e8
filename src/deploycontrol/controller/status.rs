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

use crate::deploycontrol::k8s::deploydaemon::{Condition, DeployDaemon};
use std::fmt::{Display, Formatter};

/// The single condition kind reported on DeployDaemon objects.
pub const CONDITION_KIND_READY: &str = "Ready";

/// Machine-readable reasons emitted with each condition transition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConditionReason {
    /// Deferral gate is active; the object waits in the delay queue.
    WaitingScheduler,
    /// Delay elapsed; waiting for the update event to restart reconciliation.
    WaitingSchedulerRelease,
    /// Backing deployment create was submitted and has not surfaced yet.
    WaitingDeployment,
    /// A replica-count change was issued and must be observed first.
    WaitingScale,
    /// Deployment replicas exist but are not all ready/available yet.
    WaitingPodsReady,
    /// Pod listing failed; the exposure phase could not run.
    WaitingPodExpose,
    /// Deployment and pods converged to the desired state.
    Synced,
}

impl ConditionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionReason::WaitingScheduler => "waiting-scheduler",
            ConditionReason::WaitingSchedulerRelease => "waiting-scheduler-release",
            ConditionReason::WaitingDeployment => "waiting-deployment",
            ConditionReason::WaitingScale => "waiting-scale",
            ConditionReason::WaitingPodsReady => "waiting-pods-ready",
            ConditionReason::WaitingPodExpose => "waiting-pod-expose",
            ConditionReason::Synced => "synced",
        }
    }
}

impl Display for ConditionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeployDaemon {
    /// Replaces the flattened condition with the supplied transition.
    pub fn set_condition(&mut self, ready: bool, reason: ConditionReason, message: &str) {
        self.status.conditions = Condition {
            kind: CONDITION_KIND_READY.to_string(),
            ready,
            reason: reason.as_str().to_string(),
            message: message.to_string(),
        };
    }

    /// Whether the current condition reports convergence.
    pub fn is_ready(&self) -> bool {
        self.status.conditions.ready
    }
}
