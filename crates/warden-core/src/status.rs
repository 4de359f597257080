// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment status state machine.
//!
//! The transition table is the single source of truth for which lifecycle
//! moves the orchestrator may make. Two escape hatches exist outside the
//! table: any status may move to `error` or `idle`. Those are reserved for
//! cleanup paths; callers log every use so that frequent hatch traffic
//! surfaces as a bug signal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Created but never provisioned.
    Idle,
    /// Port reservation and config materialization in progress.
    Configuring,
    /// Image pull and container creation in progress.
    Provisioning,
    /// Container started, waiting for the first successful health probe.
    Starting,
    /// Container is up and serving traffic.
    Healthy,
    /// Container stopped (explicitly or by hibernation); record preserved.
    Stopped,
    /// Something went wrong; `error_message` carries the diagnostic.
    Error,
    /// Runtime restart requested for a previously healthy container.
    Restarting,
}

impl DeploymentStatus {
    /// All statuses, in declaration order.
    pub const ALL: [DeploymentStatus; 8] = [
        DeploymentStatus::Idle,
        DeploymentStatus::Configuring,
        DeploymentStatus::Provisioning,
        DeploymentStatus::Starting,
        DeploymentStatus::Healthy,
        DeploymentStatus::Stopped,
        DeploymentStatus::Error,
        DeploymentStatus::Restarting,
    ];

    /// Statuses that count against the fleet capacity gate.
    pub const RUNNING_LIKE: [DeploymentStatus; 5] = [
        DeploymentStatus::Healthy,
        DeploymentStatus::Starting,
        DeploymentStatus::Provisioning,
        DeploymentStatus::Configuring,
        DeploymentStatus::Restarting,
    ];

    /// The canonical lowercase string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Idle => "idle",
            DeploymentStatus::Configuring => "configuring",
            DeploymentStatus::Provisioning => "provisioning",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Healthy => "healthy",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Error => "error",
            DeploymentStatus::Restarting => "restarting",
        }
    }

    /// Whether the transition `self -> to` is legal.
    ///
    /// Self-transitions are always legal, as are the `-> error` and
    /// `-> idle` escape hatches.
    pub fn can_transition(&self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        if *self == to || to == Error || to == Idle {
            return true;
        }

        matches!(
            (*self, to),
            (Idle, Configuring)
                | (Idle, Provisioning)
                | (Configuring, Provisioning)
                | (Provisioning, Starting)
                | (Starting, Healthy)
                | (Healthy, Stopped)
                | (Healthy, Restarting)
                | (Stopped, Configuring)
                | (Stopped, Starting)
                | (Restarting, Starting)
                | (Restarting, Healthy)
                | (Error, Configuring)
                | (Error, Stopped)
                | (Error, Restarting)
        )
    }

    /// Whether the table itself permits `self -> to`, ignoring the
    /// `-> error` / `-> idle` escape hatches.
    ///
    /// Callers use this to decide whether a legal move went through the
    /// hatch and should be logged prominently.
    pub fn table_permits(&self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;

        if *self == to {
            return true;
        }

        matches!(
            (*self, to),
            (Idle, Configuring)
                | (Idle, Provisioning)
                | (Idle, Error)
                | (Configuring, Provisioning)
                | (Configuring, Error)
                | (Provisioning, Starting)
                | (Provisioning, Error)
                | (Starting, Healthy)
                | (Starting, Error)
                | (Healthy, Stopped)
                | (Healthy, Error)
                | (Healthy, Restarting)
                | (Stopped, Idle)
                | (Stopped, Configuring)
                | (Stopped, Starting)
                | (Stopped, Error)
                | (Restarting, Starting)
                | (Restarting, Healthy)
                | (Restarting, Error)
                | (Error, Idle)
                | (Error, Configuring)
                | (Error, Stopped)
                | (Error, Restarting)
        )
    }

    /// Statuses that require `container_id` and `internal_port` to be set.
    pub fn requires_container_refs(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Healthy | DeploymentStatus::Starting | DeploymentStatus::Restarting
        )
    }

    /// Statuses that clear `container_id` and `internal_port` on entry.
    pub fn clears_container_refs(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Stopped | DeploymentStatus::Error | DeploymentStatus::Idle
        )
    }

    /// Whether this status counts against the fleet capacity gate.
    pub fn is_running_like(&self) -> bool {
        Self::RUNNING_LIKE.contains(self)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(DeploymentStatus::Idle),
            "configuring" => Ok(DeploymentStatus::Configuring),
            "provisioning" => Ok(DeploymentStatus::Provisioning),
            "starting" => Ok(DeploymentStatus::Starting),
            "healthy" => Ok(DeploymentStatus::Healthy),
            "stopped" => Ok(DeploymentStatus::Stopped),
            "error" => Ok(DeploymentStatus::Error),
            "restarting" => Ok(DeploymentStatus::Restarting),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DeploymentStatus::*;
    use super::*;

    #[test]
    fn test_roundtrip_strings() {
        for status in DeploymentStatus::ALL {
            assert_eq!(status.as_str().parse::<DeploymentStatus>(), Ok(status));
        }
        assert!("running".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn test_self_transitions_always_legal() {
        for status in DeploymentStatus::ALL {
            assert!(status.can_transition(status), "{status} -> {status}");
        }
    }

    #[test]
    fn test_escape_hatches_always_legal() {
        for status in DeploymentStatus::ALL {
            assert!(status.can_transition(Error), "{status} -> error");
            assert!(status.can_transition(Idle), "{status} -> idle");
        }
    }

    #[test]
    fn test_spawn_chain() {
        assert!(Idle.can_transition(Configuring));
        assert!(Configuring.can_transition(Provisioning));
        assert!(Provisioning.can_transition(Starting));
        assert!(Starting.can_transition(Healthy));
    }

    #[test]
    fn test_restart_chain() {
        assert!(Healthy.can_transition(Restarting));
        assert!(Restarting.can_transition(Healthy));
        assert!(Restarting.can_transition(Starting));
    }

    #[test]
    fn test_closure_of_the_table() {
        // Everything not in the table and not an escape hatch is illegal.
        let illegal = [
            (Idle, Starting),
            (Idle, Healthy),
            (Idle, Stopped),
            (Idle, Restarting),
            (Configuring, Starting),
            (Configuring, Healthy),
            (Configuring, Stopped),
            (Configuring, Restarting),
            (Provisioning, Configuring),
            (Provisioning, Healthy),
            (Provisioning, Stopped),
            (Provisioning, Restarting),
            (Starting, Configuring),
            (Starting, Provisioning),
            (Starting, Stopped),
            (Starting, Restarting),
            (Healthy, Configuring),
            (Healthy, Provisioning),
            (Healthy, Starting),
            (Stopped, Provisioning),
            (Stopped, Healthy),
            (Stopped, Restarting),
            (Restarting, Configuring),
            (Restarting, Provisioning),
            (Restarting, Stopped),
            (Error, Provisioning),
            (Error, Starting),
            (Error, Healthy),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition(to), "{from} -> {to} should be illegal");
        }
    }

    #[test]
    fn test_hatch_detection() {
        // Legal only through the hatch, not the table.
        assert!(Starting.can_transition(Idle));
        assert!(!Starting.table_permits(Idle));
        // Legal through the table.
        assert!(Stopped.table_permits(Idle));
    }

    #[test]
    fn test_container_ref_rules() {
        assert!(Healthy.requires_container_refs());
        assert!(Starting.requires_container_refs());
        assert!(Restarting.requires_container_refs());
        assert!(!Provisioning.requires_container_refs());

        assert!(Stopped.clears_container_refs());
        assert!(Error.clears_container_refs());
        assert!(Idle.clears_container_refs());
        assert!(!Healthy.clears_container_refs());
    }
}
