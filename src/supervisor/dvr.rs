//! Plex DVR reconciliation
//!
//! Keeps Plex's DVR and device rows converged onto the desired set of tuner
//! instances. The planning step is pure (desired + one Plex snapshot in,
//! actions out) so idempotency is testable without a server; execution
//! applies the plan and records per-instance failures without aborting the
//! run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::plex::{PlexClient, PlexDvr, PlexError};

/// Real HDHomeRun hardware is never touched by cleanup.
const PROTECTED_MAKE: &str = "Silicondust";

/// One desired tuner instance as Plex should see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DvrSyncInstance {
    pub name: String,
    pub base_url: String,
    pub device_id: String,
    pub friendly_name: String,
}

/// What the reconciler decided to do for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// No device with this device_id exists: register + create DVR
    Create,
    /// Device exists but its URI drifted: patch, then reload + activate
    UpdateUri { device_key: String, dvr_key: String },
    /// Device and DVR healthy: reload + re-activate only
    Refresh { dvr_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    UpdatedUri,
    Refreshed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub instance: String,
    pub outcome: SyncOutcome,
}

/// Decide what to do for one desired instance against a Plex snapshot.
///
/// URI drift is a trimmed-string compare; Plex-side normalization would
/// surface as one benign UpdateUri and then converge.
pub fn plan_action(desired: &DvrSyncInstance, snapshot: &[PlexDvr]) -> PlannedAction {
    for dvr in snapshot {
        for device in &dvr.device {
            if device.uuid != desired.device_id {
                continue;
            }
            let current = device.uri.trim();
            let wanted = desired.base_url.trim();
            if current != wanted {
                return PlannedAction::UpdateUri {
                    device_key: device.key.clone().unwrap_or_default(),
                    dvr_key: dvr.key.clone(),
                };
            }
            return PlannedAction::Refresh { dvr_key: dvr.key.clone() };
        }
    }
    PlannedAction::Create
}

/// DVRs eligible for cleanup: injected (not real hardware) and not desired.
pub fn plan_deletions(desired: &[DvrSyncInstance], snapshot: &[PlexDvr]) -> Vec<String> {
    snapshot
        .iter()
        .filter(|dvr| {
            dvr.device.iter().any(|d| {
                d.make != PROTECTED_MAKE && !desired.iter().any(|want| want.device_id == d.uuid)
            })
        })
        .map(|dvr| dvr.key.clone())
        .collect()
}

pub struct DvrReconciler {
    plex: PlexClient,
    guide_wait: Duration,
    delete_unknown: bool,
    dry_run: bool,
}

impl DvrReconciler {
    pub fn new(plex: PlexClient, guide_wait: Duration, delete_unknown: bool, dry_run: bool) -> Self {
        Self { plex, guide_wait, delete_unknown, dry_run }
    }

    /// Reconcile every desired instance against one snapshot of Plex state.
    /// Re-running against converged state yields only `Refreshed` outcomes.
    pub async fn reconcile(&self, desired: &[DvrSyncInstance]) -> Result<Vec<SyncReport>, PlexError> {
        let snapshot = self.plex.get_dvrs().await?;
        let mut reports = Vec::with_capacity(desired.len());

        for instance in desired {
            let action = plan_action(instance, &snapshot);
            info!(instance = %instance.name, ?action, dry_run = self.dry_run, "dvr plan");

            if self.dry_run {
                reports.push(SyncReport {
                    instance: instance.name.clone(),
                    outcome: match action {
                        PlannedAction::Create => SyncOutcome::Created,
                        PlannedAction::UpdateUri { .. } => SyncOutcome::UpdatedUri,
                        PlannedAction::Refresh { .. } => SyncOutcome::Refreshed,
                    },
                });
                continue;
            }

            let outcome = match self.apply(instance, action).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(instance = %instance.name, error = %e, "dvr sync failed");
                    SyncOutcome::Failed(e.to_string())
                }
            };
            reports.push(SyncReport { instance: instance.name.clone(), outcome });
        }

        if self.delete_unknown && !self.dry_run {
            for dvr_key in plan_deletions(desired, &snapshot) {
                match self.plex.delete_dvr(&dvr_key).await {
                    Ok(()) => info!(dvr = %dvr_key, "unknown injected dvr deleted"),
                    Err(e) => warn!(dvr = %dvr_key, error = %e, "dvr delete failed"),
                }
            }
        }

        Ok(reports)
    }

    async fn apply(
        &self,
        instance: &DvrSyncInstance,
        action: PlannedAction,
    ) -> Result<SyncOutcome, PlexError> {
        match action {
            PlannedAction::Create => {
                let device = self.plex.discover_device(&instance.base_url).await?;
                let device_key = device
                    .key
                    .ok_or_else(|| PlexError::Response("device without key".into()))?;
                let dvr = self.plex.create_dvr(&device_key, &instance.name).await?;
                self.reload_and_activate(&dvr.key, true).await?;
                Ok(SyncOutcome::Created)
            }
            PlannedAction::UpdateUri { device_key, dvr_key } => {
                self.plex
                    .update_device_uri(&device_key, &instance.base_url)
                    .await?;
                self.reload_and_activate(&dvr_key, false).await?;
                Ok(SyncOutcome::UpdatedUri)
            }
            PlannedAction::Refresh { dvr_key } => {
                self.reload_and_activate(&dvr_key, false).await?;
                Ok(SyncOutcome::Refreshed)
            }
        }
    }

    /// Reload the guide (waiting for it to settle on fresh DVRs), then fetch
    /// the channel map and enable everything.
    async fn reload_and_activate(&self, dvr_key: &str, fresh: bool) -> Result<(), PlexError> {
        self.plex.reload_guide(dvr_key).await?;
        if fresh {
            tokio::time::sleep(self.guide_wait).await;
        }
        let channels = self.plex.get_channel_map(dvr_key).await?;
        self.plex.activate_channels(dvr_key, &channels).await?;
        Ok(())
    }
}
