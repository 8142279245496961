//! Rollback of deployed resources.

use kroforge_core::cluster::ClusterClient;
use kroforge_core::deployment::DeploymentEvent;
use kroforge_core::resource::{DeployedResource, ObjectRef};
use kroforge_core::rollback::{RollbackConfig, RollbackError, RollbackResult};
use kroforge_core::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Delete `resources` in exact reverse order.
///
/// `resources` is the realized deployment order. A resource that is already
/// gone counts as rolled back. A failure is recorded and the remaining
/// resources are still processed.
pub async fn rollback_resources(
    client: &dyn ClusterClient,
    resources: &[DeployedResource],
    config: &RollbackConfig,
    progress: Option<&mpsc::UnboundedSender<DeploymentEvent>>,
) -> RollbackResult {
    let started = Instant::now();
    let emit = |event: DeploymentEvent| {
        if let Some(tx) = progress {
            let _ = tx.send(event);
        }
    };

    info!(resources = resources.len(), "Rolling back");
    emit(DeploymentEvent::RollbackStarted {
        resources: resources.len(),
    });

    let mut rolled_back = Vec::new();
    let mut errors = Vec::new();
    for resource in resources.iter().rev() {
        match rollback_one(client, resource, config).await {
            Ok(()) => {
                info!(resource = %resource.id, kind = %resource.kind, "Rolled back");
                emit(DeploymentEvent::ResourceRolledBack {
                    resource_id: resource.id.clone(),
                });
                rolled_back.push(resource.id.clone());
            }
            Err(e) => {
                warn!(resource = %resource.id, error = %e, "Rollback failed, continuing");
                errors.push(RollbackError {
                    resource_id: resource.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    let status = RollbackResult::status_for(rolled_back.len(), errors.len());
    emit(DeploymentEvent::RollbackCompleted { status });
    info!(%status, "Rollback finished");

    RollbackResult {
        rolled_back_resources: rolled_back,
        duration: started.elapsed(),
        status,
        errors,
    }
}

async fn rollback_one(
    client: &dyn ClusterClient,
    resource: &DeployedResource,
    config: &RollbackConfig,
) -> Result<()> {
    let target = resource.object_ref();
    let failure = |message: String| Error::Rollback {
        resource_id: resource.id.clone(),
        message,
    };

    match client.delete(&target, config.grace_period).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) if config.force => {
            warn!(resource = %resource.id, error = %e, "Graceful delete failed, forcing");
            match client.delete(&target, Some(0)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(failure(e.to_string())),
            }
        }
        Err(e) => return Err(failure(e.to_string())),
    }

    if let Some(timeout) = config.timeout {
        wait_until_gone(client, &target, timeout, config.poll_interval)
            .await
            .map_err(failure)?;
    }
    Ok(())
}

async fn wait_until_gone(
    client: &dyn ClusterClient,
    target: &ObjectRef,
    timeout: Duration,
    interval: Duration,
) -> std::result::Result<(), String> {
    let poll = async {
        loop {
            match client.read(target).await {
                Err(e) if e.is_not_found() => return,
                _ => tokio::time::sleep(interval).await,
            }
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| format!("{target} still present after {timeout:?}"))
}
