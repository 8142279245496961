//! Deployment engine: applies a resource graph in dependency order.

use futures::StreamExt;
use futures::stream;
use kroforge_core::cluster::{ApiResult, ClusterClient};
use kroforge_core::deployment::{
    DeploymentEvent, DeploymentMode, DeploymentOptions, DeploymentPhase, DeploymentResult,
    DeploymentStatus, EngineSettings, ResourceError, RetryPolicy,
};
use kroforge_core::expression::{ExpressionEngine, PathExpressionEngine};
use kroforge_core::hydration::{hydrate, split_status};
use kroforge_core::readiness::{ReadinessEvaluator, ReadinessResult};
use kroforge_core::resource::{
    DeployedResource, GraphResource, ObjectRef, ResourceGraph, ResourceStatus,
};
use kroforge_core::rollback::{RollbackConfig, RollbackResult};
use kroforge_core::{DeploymentId, Error, Result};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller;
use crate::readiness::{PollOutcome, ReadinessRegistry, crd_established, poll_until_ready};
use crate::resolver::ReferenceResolver;
use crate::rollback;

/// Deploys resource graphs against a cluster.
///
/// The engine holds no state between calls; every [`deploy`](Self::deploy)
/// gets its own resolver cache, cancellation token and result.
pub struct DeploymentEngine {
    client: Arc<dyn ClusterClient>,
    expressions: Arc<dyn ExpressionEngine>,
    readiness: ReadinessRegistry,
    settings: EngineSettings,
}

impl DeploymentEngine {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            expressions: Arc::new(PathExpressionEngine::new()),
            readiness: ReadinessRegistry::default(),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_expression_engine(mut self, engine: Arc<dyn ExpressionEngine>) -> Self {
        self.expressions = engine;
        self
    }

    pub fn with_readiness(mut self, registry: ReadinessRegistry) -> Self {
        self.readiness = registry;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn readiness(&self) -> &ReadinessRegistry {
        &self.readiness
    }

    /// Deploy every resource of `graph`.
    ///
    /// Structural problems such as cycles are returned as errors before any
    /// API call. Per-resource failures are reported in the result.
    pub async fn deploy(
        &self,
        graph: &ResourceGraph,
        options: &DeploymentOptions,
    ) -> Result<DeploymentResult> {
        if options.mode == DeploymentMode::Controller {
            return controller::deploy(self, graph, options).await;
        }

        let levels = graph.dependency_graph().levels()?;
        let run = DeploymentRun::new(self, options);
        run.start(&graph.name, graph.len());

        let concurrency = self.settings.max_concurrency.max(1);
        for level in &levels {
            let mut runnable = Vec::new();
            for id in level {
                // already skipped by a failed dependency
                if run.status_of(id) == ResourceStatus::Failed {
                    continue;
                }
                if run.cancel.is_cancelled() {
                    run.fail(id, DeploymentPhase::Deployment, &Error::Cancelled);
                    continue;
                }
                let failed: Vec<String> = graph
                    .dependency_graph()
                    .dependencies(id)
                    .into_iter()
                    .filter(|dep| !run.status_of(dep).is_success())
                    .map(str::to_string)
                    .collect();
                if !failed.is_empty() {
                    info!(resource = %id, ?failed, "Skipping resource due to failed dependencies");
                    let err = Error::DependencyFailed {
                        resource_id: id.clone(),
                        dependencies: failed,
                    };
                    run.fail(id, DeploymentPhase::Dependency, &err);
                    continue;
                }
                runnable.push(id);
            }

            stream::iter(runnable)
                .map(|id| run.deploy_graph_resource(graph, id))
                .buffer_unordered(concurrency)
                .collect::<Vec<()>>()
                .await;
        }

        let graph_status = match &graph.status {
            Some(template) => Some(run.hydrate_status(template).await),
            None => None,
        };
        Ok(run.finish(graph.len(), graph_status).await)
    }

    /// Deploy a single resource. Placeholders in it cannot be resolved, as
    /// nothing else has been deployed alongside it.
    pub async fn deploy_resource(
        &self,
        resource: &GraphResource,
        options: &DeploymentOptions,
    ) -> Result<DeployedResource> {
        let run = DeploymentRun::new(self, options);
        match run.deploy_one(resource, false).await {
            Ok(deployed) => Ok(run.deployed(&resource.id).unwrap_or(deployed)),
            Err((phase, e)) => {
                error!(resource = %resource.id, %phase, error = %e, "Resource deployment failed");
                Err(e)
            }
        }
    }

    /// Delete a deployed resource. A resource that is already gone is not an error.
    pub async fn delete_resource(&self, resource: &DeployedResource) -> Result<()> {
        let target = resource.object_ref();
        match self.client.delete(&target, None).await {
            Ok(()) => {
                info!(resource = %resource.id, object = %target, "Deleted resource");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(resource = %resource.id, object = %target, "Resource already deleted");
                Ok(())
            }
            Err(e) => Err(Error::Api(e)),
        }
    }

    /// Roll back `resources`, given in the order they were deployed.
    pub async fn rollback_resources(
        &self,
        resources: &[DeployedResource],
        config: &RollbackConfig,
    ) -> RollbackResult {
        rollback::rollback_resources(self.client.as_ref(), resources, config, None).await
    }
}

#[derive(Default)]
struct RunState {
    statuses: HashMap<String, ResourceStatus>,
    /// Realized deployment order.
    deployed: Vec<DeployedResource>,
    errors: Vec<ResourceError>,
    applied: HashSet<String>,
}

/// Cancels the run's token when the deployment timeout elapses.
struct DeadlineTimer(JoinHandle<()>);

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// State of one `deploy()` call.
pub(crate) struct DeploymentRun<'a> {
    pub(crate) engine: &'a DeploymentEngine,
    pub(crate) options: &'a DeploymentOptions,
    deployment_id: DeploymentId,
    resolver: ReferenceResolver,
    cancel: CancellationToken,
    retry: RetryPolicy,
    started: Instant,
    state: Mutex<RunState>,
    _deadline: DeadlineTimer,
}

impl<'a> DeploymentRun<'a> {
    pub(crate) fn new(engine: &'a DeploymentEngine, options: &'a DeploymentOptions) -> Self {
        let cancel = options.cancellation.child_token();
        let deadline = {
            let cancel = cancel.clone();
            let timeout = options.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(?timeout, "Deployment timeout elapsed, cancelling");
                cancel.cancel();
            })
        };

        Self {
            engine,
            options,
            deployment_id: DeploymentId::new(),
            resolver: ReferenceResolver::new(engine.client.clone(), engine.expressions.clone()),
            cancel,
            retry: options.retry_policy(),
            started: Instant::now(),
            state: Mutex::new(RunState::default()),
            _deadline: DeadlineTimer(deadline),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn start(&self, graph: &str, resources: usize) {
        info!(
            deployment = %self.deployment_id,
            graph = %graph,
            resources,
            mode = %self.options.mode,
            "Starting deployment"
        );
        self.options.emit(DeploymentEvent::Started {
            deployment_id: self.deployment_id,
            graph: graph.to_string(),
            resources,
        });
    }

    pub(crate) fn status_of(&self, id: &str) -> ResourceStatus {
        self.lock()
            .statuses
            .get(id)
            .copied()
            .unwrap_or(ResourceStatus::Pending)
    }

    pub(crate) fn set_status(&self, id: &str, status: ResourceStatus) {
        let changed = {
            let mut state = self.lock();
            let current = state
                .statuses
                .get(id)
                .copied()
                .unwrap_or(ResourceStatus::Pending);
            if current.can_transition_to(status) {
                state.statuses.insert(id.to_string(), status);
                if let Some(deployed) = state.deployed.iter_mut().find(|r| r.id == id) {
                    deployed.transition(status);
                }
                true
            } else {
                false
            }
        };
        if changed {
            debug!(resource = %id, %status, "Resource status changed");
            self.options.emit(DeploymentEvent::ResourceStatusChanged {
                resource_id: id.to_string(),
                status,
            });
        }
    }

    pub(crate) fn fail(&self, id: &str, phase: DeploymentPhase, err: &Error) {
        error!(resource = %id, %phase, error = %err, "Resource failed");
        self.lock()
            .errors
            .push(ResourceError::new(id, phase, err));
        self.set_status(id, ResourceStatus::Failed);
        self.options.emit(DeploymentEvent::ResourceFailed {
            resource_id: id.to_string(),
            phase,
            error: err.to_string(),
        });
    }

    /// Add an applied resource to the realized order.
    pub(crate) fn record(&self, deployed: DeployedResource) {
        let id = deployed.id.clone();
        info!(resource = %id, kind = %deployed.kind, name = %deployed.name, "Resource deployed");
        self.lock().deployed.push(deployed);
        self.set_status(&id, ResourceStatus::Deployed);
    }

    pub(crate) fn deployed(&self, id: &str) -> Option<DeployedResource> {
        self.lock().deployed.iter().find(|r| r.id == id).cloned()
    }

    /// Error for a wait that was interrupted by the run's token.
    fn interrupted(&self, resource_id: &str, last: Option<ReadinessResult>) -> Error {
        if self.options.cancellation.is_cancelled() {
            Error::Cancelled
        } else {
            Error::ReadinessTimeout {
                resource_id: resource_id.to_string(),
                timeout: self.options.timeout,
                last,
            }
        }
    }

    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            out = fut => out,
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    async fn deploy_graph_resource(&self, graph: &ResourceGraph, id: &str) {
        let Some(resource) = graph.get(id) else {
            let err = Error::Internal(format!("resource '{id}' is not in the graph"));
            self.fail(id, DeploymentPhase::Validation, &err);
            return;
        };
        // A CRD that other resources instantiate gates them on establishment.
        let gates_dependents = resource.defined_kind().is_some_and(|defined| {
            graph
                .resources()
                .iter()
                .any(|r| r.id != resource.id && r.group_kind() == defined)
        });

        if let Err((phase, err)) = self.deploy_one(resource, gates_dependents).await {
            self.fail(id, phase, &err);
            // once cancelled, unstarted resources are recorded as cancelled instead
            if !self.cancel.is_cancelled() {
                self.skip_dependents(graph, id);
            }
        }
    }

    /// Fail everything downstream of `failed` without waiting for its level.
    fn skip_dependents(&self, graph: &ResourceGraph, failed: &str) {
        let dependencies = graph.dependency_graph();
        let skipped = dependencies.transitive_dependents(failed);
        if skipped.is_empty() {
            return;
        }
        info!(resource = %failed, ?skipped, "Skipping dependents of failed resource");
        for id in &skipped {
            if self.status_of(id) == ResourceStatus::Failed {
                continue;
            }
            let blocked_by: Vec<String> = dependencies
                .dependencies(id)
                .into_iter()
                .filter(|dep| *dep == failed || skipped.iter().any(|s| s.as_str() == *dep))
                .map(str::to_string)
                .collect();
            let err = Error::DependencyFailed {
                resource_id: id.clone(),
                dependencies: blocked_by,
            };
            self.fail(id, DeploymentPhase::Dependency, &err);
        }
    }

    async fn deploy_one(
        &self,
        resource: &GraphResource,
        establish: bool,
    ) -> std::result::Result<DeployedResource, (DeploymentPhase, Error)> {
        let id = resource.id.as_str();
        self.set_status(id, ResourceStatus::Deploying);

        let manifest = self
            .guard(self.resolver.resolve_resource(resource))
            .await
            .map_err(|e| (DeploymentPhase::Resolution, e))?;
        let object = ObjectRef::from_manifest(&manifest, &self.options.namespace)
            .map_err(|e| (DeploymentPhase::Validation, e))?;
        let manifest = object.place(manifest);

        self.apply(id, &object, &manifest)
            .await
            .map_err(|e| (DeploymentPhase::Deployment, e))?;
        let deployed = DeployedResource::new(id, &object, manifest);
        self.record(deployed.clone());
        self.resolver.record(&deployed).await;

        if establish {
            info!(resource = %id, crd = %object.name, "Waiting for CRD to be established");
            let live = self
                .wait_established(id, &object)
                .await
                .map_err(|e| (DeploymentPhase::Establishment, e))?;
            self.resolver.observe(id, live).await;
            if self.options.wait_for_ready {
                self.set_status(id, ResourceStatus::Ready);
            }
        } else if self.options.wait_for_ready {
            let evaluator = self.engine.readiness.evaluator_for(resource);
            let live = self
                .wait_ready(id, &object, evaluator.as_ref())
                .await
                .map_err(|e| (DeploymentPhase::Readiness, e))?;
            self.resolver.observe(id, live).await;
            self.set_status(id, ResourceStatus::Ready);
        }

        Ok(deployed)
    }

    /// Apply a manifest, retrying transient errors. Each id is applied at most once per run.
    pub(crate) async fn apply(&self, id: &str, object: &ObjectRef, manifest: &Value) -> Result<()> {
        if !self.lock().applied.insert(id.to_string()) {
            return Err(Error::Internal(format!(
                "{id} was already applied in this deployment"
            )));
        }

        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = self.apply_once(object, manifest) => result,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(resource = %id, attempt, error = %e, ?delay, "Transient API error, retrying");
                    self.options.emit(DeploymentEvent::Retrying {
                        resource_id: id.to_string(),
                        attempt,
                        error: e.to_string(),
                    });
                    self.sleep(delay).await?;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::ResourceDeployment {
                        resource_id: id.to_string(),
                        object: object.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Create, falling back to patch and then replace when the object exists.
    async fn apply_once(&self, object: &ObjectRef, manifest: &Value) -> ApiResult<()> {
        let client = self.engine.client.as_ref();
        match client.create(manifest).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(object = %object, "Object exists, patching");
                match client.patch(manifest).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_conflict() => {
                        debug!(object = %object, "Patch conflicted, replacing");
                        let live = client.read(object).await?;
                        let mut replacement = manifest.clone();
                        if let Some(version) = live.pointer("/metadata/resourceVersion") {
                            replacement["metadata"]["resourceVersion"] = version.clone();
                        }
                        client.replace(&replacement).await.map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Poll until ready; returns the live object from the final poll.
    pub(crate) async fn wait_ready(
        &self,
        id: &str,
        target: &ObjectRef,
        evaluator: &dyn ReadinessEvaluator,
    ) -> Result<Value> {
        let outcome = poll_until_ready(
            self.engine.client.as_ref(),
            target,
            evaluator,
            self.engine.settings.poll_interval,
            &self.cancel,
            |attempt, result| {
                self.options.emit(DeploymentEvent::ReadinessPolled {
                    resource_id: id.to_string(),
                    attempt,
                    result: result.clone(),
                })
            },
        )
        .await?;

        match outcome {
            PollOutcome::Ready { live, attempts } => {
                info!(resource = %id, attempts, "Resource ready");
                Ok(live)
            }
            PollOutcome::Failed { result, attempts } => {
                warn!(
                    resource = %id,
                    attempts,
                    reason = result.reason.as_deref().unwrap_or(""),
                    "Resource failed readiness"
                );
                Err(Error::ReadinessFailed {
                    resource_id: id.to_string(),
                    result,
                })
            }
            PollOutcome::Interrupted { last } => Err(self.interrupted(id, last)),
        }
    }

    /// Wait for a CRD to report `Established`, bounded by its own timeout.
    pub(crate) async fn wait_established(&self, id: &str, crd: &ObjectRef) -> Result<Value> {
        let timeout = self.engine.settings.crd_establishment_timeout;
        match tokio::time::timeout(timeout, self.wait_ready(id, crd, &crd_established)).await {
            Ok(result) => result,
            Err(_) => Err(Error::CrdEstablishmentTimeout {
                crd: crd.name.clone(),
                timeout,
            }),
        }
    }

    /// Resolve the dynamic half of a status template and merge it over the static half.
    async fn hydrate_status(&self, template: &Value) -> Value {
        let (static_fields, dynamic) = split_status(template);
        let mut resolved = Map::new();
        if let Value::Object(fields) = dynamic {
            for (key, value) in fields {
                match self.guard(self.resolver.resolve_value(&value)).await {
                    Ok(value) => {
                        resolved.insert(key, value);
                    }
                    Err(e) => {
                        warn!(field = %key, error = %e, "Dropping unresolved status field");
                        self.lock().errors.push(ResourceError::new(
                            format!("status.{key}"),
                            DeploymentPhase::StatusHydration,
                            e,
                        ));
                    }
                }
            }
        }
        hydrate(&Value::Object(resolved), &static_fields)
    }

    /// Aggregate, roll back if configured, and build the result.
    pub(crate) async fn finish(self, total: usize, graph_status: Option<Value>) -> DeploymentResult {
        let state = std::mem::take(&mut *self.lock());
        let succeeded = state.statuses.values().filter(|s| s.is_success()).count();
        let status = DeploymentStatus::from_counts(succeeded, total);

        let rollback = if self.options.rollback_on.applies_to(status) && !state.deployed.is_empty() {
            Some(
                rollback::rollback_resources(
                    self.engine.client.as_ref(),
                    &state.deployed,
                    &self.options.rollback,
                    self.options.progress.as_ref(),
                )
                .await,
            )
        } else {
            None
        };

        let duration = self.started.elapsed();
        info!(
            deployment = %self.deployment_id,
            %status,
            succeeded,
            total,
            ?duration,
            "Deployment finished"
        );
        self.options.emit(DeploymentEvent::Completed {
            deployment_id: self.deployment_id,
            status,
        });

        DeploymentResult {
            deployment_id: self.deployment_id,
            status,
            resources: state.deployed,
            errors: state.errors,
            duration,
            graph_status,
            rollback,
        }
    }
}
