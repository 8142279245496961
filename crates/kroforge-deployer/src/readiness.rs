//! Readiness evaluators per resource kind, and the readiness poller.

use kroforge_core::cluster::ClusterClient;
use kroforge_core::readiness::{ReadinessEvaluator, ReadinessResult};
use kroforge_core::resource::{GraphResource, ObjectRef};
use kroforge_core::{Error, Result};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Kinds that are usable as soon as the API server accepts them.
const READY_ON_CREATION: &[&str] = &[
    "ConfigMap",
    "Secret",
    "ServiceAccount",
    "Role",
    "RoleBinding",
    "ClusterRole",
    "ClusterRoleBinding",
    "NetworkPolicy",
    "LimitRange",
    "ResourceQuota",
    "PodDisruptionBudget",
    "HorizontalPodAutoscaler",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
];

/// Kinds reconciled by GitOps-style controllers that publish a `Ready` condition.
const READY_CONDITION_KINDS: &[&str] = &[
    "HelmRelease",
    "HelmRepository",
    "Kustomization",
    "GitRepository",
    "OCIRepository",
    "Certificate",
];

/// Maps resource kinds to readiness evaluators.
///
/// Lookup order: the resource's own override, then its kind, then the
/// generic fallback.
#[derive(Clone)]
pub struct ReadinessRegistry {
    evaluators: HashMap<String, Arc<dyn ReadinessEvaluator>>,
    fallback: Arc<dyn ReadinessEvaluator>,
}

impl ReadinessRegistry {
    /// A registry with only the generic fallback.
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
            fallback: Arc::new(generic_ready),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, evaluator: Arc<dyn ReadinessEvaluator>) {
        self.evaluators.insert(kind.into(), evaluator);
    }

    pub fn with(mut self, kind: impl Into<String>, evaluator: Arc<dyn ReadinessEvaluator>) -> Self {
        self.register(kind, evaluator);
        self
    }

    pub fn for_kind(&self, kind: &str) -> Arc<dyn ReadinessEvaluator> {
        self.evaluators
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn evaluator_for(&self, resource: &GraphResource) -> Arc<dyn ReadinessEvaluator> {
        resource
            .readiness
            .clone()
            .unwrap_or_else(|| self.for_kind(resource.kind()))
    }
}

impl Default for ReadinessRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("Deployment", Arc::new(replicas_ready));
        registry.register("StatefulSet", Arc::new(replicas_ready));
        registry.register("ReplicaSet", Arc::new(replicas_ready));
        registry.register("DaemonSet", Arc::new(daemon_set_ready));
        registry.register("Job", Arc::new(job_ready));
        registry.register("Pod", Arc::new(pod_ready));
        registry.register("Service", Arc::new(service_ready));
        registry.register("Ingress", Arc::new(ingress_ready));
        registry.register("PersistentVolumeClaim", Arc::new(pvc_ready));
        registry.register("Namespace", Arc::new(namespace_ready));
        registry.register("CustomResourceDefinition", Arc::new(crd_established));
        registry.register("ResourceGraphDefinition", Arc::new(definition_active));
        for kind in READY_CONDITION_KINDS {
            registry.register(*kind, Arc::new(ready_condition));
        }
        for kind in READY_ON_CREATION {
            registry.register(*kind, Arc::new(exists));
        }
        registry
    }
}

static NULL: Value = Value::Null;

fn status(live: &Value) -> &Value {
    live.get("status").unwrap_or(&NULL)
}

fn int(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

/// `Some(true|false)` for a condition of `kind`, `None` if it is absent.
fn condition(live: &Value, kind: &str) -> Option<bool> {
    status(live)
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
        .map(|c| c.get("status").and_then(Value::as_str) == Some("True"))
}

fn condition_message(live: &Value, kind: &str) -> String {
    status(live)
        .get("conditions")
        .and_then(Value::as_array)
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
        })
        .and_then(|c| c.get("message").and_then(Value::as_str))
        .unwrap_or("condition not yet true")
        .to_string()
}

fn has_load_balancer_ingress(live: &Value) -> bool {
    status(live)
        .get("loadBalancer")
        .and_then(|lb| lb.get("ingress"))
        .and_then(Value::as_array)
        .is_some_and(|ingress| !ingress.is_empty())
}

fn generation_observed(live: &Value) -> bool {
    let generation = live.get("metadata").and_then(|m| int(m, "generation"));
    let observed = int(status(live), "observedGeneration");
    match (generation, observed) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => true,
    }
}

/// Ready once every desired replica reports ready.
pub fn replicas_ready(live: &Value) -> ReadinessResult {
    let desired = live
        .get("spec")
        .and_then(|s| int(s, "replicas"))
        .unwrap_or(1);
    let ready = int(status(live), "readyReplicas").unwrap_or(0);

    if !generation_observed(live) {
        return ReadinessResult::not_ready("GenerationPending", "controller has not observed the latest spec");
    }
    if ready >= desired {
        ReadinessResult::ready_with(format!("{ready}/{desired} replicas ready"))
    } else {
        ReadinessResult::not_ready("ReplicasNotReady", format!("{ready}/{desired} replicas ready"))
            .with_details(json!({"readyReplicas": ready, "replicas": desired}))
    }
}

pub fn daemon_set_ready(live: &Value) -> ReadinessResult {
    let status = status(live);
    let (Some(desired), Some(ready)) = (
        int(status, "desiredNumberScheduled"),
        int(status, "numberReady"),
    ) else {
        return ReadinessResult::not_ready("StatusPending", "daemon set has not reported status");
    };
    if ready >= desired {
        ReadinessResult::ready_with(format!("{ready}/{desired} pods ready"))
    } else {
        ReadinessResult::not_ready("PodsNotReady", format!("{ready}/{desired} pods ready"))
    }
}

pub fn job_ready(live: &Value) -> ReadinessResult {
    if condition(live, "Failed") == Some(true) {
        return ReadinessResult::failed("JobFailed", condition_message(live, "Failed"));
    }
    if condition(live, "Complete") == Some(true) {
        return ReadinessResult::ready_with("job complete");
    }
    let completions = live
        .get("spec")
        .and_then(|s| int(s, "completions"))
        .unwrap_or(1);
    let succeeded = int(status(live), "succeeded").unwrap_or(0);
    if succeeded >= completions {
        ReadinessResult::ready()
    } else {
        ReadinessResult::not_ready("JobRunning", format!("{succeeded}/{completions} completions"))
    }
}

pub fn pod_ready(live: &Value) -> ReadinessResult {
    if status(live).get("phase").and_then(Value::as_str) == Some("Succeeded") {
        return ReadinessResult::ready_with("pod succeeded");
    }
    match condition(live, "Ready") {
        Some(true) => ReadinessResult::ready(),
        _ => ReadinessResult::not_ready("PodNotReady", condition_message(live, "Ready")),
    }
}

/// LoadBalancer services wait for an external address; other types are ready on creation.
pub fn service_ready(live: &Value) -> ReadinessResult {
    let service_type = live
        .get("spec")
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("ClusterIP");
    if service_type != "LoadBalancer" || has_load_balancer_ingress(live) {
        ReadinessResult::ready()
    } else {
        ReadinessResult::not_ready("AddressPending", "waiting for load balancer address")
    }
}

pub fn ingress_ready(live: &Value) -> ReadinessResult {
    if has_load_balancer_ingress(live) {
        ReadinessResult::ready()
    } else {
        ReadinessResult::not_ready("AddressPending", "waiting for ingress address")
    }
}

pub fn pvc_ready(live: &Value) -> ReadinessResult {
    match status(live).get("phase").and_then(Value::as_str) {
        Some("Bound") => ReadinessResult::ready(),
        phase => ReadinessResult::not_ready(
            "VolumeNotBound",
            format!("claim phase is {}", phase.unwrap_or("unknown")),
        ),
    }
}

pub fn namespace_ready(live: &Value) -> ReadinessResult {
    match status(live).get("phase").and_then(Value::as_str) {
        None | Some("Active") => ReadinessResult::ready(),
        Some(phase) => ReadinessResult::not_ready("NamespaceNotActive", format!("namespace is {phase}")),
    }
}

/// A CRD is established once its names are accepted and it is being served.
pub fn crd_established(live: &Value) -> ReadinessResult {
    match (condition(live, "Established"), condition(live, "NamesAccepted")) {
        (Some(true), Some(true)) => ReadinessResult::ready_with("established"),
        (_, Some(false)) => {
            ReadinessResult::not_ready("NamesNotAccepted", condition_message(live, "NamesAccepted"))
        }
        _ => ReadinessResult::not_ready("NotEstablished", condition_message(live, "Established")),
    }
}

pub fn definition_active(live: &Value) -> ReadinessResult {
    match status(live).get("state").and_then(Value::as_str) {
        Some("Active") => ReadinessResult::ready(),
        state => ReadinessResult::not_ready(
            "DefinitionInactive",
            format!("definition state is {}", state.unwrap_or("unknown")),
        ),
    }
}

/// An instance reconciled by the graph controller.
pub fn controller_instance_ready(live: &Value) -> ReadinessResult {
    let state = status(live).get("state").and_then(Value::as_str);
    let synced = condition(live, "Ready") == Some(true)
        || condition(live, "InstanceSynced") == Some(true);
    match state {
        Some("ACTIVE") if synced => ReadinessResult::ready(),
        Some("ACTIVE") => ReadinessResult::not_ready("NotSynced", condition_message(live, "Ready")),
        state => ReadinessResult::not_ready(
            "InstanceInactive",
            format!("instance state is {}", state.unwrap_or("unknown")),
        ),
    }
}

pub fn ready_condition(live: &Value) -> ReadinessResult {
    match condition(live, "Ready") {
        Some(true) => ReadinessResult::ready(),
        _ => ReadinessResult::not_ready("NotReady", condition_message(live, "Ready")),
    }
}

pub fn exists(_live: &Value) -> ReadinessResult {
    ReadinessResult::ready()
}

/// Fallback for unknown kinds: the `Ready` condition, then the phase, then existence.
pub fn generic_ready(live: &Value) -> ReadinessResult {
    if condition(live, "Ready").is_some() {
        return ready_condition(live);
    }
    match status(live).get("phase").and_then(Value::as_str) {
        None | Some("Running" | "Active" | "Bound" | "Succeeded" | "Ready") => ReadinessResult::ready(),
        Some(phase) => ReadinessResult::not_ready("PhaseNotReady", format!("phase is {phase}")),
    }
}

/// How a readiness poll ended, other than with an API error.
#[derive(Debug)]
pub enum PollOutcome {
    /// The evaluator reported ready; carries the live object from that poll.
    Ready { live: Value, attempts: u32 },
    /// The evaluator reported a terminal failure.
    Failed { result: ReadinessResult, attempts: u32 },
    /// The token fired first; carries the last result observed.
    Interrupted { last: Option<ReadinessResult> },
}

/// Poll `target` every `interval` until `evaluator` reports ready or a
/// terminal failure, or `cancel` fires.
///
/// A missing object or a transient API error counts as not ready. Any other
/// API error ends the poll.
pub async fn poll_until_ready(
    client: &dyn ClusterClient,
    target: &ObjectRef,
    evaluator: &dyn ReadinessEvaluator,
    interval: Duration,
    cancel: &CancellationToken,
    mut on_poll: impl FnMut(u32, &ReadinessResult),
) -> Result<PollOutcome> {
    let mut last = None;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Interrupted { last });
        }
        attempt += 1;

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PollOutcome::Interrupted { last }),
            read = client.read(target) => read,
        };

        let (result, live) = match read {
            Ok(live) => (evaluator.evaluate(&live), Some(live)),
            Err(e) if e.is_not_found() => (ReadinessResult::not_ready("NotFound", e.message), None),
            Err(e) if e.is_transient() => (ReadinessResult::not_ready("ApiError", e.to_string()), None),
            Err(e) => return Err(Error::Api(e)),
        };

        debug!(
            object = %target,
            attempt,
            ready = result.ready,
            reason = result.reason.as_deref().unwrap_or(""),
            "Readiness poll"
        );
        on_poll(attempt, &result);

        if let (true, Some(live)) = (result.ready, live) {
            return Ok(PollOutcome::Ready {
                live,
                attempts: attempt,
            });
        }
        if result.terminal {
            return Ok(PollOutcome::Failed {
                result,
                attempts: attempt,
            });
        }
        last = Some(result);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PollOutcome::Interrupted { last }),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;

    fn with_status(kind: &str, spec: Value, status: Value) -> Value {
        json!({"kind": kind, "metadata": {"name": "x"}, "spec": spec, "status": status})
    }

    #[test]
    fn test_workload_replicas() {
        let registry = ReadinessRegistry::default();
        let pending = with_status("Deployment", json!({"replicas": 3}), json!({"readyReplicas": 1}));
        let result = registry.for_kind("Deployment").evaluate(&pending);
        assert!(!result.ready);
        assert_eq!(result.reason.as_deref(), Some("ReplicasNotReady"));

        let done = with_status("Deployment", json!({"replicas": 3}), json!({"readyReplicas": 3}));
        assert!(registry.for_kind("Deployment").evaluate(&done).ready);
    }

    #[test]
    fn test_stale_generation_is_not_ready() {
        let live = json!({
            "metadata": {"generation": 4},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 3, "readyReplicas": 1}
        });
        assert!(!replicas_ready(&live).ready);
    }

    #[test]
    fn test_config_kinds_ready_on_creation() {
        let registry = ReadinessRegistry::default();
        assert!(registry.for_kind("ConfigMap").evaluate(&json!({})).ready);
        assert!(registry.for_kind("Secret").evaluate(&json!({})).ready);
    }

    #[test]
    fn test_load_balancer_waits_for_address() {
        let registry = ReadinessRegistry::default();
        let pending = with_status("Service", json!({"type": "LoadBalancer"}), json!({}));
        assert!(!registry.for_kind("Service").evaluate(&pending).ready);

        let assigned = with_status(
            "Service",
            json!({"type": "LoadBalancer"}),
            json!({"loadBalancer": {"ingress": [{"ip": "203.0.113.9"}]}}),
        );
        assert!(registry.for_kind("Service").evaluate(&assigned).ready);

        let cluster_ip = with_status("Service", json!({"type": "ClusterIP"}), json!({}));
        assert!(registry.for_kind("Service").evaluate(&cluster_ip).ready);
    }

    #[test]
    fn test_crd_needs_both_conditions() {
        let established = json!({"status": {"conditions": [
            {"type": "NamesAccepted", "status": "True"},
            {"type": "Established", "status": "True"}
        ]}});
        assert!(crd_established(&established).ready);

        let pending = json!({"status": {"conditions": [
            {"type": "NamesAccepted", "status": "True"},
            {"type": "Established", "status": "False", "message": "not yet"}
        ]}});
        let result = crd_established(&pending);
        assert!(!result.ready);
        assert_eq!(result.message.as_deref(), Some("not yet"));
    }

    #[test]
    fn test_failed_job_is_terminal() {
        let live = json!({"status": {"conditions": [
            {"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}
        ]}});
        let result = job_ready(&live);
        assert!(!result.ready);
        assert!(result.terminal);
        assert_eq!(result.reason.as_deref(), Some("JobFailed"));
        assert_eq!(result.message.as_deref(), Some("BackoffLimitExceeded"));

        let running = json!({"spec": {"completions": 2}, "status": {"succeeded": 1}});
        assert!(!job_ready(&running).terminal);
    }

    #[test]
    fn test_controller_instance() {
        let active = json!({"status": {"state": "ACTIVE", "conditions": [
            {"type": "InstanceSynced", "status": "True"}
        ]}});
        assert!(controller_instance_ready(&active).ready);
        let progressing = json!({"status": {"state": "IN_PROGRESS"}});
        assert!(!controller_instance_ready(&progressing).ready);
    }

    #[test]
    fn test_generic_fallback() {
        assert!(generic_ready(&json!({"metadata": {"name": "x"}})).ready);
        assert!(!generic_ready(&json!({"status": {"phase": "Pending"}})).ready);
        assert!(
            !generic_ready(&json!({"status": {"conditions": [{"type": "Ready", "status": "False"}]}}))
                .ready
        );
    }

    #[test]
    fn test_resource_override_wins() {
        let registry = ReadinessRegistry::default();
        let resource = GraphResource::new("cm", json!({"kind": "ConfigMap"}))
            .with_readiness(Arc::new(|_: &Value| ReadinessResult::not_ready("Custom", "never")));
        assert!(!registry.evaluator_for(&resource).evaluate(&json!({})).ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_reports_each_attempt() {
        let cluster = MockCluster::new();
        cluster.insert(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {"replicas": 2}
        }));
        cluster.script_status(
            "web",
            vec![
                json!({"readyReplicas": 0}),
                json!({"readyReplicas": 1}),
                json!({"readyReplicas": 2}),
            ],
        );
        let target = ObjectRef::new("apps/v1", "Deployment", Some("default".into()), "web");
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();

        let outcome = poll_until_ready(
            &cluster,
            &target,
            &replicas_ready,
            Duration::from_secs(2),
            &cancel,
            |attempt, result| seen.push((attempt, result.ready)),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, PollOutcome::Ready { attempts: 3, .. }));
        assert_eq!(seen, vec![(1, false), (2, false), (3, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_ends_on_terminal_failure() {
        let cluster = MockCluster::new();
        cluster.insert(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "default"}
        }));
        cluster.script_status(
            "migrate",
            vec![
                json!({"active": 1}),
                json!({"conditions": [
                    {"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}
                ]}),
            ],
        );
        let target = ObjectRef::new("batch/v1", "Job", Some("default".into()), "migrate");
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let outcome = poll_until_ready(
            &cluster,
            &target,
            &job_ready,
            Duration::from_secs(5),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();

        let PollOutcome::Failed { result, attempts } = outcome else {
            panic!("expected a terminal failure, got {outcome:?}");
        };
        assert_eq!(attempts, 2);
        assert_eq!(result.reason.as_deref(), Some("JobFailed"));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(cluster.reads("migrate"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_stops_on_cancel() {
        let cluster = MockCluster::new();
        let target = ObjectRef::new("v1", "ConfigMap", Some("default".into()), "missing");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let outcome = poll_until_ready(
            &cluster,
            &target,
            &exists,
            Duration::from_secs(2),
            &cancel,
            |_, _| {},
        )
        .await
        .unwrap();

        match outcome {
            PollOutcome::Interrupted { last } => {
                assert_eq!(last.unwrap().reason.as_deref(), Some("NotFound"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // reads at 0s, 2s and 4s
        assert_eq!(cluster.reads("missing"), 3);
    }

    #[tokio::test]
    async fn test_poll_fails_on_permanent_error() {
        let cluster = MockCluster::new();
        cluster.fail(
            crate::testing::Op::Read,
            "web",
            kroforge_core::cluster::ApiError::new(403, "Forbidden", "denied"),
        );
        let target = ObjectRef::new("apps/v1", "Deployment", Some("default".into()), "web");
        let err = poll_until_ready(
            &cluster,
            &target,
            &exists,
            Duration::from_secs(1),
            &CancellationToken::new(),
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }
}
