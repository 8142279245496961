//! Resource graph and deployed resource types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::graph::DependencyGraph;
use crate::placeholder::{self, Placeholder};
use crate::readiness::ReadinessEvaluator;
use crate::{Error, Result};

/// Kinds that never live in a namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PriorityClass",
    "IngressClass",
    "RuntimeClass",
    "CSIDriver",
    "APIService",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "ResourceGraphDefinition",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Address of an object in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }

    /// Read the address out of a manifest. Namespaced kinds without a
    /// namespace get `default_namespace`.
    pub fn from_manifest(manifest: &Value, default_namespace: &str) -> Result<Self> {
        let field = |path: &[&str]| {
            path.iter()
                .try_fold(manifest, |v, k| v.get(*k))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let api_version = field(&["apiVersion"])
            .ok_or_else(|| Error::InvalidGraph("manifest is missing apiVersion".to_string()))?;
        let kind = field(&["kind"])
            .ok_or_else(|| Error::InvalidGraph("manifest is missing kind".to_string()))?;
        let name = field(&["metadata", "name"]).ok_or_else(|| {
            Error::InvalidGraph(format!("{kind} manifest is missing metadata.name"))
        })?;
        let namespace = if is_cluster_scoped(&kind) {
            None
        } else {
            Some(field(&["metadata", "namespace"]).unwrap_or_else(|| default_namespace.to_string()))
        };
        Ok(Self {
            api_version,
            kind,
            namespace,
            name,
        })
    }

    /// Write this address's namespace into `manifest`. The API server
    /// places an object by its own metadata, not by where it is later read.
    pub fn place(&self, mut manifest: Value) -> Value {
        if let (Some(namespace), Some(metadata)) = (
            &self.namespace,
            manifest.get_mut("metadata").and_then(Value::as_object_mut),
        ) {
            metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
        }
        manifest
    }

    /// API group, empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(_, version)| version)
            .unwrap_or(&self.api_version)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// One resource of a graph.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphResource {
    /// Unique within the graph.
    pub id: String,
    /// Manifest, possibly containing placeholders.
    pub manifest: Value,
    /// Extra ordering constraints not visible in the manifest.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides the registry's readiness evaluator for this resource.
    #[serde(skip)]
    pub readiness: Option<Arc<dyn ReadinessEvaluator>>,
}

impl GraphResource {
    pub fn new(id: impl Into<String>, manifest: Value) -> Self {
        Self {
            id: id.into(),
            manifest,
            depends_on: Vec::new(),
            readiness: None,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_readiness(mut self, evaluator: Arc<dyn ReadinessEvaluator>) -> Self {
        self.readiness = Some(evaluator);
        self
    }

    pub fn kind(&self) -> &str {
        self.manifest
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Resource ids referenced from the manifest, in order of appearance.
    pub fn referenced_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in placeholder::collect_placeholders(&self.manifest) {
            for id in p.referenced_ids() {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// `(group, kind)` this resource defines, if it is a CRD.
    pub fn defined_kind(&self) -> Option<(String, String)> {
        if self.kind() != "CustomResourceDefinition" {
            return None;
        }
        let spec = self.manifest.get("spec")?;
        let group = spec.get("group")?.as_str()?;
        let kind = spec.get("names")?.get("kind")?.as_str()?;
        Some((group.to_string(), kind.to_string()))
    }

    /// `(group, kind)` of the object this manifest creates.
    pub fn group_kind(&self) -> (String, String) {
        let api_version = self
            .manifest
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let group = api_version
            .rsplit_once('/')
            .map(|(g, _)| g)
            .unwrap_or_default();
        (group.to_string(), self.kind().to_string())
    }
}

impl fmt::Debug for GraphResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphResource")
            .field("id", &self.id)
            .field("manifest", &self.manifest)
            .field("depends_on", &self.depends_on)
            .field("readiness", &self.readiness.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Manifests for the controller backend: the graph definition and one instance of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerManifests {
    pub definition: Value,
    pub instance: Value,
}

/// A named set of resources and the dependencies between them.
///
/// Built once per deployment call and not modified afterwards.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    pub name: String,
    resources: Vec<GraphResource>,
    dependency_graph: DependencyGraph,
    /// Status template: literals and placeholders.
    pub status: Option<Value>,
    /// Needed only in controller mode.
    pub controller: Option<ControllerManifests>,
}

impl ResourceGraph {
    /// Build the graph and derive its edges. Cycles are not checked here;
    /// see [`DependencyGraph::topological_order`].
    pub fn new(name: impl Into<String>, resources: Vec<GraphResource>) -> Result<Self> {
        let mut dependency_graph = DependencyGraph::new();
        let mut seen = HashSet::new();
        for resource in &resources {
            if !seen.insert(resource.id.as_str()) {
                return Err(Error::InvalidGraph(format!(
                    "duplicate resource id '{}'",
                    resource.id
                )));
            }
            dependency_graph.add_node(&resource.id)?;
        }

        for resource in &resources {
            for dep in &resource.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::InvalidGraph(format!(
                        "resource '{}' depends on unknown resource '{}'",
                        resource.id, dep
                    )));
                }
                dependency_graph.add_edge(dep, &resource.id)?;
            }

            for p in placeholder::collect_placeholders(&resource.manifest) {
                match &p {
                    Placeholder::Ref(r) => {
                        if !seen.contains(r.resource_id.as_str()) {
                            return Err(Error::InvalidGraph(format!(
                                "resource '{}' references unknown resource '{}'",
                                resource.id, r.resource_id
                            )));
                        }
                        dependency_graph.add_edge(&r.resource_id, &resource.id)?;
                    }
                    // Expression identifiers may name things other than resources.
                    Placeholder::Expr(_) => {
                        for id in p.referenced_ids() {
                            if seen.contains(id.as_str()) {
                                dependency_graph.add_edge(&id, &resource.id)?;
                            }
                        }
                    }
                }
            }
        }

        for crd in &resources {
            let Some(defined) = crd.defined_kind() else {
                continue;
            };
            for resource in &resources {
                if resource.id != crd.id && resource.group_kind() == defined {
                    dependency_graph.add_edge(&crd.id, &resource.id)?;
                }
            }
        }

        Ok(Self {
            name: name.into(),
            resources,
            dependency_graph,
            status: None,
            controller: None,
        })
    }

    pub fn with_status(mut self, status: Value) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_controller(mut self, controller: ControllerManifests) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn resources(&self) -> &[GraphResource] {
        &self.resources
    }

    pub fn get(&self, id: &str) -> Option<&GraphResource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.dependency_graph
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Lifecycle state of a resource within one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Deploying,
    Deployed,
    Ready,
    Failed,
}

impl ResourceStatus {
    fn rank(self) -> u8 {
        match self {
            ResourceStatus::Pending => 0,
            ResourceStatus::Deploying => 1,
            ResourceStatus::Deployed => 2,
            ResourceStatus::Ready => 3,
            ResourceStatus::Failed => 4,
        }
    }

    /// Transitions only move forward; `Failed` is terminal and reachable from anywhere.
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        match (self, next) {
            (ResourceStatus::Failed, _) => false,
            (_, ResourceStatus::Failed) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResourceStatus::Deployed | ResourceStatus::Ready)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStatus::Pending => write!(f, "pending"),
            ResourceStatus::Deploying => write!(f, "deploying"),
            ResourceStatus::Deployed => write!(f, "deployed"),
            ResourceStatus::Ready => write!(f, "ready"),
            ResourceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A resource the engine has applied to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResource {
    pub id: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    /// The manifest as applied, placeholders resolved.
    pub manifest: Value,
    pub status: ResourceStatus,
    pub deployed_at: DateTime<Utc>,
}

impl DeployedResource {
    pub fn new(id: impl Into<String>, object: &ObjectRef, manifest: Value) -> Self {
        Self {
            id: id.into(),
            api_version: object.api_version.clone(),
            kind: object.kind.clone(),
            name: object.name.clone(),
            namespace: object.namespace.clone(),
            manifest,
            status: ResourceStatus::Deployed,
            deployed_at: Utc::now(),
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(
            self.api_version.clone(),
            self.kind.clone(),
            self.namespace.clone(),
            self.name.clone(),
        )
    }

    /// Move to `next` if the transition is allowed. Returns whether it moved.
    pub fn transition(&mut self, next: ResourceStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}
