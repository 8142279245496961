//! Kubernetes cluster client.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Event;
use kroforge_core::cluster::{
    ApiError, ApiResult, ClusterClient, ClusterEvent, ClusterEventType,
};
use kroforge_core::resource::ObjectRef;
use kroforge_core::{Error, Result};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::runtime::{WatchStreamExt, watcher};
use kube::Client;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Cluster client that talks to the Kubernetes API through kube-rs.
///
/// Objects are handled as [`DynamicObject`]s; the API resource for each
/// `(apiVersion, kind)` is discovered once and cached.
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
    discovered: RwLock<HashMap<(String, String), (ApiResource, ApiCapabilities)>>,
}

impl KubeClusterClient {
    /// Connect using the ambient kubeconfig or in-cluster configuration.
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        let namespace = client.default_namespace().to_string();
        Self {
            client,
            namespace,
            discovered: RwLock::new(HashMap::new()),
        }
    }

    async fn api_for(&self, target: &ObjectRef) -> ApiResult<Api<DynamicObject>> {
        let key = (target.api_version.clone(), target.kind.clone());
        let cached = self.discovered.read().await.get(&key).cloned();
        let (resource, caps) = match cached {
            Some(found) => found,
            None => {
                let gvk = GroupVersionKind::gvk(target.group(), target.version(), &target.kind);
                let found = discovery::pinned_kind(&self.client, &gvk)
                    .await
                    .map_err(api_error)?;
                debug!(api_version = %target.api_version, kind = %target.kind, "Discovered API resource");
                self.discovered.write().await.insert(key, found.clone());
                found
            }
        };

        Ok(match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                target.namespace.as_deref().unwrap_or(&self.namespace),
                &resource,
            ),
        })
    }

    fn target_of(&self, manifest: &Value) -> ApiResult<ObjectRef> {
        ObjectRef::from_manifest(manifest, &self.namespace)
            .map_err(|e| ApiError::new(400, "BadRequest", e.to_string()))
    }
}

fn api_error(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(response) => ApiError::new(response.code, response.reason, response.message),
        // The kind is not served yet, e.g. a CRD that is still being established.
        kube::Error::Discovery(e) => ApiError::not_found(e.to_string()),
        other => ApiError::transport(other.to_string()),
    }
}

fn to_dynamic(manifest: &Value) -> ApiResult<DynamicObject> {
    serde_json::from_value(manifest.clone())
        .map_err(|e| ApiError::new(400, "BadRequest", format!("invalid manifest: {e}")))
}

fn to_value(object: DynamicObject) -> ApiResult<Value> {
    serde_json::to_value(object).map_err(|e| ApiError::transport(e.to_string()))
}

fn to_cluster_event(involved: &ObjectRef, event: Event) -> ClusterEvent {
    let event_type = match event.type_.as_deref() {
        Some("Warning") => ClusterEventType::Warning,
        _ => ClusterEventType::Normal,
    };
    let timestamp = event
        .last_timestamp
        .map(|t| t.0)
        .or_else(|| event.event_time.map(|t| t.0))
        .unwrap_or_else(Utc::now);
    ClusterEvent {
        event_type,
        reason: event.reason.unwrap_or_default(),
        message: event.message.unwrap_or_default(),
        involved: involved.clone(),
        count: event.count.unwrap_or(1).max(0) as u32,
        timestamp,
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn read(&self, target: &ObjectRef) -> ApiResult<Value> {
        let api = self.api_for(target).await?;
        let object = api.get(&target.name).await.map_err(api_error)?;
        to_value(object)
    }

    async fn create(&self, manifest: &Value) -> ApiResult<Value> {
        let target = self.target_of(manifest)?;
        let api = self.api_for(&target).await?;
        let object = api
            .create(&PostParams::default(), &to_dynamic(manifest)?)
            .await
            .map_err(api_error)?;
        to_value(object)
    }

    async fn patch(&self, manifest: &Value) -> ApiResult<Value> {
        let target = self.target_of(manifest)?;
        let api = self.api_for(&target).await?;
        let object = api
            .patch(&target.name, &PatchParams::default(), &Patch::Merge(manifest))
            .await
            .map_err(api_error)?;
        to_value(object)
    }

    async fn replace(&self, manifest: &Value) -> ApiResult<Value> {
        let target = self.target_of(manifest)?;
        let api = self.api_for(&target).await?;
        let object = api
            .replace(&target.name, &PostParams::default(), &to_dynamic(manifest)?)
            .await
            .map_err(api_error)?;
        to_value(object)
    }

    async fn delete(&self, target: &ObjectRef, grace_period: Option<u32>) -> ApiResult<()> {
        let api = self.api_for(target).await?;
        let params = DeleteParams {
            grace_period_seconds: grace_period,
            ..DeleteParams::default()
        };
        api.delete(&target.name, &params).await.map_err(api_error)?;
        Ok(())
    }

    async fn watch_events(
        &self,
        target: &ObjectRef,
    ) -> ApiResult<BoxStream<'static, ApiResult<ClusterEvent>>> {
        // Events about cluster-scoped objects are recorded in `default`.
        let events: Api<Event> = Api::namespaced(
            self.client.clone(),
            target.namespace.as_deref().unwrap_or("default"),
        );
        Ok(event_stream(events, target))
    }
}

/// Events about `target`. Watch errors are yielded, then the watcher
/// backs off before listing again.
fn event_stream(
    events: Api<Event>,
    target: &ObjectRef,
) -> BoxStream<'static, ApiResult<ClusterEvent>> {
    let selector = format!(
        "involvedObject.kind={},involvedObject.name={}",
        target.kind, target.name
    );
    let involved = target.clone();

    watcher(events, watcher::Config::default().fields(&selector))
        .default_backoff()
        .applied_objects()
        .map_ok(move |event| to_cluster_event(&involved, event))
        .map_err(|e| ApiError::transport(e.to_string()))
        .boxed()
}
