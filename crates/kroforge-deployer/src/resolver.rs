//! Resolution of placeholders against deployed resources.

use async_recursion::async_recursion;
use kroforge_core::cluster::ClusterClient;
use kroforge_core::expression::{self, Bindings, ExpressionEngine};
use kroforge_core::path::FieldPath;
use kroforge_core::placeholder::{Expression, Placeholder, Slot, StructuralRef, contains_placeholder};
use kroforge_core::resource::{DeployedResource, GraphResource};
use kroforge_core::{Error, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::debug;

type Cells = Mutex<HashMap<String, Arc<OnceCell<Value>>>>;

/// Fills in placeholders with values from resources already deployed in
/// the same run.
///
/// Live objects and structural reference values are cached read-through:
/// each key is fetched at most once and never invalidated. One resolver
/// serves exactly one deployment run.
pub struct ReferenceResolver {
    client: Arc<dyn ClusterClient>,
    engine: Arc<dyn ExpressionEngine>,
    deployed: RwLock<HashMap<String, DeployedResource>>,
    live: Cells,
    fields: Cells,
}

impl ReferenceResolver {
    pub fn new(client: Arc<dyn ClusterClient>, engine: Arc<dyn ExpressionEngine>) -> Self {
        Self {
            client,
            engine,
            deployed: RwLock::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            fields: Mutex::new(HashMap::new()),
        }
    }

    /// Make a deployed resource available to later references.
    pub async fn record(&self, resource: &DeployedResource) {
        self.deployed
            .write()
            .await
            .insert(resource.id.clone(), resource.clone());
    }

    /// Seed the live-object cache, e.g. with the object from the final readiness poll.
    pub async fn observe(&self, resource_id: &str, live: Value) {
        let cell = cell(&self.live, resource_id).await;
        let _ = cell.set(live);
    }

    /// Resolve every placeholder in a resource's manifest.
    pub async fn resolve_resource(&self, resource: &GraphResource) -> Result<Value> {
        self.resolve_value(&resource.manifest).await
    }

    /// Resolve every placeholder in `value`, leaving literals untouched.
    #[async_recursion]
    pub async fn resolve_value(&self, value: &Value) -> Result<Value> {
        if !contains_placeholder(value) {
            return Ok(value.clone());
        }
        match Slot::classify(value) {
            Slot::Placeholder(Placeholder::Ref(reference)) => self.resolve_reference(&reference).await,
            Slot::Placeholder(Placeholder::Expr(expr)) => self.evaluate(&expr).await,
            Slot::Literal(Value::Object(map)) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(item).await?);
                }
                Ok(Value::Object(out))
            }
            Slot::Literal(Value::Array(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_value(item).await?);
                }
                Ok(Value::Array(out))
            }
            Slot::Literal(other) => Ok(other.clone()),
        }
    }

    /// Value of a structural reference, cached under `resourceId.fieldPath`.
    pub async fn resolve_reference(&self, reference: &StructuralRef) -> Result<Value> {
        let cell = cell(&self.fields, &reference.cache_key()).await;
        let value = cell
            .get_or_try_init(|| async {
                let path = FieldPath::parse(&reference.field_path)
                    .map_err(|reason| resolution_error(reference, reason))?;
                let live = self.live_object(&reference.resource_id).await.map_err(
                    |e| match e {
                        Error::ReferenceResolution { .. } => e,
                        other => resolution_error(reference, other.to_string()),
                    },
                )?;
                let value = path.lookup(&live).cloned().ok_or_else(|| {
                    resolution_error(reference, format!("field `{}` is not set", reference.field_path))
                })?;
                debug!(reference = %reference.cache_key(), "Resolved reference");
                Ok::<_, Error>(value)
            })
            .await?;
        Ok(value.clone())
    }

    /// Evaluate an expression with every deployed resource it names bound.
    pub async fn evaluate(&self, expr: &Expression) -> Result<Value> {
        let mut bindings = Bindings::new();
        for id in expression::identifiers(expr.as_str()) {
            if !self.deployed.read().await.contains_key(&id) {
                continue;
            }
            let live = self.live_object(&id).await?;
            bindings.insert(id, live);
        }
        self.engine.evaluate(expr.as_str(), &bindings)
    }

    async fn live_object(&self, resource_id: &str) -> Result<Value> {
        let deployed = self
            .deployed
            .read()
            .await
            .get(resource_id)
            .cloned()
            .ok_or_else(|| Error::ReferenceResolution {
                resource_id: resource_id.to_string(),
                field_path: String::new(),
                reason: "resource has not been deployed".to_string(),
            })?;

        let cell = cell(&self.live, resource_id).await;
        let live = cell
            .get_or_try_init(|| async {
                debug!(resource = %resource_id, object = %deployed.object_ref(), "Reading live object");
                self.client
                    .read(&deployed.object_ref())
                    .await
                    .map_err(Error::Api)
            })
            .await?;
        Ok(live.clone())
    }
}

async fn cell(cells: &Cells, key: &str) -> Arc<OnceCell<Value>> {
    cells
        .lock()
        .await
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .clone()
}

fn resolution_error(reference: &StructuralRef, reason: impl Into<String>) -> Error {
    Error::ReferenceResolution {
        resource_id: reference.resource_id.clone(),
        field_path: reference.field_path.clone(),
        reason: reason.into(),
    }
}
