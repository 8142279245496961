//! Controller-mode deployment.
//!
//! The graph is handed to an in-cluster controller: the engine applies the
//! graph definition, waits for it to become active and for the CRD the
//! controller generates to be established, then applies one instance of the
//! generated kind. The controller creates the underlying resources, so the
//! engine only tracks the definition and the instance.

use kroforge_core::deployment::{DeploymentOptions, DeploymentPhase, DeploymentResult};
use kroforge_core::hydration::{hydrate, split_status};
use kroforge_core::resource::{DeployedResource, ObjectRef, ResourceGraph, ResourceStatus};
use kroforge_core::{Error, Result};
use serde_json::{Value, json};
use tracing::info;

use crate::engine::{DeploymentEngine, DeploymentRun};
use crate::readiness::controller_instance_ready;

/// Resource id of the graph definition in results and events.
pub const DEFINITION_ID: &str = "definition";
/// Resource id of the instance in results and events.
pub const INSTANCE_ID: &str = "instance";

const DEFAULT_GROUP: &str = "kro.run";

pub(crate) async fn deploy(
    engine: &DeploymentEngine,
    graph: &ResourceGraph,
    options: &DeploymentOptions,
) -> Result<DeploymentResult> {
    let manifests = graph.controller.as_ref().ok_or_else(|| {
        Error::Configuration(format!(
            "graph '{}' has no controller manifests; controller mode needs a definition and an instance",
            graph.name
        ))
    })?;
    let crd = ObjectRef::new(
        "apiextensions.k8s.io/v1",
        "CustomResourceDefinition",
        None,
        generated_crd_name(&manifests.definition)?,
    );
    let definition = ObjectRef::from_manifest(&manifests.definition, &options.namespace)?;
    let instance = ObjectRef::from_manifest(&manifests.instance, &options.namespace)?;
    let definition_manifest = definition.place(manifests.definition.clone());
    let instance_manifest = instance.place(manifests.instance.clone());

    let run = DeploymentRun::new(engine, options);
    run.start(&graph.name, 2);

    let live = 'deploy: {
        run.set_status(DEFINITION_ID, ResourceStatus::Deploying);
        if let Err(e) = run.apply(DEFINITION_ID, &definition, &definition_manifest).await {
            run.fail(DEFINITION_ID, DeploymentPhase::Deployment, &e);
            skip_instance(&run);
            break 'deploy None;
        }
        run.record(DeployedResource::new(
            DEFINITION_ID,
            &definition,
            definition_manifest,
        ));

        let active = engine.readiness().for_kind(&definition.kind);
        if let Err(e) = run.wait_ready(DEFINITION_ID, &definition, active.as_ref()).await {
            run.fail(DEFINITION_ID, DeploymentPhase::Readiness, &e);
            skip_instance(&run);
            break 'deploy None;
        }
        info!(crd = %crd.name, "Waiting for generated CRD to be established");
        if let Err(e) = run.wait_established(DEFINITION_ID, &crd).await {
            run.fail(DEFINITION_ID, DeploymentPhase::Establishment, &e);
            skip_instance(&run);
            break 'deploy None;
        }
        run.set_status(DEFINITION_ID, ResourceStatus::Ready);

        run.set_status(INSTANCE_ID, ResourceStatus::Deploying);
        if let Err(e) = run.apply(INSTANCE_ID, &instance, &instance_manifest).await {
            run.fail(INSTANCE_ID, DeploymentPhase::Deployment, &e);
            break 'deploy None;
        }
        run.record(DeployedResource::new(
            INSTANCE_ID,
            &instance,
            instance_manifest,
        ));
        if !options.wait_for_ready {
            break 'deploy None;
        }

        match run.wait_ready(INSTANCE_ID, &instance, &controller_instance_ready).await {
            Ok(live) => {
                run.set_status(INSTANCE_ID, ResourceStatus::Ready);
                Some(live)
            }
            Err(e) => {
                run.fail(INSTANCE_ID, DeploymentPhase::Readiness, &e);
                None
            }
        }
    };

    // The controller resolves the status template; its result is the instance status.
    let static_fields = graph.status.as_ref().map(|template| split_status(template).0);
    let dynamic = live.as_ref().and_then(|l| l.get("status")).cloned();
    let graph_status = match (dynamic, static_fields) {
        (None, None) => None,
        (dynamic, static_fields) => Some(hydrate(
            &dynamic.unwrap_or(Value::Null),
            &static_fields.unwrap_or_else(|| json!({})),
        )),
    };

    Ok(run.finish(2, graph_status).await)
}

fn skip_instance(run: &DeploymentRun<'_>) {
    let err = Error::DependencyFailed {
        resource_id: INSTANCE_ID.to_string(),
        dependencies: vec![DEFINITION_ID.to_string()],
    };
    run.fail(INSTANCE_ID, DeploymentPhase::Dependency, &err);
}

/// Name of the CRD the controller generates for a definition:
/// `<lowercase kind>s.<group>`.
pub fn generated_crd_name(definition: &Value) -> Result<String> {
    let schema = definition
        .pointer("/spec/schema")
        .ok_or_else(|| Error::Configuration("graph definition has no spec.schema".to_string()))?;
    let kind = schema
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Configuration("graph definition schema has no kind".to_string()))?;
    let group = schema
        .get("group")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_GROUP);
    Ok(format!("{}s.{}", kind.to_lowercase(), group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCluster, Op, init_tracing};
    use kroforge_core::deployment::{DeploymentMode, DeploymentStatus, EngineSettings};
    use kroforge_core::resource::{ControllerManifests, GraphResource};
    use std::sync::Arc;
    use std::time::Duration;

    fn definition() -> Value {
        json!({
            "apiVersion": "kro.run/v1alpha1",
            "kind": "ResourceGraphDefinition",
            "metadata": {"name": "webapp"},
            "spec": {
                "schema": {"apiVersion": "v1alpha1", "kind": "WebApp"},
                "resources": []
            }
        })
    }

    fn instance() -> Value {
        json!({
            "apiVersion": "kro.run/v1alpha1",
            "kind": "WebApp",
            "metadata": {"name": "shop"},
            "spec": {"replicas": 2}
        })
    }

    fn established_crd() -> Value {
        json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "webapps.kro.run"},
            "status": {"conditions": [
                {"type": "NamesAccepted", "status": "True"},
                {"type": "Established", "status": "True"}
            ]}
        })
    }

    fn graph() -> ResourceGraph {
        ResourceGraph::new(
            "webapp",
            vec![GraphResource::new(
                "unused",
                json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "unused"}}),
            )],
        )
        .unwrap()
        .with_status(json!({"owner": "platform", "url": {"$expr": "${web.status.url}"}}))
        .with_controller(ControllerManifests {
            definition: definition(),
            instance: instance(),
        })
    }

    fn options() -> DeploymentOptions {
        DeploymentOptions {
            mode: DeploymentMode::Controller,
            ..DeploymentOptions::default()
        }
    }

    fn engine(cluster: &Arc<MockCluster>) -> DeploymentEngine {
        init_tracing();
        DeploymentEngine::new(cluster.clone()).with_settings(EngineSettings {
            poll_interval: Duration::from_secs(1),
            crd_establishment_timeout: Duration::from_secs(10),
            max_concurrency: 4,
        })
    }

    #[test]
    fn test_generated_crd_name() {
        assert_eq!(generated_crd_name(&definition()).unwrap(), "webapps.kro.run");

        let mut custom = definition();
        custom["spec"]["schema"]["group"] = json!("apps.example.com");
        assert_eq!(generated_crd_name(&custom).unwrap(), "webapps.apps.example.com");

        let err = generated_crd_name(&json!({"spec": {}})).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_definition_then_instance() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert(established_crd());
        cluster.script_status(
            "webapp",
            vec![json!({"state": "Inactive"}), json!({"state": "Active"})],
        );
        cluster.script_status(
            "shop",
            vec![
                json!({"state": "IN_PROGRESS"}),
                json!({
                    "state": "ACTIVE",
                    "conditions": [{"type": "InstanceSynced", "status": "True"}],
                    "url": "https://shop.example.com"
                }),
            ],
        );

        let result = engine(&cluster).deploy(&graph(), &options()).await.unwrap();

        assert_eq!(result.status, DeploymentStatus::Success);
        assert_eq!(cluster.applied(), vec!["webapp", "shop"]);
        let ids: Vec<&str> = result.resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![DEFINITION_ID, INSTANCE_ID]);
        assert!(cluster.get("unused").is_none());

        let status = result.graph_status.unwrap();
        assert_eq!(status["owner"], json!("platform"));
        assert_eq!(status["url"], json!("https://shop.example.com"));
        assert_eq!(status["state"], json!("ACTIVE"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_lands_in_target_namespace() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert(established_crd());
        cluster.script_status("webapp", vec![json!({"state": "Active"})]);
        let options = DeploymentOptions {
            namespace: "production".to_string(),
            wait_for_ready: false,
            ..options()
        };

        let result = engine(&cluster).deploy(&graph(), &options).await.unwrap();

        assert_eq!(result.status, DeploymentStatus::Success);
        let shop = cluster.get_in("production", "shop").unwrap();
        assert_eq!(shop["metadata"]["namespace"], json!("production"));
        // the definition is cluster-scoped
        let webapp = cluster.get_in("", "webapp").unwrap();
        assert!(webapp.pointer("/metadata/namespace").is_none());
        assert_eq!(
            result.resource(INSTANCE_ID).unwrap().namespace.as_deref(),
            Some("production")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crd_never_established() {
        let cluster = Arc::new(MockCluster::new());
        cluster.script_status("webapp", vec![json!({"state": "Active"})]);

        let result = engine(&cluster).deploy(&graph(), &options()).await.unwrap();

        assert_eq!(result.status, DeploymentStatus::Failed);
        assert_eq!(
            result.errors_for(DEFINITION_ID)[0].phase,
            DeploymentPhase::Establishment
        );
        assert_eq!(
            result.errors_for(INSTANCE_ID)[0].phase,
            DeploymentPhase::Dependency
        );
        assert_eq!(cluster.count(Op::Create), 1);
        assert!(cluster.get("shop").is_none());
    }

    #[tokio::test]
    async fn test_missing_manifests_is_configuration_error() {
        let cluster = Arc::new(MockCluster::new());
        let graph = ResourceGraph::new("bare", Vec::new()).unwrap();

        let err = engine(&cluster).deploy(&graph, &options()).await.unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_without_waiting() {
        let cluster = Arc::new(MockCluster::new());
        cluster.insert(established_crd());
        cluster.script_status("webapp", vec![json!({"state": "Active"})]);
        let options = DeploymentOptions {
            wait_for_ready: false,
            ..options()
        };

        let result = engine(&cluster).deploy(&graph(), &options).await.unwrap();

        assert_eq!(result.status, DeploymentStatus::Success);
        assert_eq!(
            result.resource(INSTANCE_ID).unwrap().status,
            ResourceStatus::Deployed
        );
        assert_eq!(cluster.reads("shop"), 0);
        assert_eq!(result.graph_status, Some(json!({"owner": "platform"})));
    }
}
