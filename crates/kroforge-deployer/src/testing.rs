//! In-memory cluster used by the deployer tests.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use kroforge_core::cluster::{ApiError, ApiResult, ClusterClient, ClusterEvent};
use kroforge_core::resource::ObjectRef;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Create,
    Patch,
    Replace,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub name: String,
    pub grace_period: Option<u32>,
}

/// Namespace (empty for cluster-scoped objects) and name.
type Key = (String, String);

#[derive(Default)]
struct State {
    objects: HashMap<Key, Value>,
    calls: Vec<Call>,
    /// Names in the order a write succeeded.
    applied: Vec<String>,
    failures: HashMap<(Op, String), VecDeque<ApiError>>,
    statuses: HashMap<String, VecDeque<Value>>,
    events: HashMap<String, Vec<ClusterEvent>>,
    /// Deletes leave the object behind for this many reads.
    linger: HashMap<String, usize>,
    terminating: HashMap<String, usize>,
}

/// A cluster keyed by namespace and name. Scripted statuses, failures and
/// call records go by name, so names must be unique within a test.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
    latency: Option<Duration>,
    open_watches: Arc<AtomicUsize>,
}

struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed an object. Namespaced kinds without a namespace go to `default`.
    pub fn insert(&self, manifest: Value) {
        let target = ObjectRef::from_manifest(&manifest, "default").unwrap();
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key_for(&target), manifest);
    }

    /// The object named `name` in any namespace.
    pub fn get(&self, name: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .find(|((_, n), _)| n == name)
            .map(|(_, object)| object.clone())
    }

    pub fn get_in(&self, namespace: &str, name: &str) -> Option<Value> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().unwrap().objects.get(&key).cloned()
    }

    /// Fail the next `op` on `name` with `error`. Queued failures are used in order.
    pub fn fail(&self, op: Op, name: &str, error: ApiError) {
        self.fail_times(op, name, error, 1);
    }

    pub fn fail_times(&self, op: Op, name: &str, error: ApiError, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.failures.entry((op, name.to_string())).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Each read of `name` takes the next status; the last one sticks.
    pub fn script_status(&self, name: &str, statuses: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(name.to_string(), statuses.into());
    }

    /// Keep a deleted object visible for `reads` more reads.
    pub fn linger(&self, name: &str, reads: usize) {
        self.state
            .lock()
            .unwrap()
            .linger
            .insert(name.to_string(), reads);
    }

    pub fn push_event(&self, name: &str, event: ClusterEvent) {
        self.state
            .lock()
            .unwrap()
            .events
            .entry(name.to_string())
            .or_default()
            .push(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    pub fn reads(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.op == Op::Read && c.name == name)
            .count()
    }

    /// Names whose create, patch or replace succeeded, in order.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    /// Names in the order they were deleted (attempts included).
    pub fn deletes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == Op::Delete)
            .collect()
    }

    pub fn open_watches(&self) -> usize {
        self.open_watches.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: Op, name: &str, grace_period: Option<u32>) -> ApiResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op,
            name: name.to_string(),
            grace_period,
        });
        match state
            .failures
            .get_mut(&(op, name.to_string()))
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn lookup(&self, key: &Key) -> Option<Value> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    fn store(&self, key: Key, mut manifest: Value) -> Value {
        let mut state = self.state.lock().unwrap();
        let version = state
            .objects
            .get(&key)
            .and_then(|o| o["metadata"]["resourceVersion"].as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        manifest["metadata"]["resourceVersion"] = json!((version + 1).to_string());
        state.applied.push(key.1.clone());
        state.objects.insert(key, manifest.clone());
        manifest
    }
}

/// Where the API server would put `manifest`: only its own metadata counts.
fn key_of(manifest: &Value) -> Key {
    let field = |name: &str| {
        manifest["metadata"][name]
            .as_str()
            .unwrap_or_default()
            .to_string()
    };
    (field("namespace"), field("name"))
}

fn key_for(target: &ObjectRef) -> Key {
    (
        target.namespace.clone().unwrap_or_default(),
        target.name.clone(),
    )
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn read(&self, target: &ObjectRef) -> ApiResult<Value> {
        self.enter(Op::Read, &target.name, None).await?;
        let mut state = self.state.lock().unwrap();
        let next_status = state.statuses.get_mut(&target.name).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        let expired = match state.terminating.get_mut(&target.name) {
            Some(0) => true,
            Some(reads) => {
                *reads -= 1;
                false
            }
            None => false,
        };
        let key = key_for(target);
        if expired {
            state.terminating.remove(&target.name);
            state.objects.remove(&key);
        }
        let object = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| ApiError::not_found(format!("{target} not found")))?;
        if let Some(status) = next_status {
            object["status"] = status;
        }
        Ok(object.clone())
    }

    async fn create(&self, manifest: &Value) -> ApiResult<Value> {
        let key = key_of(manifest);
        self.enter(Op::Create, &key.1, None).await?;
        if self.lookup(&key).is_some() {
            return Err(ApiError::conflict(format!("{} already exists", key.1)));
        }
        Ok(self.store(key, manifest.clone()))
    }

    async fn patch(&self, manifest: &Value) -> ApiResult<Value> {
        let key = key_of(manifest);
        self.enter(Op::Patch, &key.1, None).await?;
        let mut existing = self
            .lookup(&key)
            .ok_or_else(|| ApiError::not_found(format!("{} not found", key.1)))?;
        merge(&mut existing, manifest);
        Ok(self.store(key, existing))
    }

    async fn replace(&self, manifest: &Value) -> ApiResult<Value> {
        let key = key_of(manifest);
        self.enter(Op::Replace, &key.1, None).await?;
        if self.lookup(&key).is_none() {
            return Err(ApiError::not_found(format!("{} not found", key.1)));
        }
        Ok(self.store(key, manifest.clone()))
    }

    async fn delete(&self, target: &ObjectRef, grace_period: Option<u32>) -> ApiResult<()> {
        self.enter(Op::Delete, &target.name, grace_period).await?;
        let mut state = self.state.lock().unwrap();
        let key = key_for(target);
        if !state.objects.contains_key(&key) {
            return Err(ApiError::not_found(format!("{target} not found")));
        }
        match state.linger.get(&target.name).copied() {
            Some(reads) if reads > 0 => {
                state.terminating.insert(target.name.clone(), reads);
            }
            _ => {
                state.objects.remove(&key);
            }
        }
        Ok(())
    }

    async fn watch_events(
        &self,
        target: &ObjectRef,
    ) -> ApiResult<BoxStream<'static, ApiResult<ClusterEvent>>> {
        let events = self
            .state
            .lock()
            .unwrap()
            .events
            .get(&target.name)
            .cloned()
            .unwrap_or_default();
        self.open_watches.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.open_watches.clone());
        let stream = stream::iter(events.into_iter().map(Ok::<_, ApiError>))
            .chain(stream::pending())
            .map(move |event| {
                let _ = &guard;
                event
            })
            .boxed();
        Ok(stream)
    }
}

/// Install a test subscriber so `RUST_LOG` shows engine logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
