//! Cluster access seam for the convergence handlers
//!
//! The handlers talk to the cluster exclusively through [`ClusterView`]:
//! cached reads served by reflector stores, uncached reads and all writes
//! going straight to the API server, and Event publication. Tests substitute
//! an in-memory implementation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::Client;
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store};

use crate::Result;

/// Classification of a cluster Event record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Normal => "Normal",
            EventKind::Warning => "Warning",
        }
    }
}

/// A cluster Event to attach to an object, usually the source secret.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub kind: EventKind,
    pub reason: &'static str,
    pub message: String,
    pub regarding: ObjectReference,
}

impl EventRecord {
    pub fn normal(regarding: ObjectReference, reason: &'static str, message: String) -> Self {
        EventRecord {
            kind: EventKind::Normal,
            reason,
            message,
            regarding,
        }
    }

    pub fn warning(regarding: ObjectReference, reason: &'static str, message: String) -> Self {
        EventRecord {
            kind: EventKind::Warning,
            reason,
            message,
            regarding,
        }
    }
}

/// Read/write access to the cluster state the handlers reconcile.
///
/// Reads named `cached_*` come from the local watch caches and are
/// eventually consistent; `fetch_secret` and all writes go to the API
/// server. `delete_config_map` treats an already-absent object as success.
#[async_trait]
pub trait ClusterView: Send + Sync + 'static {
    async fn cached_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Uncached secret read, used on the latency-sensitive
    /// namespace-just-labelled path where the cache may not have caught up.
    async fn fetch_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn cached_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// All namespaces whose `key` label carries exactly `value`.
    async fn namespaces_with_label(&self, key: &str, value: &str) -> Result<Vec<Namespace>>;

    async fn cached_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    async fn publish_event(&self, record: EventRecord) -> Result<()>;
}

/// Production [`ClusterView`] backed by a kube client and reflector stores.
pub struct KubeCluster {
    client: Client,
    secrets: Store<Secret>,
    namespaces: Store<Namespace>,
    config_maps: Store<ConfigMap>,
}

impl KubeCluster {
    pub fn new(
        client: Client,
        secrets: Store<Secret>,
        namespaces: Store<Namespace>,
        config_maps: Store<ConfigMap>,
    ) -> Self {
        KubeCluster {
            client,
            secrets,
            namespaces,
            config_maps,
        }
    }
}

#[async_trait]
impl ClusterView for KubeCluster {
    async fn cached_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self.secrets.get(&key).map(|obj| obj.as_ref().clone()))
    }

    async fn fetch_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn cached_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let key = ObjectRef::new(name);
        Ok(self.namespaces.get(&key).map(|obj| obj.as_ref().clone()))
    }

    async fn namespaces_with_label(&self, key: &str, value: &str) -> Result<Vec<Namespace>> {
        let matching = self
            .namespaces
            .state()
            .into_iter()
            .filter(|ns| ns.labels().get(key).map(String::as_str) == Some(value))
            .map(|ns| ns.as_ref().clone())
            .collect();
        Ok(matching)
    }

    async fn cached_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self.config_maps.get(&key).map(|obj| obj.as_ref().clone()))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone: deletion is idempotent.
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn publish_event(&self, record: EventRecord) -> Result<()> {
        let namespace = record
            .regarding
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let involved_name = record.regarding.name.clone().unwrap_or_default();
        let time = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{involved_name}-ca-bundle-")),
                ..Default::default()
            },
            type_: Some(record.kind.as_str().to_string()),
            reason: Some(record.reason.to_string()),
            message: Some(record.message),
            involved_object: record.regarding,
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}
