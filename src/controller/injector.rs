//! Controller lifecycle: watch plumbing, worker pools, graceful shutdown

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::Api;
use kube::Client;
use kube_runtime::reflector::store;
use kube_runtime::{reflector, watcher, WatchStreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::cluster::KubeCluster;
use crate::controller::handlers::Handlers;
use crate::controller::outcome::Outcome;
use crate::controller::queue::{self, WorkQueue};
use crate::controller::router::EventRouter;
use crate::controller::Settings;
use crate::{Error, Result};

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// The CA bundle injector: owns the queues, the watch tasks and the worker
/// pools.
pub struct CaBundleInjector {
    client: Client,
    settings: Arc<Settings>,
}

impl CaBundleInjector {
    pub fn new(client: Client, settings: Settings) -> Self {
        CaBundleInjector {
            client,
            settings: Arc::new(settings),
        }
    }

    /// Run the controller until the shutdown token fires.
    ///
    /// Spawns the watch drivers, waits for the local caches to complete
    /// their initial sync, then starts `workers` dispatch workers per queue.
    /// On shutdown every worker finishes its in-flight item, pending queue
    /// items are discarded, and this returns once all tasks have exited.
    /// Errors only if the initial cache sync fails before workers start.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        info!(
            source = %format!("{}/{}", settings.source_namespace, settings.source_secret),
            config_map = %settings.config_map_name,
            label = %settings.label,
            "starting CA bundle injector"
        );

        let secret_queue = WorkQueue::named("ca-bundles");
        let newly_labelled_queue = WorkQueue::named("ca-injected-new-namespaces");
        let label_changed_queue = WorkQueue::named("ca-injected-changed-namespaces");

        let router = Arc::new(EventRouter::new(
            Arc::clone(&settings),
            secret_queue.clone(),
            newly_labelled_queue.clone(),
            label_changed_queue.clone(),
        ));

        // Reflector-backed caches. The secret watch is scoped to the single
        // source object and the config map watch to the fixed derived name,
        // so the caches stay small even on large clusters.
        let secrets_api: Api<Secret> =
            Api::namespaced(self.client.clone(), &settings.source_namespace);
        let secret_cfg = watcher::Config::default()
            .fields(&format!("metadata.name={}", settings.source_secret));
        let (secret_store, secret_writer) = store();

        let namespaces_api: Api<Namespace> = Api::all(self.client.clone());
        let namespace_cfg = watcher::Config::default();
        let (namespace_store, namespace_writer) = store();

        let config_maps_api: Api<ConfigMap> = Api::all(self.client.clone());
        let config_map_cfg = watcher::Config::default()
            .fields(&format!("metadata.name={}", settings.config_map_name));
        let (config_map_store, config_map_writer) = store();

        let mut watch_tasks: JoinSet<()> = JoinSet::new();
        {
            let router = Arc::clone(&router);
            spawn_watch(
                &mut watch_tasks,
                "secret",
                reflector(secret_writer, watcher(secrets_api, secret_cfg).default_backoff()),
                shutdown.clone(),
                move |event| router.observe_secret(event),
            );
        }
        {
            let router = Arc::clone(&router);
            spawn_watch(
                &mut watch_tasks,
                "namespace",
                reflector(
                    namespace_writer,
                    watcher(namespaces_api, namespace_cfg).default_backoff(),
                ),
                shutdown.clone(),
                move |event| router.observe_namespace(event),
            );
        }
        spawn_watch(
            &mut watch_tasks,
            "configmap",
            reflector(
                config_map_writer,
                watcher(config_maps_api, config_map_cfg).default_backoff(),
            ),
            shutdown.clone(),
            // Config maps feed the cache only; no reconciliation is keyed
            // off their events.
            |_event: &watcher::Event<ConfigMap>| {},
        );

        info!("waiting for caches to sync");
        let ready = async {
            secret_store
                .wait_until_ready()
                .await
                .map_err(|e| Error::CacheSyncError(e.to_string()))?;
            namespace_store
                .wait_until_ready()
                .await
                .map_err(|e| Error::CacheSyncError(e.to_string()))?;
            config_map_store
                .wait_until_ready()
                .await
                .map_err(|e| Error::CacheSyncError(e.to_string()))?;
            Ok::<(), Error>(())
        };
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested before caches synced");
                watch_tasks.shutdown().await;
                return Ok(());
            }
            synced = tokio::time::timeout(CACHE_SYNC_TIMEOUT, ready) => match synced {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    watch_tasks.shutdown().await;
                    return Err(error);
                }
                Err(_) => {
                    watch_tasks.shutdown().await;
                    return Err(Error::CacheSyncError(format!(
                        "timed out after {CACHE_SYNC_TIMEOUT:?}"
                    )));
                }
            },
        }

        let cluster = Arc::new(KubeCluster::new(
            self.client.clone(),
            secret_store,
            namespace_store,
            config_map_store,
        ));
        let handlers = Arc::new(Handlers::new(cluster, Arc::clone(&settings)));

        info!(workers, "caches synced, starting workers");
        let mut worker_tasks: JoinSet<()> = JoinSet::new();
        {
            let handlers = Arc::clone(&handlers);
            spawn_workers(&mut worker_tasks, workers, &secret_queue, move |key| {
                let handlers = Arc::clone(&handlers);
                async move { handlers.sync_secret(&key).await }
            });
        }
        {
            let handlers = Arc::clone(&handlers);
            spawn_workers(&mut worker_tasks, workers, &newly_labelled_queue, move |key| {
                let handlers = Arc::clone(&handlers);
                async move { handlers.sync_namespace_added(&key).await }
            });
        }
        {
            let handlers = Arc::clone(&handlers);
            spawn_workers(&mut worker_tasks, workers, &label_changed_queue, move |key| {
                let handlers = Arc::clone(&handlers);
                async move { handlers.sync_namespace_changed(&key).await }
            });
        }

        shutdown.cancelled().await;
        info!("shutting down workers");
        secret_queue.shut_down();
        newly_labelled_queue.shut_down();
        label_changed_queue.shut_down();
        while worker_tasks.join_next().await.is_some() {}
        watch_tasks.shutdown().await;
        info!("CA bundle injector stopped");

        Ok(())
    }
}

/// Drive one watch stream until shutdown, handing every event to `route`.
///
/// Stream errors are logged and the watcher's own backoff re-establishes the
/// watch; they never abort the controller.
fn spawn_watch<K, S, F>(
    tasks: &mut JoinSet<()>,
    kind: &'static str,
    stream: S,
    shutdown: CancellationToken,
    route: F,
) where
    K: Send + 'static,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    F: Fn(&watcher::Event<K>) + Send + 'static,
{
    tasks.spawn(async move {
        futures::pin_mut!(stream);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.try_next() => match next {
                    Ok(Some(event)) => route(&event),
                    Ok(None) => break,
                    Err(error) => warn!(kind, %error, "watch stream error"),
                },
            }
        }
        debug!(kind, "watch task exiting");
    });
}

/// Spawn `count` dispatch workers over one queue.
fn spawn_workers<F, Fut>(
    tasks: &mut JoinSet<()>,
    count: usize,
    work_queue: &WorkQueue<String>,
    handler: F,
) where
    F: Fn(String) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Outcome>> + Send + 'static,
{
    for _ in 0..count {
        let work_queue = work_queue.clone();
        let handler = handler.clone();
        tasks.spawn(async move { queue::run_worker(work_queue, handler).await });
    }
}
