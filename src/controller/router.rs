//! Event router: watch notifications in, reconciliation keys out
//!
//! Filters raw `watcher::Event` notifications per event class and enqueues
//! reconciliation keys, keeping the queues free of irrelevant churn. The
//! kube watcher delivers single object snapshots, not old/new pairs, so the
//! router keeps a last-seen view (resource version plus label value) to
//! distinguish adds from updates and to suppress no-op resyncs.
//!
//! The decision logic lives in pure functions so it can be tested without a
//! watch stream; the router itself only tracks state and enqueues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::ResourceExt;
use kube_runtime::watcher;
use tracing::debug;

use crate::controller::queue::WorkQueue;
use crate::controller::Settings;

/// Build a work queue key from an object's coordinates.
///
/// Namespaced objects key as `"namespace/name"`, cluster-scoped ones as the
/// bare name.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// Split a work queue key back into its coordinates.
///
/// Returns `None` for keys that cannot have been produced by `object_key`;
/// the handlers treat those as terminal and drop them.
pub fn split_key(key: &str) -> Option<(Option<&str>, &str)> {
    match key.split_once('/') {
        None if key.is_empty() => None,
        None => Some((None, key)),
        Some((namespace, name)) => {
            if namespace.is_empty() || name.is_empty() || name.contains('/') {
                None
            } else {
                Some((Some(namespace), name))
            }
        }
    }
}

/// Last observed state of a namespace, kept to reconstruct old/new pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceView {
    pub resource_version: Option<String>,
    pub label: Option<String>,
}

/// Whether a secret snapshot warrants a reconciliation pass.
///
/// Any secret other than the configured source is ignored; a snapshot whose
/// resource version matches the last seen one is a periodic resync and is
/// ignored too. `last_rv == None` means first sight, which always enqueues.
pub fn secret_relevant(source_name: &str, last_rv: Option<&str>, secret: &Secret) -> bool {
    if secret.name_any() != source_name {
        return false;
    }
    match last_rv {
        None => true,
        Some(last) => secret.resource_version().as_deref() != Some(last),
    }
}

/// Whether a first-seen namespace belongs on the newly-labelled queue: the
/// injection label must be present with a non-empty value.
pub fn namespace_add_relevant(label: &str, namespace: &Namespace) -> bool {
    super::desired::has_injection_label(namespace, label)
}

/// Whether a namespace update belongs on the label-changed queue: the
/// resource version must have moved and the label value must differ from the
/// last seen one.
pub fn namespace_change_relevant(label: &str, last: &NamespaceView, namespace: &Namespace) -> bool {
    if namespace.resource_version() == last.resource_version {
        return false;
    }
    namespace.labels().get(label) != last.label.as_ref()
}

/// Routes watch events for the two watched kinds onto the three queues.
pub struct EventRouter {
    settings: Arc<Settings>,
    secrets: WorkQueue<String>,
    newly_labelled: WorkQueue<String>,
    label_changed: WorkQueue<String>,
    secret_rv: Mutex<Option<String>>,
    namespaces: Mutex<HashMap<String, NamespaceView>>,
}

impl EventRouter {
    pub fn new(
        settings: Arc<Settings>,
        secrets: WorkQueue<String>,
        newly_labelled: WorkQueue<String>,
        label_changed: WorkQueue<String>,
    ) -> Self {
        EventRouter {
            settings,
            secrets,
            newly_labelled,
            label_changed,
            secret_rv: Mutex::new(None),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe_secret(&self, event: &watcher::Event<Secret>) {
        match event {
            watcher::Event::Apply(secret) | watcher::Event::InitApply(secret) => {
                let enqueue = {
                    let mut last = self.secret_rv.lock().expect("router state poisoned");
                    if !secret_relevant(&self.settings.source_secret, last.as_deref(), secret) {
                        return;
                    }
                    *last = secret.resource_version();
                    true
                };
                if enqueue {
                    let key = object_key(secret.namespace().as_deref(), &secret.name_any());
                    debug!(%key, "source secret changed, enqueuing");
                    self.secrets.add_rate_limited(key);
                }
            }
            watcher::Event::Delete(secret) => {
                if secret.name_any() != self.settings.source_secret {
                    return;
                }
                *self.secret_rv.lock().expect("router state poisoned") = None;
                let key = object_key(secret.namespace().as_deref(), &secret.name_any());
                debug!(%key, "source secret deleted, enqueuing");
                self.secrets.add_rate_limited(key);
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    pub fn observe_namespace(&self, event: &watcher::Event<Namespace>) {
        match event {
            watcher::Event::Apply(namespace) | watcher::Event::InitApply(namespace) => {
                let name = namespace.name_any();
                let view = NamespaceView {
                    resource_version: namespace.resource_version(),
                    label: namespace.labels().get(&self.settings.label).cloned(),
                };

                let target = {
                    let mut known = self.namespaces.lock().expect("router state poisoned");
                    let target = match known.get(&name) {
                        None if namespace_add_relevant(&self.settings.label, namespace) => {
                            Some(&self.newly_labelled)
                        }
                        None => None,
                        Some(last)
                            if namespace_change_relevant(&self.settings.label, last, namespace) =>
                        {
                            Some(&self.label_changed)
                        }
                        Some(_) => None,
                    };
                    known.insert(name.clone(), view);
                    target.cloned()
                };

                if let Some(queue) = target {
                    debug!(namespace = %name, queue = queue.name(), "namespace label event, enqueuing");
                    queue.add_rate_limited(name);
                }
            }
            watcher::Event::Delete(namespace) => {
                // Namespace deletion needs no reconciliation: the config map
                // dies with its namespace. Only the last-seen view is pruned.
                self.namespaces
                    .lock()
                    .expect("router state poisoned")
                    .remove(&namespace.name_any());
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const LABEL: &str = "ca-bundle-injection";

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            source_namespace: "certs".to_string(),
            source_secret: "ca-source".to_string(),
            config_map_name: "ca-bundle".to_string(),
            label: LABEL.to_string(),
        })
    }

    fn secret(name: &str, rv: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("certs".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn namespace(name: &str, rv: &str, label: Option<&str>) -> Namespace {
        let labels = label.map(|value| {
            let mut map = BTreeMap::new();
            map.insert(LABEL.to_string(), value.to_string());
            map
        });
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(rv.to_string()),
                labels,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn router() -> (EventRouter, WorkQueue<String>, WorkQueue<String>, WorkQueue<String>) {
        let secrets = WorkQueue::named("secrets");
        let newly = WorkQueue::named("newly-labelled");
        let changed = WorkQueue::named("label-changed");
        let router = EventRouter::new(settings(), secrets.clone(), newly.clone(), changed.clone());
        (router, secrets, newly, changed)
    }

    async fn settle() {
        // Enqueues go through the rate limiter's base delay.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_secrets_with_other_names() {
        let (router, secrets, _, _) = router();
        router.observe_secret(&watcher::Event::Apply(secret("unrelated", "1")));
        settle().await;
        assert!(secrets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueues_source_secret_on_first_sight_and_rv_change() {
        let (router, secrets, _, _) = router();

        router.observe_secret(&watcher::Event::Apply(secret("ca-source", "1")));
        settle().await;
        assert_eq!(secrets.get().await.as_deref(), Some("certs/ca-source"));
        secrets.done(&"certs/ca-source".to_string());

        // Same resource version: periodic resync, suppressed.
        router.observe_secret(&watcher::Event::Apply(secret("ca-source", "1")));
        settle().await;
        assert!(secrets.is_empty());

        router.observe_secret(&watcher::Event::Apply(secret("ca-source", "2")));
        settle().await;
        assert_eq!(secrets.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueues_source_secret_deletion() {
        let (router, secrets, _, _) = router();
        router.observe_secret(&watcher::Event::Delete(secret("ca-source", "3")));
        settle().await;
        assert_eq!(secrets.get().await.as_deref(), Some("certs/ca-source"));
    }

    #[tokio::test(start_paused = true)]
    async fn labelled_namespace_add_goes_to_newly_labelled_queue() {
        let (router, _, newly, changed) = router();
        router.observe_namespace(&watcher::Event::Apply(namespace("a", "1", Some("enabled"))));
        settle().await;
        assert_eq!(newly.get().await.as_deref(), Some("a"));
        assert!(changed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unlabelled_namespace_add_is_ignored() {
        let (router, _, newly, changed) = router();
        router.observe_namespace(&watcher::Event::Apply(namespace("b", "1", None)));
        router.observe_namespace(&watcher::Event::Apply(namespace("c", "1", Some(""))));
        settle().await;
        assert!(newly.is_empty());
        assert!(changed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn label_transition_goes_to_label_changed_queue() {
        let (router, _, newly, changed) = router();
        router.observe_namespace(&watcher::Event::Apply(namespace("a", "1", None)));
        settle().await;
        assert!(newly.is_empty());

        router.observe_namespace(&watcher::Event::Apply(namespace("a", "2", Some("enabled"))));
        settle().await;
        assert_eq!(changed.get().await.as_deref(), Some("a"));

        // Label removed again.
        changed.done(&"a".to_string());
        router.observe_namespace(&watcher::Event::Apply(namespace("a", "3", None)));
        settle().await;
        assert_eq!(changed.get().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_rv_or_label_updates_are_suppressed() {
        let (router, _, _, changed) = router();
        router.observe_namespace(&watcher::Event::Apply(namespace("a", "1", Some("enabled"))));
        settle().await;

        // Resync with identical resource version.
        router.observe_namespace(&watcher::Event::Apply(namespace("a", "1", Some("enabled"))));
        settle().await;
        assert!(changed.is_empty());

        // Object changed, label did not.
        router.observe_namespace(&watcher::Event::Apply(namespace("a", "2", Some("enabled"))));
        settle().await;
        assert!(changed.is_empty());
    }

    #[test]
    fn key_round_trip() {
        assert_eq!(object_key(Some("certs"), "ca-source"), "certs/ca-source");
        assert_eq!(object_key(None, "a"), "a");
        assert_eq!(split_key("certs/ca-source"), Some((Some("certs"), "ca-source")));
        assert_eq!(split_key("a"), Some((None, "a")));
        assert_eq!(split_key(""), None);
        assert_eq!(split_key("a/b/c"), None);
        assert_eq!(split_key("/name"), None);
    }

    #[test]
    fn change_relevance_requires_moved_rv_and_new_label_value() {
        let last = NamespaceView {
            resource_version: Some("1".to_string()),
            label: Some("enabled".to_string()),
        };
        assert!(!namespace_change_relevant(
            LABEL,
            &last,
            &namespace("a", "1", Some("enabled"))
        ));
        assert!(!namespace_change_relevant(
            LABEL,
            &last,
            &namespace("a", "2", Some("enabled"))
        ));
        assert!(namespace_change_relevant(
            LABEL,
            &last,
            &namespace("a", "2", None)
        ));
        assert!(namespace_change_relevant(
            LABEL,
            &last,
            &namespace("a", "2", Some("disabled"))
        ));
    }
}
