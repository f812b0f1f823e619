//! Convergence handlers, one per event class
//!
//! Each handler computes the delta between observed and desired state for a
//! single reconciliation key and applies it through the cluster seam. The
//! handlers are idempotent and safe to re-run in any order; they never retry
//! internally, since the dispatch loop owns the retry decision.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::cluster::{ClusterView, EventRecord};
use crate::controller::desired;
use crate::controller::outcome::Outcome;
use crate::controller::router::split_key;
use crate::controller::Settings;
use crate::{Error, Result};

/// The three synchronization handlers, generic over cluster access.
pub struct Handlers<C> {
    cluster: Arc<C>,
    settings: Arc<Settings>,
}

impl<C: ClusterView> Handlers<C> {
    pub fn new(cluster: Arc<C>, settings: Arc<Settings>) -> Self {
        Handlers { cluster, settings }
    }

    /// Handler for source secret changes.
    ///
    /// Resolves the secret, then converges every opt-in namespace: creates
    /// the config map where it is missing, rewrites it where the payload
    /// drifted, and surfaces a conflict for any same-named object the secret
    /// does not own.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_secret(&self, key: &str) -> Result<Outcome> {
        let Some((Some(namespace), name)) = split_key(key) else {
            warn!(%key, "invalid resource key on secret queue, dropping");
            return Ok(Outcome::BadKey);
        };

        let Some(secret) = self.cluster.cached_secret(namespace, name).await? else {
            // Legitimately deleted mid-processing; owned config maps are
            // reaped by cluster garbage collection through the owner
            // reference.
            info!(%key, "source secret no longer exists, nothing to reconcile");
            return Ok(Outcome::SourceGone);
        };

        let payload = desired::ca_payload(&secret);
        let opt_in = self
            .cluster
            .namespaces_with_label(&self.settings.label, desired::OPT_IN_VALUE)
            .await?;

        let mut created = 0;
        let mut updated = 0;
        for target in &opt_in {
            let target_name = target.name_any();
            match self
                .cluster
                .cached_config_map(&target_name, &self.settings.config_map_name)
                .await?
            {
                None => {
                    debug!(namespace = %target_name, "config map missing in opt-in namespace, creating");
                    let config_map =
                        desired::config_map(&self.settings.config_map_name, &target_name, &secret);
                    self.cluster.create_config_map(&config_map).await?;
                    created += 1;
                }
                Some(existing) => {
                    if !desired::is_controlled_by(&existing, &secret) {
                        let error = Error::OwnershipConflict {
                            namespace: target_name,
                            name: existing.name_any(),
                        };
                        self.record_conflict(secret.object_ref(&()), &error).await;
                        return Err(error);
                    }

                    let current = existing
                        .data
                        .as_ref()
                        .and_then(|data| data.get(desired::CA_CERTIFICATE_KEY))
                        .map(String::as_str)
                        .unwrap_or_default();
                    if current != payload {
                        debug!(namespace = %target_name, "config map payload stale, updating");
                        let config_map = desired::config_map(
                            &self.settings.config_map_name,
                            &target_name,
                            &secret,
                        );
                        self.cluster.update_config_map(&config_map).await?;
                        updated += 1;
                    }
                }
            }
        }

        let outcome = Outcome::Synced { created, updated };
        if outcome.changed() {
            self.record_outcome(secret.object_ref(&()), &outcome).await;
        }
        Ok(outcome)
    }

    /// Handler for namespaces that just opted in.
    ///
    /// Fetches the source secret uncached: the label was added moments ago
    /// and the secret cache may not have been primed yet.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_namespace_added(&self, key: &str) -> Result<Outcome> {
        let Some((None, name)) = split_key(key) else {
            warn!(%key, "invalid resource key on newly-labelled queue, dropping");
            return Ok(Outcome::BadKey);
        };

        if self.cluster.cached_namespace(name).await?.is_none() {
            info!(namespace = %name, "newly labelled namespace no longer exists");
            return Ok(Outcome::Gone);
        }

        if self
            .cluster
            .cached_config_map(name, &self.settings.config_map_name)
            .await?
            .is_some()
        {
            // Not expected for a namespace that just opted in; leave the
            // object alone rather than guessing at corrective action.
            info!(
                namespace = %name,
                config_map = %self.settings.config_map_name,
                "config map already present in newly labelled namespace, ignoring"
            );
            return Ok(Outcome::AlreadyPresent {
                namespace: name.to_string(),
            });
        }

        match self.fetch_source_secret().await? {
            None => {
                info!(namespace = %name, "source secret not created yet, waiting for its add event");
                Ok(Outcome::SourceGone)
            }
            Some(secret) => {
                let config_map =
                    desired::config_map(&self.settings.config_map_name, name, &secret);
                self.cluster.create_config_map(&config_map).await?;
                Ok(Outcome::Created {
                    namespace: name.to_string(),
                })
            }
        }
    }

    /// Handler for namespaces whose injection label changed value.
    ///
    /// Enforces the invariant that exactly the opt-in namespaces carry the
    /// config map: creates it on opt-in, deletes it on opt-out, and refuses
    /// to touch any same-named object the injector does not own.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_namespace_changed(&self, key: &str) -> Result<Outcome> {
        let Some((None, name)) = split_key(key) else {
            warn!(%key, "invalid resource key on label-changed queue, dropping");
            return Ok(Outcome::BadKey);
        };

        let Some(namespace) = self.cluster.cached_namespace(name).await? else {
            info!(namespace = %name, "namespace no longer exists");
            return Ok(Outcome::Gone);
        };
        let opt_in = desired::is_opt_in(&namespace, &self.settings.label);

        match self
            .cluster
            .cached_config_map(name, &self.settings.config_map_name)
            .await?
        {
            None if opt_in => match self.fetch_source_secret().await? {
                None => {
                    info!(namespace = %name, "source secret not created yet, waiting for its add event");
                    Ok(Outcome::SourceGone)
                }
                Some(secret) => {
                    let config_map =
                        desired::config_map(&self.settings.config_map_name, name, &secret);
                    self.cluster.create_config_map(&config_map).await?;
                    Ok(Outcome::Created {
                        namespace: name.to_string(),
                    })
                }
            },
            None => Ok(Outcome::Unchanged),
            Some(existing) => {
                if !desired::is_controlled_by_source(&existing, &self.settings.source_secret) {
                    let error = Error::OwnershipConflict {
                        namespace: name.to_string(),
                        name: existing.name_any(),
                    };
                    self.record_conflict(self.source_secret_ref(), &error).await;
                    return Err(error);
                }

                if opt_in {
                    // Content reconciliation belongs to the secret handler.
                    Ok(Outcome::Unchanged)
                } else {
                    info!(
                        namespace = %name,
                        config_map = %self.settings.config_map_name,
                        "namespace no longer opted in, deleting config map"
                    );
                    self.cluster
                        .delete_config_map(name, &self.settings.config_map_name)
                        .await?;
                    Ok(Outcome::Deleted {
                        namespace: name.to_string(),
                    })
                }
            }
        }
    }

    async fn fetch_source_secret(&self) -> Result<Option<Secret>> {
        self.cluster
            .fetch_secret(&self.settings.source_namespace, &self.settings.source_secret)
            .await
    }

    /// Object reference for the source secret when no snapshot is at hand.
    fn source_secret_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Secret".to_string()),
            namespace: Some(self.settings.source_namespace.clone()),
            name: Some(self.settings.source_secret.clone()),
            ..Default::default()
        }
    }

    /// Best-effort Event publication; failures are logged, never propagated,
    /// so an unreachable Events API cannot wedge reconciliation.
    async fn record_outcome(&self, regarding: ObjectReference, outcome: &Outcome) {
        let record = EventRecord::normal(regarding, outcome.reason(), outcome.to_string());
        if let Err(error) = self.cluster.publish_event(record).await {
            warn!(%error, "failed to publish event");
        }
    }

    async fn record_conflict(&self, regarding: ObjectReference, error: &Error) {
        let record = EventRecord::warning(regarding, error.event_reason(), error.to_string());
        if let Err(error) = self.cluster.publish_event(record).await {
            warn!(%error, "failed to publish conflict event");
        }
    }
}
