//! Controller module for CA bundle reconciliation
//! This module contains the work queues, the event router, the convergence
//! handlers and the controller lifecycle for the CA bundle injector.

pub mod cluster;
pub mod desired;
pub mod handlers;
mod injector;
pub mod outcome;
pub mod queue;
pub mod router;

pub use cluster::{ClusterView, EventKind, EventRecord, KubeCluster};
pub use handlers::Handlers;
pub use injector::CaBundleInjector;
pub use outcome::Outcome;
pub use queue::WorkQueue;
pub use router::EventRouter;

/// Runtime settings shared by the router, the handlers and the lifecycle.
///
/// All four values are fixed at startup; the controller carries no other
/// durable state of its own.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace holding the source secret
    pub source_namespace: String,
    /// Name of the source secret
    pub source_secret: String,
    /// Name of the derived config map created in each opt-in namespace
    pub config_map_name: String,
    /// Label namespaces use to opt in to CA bundle injection
    pub label: String,
}
