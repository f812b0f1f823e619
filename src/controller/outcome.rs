//! Terminal outcomes of a single handler invocation
//!
//! Every non-error result of a convergence handler is one of these variants;
//! the dispatcher logs them and the event publisher derives Event reasons
//! from them instead of ambient string constants.

use std::fmt;

/// What a single reconciliation pass concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Full secret pass: every opt-in namespace converged.
    Synced { created: usize, updated: usize },
    /// Derived config map created in one namespace.
    Created { namespace: String },
    /// Derived config map deleted from one namespace.
    Deleted { namespace: String },
    /// A newly labelled namespace already carried the config map; left as-is.
    AlreadyPresent { namespace: String },
    /// Nothing to do for this key.
    Unchanged,
    /// The source secret no longer exists; nothing to reconcile.
    SourceGone,
    /// The namespace named by the key no longer exists.
    Gone,
    /// The key could not be parsed; dropped without retry.
    BadKey,
}

impl Outcome {
    /// Short machine-readable reason, used for Event records and log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            Outcome::Synced { .. } => "Synced",
            Outcome::Created { .. } => "Created",
            Outcome::Deleted { .. } => "Deleted",
            Outcome::AlreadyPresent { .. } => "AlreadyPresent",
            Outcome::Unchanged => "UpToDate",
            Outcome::SourceGone => "SourceGone",
            Outcome::Gone => "NamespaceGone",
            Outcome::BadKey => "InvalidKey",
        }
    }

    /// Whether this pass wrote anything to the cluster.
    pub fn changed(&self) -> bool {
        match self {
            Outcome::Synced { created, updated } => *created > 0 || *updated > 0,
            Outcome::Created { .. } | Outcome::Deleted { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Synced { created, updated } => write!(
                f,
                "CA bundle synced ({created} config map(s) created, {updated} updated)"
            ),
            Outcome::Created { namespace } => {
                write!(f, "CA bundle config map created in namespace '{namespace}'")
            }
            Outcome::Deleted { namespace } => {
                write!(f, "CA bundle config map deleted from namespace '{namespace}'")
            }
            Outcome::AlreadyPresent { namespace } => write!(
                f,
                "config map already present in newly labelled namespace '{namespace}', ignoring"
            ),
            Outcome::Unchanged => write!(f, "already up to date"),
            Outcome::SourceGone => write!(f, "source secret no longer exists"),
            Outcome::Gone => write!(f, "namespace no longer exists"),
            Outcome::BadKey => write!(f, "malformed work queue key dropped"),
        }
    }
}
