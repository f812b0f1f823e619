//! CA Bundle Injector: Kubernetes controller for CA trust distribution
//!
//! This crate watches a single CA bundle Secret and replicates its payload
//! into a ConfigMap in every namespace that opts in through a label.

pub mod controller;
pub mod error;
pub mod telemetry;

pub use crate::error::{Error, Result};
