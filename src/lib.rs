//! Declarative reconciliation engine for Kubernetes
//!
//! Owners declare the objects they want through builders; the engine creates,
//! updates and deletes cluster objects to match, tags them with a component
//! id, purges orphans and can wait for the result to become ready.
//!
//! The operator binary drives the engine for the `ConfigSet` custom resource.

pub mod backoff;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod declarative;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod store;

pub use error::{Error, Result};
