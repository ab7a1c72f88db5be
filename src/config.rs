//! Operator configuration
//!
//! Read once from the environment at startup. Everything the engine needs is
//! turned into a [`ReconcilerOptions`] value; nothing reads the environment
//! after that.

use std::env;
use std::str::FromStr;

use crate::backoff::Backoff;
use crate::declarative::{RecreatePolicy, ReconcilerOptions};
use crate::error::{Error, Result};

pub const METRICS_PORT_ENV: &str = "DECLARATIVE_METRICS_PORT";
pub const WATCH_NAMESPACE_ENV: &str = "DECLARATIVE_WATCH_NAMESPACE";
pub const OWNER_REFERENCES_ENV: &str = "DECLARATIVE_OWNER_REFERENCES";
pub const RECREATE_ON_IMMUTABLE_ENV: &str = "DECLARATIVE_RECREATE_ON_IMMUTABLE";
pub const READINESS_STEPS_ENV: &str = "DECLARATIVE_READINESS_STEPS";

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "kube-declarative";

const DEFAULT_METRICS_PORT: u16 = 8080;
const DEFAULT_READINESS_STEPS: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    pub metrics_port: u16,
    /// `None` watches every namespace
    pub watch_namespace: Option<String>,
    pub owner_references: bool,
    pub recreate_on_immutable: bool,
    /// Readiness attempts per object; 0 disables waiting
    pub readiness_steps: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            watch_namespace: None,
            owner_references: true,
            recreate_on_immutable: false,
            readiness_steps: DEFAULT_READINESS_STEPS,
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable lookup; unset and empty values take defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            metrics_port: parse(METRICS_PORT_ENV, get(METRICS_PORT_ENV))?.unwrap_or(defaults.metrics_port),
            watch_namespace: get(WATCH_NAMESPACE_ENV),
            owner_references: parse_bool(OWNER_REFERENCES_ENV, get(OWNER_REFERENCES_ENV))?
                .unwrap_or(defaults.owner_references),
            recreate_on_immutable: parse_bool(RECREATE_ON_IMMUTABLE_ENV, get(RECREATE_ON_IMMUTABLE_ENV))?
                .unwrap_or(defaults.recreate_on_immutable),
            readiness_steps: parse(READINESS_STEPS_ENV, get(READINESS_STEPS_ENV))?
                .unwrap_or(defaults.readiness_steps),
        })
    }

    /// Engine options matching this configuration
    pub fn reconciler_options(&self) -> ReconcilerOptions {
        ReconcilerOptions {
            owner_references: self.owner_references,
            recreate: if self.recreate_on_immutable {
                RecreatePolicy::allow_list()
            } else {
                RecreatePolicy::Never
            },
            readiness: (self.readiness_steps > 0).then(|| Backoff::default().with_steps(self.readiness_steps)),
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn parse<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| Error::validation(format!("invalid {} '{}': {}", name, v, e)))
        })
        .transpose()
}

fn parse_bool(name: &str, value: Option<String>) -> Result<Option<bool>> {
    value
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::validation(format!("invalid {} '{}': expected a boolean", name, v))),
        })
        .transpose()
}
