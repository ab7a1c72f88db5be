//! Desired state policies
//!
//! Every desired object carries a [`DesiredStatePolicy`]. The policy names the
//! target disposition and may hook into the create/update/delete steps of the
//! state machine. All hooks have no-op defaults, so a plain [`DesiredState`]
//! is itself a complete policy.

use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::Value;

use crate::error::Result;
use crate::store::{gvk_of, DeleteOptions, WriteOptions};

/// Target disposition of one object for one pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DesiredState {
    /// Create once, never reconcile again
    Created,
    /// Create or update
    Present,
    /// Ensure deleted
    Absent,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Created => "Created",
            DesiredState::Present => "Present",
            DesiredState::Absent => "Absent",
        }
    }
}

/// Disposition plus optional lifecycle hooks, gates and option providers
pub trait DesiredStatePolicy: Send + Sync {
    fn desired_state(&self) -> DesiredState;

    /// Runs before the object is created
    fn before_create(&self, _desired: &mut DynamicObject) -> Result<()> {
        Ok(())
    }

    /// Runs before diffing an existing object; use it to carry server-managed fields over
    fn before_update(&self, _current: &DynamicObject, _desired: &mut DynamicObject) -> Result<()> {
        Ok(())
    }

    /// Runs before the object is deleted
    fn before_delete(&self, _current: &DynamicObject) -> Result<()> {
        Ok(())
    }

    fn should_create(&self, _desired: &DynamicObject) -> Result<bool> {
        Ok(true)
    }

    fn should_update(&self, _current: &DynamicObject, _desired: &DynamicObject) -> Result<bool> {
        Ok(true)
    }

    fn should_delete(&self, _current: &DynamicObject) -> Result<bool> {
        Ok(true)
    }

    fn create_options(&self, _opts: &mut WriteOptions) {}

    fn update_options(&self, _opts: &mut WriteOptions) {}

    fn delete_options(&self, _opts: &mut DeleteOptions) {}
}

impl DesiredStatePolicy for DesiredState {
    fn desired_state(&self) -> DesiredState {
        *self
    }
}

/// Several policies applied in order.
///
/// The desired state is the first member's. Gates stop at the first `false`,
/// hooks stop at the first error, option providers all run in order.
#[derive(Clone, Default)]
pub struct PolicyChain {
    members: Vec<Arc<dyn DesiredStatePolicy>>,
}

impl PolicyChain {
    pub fn new(members: Vec<Arc<dyn DesiredStatePolicy>>) -> Self {
        Self { members }
    }

    #[must_use]
    pub fn with(mut self, policy: impl DesiredStatePolicy + 'static) -> Self {
        self.members.push(Arc::new(policy));
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl DesiredStatePolicy for PolicyChain {
    fn desired_state(&self) -> DesiredState {
        self.members
            .first()
            .map_or(DesiredState::Present, |m| m.desired_state())
    }

    fn before_create(&self, desired: &mut DynamicObject) -> Result<()> {
        for member in &self.members {
            member.before_create(desired)?;
        }
        Ok(())
    }

    fn before_update(&self, current: &DynamicObject, desired: &mut DynamicObject) -> Result<()> {
        for member in &self.members {
            member.before_update(current, desired)?;
        }
        Ok(())
    }

    fn before_delete(&self, current: &DynamicObject) -> Result<()> {
        for member in &self.members {
            member.before_delete(current)?;
        }
        Ok(())
    }

    fn should_create(&self, desired: &DynamicObject) -> Result<bool> {
        for member in &self.members {
            if !member.should_create(desired)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn should_update(&self, current: &DynamicObject, desired: &DynamicObject) -> Result<bool> {
        for member in &self.members {
            if !member.should_update(current, desired)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn should_delete(&self, current: &DynamicObject) -> Result<bool> {
        for member in &self.members {
            if !member.should_delete(current)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn create_options(&self, opts: &mut WriteOptions) {
        self.members.iter().for_each(|m| m.create_options(opts));
    }

    fn update_options(&self, opts: &mut WriteOptions) {
        self.members.iter().for_each(|m| m.update_options(opts));
    }

    fn delete_options(&self, opts: &mut DeleteOptions) {
        self.members.iter().for_each(|m| m.delete_options(opts));
    }
}

/// Copy `fields` (top-level keys under `parent`) from current to desired when desired leaves them unset
fn carry_over(current: &DynamicObject, desired: &mut DynamicObject, parent: Option<&str>, fields: &[&str]) {
    let source = match parent {
        Some(p) => current.data.get(p),
        None => Some(&current.data),
    };
    let Some(source) = source.and_then(Value::as_object) else {
        return;
    };

    let target = match parent {
        Some(p) => {
            if !desired.data.get(p).is_some_and(Value::is_object) {
                desired.data[p] = Value::Object(Default::default());
            }
            &mut desired.data[p]
        }
        None => &mut desired.data,
    };
    let Some(target) = target.as_object_mut() else {
        return;
    };

    for field in fields {
        if let Some(value) = source.get(*field) {
            let unset = target
                .get(*field)
                .map_or(true, |v| v.is_null() || v.as_str() == Some(""));
            if unset {
                target.insert((*field).to_string(), value.clone());
            }
        }
    }
}

/// Keeps the cluster-allocated virtual IP of a Service across updates
#[derive(Clone, Copy, Debug, Default)]
pub struct PreserveClusterIp;

impl DesiredStatePolicy for PreserveClusterIp {
    fn desired_state(&self) -> DesiredState {
        DesiredState::Present
    }

    fn before_update(&self, current: &DynamicObject, desired: &mut DynamicObject) -> Result<()> {
        if gvk_of(desired).is_some_and(|gvk| gvk.group.is_empty() && gvk.kind == "Service") {
            carry_over(current, desired, Some("spec"), &["clusterIP", "clusterIPs"]);
        }
        Ok(())
    }
}

/// Keeps system-generated secret references of a ServiceAccount across updates
#[derive(Clone, Copy, Debug, Default)]
pub struct PreserveServiceAccountSecrets;

impl DesiredStatePolicy for PreserveServiceAccountSecrets {
    fn desired_state(&self) -> DesiredState {
        DesiredState::Present
    }

    fn before_update(&self, current: &DynamicObject, desired: &mut DynamicObject) -> Result<()> {
        if gvk_of(desired).is_some_and(|gvk| gvk.group.is_empty() && gvk.kind == "ServiceAccount") {
            carry_over(current, desired, None, &["secrets", "imagePullSecrets"]);
        }
        Ok(())
    }
}

/// A target object plus the policy to reconcile it with
#[derive(Clone)]
pub struct DesiredObject {
    pub object: DynamicObject,
    pub policy: Arc<dyn DesiredStatePolicy>,
}

impl DesiredObject {
    pub fn new(object: DynamicObject, policy: impl DesiredStatePolicy + 'static) -> Self {
        Self {
            object,
            policy: Arc::new(policy),
        }
    }

    pub fn present(object: DynamicObject) -> Self {
        Self::new(object, DesiredState::Present)
    }

    pub fn created(object: DynamicObject) -> Self {
        Self::new(object, DesiredState::Created)
    }

    pub fn absent(object: DynamicObject) -> Self {
        Self::new(object, DesiredState::Absent)
    }

    pub fn state(&self) -> DesiredState {
        self.policy.desired_state()
    }
}

impl std::fmt::Debug for DesiredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesiredObject")
            .field("object", &crate::store::describe(&self.object))
            .field("state", &self.state())
            .finish()
    }
}

/// Produces one desired object per pass
pub trait Builder: Send + Sync {
    fn build(&self) -> Result<DesiredObject>;
}

impl<F> Builder for F
where
    F: Fn() -> Result<DesiredObject> + Send + Sync,
{
    fn build(&self) -> Result<DesiredObject> {
        self()
    }
}
