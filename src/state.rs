//! Named, typed, versioned state variables with change notification.
//!
//! The protocol engine never writes storage directly: interpreters call
//! [`DeviceStateModel::update`], and the model decides whether anything
//! changed. Watchers fire exactly once per real change, never for a write of
//! the value already held, so a static device polled continuously produces no
//! notifications.
//!
//! Changes are queued inside the model and handed out by
//! [`DeviceStateModel::take_notifications`], so a shared model can be
//! unlocked before any watcher runs.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::LinkError;
use crate::value::{Value, VarType};

#[derive(Debug, Clone, Serialize)]
pub struct StateVariable {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: VarType,
    pub editable: bool,
    #[serde(rename = "state")]
    pub value: Value,
    pub version: u64,
}

/// Delivered to watchers after a variable actually changed.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub name: String,
    pub old: Value,
    pub new: Value,
    pub version: u64,
}

pub type Watcher = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// State model shared between the engine task and handles.
pub type SharedState = Arc<RwLock<DeviceStateModel>>;

#[derive(Default)]
pub struct DeviceStateModel {
    vars: BTreeMap<String, StateVariable>,
    watchers: HashMap<String, Vec<Watcher>>,
    any_watchers: Vec<Watcher>,
    queued: Vec<StateChange>,
}

/// Changes taken out of a model together with the watchers interested in
/// them. Deliver after releasing the model lock.
#[must_use]
pub struct Notifications {
    pending: Vec<(StateChange, Vec<Watcher>)>,
}

impl Notifications {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn deliver(self) {
        for (change, watchers) in self.pending {
            for w in watchers {
                w(&change);
            }
        }
    }
}

impl DeviceStateModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable. Its initial value is `Null` (unknown) at version 0.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        var_type: VarType,
        editable: bool,
    ) -> Result<(), LinkError> {
        let name = name.into();
        if self.vars.contains_key(&name) {
            return Err(LinkError::Config(format!(
                "state variable {name} declared twice"
            )));
        }
        self.vars.insert(
            name.clone(),
            StateVariable {
                name,
                var_type,
                editable,
                value: Value::Null,
                version: 0,
            },
        );
        Ok(())
    }

    /// Store `value` if it differs from the current one. Returns whether it
    /// changed. A change is queued for the watchers; nothing runs until
    /// [`take_notifications`](Self::take_notifications) is delivered.
    pub fn update(&mut self, name: &str, value: impl Into<Value>) -> Result<bool, LinkError> {
        let value = value.into();
        let var = self
            .vars
            .get_mut(name)
            .ok_or_else(|| LinkError::UnknownVariable(name.to_string()))?;
        if !var.var_type.accepts(&value) {
            return Err(LinkError::TypeMismatch {
                name: name.to_string(),
                expected: var.var_type.name().to_string(),
            });
        }
        if var.value.same_as(&value) {
            return Ok(false);
        }
        let old = std::mem::replace(&mut var.value, value.clone());
        var.version += 1;
        tracing::debug!(var = name, value = %value, version = var.version, "state changed");

        self.queued.push(StateChange {
            name: name.to_string(),
            old,
            new: value,
            version: var.version,
        });
        Ok(true)
    }

    /// Drain queued changes, pairing each with its watchers.
    pub fn take_notifications(&mut self) -> Notifications {
        let pending = self
            .queued
            .drain(..)
            .map(|change| {
                let watchers = self
                    .watchers
                    .get(&change.name)
                    .into_iter()
                    .flatten()
                    .chain(&self.any_watchers)
                    .cloned()
                    .collect();
                (change, watchers)
            })
            .collect();
        Notifications { pending }
    }

    /// Watch one variable.
    pub fn on_change<F>(&mut self, name: &str, callback: F) -> Result<(), LinkError>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        if !self.vars.contains_key(name) {
            return Err(LinkError::UnknownVariable(name.to_string()));
        }
        self.watchers
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }

    /// Watch every variable.
    pub fn on_any_change<F>(&mut self, callback: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.any_watchers.push(Arc::new(callback));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).map(|v| &v.value)
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&StateVariable> {
        self.vars.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// All variables as `{name: {type, editable, state, version}}`.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.vars).unwrap_or(serde_json::Value::Null)
    }

    #[must_use]
    pub fn into_shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }
}

impl std::fmt::Debug for DeviceStateModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStateModel")
            .field("vars", &self.vars)
            .field("watched", &self.watchers.keys().collect::<Vec<_>>())
            .field("any_watchers", &self.any_watchers.len())
            .field("queued", &self.queued.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn model() -> DeviceStateModel {
        let mut m = DeviceStateModel::new();
        m.declare("power", VarType::Boolean, true).expect("declare");
        m.declare("volume", VarType::Percentage, true).expect("declare");
        m.declare(
            "input",
            VarType::Option(vec!["RGB1".into(), "VIDEO".into()]),
            true,
        )
        .expect("declare");
        m
    }

    #[test]
    fn repeated_write_notifies_once() {
        let mut m = model();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        m.on_change("power", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .expect("watch");

        assert!(m.update("power", true).expect("update"));
        assert!(!m.update("power", true).expect("update"));
        let pending = m.take_notifications();
        assert_eq!(pending.len(), 1);
        pending.deliver();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(m.take_notifications().is_empty());
        assert_eq!(m.variable("power").map(|v| v.version), Some(1));
    }

    #[test]
    fn change_carries_old_and_new() {
        let mut m = model();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        m.on_any_change(move |c| s.lock().expect("lock").push(c.clone()));

        m.update("input", "RGB1").expect("update");
        m.update("input", "VIDEO").expect("update");
        m.take_notifications().deliver();
        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].old, Value::from("RGB1"));
        assert_eq!(seen[1].new, Value::from("VIDEO"));
        assert_eq!(seen[1].version, 2);
    }

    #[test]
    fn watchers_are_per_variable() {
        let mut m = model();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        m.on_change("volume", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .expect("watch");
        m.update("power", false).expect("update");
        m.take_notifications().deliver();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn watcher_can_read_shared_model_on_delivery() {
        let shared = model().into_shared();
        let seen = Arc::new(Mutex::new(None));
        {
            let reader = Arc::clone(&shared);
            let s = Arc::clone(&seen);
            shared
                .write()
                .expect("lock")
                .on_change("volume", move |_| {
                    let now = reader.read().expect("read").get("volume").cloned();
                    *s.lock().expect("lock") = now;
                })
                .expect("watch");
        }
        let pending = {
            let mut m = shared.write().expect("lock");
            m.update("volume", 0.25).expect("update");
            m.take_notifications()
        };
        pending.deliver();
        assert_eq!(*seen.lock().expect("lock"), Some(Value::Number(0.25)));
    }

    #[test]
    fn rejects_unknown_and_mistyped() {
        let mut m = model();
        assert!(matches!(m.update("lamp", 1i64), Err(LinkError::UnknownVariable(_))));
        assert!(matches!(m.update("volume", 1.5), Err(LinkError::TypeMismatch { .. })));
        assert!(matches!(m.update("input", "HDMI"), Err(LinkError::TypeMismatch { .. })));
        assert!(m.on_change("lamp", |_| {}).is_err());
        assert!(m.declare("power", VarType::Boolean, true).is_err());
    }

    #[test]
    fn snapshot_shape() {
        let mut m = model();
        m.update("volume", 0.5).expect("update");
        let snap = m.snapshot();
        assert_eq!(snap["volume"]["state"], serde_json::json!(0.5));
        assert_eq!(snap["volume"]["type"]["kind"], serde_json::json!("percentage"));
        assert_eq!(snap["volume"]["version"], serde_json::json!(1));
        assert_eq!(snap["power"]["state"], serde_json::Value::Null);
    }
}
