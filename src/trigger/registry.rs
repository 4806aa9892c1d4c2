//! Identifier-to-factory table for triggers named in collection configurations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::storage::{CollectionPath, TriggerDef};
use crate::trigger::error::TriggerError;
use crate::trigger::history::HistoryTrigger;
use crate::trigger::Trigger;

/// Builds trigger instances from a registration.
pub trait TriggerFactory: Send + Sync {
    fn create(&self, def: &TriggerDef) -> Result<Arc<dyn Trigger>, TriggerError>;
}

impl<F> TriggerFactory for F
where
    F: Fn(&TriggerDef) -> Result<Arc<dyn Trigger>, TriggerError> + Send + Sync,
{
    fn create(&self, def: &TriggerDef) -> Result<Arc<dyn Trigger>, TriggerError> {
        self(def)
    }
}

/// The handler table. Clones share the same table.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn TriggerFactory>>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `history` trigger archiving under `history_root`.
    pub fn with_builtins(history_root: CollectionPath) -> Self {
        let registry = Self::new();
        registry.register(HistoryTrigger::NAME, move |def: &TriggerDef| {
            let trigger = HistoryTrigger::from_def(def, &history_root)?;
            Ok(Arc::new(trigger) as Arc<dyn Trigger>)
        });
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&TriggerDef) -> Result<Arc<dyn Trigger>, TriggerError> + Send + Sync + 'static,
    {
        self.register_factory(name, Arc::new(factory));
    }

    pub fn register_factory(&self, name: impl Into<String>, factory: Arc<dyn TriggerFactory>) {
        let name = name.into();
        debug!(trigger = %name, "trigger factory registered");
        self.factories.write().insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Registered identifiers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate the trigger a registration names.
    pub fn create(&self, def: &TriggerDef) -> Result<Arc<dyn Trigger>, TriggerError> {
        let factory = self
            .factories
            .read()
            .get(&def.name)
            .cloned()
            .ok_or_else(|| TriggerError::Unknown(def.name.clone()))?;
        factory.create(def)
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("triggers", &self.names())
            .finish()
    }
}
