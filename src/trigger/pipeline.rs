//! Trigger resolution and the per-operation phase machine.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::storage::{CollectionPath, CollectionTree, TriggerDef};
use crate::store::CollectionStore;
use crate::transaction::Transaction;
use crate::trigger::error::TriggerError;
use crate::trigger::event::{OperationKind, TriggerEvent};
use crate::trigger::registry::TriggerRegistry;
use crate::trigger::{Outcome, Trigger, TriggerContext};

/// A trigger instance bound to the collection that declared it.
#[derive(Clone)]
pub struct ResolvedTrigger {
    /// `<declaring collection>#<position>:<name>`, unique per registration.
    key: String,
    declared_on: CollectionPath,
    trigger: Arc<dyn Trigger>,
}

impl ResolvedTrigger {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn declared_on(&self) -> &CollectionPath {
        &self.declared_on
    }

    pub fn name(&self) -> &str {
        self.trigger.name()
    }
}

impl fmt::Debug for ResolvedTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTrigger").field("key", &self.key).finish()
    }
}

/// Resolves which triggers apply to an operation.
#[derive(Clone, Debug)]
pub struct TriggerPipeline {
    registry: TriggerRegistry,
}

impl TriggerPipeline {
    pub fn new(registry: TriggerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    /// Check that every registration names a known trigger and builds.
    pub fn validate(&self, defs: &[TriggerDef]) -> DbResult<()> {
        for def in defs {
            self.registry.create(def).map_err(|e| match e {
                TriggerError::Unknown(name) => DbError::not_found(format!("trigger '{}'", name)),
                other => DbError::invalid_state(other.to_string()),
            })?;
        }
        Ok(())
    }

    /// Triggers observing `kind` for `collection`, ancestors' registrations
    /// first. A level with `inherit_triggers: false` drops everything
    /// declared above it.
    pub fn resolve(
        &self,
        tree: &CollectionTree,
        collection: &CollectionPath,
        kind: OperationKind,
    ) -> DbResult<Vec<ResolvedTrigger>> {
        let mut resolved = Vec::new();
        for (scope, config) in tree.configs_along(collection) {
            if !config.inherit_triggers {
                resolved.clear();
            }
            for (idx, def) in config.triggers.iter().enumerate() {
                if !def.observes(kind) {
                    continue;
                }
                let trigger = self
                    .registry
                    .create(def)
                    .map_err(|e| DbError::invalid_state(format!("trigger on {}: {}", scope, e)))?;
                resolved.push(ResolvedTrigger {
                    key: format!("{}#{}:{}", scope, idx, def.name),
                    declared_on: scope.clone(),
                    trigger,
                });
            }
        }
        Ok(resolved)
    }

    /// Triggers for a move or copy: the source side's, then any the
    /// destination side adds.
    pub fn resolve_pair(
        &self,
        tree: &CollectionTree,
        source: &CollectionPath,
        destination: &CollectionPath,
        kind: OperationKind,
    ) -> DbResult<Vec<ResolvedTrigger>> {
        let mut resolved = self.resolve(tree, source, kind)?;
        let mut seen: HashSet<String> = resolved.iter().map(|t| t.key.clone()).collect();
        for trigger in self.resolve(tree, destination, kind)? {
            if seen.insert(trigger.key.clone()) {
                resolved.push(trigger);
            }
        }
        Ok(resolved)
    }

    /// Resolve and wrap one operation.
    pub fn operation(
        &self,
        tree: &CollectionTree,
        event: TriggerEvent,
    ) -> DbResult<TriggerOperation> {
        let triggers = match &event.destination {
            Some(dest) => self.resolve_pair(tree, event.target.collection(), dest.collection(), event.kind)?,
            None => self.resolve(tree, event.target.collection(), event.kind)?,
        };
        Ok(TriggerOperation::new(triggers, event))
    }
}

/// Where an operation is in its bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preparing,
    BeforeFired,
    Applying,
    AfterFired,
    Done,
    Aborted,
}

/// One structural operation wrapped in its before/after hooks.
///
/// Before-hooks run in resolution order, after-hooks in reverse order and only
/// for the triggers whose before-hook ran.
pub struct TriggerOperation {
    triggers: Vec<ResolvedTrigger>,
    event: TriggerEvent,
    phase: Phase,
    fired: Vec<usize>,
}

impl TriggerOperation {
    pub fn new(triggers: Vec<ResolvedTrigger>, event: TriggerEvent) -> Self {
        Self {
            triggers,
            event,
            phase: Phase::Preparing,
            fired: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn event(&self) -> &TriggerEvent {
        &self.event
    }

    pub fn triggers(&self) -> &[ResolvedTrigger] {
        &self.triggers
    }

    /// Run before-hooks, `apply`, then after-hooks. Leaves the operation in
    /// `Done` or `Aborted`.
    pub fn run<T>(
        &mut self,
        store: &CollectionStore,
        tx: &mut Transaction,
        apply: impl FnOnce(&mut Transaction) -> DbResult<T>,
    ) -> DbResult<T> {
        let result = self.fire_before(store, tx).and_then(|()| {
            self.phase = Phase::Applying;
            apply(tx)
        });
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.phase = Phase::Aborted;
                return Err(e);
            }
        };

        match self.fire_after(store, tx) {
            Ok(()) => {
                self.phase = Phase::Done;
                Ok(value)
            }
            Err(e) => {
                self.phase = Phase::Aborted;
                Err(e)
            }
        }
    }

    fn fire_before(&mut self, store: &CollectionStore, tx: &mut Transaction) -> DbResult<()> {
        debug_assert_eq!(self.phase, Phase::Preparing);

        for idx in 0..self.triggers.len() {
            let trigger = self.triggers[idx].clone();
            if !tx.enter_trigger(&trigger.key) {
                debug!(trigger = %trigger.key, "suppressed re-entrant trigger");
                continue;
            }

            let outcome = {
                let mut ctx = TriggerContext {
                    store,
                    tx: &mut *tx,
                    declared_on: &trigger.declared_on,
                };
                trigger.trigger.before(&mut ctx, &self.event)
            };
            tx.leave_trigger(&trigger.key);

            match outcome {
                Ok(Outcome::Continue) => self.fired.push(idx),
                Ok(Outcome::Veto(reason)) => {
                    warn!(trigger = %trigger.key, kind = %self.event.kind, target = %self.event.target, %reason, "operation vetoed");
                    return Err(DbError::TriggerRejected {
                        trigger: trigger.name().to_string(),
                        reason,
                    });
                }
                Err(e) => return Err(hook_failure(&trigger, e)),
            }
        }

        self.phase = Phase::BeforeFired;
        Ok(())
    }

    fn fire_after(&mut self, store: &CollectionStore, tx: &mut Transaction) -> DbResult<()> {
        let fired = std::mem::take(&mut self.fired);
        for &idx in fired.iter().rev() {
            let trigger = self.triggers[idx].clone();
            if !tx.enter_trigger(&trigger.key) {
                continue;
            }

            let result = {
                let mut ctx = TriggerContext {
                    store,
                    tx: &mut *tx,
                    declared_on: &trigger.declared_on,
                };
                trigger.trigger.after(&mut ctx, &self.event)
            };
            tx.leave_trigger(&trigger.key);

            result.map_err(|e| hook_failure(&trigger, e))?;
        }

        self.phase = Phase::AfterFired;
        Ok(())
    }
}

/// A failing hook vetoes the operation, unless the failure must abort the
/// whole transaction, in which case it is passed through unchanged.
fn hook_failure(trigger: &ResolvedTrigger, err: TriggerError) -> DbError {
    match err {
        TriggerError::Store(inner) if inner.aborts_transaction() => *inner,
        other => {
            warn!(trigger = %trigger.key, error = %other, "trigger failed");
            DbError::TriggerRejected {
                trigger: trigger.name().to_string(),
                reason: other.to_string(),
            }
        }
    }
}
