//! Built-in trigger archiving overwritten documents.

use tracing::debug;
use ulid::Ulid;

use crate::error::DbError;
use crate::storage::{CollectionPath, DocumentName, TriggerDef};
use crate::trigger::error::TriggerError;
use crate::trigger::event::{OperationKind, TriggerEvent};
use crate::trigger::{Outcome, Trigger, TriggerContext};

/// Before a document is overwritten (by store, update, copy or move), stores
/// its previous content as `<root><collection>/<name>/<ulid>`.
///
/// Overwrites inside `root` itself are never archived, and the pipeline keeps
/// the trigger from firing again for its own archive writes.
#[derive(Debug, Clone)]
pub struct HistoryTrigger {
    root: CollectionPath,
}

impl HistoryTrigger {
    pub const NAME: &'static str = "history";

    pub fn new(root: CollectionPath) -> Self {
        Self { root }
    }

    /// Build from a registration; a `root` parameter overrides `default_root`.
    pub fn from_def(def: &TriggerDef, default_root: &CollectionPath) -> Result<Self, TriggerError> {
        let root = match def.params.get("root") {
            Some(raw) => CollectionPath::new(raw).map_err(|e| TriggerError::Config {
                trigger: def.name.clone(),
                reason: e.to_string(),
            })?,
            None => default_root.clone(),
        };
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &CollectionPath {
        &self.root
    }
}

impl Trigger for HistoryTrigger {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn before(&self, ctx: &mut TriggerContext<'_>, event: &TriggerEvent) -> Result<Outcome, TriggerError> {
        if !matches!(
            event.kind,
            OperationKind::Store | OperationKind::Update | OperationKind::Copy | OperationKind::Move
        ) {
            return Ok(Outcome::Continue);
        }

        let (Some(previous), Some(overwritten)) = (&event.replaces, event.overwritten()) else {
            return Ok(Outcome::Continue);
        };
        if overwritten.collection.is_within(&self.root) {
            return Ok(Outcome::Continue);
        }

        let archive = self
            .root
            .join(&overwritten.collection)
            .child(overwritten.name.as_str())
            .map_err(DbError::from)?;
        let name = DocumentName::new(Ulid::new().to_string().to_lowercase()).map_err(DbError::from)?;

        ctx.store.ensure_collection(ctx.tx, &archive)?;
        ctx.store
            .store_with_mime(ctx.tx, &archive, &name, previous.content.clone(), &previous.mime)?;

        debug!(document = %overwritten, archive = %archive, "archived previous version");
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_parameter() {
        let default_root = CollectionPath::new("/db/history").unwrap();

        let plain = HistoryTrigger::from_def(&TriggerDef::new("history"), &default_root).unwrap();
        assert_eq!(plain.root(), &default_root);

        let custom = TriggerDef::new("history").param("root", "/db/archive");
        let trigger = HistoryTrigger::from_def(&custom, &default_root).unwrap();
        assert_eq!(trigger.root().as_str(), "/db/archive");
    }
}
