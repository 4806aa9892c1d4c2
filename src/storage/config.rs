//! Per-collection configuration: trigger registrations and index definitions.
//!
//! A configuration attaches to one collection and applies to its whole
//! subtree. Index rules resolve to the nearest configured ancestor; trigger
//! registrations accumulate from the root down unless a level turns
//! `inherit_triggers` off.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::trigger::OperationKind;

/// Configuration document attached to a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    /// When false, triggers declared by ancestors do not apply here.
    #[serde(default = "default_true")]
    pub inherit_triggers: bool,
    #[serde(default)]
    pub index: IndexConfig,
}

fn default_true() -> bool {
    true
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            triggers: Vec::new(),
            inherit_triggers: true,
            index: IndexConfig::default(),
        }
    }
}

impl CollectionConfig {
    /// Parse a configuration document.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize as a configuration document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Add a trigger registration.
    pub fn with_trigger(mut self, def: TriggerDef) -> Self {
        self.triggers.push(def);
        self
    }

    /// Index the text of the given element names.
    pub fn with_fulltext<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index.fulltext = Some(FullTextDefinition {
            fields: fields.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Index element paths; an empty list indexes every path.
    pub fn with_structural<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index.structural = Some(StructuralDefinition {
            paths: paths.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// One trigger registration: which hook, for which operation kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Identifier the trigger factory was registered under.
    pub name: String,
    /// Operation kinds observed. Empty means all of them.
    #[serde(default)]
    pub events: Vec<OperationKind>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl TriggerDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    /// Restrict to the given operation kinds.
    pub fn on(mut self, events: impl IntoIterator<Item = OperationKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Does this registration fire for `kind`?
    pub fn observes(&self, kind: OperationKind) -> bool {
        self.events.is_empty() || self.events.contains(&kind)
    }
}

/// Index section of a collection configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub fulltext: Option<FullTextDefinition>,
    #[serde(default)]
    pub structural: Option<StructuralDefinition>,
}

/// Element names whose text is tokenized into the full-text index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTextDefinition {
    pub fields: Vec<String>,
}

/// Element paths recorded by the structural index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralDefinition {
    #[serde(default)]
    pub paths: Vec<String>,
}
