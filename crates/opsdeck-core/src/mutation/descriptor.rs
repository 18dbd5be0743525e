use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::item::{Item, ItemId};
use crate::model::task::ParseEnumError;
use crate::ports::MutationRequest;
use crate::query::key::QueryKey;

/// The kind of write a mutation performs. Together with the item id it
/// forms the reservation key that serializes concurrent mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(ParseEnumError {
                expected: "mutation kind",
                got: s.to_string(),
            }),
        }
    }
}

/// The optimistic change applied to each target entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Patch {
    /// Drop the item from `data`.
    Remove { id: ItemId },
    /// Shallow-merge `fields` into the item, keeping its position.
    Merge {
        id: ItemId,
        fields: Map<String, Value>,
    },
    /// Put a new item at the head of `data` (or replace it in place when
    /// the id is already present).
    Prepend { item: Item },
}

impl Patch {
    pub const fn item_id(&self) -> &ItemId {
        match self {
            Self::Remove { id } | Self::Merge { id, .. } => id,
            Self::Prepend { item } => &item.id,
        }
    }
}

/// Which cached entries a mutation touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Targets {
    /// Every successful entry of the collection whose `data` currently
    /// contains the item.
    Containing,
    /// Exactly these keys (used by creates, whose item is in no list yet).
    Keys(BTreeSet<QueryKey>),
}

/// Everything the mutation cache needs to apply, issue, and reconcile one
/// mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationDescriptor {
    pub collection: String,
    pub kind: MutationKind,
    pub item_id: ItemId,
    pub patch: Patch,
    pub targets: Targets,
    /// Request body forwarded to the request collaborator.
    #[serde(default)]
    pub body: Map<String, Value>,
}

impl MutationDescriptor {
    pub fn delete(collection: impl Into<String>, id: impl Into<ItemId>) -> Self {
        let id = id.into();
        Self {
            collection: collection.into(),
            kind: MutationKind::Delete,
            item_id: id.clone(),
            patch: Patch::Remove { id },
            targets: Targets::Containing,
            body: Map::new(),
        }
    }

    /// Partial update: `fields` is both the optimistic merge and the body.
    pub fn update(
        collection: impl Into<String>,
        id: impl Into<ItemId>,
        fields: Map<String, Value>,
    ) -> Self {
        let id = id.into();
        Self {
            collection: collection.into(),
            kind: MutationKind::Update,
            item_id: id.clone(),
            patch: Patch::Merge {
                id,
                fields: fields.clone(),
            },
            targets: Targets::Containing,
            body: fields,
        }
    }

    /// Create `item` and show it at the head of each key in `into`.
    pub fn create(
        collection: impl Into<String>,
        item: Item,
        into: impl IntoIterator<Item = QueryKey>,
    ) -> Self {
        let body = match serde_json::to_value(&item) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            collection: collection.into(),
            kind: MutationKind::Create,
            item_id: item.id.clone(),
            patch: Patch::Prepend { item },
            targets: Targets::Keys(into.into_iter().collect()),
            body,
        }
    }

    /// Replace the request body while keeping the optimistic patch.
    #[must_use]
    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = body;
        self
    }

    pub fn to_request(&self) -> MutationRequest {
        MutationRequest {
            collection: self.collection.clone(),
            kind: self.kind,
            item_id: self.item_id.clone(),
            body: self.body.clone(),
        }
    }
}
