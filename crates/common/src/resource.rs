//! Resource types and identities
//!
//! A lockable resource is named by a [`ResourceKey`]: the registered
//! [`ResourceType`] plus a [`ResourceIdentity`]. Ordinary records use a plain
//! numeric id. A temporal property lock names one property of one entity and
//! covers all of its time ranges; the range itself travels with each call.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry of lockable resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Node,
    Relationship,
    GraphProperties,
    Schema,
    IndexEntry,
    LegacyIndex,
    /// Time-versioned property on a node
    NodeTemporalProp,
    /// Time-versioned property on a relationship
    RelationshipTemporalProp,
}

impl ResourceType {
    const ALL: [ResourceType; 8] = [
        ResourceType::Node,
        ResourceType::Relationship,
        ResourceType::GraphProperties,
        ResourceType::Schema,
        ResourceType::IndexEntry,
        ResourceType::LegacyIndex,
        ResourceType::NodeTemporalProp,
        ResourceType::RelationshipTemporalProp,
    ];

    /// Stable integer id of this type
    pub fn type_id(&self) -> i32 {
        match self {
            ResourceType::Node => 0,
            ResourceType::Relationship => 1,
            ResourceType::GraphProperties => 2,
            ResourceType::Schema => 3,
            ResourceType::IndexEntry => 4,
            ResourceType::LegacyIndex => 5,
            ResourceType::NodeTemporalProp => 6,
            ResourceType::RelationshipTemporalProp => 7,
        }
    }

    pub fn from_type_id(type_id: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.type_id() == type_id)
    }

    /// Whether locks of this type are interval locks
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            ResourceType::NodeTemporalProp | ResourceType::RelationshipTemporalProp
        )
    }

    pub fn all() -> &'static [ResourceType] {
        &Self::ALL
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Node => "NODE",
            ResourceType::Relationship => "RELATIONSHIP",
            ResourceType::GraphProperties => "GRAPH_PROPS",
            ResourceType::Schema => "SCHEMA",
            ResourceType::IndexEntry => "INDEX_ENTRY",
            ResourceType::LegacyIndex => "LEGACY_INDEX",
            ResourceType::NodeTemporalProp => "NODE_TEMPORAL_PROP",
            ResourceType::RelationshipTemporalProp => "REL_TEMPORAL_PROP",
        };
        f.write_str(name)
    }
}

/// Identity of a lockable resource within its type.
///
/// Variants never compare equal to each other, even when their numeric
/// fields coincide; ordering puts every `Normal` before every `TemporalProp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceIdentity {
    /// Ordinary entity or record lock
    Normal(i64),
    /// All time ranges of one property on one entity
    TemporalProp { entity_id: i64, property_key: i32 },
}

impl ResourceIdentity {
    pub fn entity_id(&self) -> i64 {
        match self {
            ResourceIdentity::Normal(id) => *id,
            ResourceIdentity::TemporalProp { entity_id, .. } => *entity_id,
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, ResourceIdentity::TemporalProp { .. })
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceIdentity::Normal(id) => write!(f, "{}", id),
            ResourceIdentity::TemporalProp {
                entity_id,
                property_key,
            } => write!(f, "{}.{}", entity_id, property_key),
        }
    }
}

/// Key of one lock state machine in the lock manager's table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub identity: ResourceIdentity,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, identity: ResourceIdentity) -> Self {
        Self {
            resource_type,
            identity,
        }
    }

    pub fn normal(resource_type: ResourceType, id: i64) -> Self {
        Self::new(resource_type, ResourceIdentity::Normal(id))
    }

    pub fn temporal(resource_type: ResourceType, entity_id: i64, property_key: i32) -> Self {
        Self::new(
            resource_type,
            ResourceIdentity::TemporalProp {
                entity_id,
                property_key,
            },
        )
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.resource_type, self.identity)
    }
}
