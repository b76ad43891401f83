//! Property-graph storage.
//!
//! The completion pipeline only talks to the graph through the [`GraphStore`]
//! trait; [`SqliteGraphStore`] is the bundled backend.

mod schema;
mod sqlite;

pub use schema::{apply_pragmas, init_schema, SCHEMA_VERSION};
pub use sqlite::SqliteGraphStore;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::models::NodeIdentity;

/// Node and relationship properties.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// How `merge_node` treats the supplied properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Properties are written only if the node is created (`ON CREATE SET`).
    OnCreate,
    /// Properties are patched onto the node, new or existing (`SET +=`).
    Always,
}

/// Node selection for `query_by_predicate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePredicate {
    HasLabel(String),
    /// Nodes with `label` whose `property` is absent or blank.
    BlankProperty { label: String, property: String },
    /// Nodes with `label`, a non-blank `marker` and `flag` not set to true.
    PendingExpansion {
        label: String,
        marker: String,
        flag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub parent: NodeIdentity,
    pub child: NodeIdentity,
    pub rel_type: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: u64,
    pub relationships: u64,
    pub labels: Vec<(String, u64)>,
}

/// Trait for graph storage backends.
///
/// Every mutation is idempotent: merging an existing node, label or
/// relationship never duplicates it. Implementations must be thread-safe.
pub trait GraphStore: Send + Sync {
    // === Node Operations ===

    fn node_exists(&self, identity: &NodeIdentity) -> Result<bool>;

    fn has_label(&self, identity: &NodeIdentity, label: &str) -> Result<bool>;

    /// Merge a node keyed by its identity. Returns true if it was created.
    fn merge_node(
        &self,
        identity: &NodeIdentity,
        properties: &Properties,
        mode: MergeMode,
    ) -> Result<bool>;

    /// Returns true if the label was newly added.
    fn add_label(&self, identity: &NodeIdentity, label: &str) -> Result<bool>;

    /// Delete a node together with its labels and relationships.
    fn delete_node(&self, identity: &NodeIdentity) -> Result<bool>;

    fn node_properties(&self, identity: &NodeIdentity) -> Result<Option<Properties>>;

    fn labels(&self, identity: &NodeIdentity) -> Result<Vec<String>>;

    fn query_by_predicate(&self, predicate: &NodePredicate) -> Result<Vec<NodeIdentity>>;

    // === Relationship Operations ===

    /// Merge `parent -[rel_type]-> child`. Returns true if it was created;
    /// false if it already existed or either endpoint is missing.
    fn merge_relationship(
        &self,
        parent: &NodeIdentity,
        child: &NodeIdentity,
        rel_type: &str,
        properties: &Properties,
    ) -> Result<bool>;

    fn relationships_from(
        &self,
        parent: &NodeIdentity,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>>;

    fn relationships_to(
        &self,
        child: &NodeIdentity,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>>;

    fn stats(&self) -> Result<GraphStats>;
}

/// Labels, relationship types and property names end up in the schema, so
/// they are restricted to `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(GraphError::InvalidName(name.to_string()))
    }
}

pub(crate) fn validate_identity(identity: &NodeIdentity) -> Result<()> {
    if !identity.is_valid() {
        return Err(GraphError::InvalidIdentity(identity.to_string()));
    }
    validate_name(&identity.primary_label)?;
    validate_name(&identity.id_property)
}
