use std::fmt;

use serde::{Deserialize, Serialize};

/// Names a graph node: `(:primary_label {id_property: id_value})`.
///
/// The optional secondary role is a functional tag (`PubMed`, `Reference`,
/// ...) and is not part of the identity: two identities with the same
/// label/property/value address the same node whatever their roles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub primary_label: String,
    pub id_property: String,
    pub id_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_role: Option<String>,
}

impl NodeIdentity {
    pub fn new(
        primary_label: impl Into<String>,
        id_property: impl Into<String>,
        id_value: impl Into<String>,
    ) -> Self {
        Self {
            primary_label: primary_label.into(),
            id_property: id_property.into(),
            id_value: id_value.into(),
            secondary_role: None,
        }
    }

    /// Same node, tagged with a role. A blank role leaves the identity untagged.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        let role = role.into();
        self.secondary_role = if role.trim().is_empty() { None } else { Some(role) };
        self
    }

    /// The identity with its role stripped.
    pub fn untagged(&self) -> Self {
        Self {
            secondary_role: None,
            ..self.clone()
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.primary_label.trim().is_empty()
            && !self.id_property.trim().is_empty()
            && !self.id_value.trim().is_empty()
    }

    /// True when both identities address the same node.
    pub fn same_node(&self, other: &NodeIdentity) -> bool {
        self.primary_label == other.primary_label
            && self.id_property == other.id_property
            && self.id_value == other.id_value
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secondary_role {
            Some(role) => write!(
                f,
                "(:{}:{} {{{}: {}}})",
                self.primary_label, role, self.id_property, self.id_value
            ),
            None => write!(
                f,
                "(:{} {{{}: {}}})",
                self.primary_label, self.id_property, self.id_value
            ),
        }
    }
}

/// Declares a child node that will exist before its data does, together with
/// the parent relationship that discovered it. `empty_marker_property` names
/// the property whose blankness marks the child as a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderEdge {
    pub parent: NodeIdentity,
    pub child: NodeIdentity,
    pub relationship_type: String,
    pub empty_marker_property: String,
}

impl PlaceholderEdge {
    pub fn new(
        parent: NodeIdentity,
        child: NodeIdentity,
        relationship_type: impl Into<String>,
        empty_marker_property: impl Into<String>,
    ) -> Self {
        Self {
            parent,
            child,
            relationship_type: relationship_type.into(),
            empty_marker_property: empty_marker_property.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.parent.is_valid()
            && self.child.is_valid()
            && !self.relationship_type.trim().is_empty()
            && !self.empty_marker_property.trim().is_empty()
    }
}
