use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::models::identifiers::NodeIdentity;

pub const PUBLICATION_LABEL: &str = "Publication";
pub const PUB_ID_PROPERTY: &str = "pub_id";
/// Blank on placeholder publications, set only by a completed merge.
pub const MARKER_PROPERTY: &str = "title";
/// Set on primary records once their references have been expanded.
pub const REFERENCES_LOADED_PROPERTY: &str = "references_loaded";
/// Marker value for complete records that carry no title of their own.
pub const UNTITLED: &str = "[Untitled]";

pub const SECTION_LABEL: &str = "PublicationSection";
pub const SECTION_ID_PROPERTY: &str = "section_id";

pub const HAS_PUBLICATION: &str = "HAS_PUBLICATION";
pub const HAS_REFERENCE: &str = "HAS_REFERENCE";
pub const HAS_CITATION: &str = "HAS_CITATION";
pub const HAS_SECTION: &str = "HAS_SECTION";

/// Functional position of a publication node. Roles are additive labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// A primary record in its own right; its references get expanded.
    PubMed,
    Reference,
    Citation,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::PubMed => "PubMed",
            Role::Reference => "Reference",
            Role::Citation => "Citation",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::PubMed)
    }

    /// Relationship type from the discovering parent to a node of this role.
    pub fn parent_relationship(&self) -> &'static str {
        match self {
            Role::PubMed => HAS_PUBLICATION,
            Role::Reference => HAS_REFERENCE,
            Role::Citation => HAS_CITATION,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Role {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PubMed" => Ok(Role::PubMed),
            "Reference" => Ok(Role::Reference),
            "Citation" => Ok(Role::Citation),
            other => Err(GraphError::InvalidName(other.to_string())),
        }
    }
}

/// `(:Publication {pub_id: id})`
pub fn publication_identity(pub_id: impl Into<String>) -> NodeIdentity {
    NodeIdentity::new(PUBLICATION_LABEL, PUB_ID_PROPERTY, pub_id)
}

pub fn section_identity(pub_id: &str) -> NodeIdentity {
    NodeIdentity::new(SECTION_LABEL, SECTION_ID_PROPERTY, format!("{pub_id}-abstract"))
}

/// Normalized bibliographic record, produced by the record parser from a
/// successfully retrieved article. Missing external ids are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BibliographicEntry {
    pub role: Role,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub pmc_id: String,
    pub doi: String,
    pub journal_name: String,
    pub journal_issue: String,
    pub title: String,
    pub abstract_text: String,
    pub author_caption: String,
    pub reference_ids: BTreeSet<String>,
    pub citation_ids: BTreeSet<String>,
    pub citation_count: u32,
}

impl BibliographicEntry {
    /// The publication node, tagged with the entry's role.
    pub fn identity(&self) -> NodeIdentity {
        publication_identity(self.id.clone()).with_role(self.role.label())
    }
}
