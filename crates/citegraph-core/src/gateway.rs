//! Existence checks and idempotent upserts for publication nodes.
//!
//! [`GraphGateway`] is the only writer of node and relationship state. Every
//! membership check is a live query against the store.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{
    publication_identity, section_identity, BibliographicEntry, NodeIdentity, PlaceholderEdge,
    Role, HAS_CITATION, HAS_PUBLICATION, HAS_REFERENCE, HAS_SECTION, MARKER_PROPERTY,
    PUBLICATION_LABEL, REFERENCES_LOADED_PROPERTY, UNTITLED,
};
use crate::storage::{
    validate_name, GraphStore, MergeMode, NodePredicate, Properties, Relationship,
};

/// What `create_placeholder` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderOutcome {
    /// Invalid edge; nothing was written.
    Skipped,
    Registered {
        node_created: bool,
        relationship_created: bool,
        role_added: bool,
    },
}

impl PlaceholderOutcome {
    pub fn node_created(&self) -> bool {
        matches!(self, Self::Registered { node_created: true, .. })
    }
}

pub struct GraphGateway {
    store: Arc<dyn GraphStore>,
    /// Serializes the check-then-write sequence of placeholder creation.
    write_lock: Mutex<()>,
}

impl GraphGateway {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// True iff a node with this identity exists, whatever its roles or
    /// completeness.
    pub fn exists(&self, identity: &NodeIdentity) -> Result<bool> {
        self.store.node_exists(identity)
    }

    pub fn has_role(&self, identity: &NodeIdentity, role: &str) -> Result<bool> {
        self.store.has_label(identity, role)
    }

    /// Idempotent role label addition. Returns true if the label is new.
    pub fn add_role(&self, identity: &NodeIdentity, role: &str) -> Result<bool> {
        self.store.add_label(&identity.untagged(), role)
    }

    pub fn merge_relationship(
        &self,
        parent: &NodeIdentity,
        child: &NodeIdentity,
        rel_type: &str,
    ) -> Result<bool> {
        self.store
            .merge_relationship(&parent.untagged(), &child.untagged(), rel_type, &Properties::new())
    }

    /// Create a node with no properties unless it already exists, e.g. the
    /// ontology term that publications are registered under. Returns true if
    /// the node is new.
    pub fn ensure_node(&self, identity: &NodeIdentity) -> Result<bool> {
        let node = identity.untagged();
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.merge_node(&node, &Properties::new(), MergeMode::OnCreate)
    }

    /// Record that `edge.child` will exist. Creates the child with a blank
    /// marker if it is unknown, always merges the parent relationship, and
    /// adds the child's role label even to a pre-existing node.
    ///
    /// An invalid edge is logged and skipped; it never fails the caller.
    pub fn create_placeholder(&self, edge: &PlaceholderEdge) -> Result<PlaceholderOutcome> {
        if !edge.is_valid() {
            warn!(parent = %edge.parent, child = %edge.child, "invalid placeholder edge, skipped");
            return Ok(PlaceholderOutcome::Skipped);
        }
        let names = [
            edge.relationship_type.as_str(),
            edge.empty_marker_property.as_str(),
            edge.child.primary_label.as_str(),
            edge.child.id_property.as_str(),
            edge.parent.primary_label.as_str(),
            edge.parent.id_property.as_str(),
        ];
        let role = edge.child.secondary_role.as_deref();
        if let Some(bad) = names.into_iter().chain(role).find(|n| validate_name(n).is_err()) {
            warn!(name = bad, child = %edge.child, "placeholder edge has an unusable name, skipped");
            return Ok(PlaceholderOutcome::Skipped);
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let child = edge.child.untagged();

        let node_created = if self.store.node_exists(&child)? {
            false
        } else {
            let mut blank = Properties::new();
            blank.insert(edge.empty_marker_property.clone(), Value::String(String::new()));
            self.store.merge_node(&child, &blank, MergeMode::OnCreate)?
        };

        let relationship_created = self.store.merge_relationship(
            &edge.parent.untagged(),
            &child,
            &edge.relationship_type,
            &Properties::new(),
        )?;
        if !relationship_created && !self.store.node_exists(&edge.parent.untagged())? {
            warn!(parent = %edge.parent, child = %child, "parent node missing, relationship not created");
        }

        let role_added = match role {
            Some(role) => self.store.add_label(&child, role)?,
            None => false,
        };

        debug!(child = %edge.child, node_created, relationship_created, "placeholder registered");
        Ok(PlaceholderOutcome::Registered {
            node_created,
            relationship_created,
            role_added,
        })
    }

    /// Merge a complete record onto its publication node, populating the
    /// marker property. Re-merging the same entry yields the same state.
    pub fn merge_complete(&self, entry: &BibliographicEntry) -> Result<String> {
        let node = publication_identity(entry.id.clone());
        let title = if entry.title.trim().is_empty() {
            UNTITLED.to_string()
        } else {
            entry.title.clone()
        };

        let mut props = Properties::new();
        props.insert(MARKER_PROPERTY.into(), Value::from(title));
        props.insert("pmc_id".into(), Value::from(entry.pmc_id.clone()));
        props.insert("doi_id".into(), Value::from(entry.doi.clone()));
        props.insert("journal_name".into(), Value::from(entry.journal_name.clone()));
        props.insert("journal_issue".into(), Value::from(entry.journal_issue.clone()));
        props.insert("author".into(), Value::from(entry.author_caption.clone()));
        props.insert("reference_count".into(), Value::from(entry.reference_ids.len() as u64));
        props.insert("cited_by_count".into(), Value::from(entry.citation_count));

        self.store.merge_node(&node, &props, MergeMode::Always)?;
        self.store.add_label(&node, entry.role.label())?;

        if !entry.abstract_text.is_empty() {
            let section = section_identity(&entry.id);
            let mut text = Properties::new();
            text.insert("text".into(), Value::from(entry.abstract_text.clone()));
            self.store.merge_node(&section, &text, MergeMode::Always)?;

            let mut kind = Properties::new();
            kind.insert("type".into(), Value::from("Abstract"));
            self.store.merge_relationship(&node, &section, HAS_SECTION, &kind)?;
        }

        debug!(pub_id = %entry.id, role = %entry.role, "complete publication merged");
        Ok(entry.id.clone())
    }

    /// The marker property is the only completeness signal.
    pub fn is_complete(&self, identity: &NodeIdentity) -> Result<bool> {
        let props = self.store.node_properties(identity)?;
        Ok(props
            .as_ref()
            .and_then(|p| p.get(MARKER_PROPERTY))
            .and_then(Value::as_str)
            .is_some_and(|marker| !marker.trim().is_empty()))
    }

    /// Ids of every publication whose marker property is blank, any role.
    pub fn find_placeholder_ids(&self) -> Result<Vec<String>> {
        let nodes = self.store.query_by_predicate(&NodePredicate::BlankProperty {
            label: PUBLICATION_LABEL.to_string(),
            property: MARKER_PROPERTY.to_string(),
        })?;
        Ok(nodes.into_iter().map(|n| n.id_value).collect())
    }

    /// Complete primary records whose references were never expanded, e.g.
    /// a finished Reference node later registered as a primary record.
    pub fn find_pending_expansion_ids(&self) -> Result<Vec<String>> {
        let nodes = self.store.query_by_predicate(&NodePredicate::PendingExpansion {
            label: Role::PubMed.label().to_string(),
            marker: MARKER_PROPERTY.to_string(),
            flag: REFERENCES_LOADED_PROPERTY.to_string(),
        })?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.primary_label == PUBLICATION_LABEL)
            .map(|n| n.id_value)
            .collect())
    }

    pub fn references_loaded(&self, pub_id: &str) -> Result<bool> {
        let props = self.store.node_properties(&publication_identity(pub_id))?;
        Ok(props
            .as_ref()
            .and_then(|p| p.get(REFERENCES_LOADED_PROPERTY))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub fn mark_references_loaded(&self, pub_id: &str) -> Result<()> {
        let mut props = Properties::new();
        props.insert(REFERENCES_LOADED_PROPERTY.into(), Value::Bool(true));
        self.store
            .merge_node(&publication_identity(pub_id), &props, MergeMode::Always)?;
        Ok(())
    }

    /// Role labels currently carried by a publication.
    pub fn roles(&self, pub_id: &str) -> Result<Vec<Role>> {
        let labels = self.store.labels(&publication_identity(pub_id))?;
        Ok(labels.iter().filter_map(|l| l.parse().ok()).collect())
    }

    /// Relationships through which a publication was discovered, oldest first.
    pub fn parent_links(&self, pub_id: &str) -> Result<Vec<Relationship>> {
        let links = self.store.relationships_to(&publication_identity(pub_id), None)?;
        Ok(links
            .into_iter()
            .filter(|r| [HAS_PUBLICATION, HAS_REFERENCE, HAS_CITATION].contains(&r.rel_type.as_str()))
            .collect())
    }

    pub fn delete_node(&self, identity: &NodeIdentity) -> Result<bool> {
        self.store.delete_node(&identity.untagged())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::storage::SqliteGraphStore;

    fn gateway() -> GraphGateway {
        GraphGateway::new(Arc::new(SqliteGraphStore::open_in_memory().unwrap()))
    }

    fn go_term(gateway: &GraphGateway) -> NodeIdentity {
        let parent = NodeIdentity::new("GoTerm", "go_id", "GO:0000001");
        gateway.ensure_node(&parent).unwrap();
        parent
    }

    fn seed_edge(parent: &NodeIdentity, pub_id: &str, role: Role) -> PlaceholderEdge {
        PlaceholderEdge::new(
            parent.clone(),
            publication_identity(pub_id).with_role(role.label()),
            role.parent_relationship(),
            MARKER_PROPERTY,
        )
    }

    fn entry(id: &str, role: Role, title: &str) -> BibliographicEntry {
        BibliographicEntry {
            role,
            id: id.to_string(),
            parent_id: None,
            pmc_id: "PMC1".to_string(),
            doi: String::new(),
            journal_name: "Nature".to_string(),
            journal_issue: "2015 7(2):10-20".to_string(),
            title: title.to_string(),
            abstract_text: "Background.".to_string(),
            author_caption: "Smith, J; Jones, M".to_string(),
            reference_ids: ["200", "300"].into_iter().map(String::from).collect(),
            citation_ids: BTreeSet::new(),
            citation_count: 4,
        }
    }

    #[test]
    fn test_ensure_node_keeps_existing_properties() {
        let gw = gateway();
        let term = NodeIdentity::new("GoTerm", "go_id", "GO:0000002");
        assert!(gw.ensure_node(&term).unwrap());

        let mut props = Properties::new();
        props.insert("name".into(), Value::from("courtship behavior"));
        gw.store().merge_node(&term, &props, MergeMode::Always).unwrap();

        assert!(!gw.ensure_node(&term.clone().with_role("Ontology")).unwrap());
        let stored = gw.store().node_properties(&term).unwrap().unwrap();
        assert_eq!(stored["name"], Value::from("courtship behavior"));
        assert!(gw.store().labels(&term).unwrap().iter().all(|l| l != "Ontology"));

        let bad = NodeIdentity::new("Go Term", "go_id", "GO:1");
        assert!(gw.ensure_node(&bad).is_err());
    }

    #[test]
    fn test_placeholder_creation_is_idempotent() {
        let gw = gateway();
        let parent = go_term(&gw);
        let edge = seed_edge(&parent, "100", Role::PubMed);

        let first = gw.create_placeholder(&edge).unwrap();
        let second = gw.create_placeholder(&edge).unwrap();
        assert!(first.node_created());
        assert_eq!(
            second,
            PlaceholderOutcome::Registered {
                node_created: false,
                relationship_created: false,
                role_added: false,
            }
        );

        let stats = gw.store().stats().unwrap();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.relationships, 1);
    }

    #[test]
    fn test_placeholder_is_not_complete() {
        let gw = gateway();
        let parent = go_term(&gw);
        gw.create_placeholder(&seed_edge(&parent, "100", Role::PubMed)).unwrap();

        let node = publication_identity("100");
        assert!(gw.exists(&node).unwrap());
        assert!(gw.has_role(&node, "PubMed").unwrap());
        assert!(!gw.is_complete(&node).unwrap());
        assert_eq!(gw.find_placeholder_ids().unwrap(), vec!["100"]);

        gw.merge_complete(&entry("100", Role::PubMed, "Done")).unwrap();
        assert!(gw.is_complete(&node).unwrap());
        assert!(gw.find_placeholder_ids().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_edge_is_skipped() {
        let gw = gateway();
        let parent = go_term(&gw);
        let blank_child = seed_edge(&parent, " ", Role::PubMed);
        assert_eq!(gw.create_placeholder(&blank_child).unwrap(), PlaceholderOutcome::Skipped);

        let mut bad_rel = seed_edge(&parent, "1", Role::PubMed);
        bad_rel.relationship_type = "HAS PUB".to_string();
        assert_eq!(gw.create_placeholder(&bad_rel).unwrap(), PlaceholderOutcome::Skipped);
        assert_eq!(gw.store().stats().unwrap().nodes, 1);
    }

    #[test]
    fn test_roles_accumulate() {
        let gw = gateway();
        let parent = go_term(&gw);
        gw.create_placeholder(&seed_edge(&parent, "200", Role::Reference)).unwrap();
        gw.merge_complete(&entry("200", Role::Reference, "Ref")).unwrap();

        let outcome = gw.create_placeholder(&seed_edge(&parent, "200", Role::PubMed)).unwrap();
        assert_eq!(
            outcome,
            PlaceholderOutcome::Registered {
                node_created: false,
                relationship_created: true,
                role_added: true,
            }
        );
        gw.merge_complete(&entry("200", Role::PubMed, "Ref")).unwrap();

        let roles = gw.roles("200").unwrap();
        assert!(roles.contains(&Role::Reference));
        assert!(roles.contains(&Role::PubMed));
        // Completed node was not blanked by the later placeholder registration.
        assert!(gw.is_complete(&publication_identity("200")).unwrap());
    }

    #[test]
    fn test_merge_complete_is_idempotent() {
        let gw = gateway();
        let e = entry("100", Role::PubMed, "He said 'hi'");
        assert_eq!(gw.merge_complete(&e).unwrap(), "100");
        let first = gw.store().node_properties(&publication_identity("100")).unwrap();
        gw.merge_complete(&e).unwrap();
        let second = gw.store().node_properties(&publication_identity("100")).unwrap();
        assert_eq!(first, second);

        let props = second.unwrap();
        assert_eq!(props["reference_count"], Value::from(2));
        assert_eq!(props["cited_by_count"], Value::from(4));
        assert_eq!(props["doi_id"], Value::from(""));

        let sections = gw
            .store()
            .relationships_from(&publication_identity("100"), Some(HAS_SECTION))
            .unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].properties["type"], Value::from("Abstract"));
        assert_eq!(gw.store().stats().unwrap().nodes, 2);
    }

    #[test]
    fn test_untitled_record_leaves_placeholder_queue() {
        let gw = gateway();
        gw.merge_complete(&entry("5", Role::Reference, "  ")).unwrap();
        assert!(gw.is_complete(&publication_identity("5")).unwrap());
        let props = gw.store().node_properties(&publication_identity("5")).unwrap().unwrap();
        assert_eq!(props[MARKER_PROPERTY], Value::from(UNTITLED));
    }

    #[test]
    fn test_pending_expansion_and_flag() {
        let gw = gateway();
        gw.merge_complete(&entry("1", Role::PubMed, "A")).unwrap();
        gw.merge_complete(&entry("2", Role::Reference, "B")).unwrap();
        assert_eq!(gw.find_pending_expansion_ids().unwrap(), vec!["1"]);
        assert!(!gw.references_loaded("1").unwrap());

        gw.mark_references_loaded("1").unwrap();
        assert!(gw.references_loaded("1").unwrap());
        assert!(gw.find_pending_expansion_ids().unwrap().is_empty());
        // The flag does not disturb completeness or other properties.
        assert!(gw.is_complete(&publication_identity("1")).unwrap());
    }

    #[test]
    fn test_parent_links() {
        let gw = gateway();
        let parent = go_term(&gw);
        gw.create_placeholder(&seed_edge(&parent, "100", Role::PubMed)).unwrap();
        let links = gw.parent_links("100").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].rel_type, HAS_PUBLICATION);
        assert!(links[0].parent.same_node(&parent));
    }
}
