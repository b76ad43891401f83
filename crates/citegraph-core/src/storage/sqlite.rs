use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::schema::{apply_pragmas, init_schema};
use super::{
    validate_identity, validate_name, GraphStats, GraphStore, MergeMode, NodePredicate, Properties,
    Relationship,
};
use crate::error::Result;
use crate::models::NodeIdentity;

const IDENTITY_MATCH: &str = "primary_label = ?1 AND id_property = ?2 AND id_value = ?3";

/// SQLite-backed property graph.
///
/// Nodes are unique on (primary label, id property, id value); relationships
/// are unique on (parent, child, type). Those constraints are what make every
/// merge idempotent, including across concurrent writers. Thread-safe via an
/// internal mutex on the connection.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
    path: Option<String>,
}

impl SqliteGraphStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string_lossy().to_string()),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn node_id(conn: &Connection, identity: &NodeIdentity) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            &format!("SELECT node_id FROM nodes WHERE {IDENTITY_MATCH}"),
            params![identity.primary_label, identity.id_property, identity.id_value],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn json_path(property: &str) -> Result<String> {
    validate_name(property)?;
    Ok(format!("$.{property}"))
}

fn parse_properties(raw: &str) -> Result<Properties> {
    Ok(serde_json::from_str(raw)?)
}

impl GraphStore for SqliteGraphStore {
    fn node_exists(&self, identity: &NodeIdentity) -> Result<bool> {
        let conn = self.conn();
        Ok(node_id(&conn, identity)?.is_some())
    }

    fn has_label(&self, identity: &NodeIdentity, label: &str) -> Result<bool> {
        let conn = self.conn();
        let found: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM node_labels l JOIN nodes n ON n.node_id = l.node_id
                WHERE n.primary_label = ?1 AND n.id_property = ?2 AND n.id_value = ?3
                  AND l.label = ?4)",
            params![
                identity.primary_label,
                identity.id_property,
                identity.id_value,
                label
            ],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn merge_node(
        &self,
        identity: &NodeIdentity,
        properties: &Properties,
        mode: MergeMode,
    ) -> Result<bool> {
        validate_identity(identity)?;
        let props = serde_json::to_string(properties)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let created = tx.execute(
            "INSERT INTO nodes (primary_label, id_property, id_value, properties, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (primary_label, id_property, id_value) DO NOTHING",
            params![
                identity.primary_label,
                identity.id_property,
                identity.id_value,
                props,
                now
            ],
        )? == 1;

        if !created && mode == MergeMode::Always && !properties.is_empty() {
            tx.execute(
                &format!(
                    "UPDATE nodes SET properties = json_patch(properties, ?4), updated_at = ?5
                     WHERE {IDENTITY_MATCH}"
                ),
                params![
                    identity.primary_label,
                    identity.id_property,
                    identity.id_value,
                    props,
                    now
                ],
            )?;
        }

        // The primary label is also a label, so label predicates see it.
        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO node_labels (node_id, label)
                 SELECT node_id, ?1 FROM nodes WHERE {IDENTITY_MATCH}"
            ),
            params![identity.primary_label, identity.id_property, identity.id_value],
        )?;
        tx.commit()?;
        Ok(created)
    }

    fn add_label(&self, identity: &NodeIdentity, label: &str) -> Result<bool> {
        validate_name(label)?;
        let conn = self.conn();
        let added = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO node_labels (node_id, label)
                 SELECT node_id, ?4 FROM nodes WHERE {IDENTITY_MATCH}"
            ),
            params![
                identity.primary_label,
                identity.id_property,
                identity.id_value,
                label
            ],
        )?;
        Ok(added == 1)
    }

    fn delete_node(&self, identity: &NodeIdentity) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn.execute(
            &format!("DELETE FROM nodes WHERE {IDENTITY_MATCH}"),
            params![identity.primary_label, identity.id_property, identity.id_value],
        )?;
        Ok(deleted > 0)
    }

    fn node_properties(&self, identity: &NodeIdentity) -> Result<Option<Properties>> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT properties FROM nodes WHERE {IDENTITY_MATCH}"),
                params![identity.primary_label, identity.id_property, identity.id_value],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| parse_properties(&raw)).transpose()
    }

    fn labels(&self, identity: &NodeIdentity) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT l.label FROM node_labels l JOIN nodes n ON n.node_id = l.node_id
             WHERE n.primary_label = ?1 AND n.id_property = ?2 AND n.id_value = ?3
             ORDER BY l.label",
        )?;
        let rows = stmt.query_map(
            params![identity.primary_label, identity.id_property, identity.id_value],
            |row| row.get::<_, String>(0),
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_by_predicate(&self, predicate: &NodePredicate) -> Result<Vec<NodeIdentity>> {
        let conn = self.conn();
        let map_identity = |row: &rusqlite::Row<'_>| -> rusqlite::Result<NodeIdentity> {
            Ok(NodeIdentity::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        };
        const HAS_LABEL: &str = "EXISTS (SELECT 1 FROM node_labels l
                                   WHERE l.node_id = n.node_id AND l.label = ?1)";

        let identities = match predicate {
            NodePredicate::HasLabel(label) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT n.primary_label, n.id_property, n.id_value FROM nodes n
                     WHERE {HAS_LABEL} ORDER BY n.node_id"
                ))?;
                let rows = stmt.query_map(params![label], map_identity)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            NodePredicate::BlankProperty { label, property } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT n.primary_label, n.id_property, n.id_value FROM nodes n
                     WHERE {HAS_LABEL}
                       AND TRIM(COALESCE(json_extract(n.properties, ?2), '')) = ''
                     ORDER BY n.node_id"
                ))?;
                let rows = stmt.query_map(params![label, json_path(property)?], map_identity)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            NodePredicate::PendingExpansion {
                label,
                marker,
                flag,
            } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT n.primary_label, n.id_property, n.id_value FROM nodes n
                     WHERE {HAS_LABEL}
                       AND TRIM(COALESCE(json_extract(n.properties, ?2), '')) <> ''
                       AND IFNULL(json_extract(n.properties, ?3), 0) = 0
                     ORDER BY n.node_id"
                ))?;
                let rows = stmt.query_map(
                    params![label, json_path(marker)?, json_path(flag)?],
                    map_identity,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(identities)
    }

    fn merge_relationship(
        &self,
        parent: &NodeIdentity,
        child: &NodeIdentity,
        rel_type: &str,
        properties: &Properties,
    ) -> Result<bool> {
        validate_name(rel_type)?;
        let props = serde_json::to_string(properties)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let (Some(parent_id), Some(child_id)) = (node_id(&tx, parent)?, node_id(&tx, child)?)
        else {
            tracing::debug!(%parent, %child, rel_type, "relationship endpoint missing");
            return Ok(false);
        };

        let created = tx.execute(
            "INSERT INTO relationships (parent_id, child_id, rel_type, properties, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (parent_id, child_id, rel_type) DO NOTHING",
            params![parent_id, child_id, rel_type, props, Utc::now().to_rfc3339()],
        )? == 1;

        if !created && !properties.is_empty() {
            tx.execute(
                "UPDATE relationships SET properties = json_patch(properties, ?4)
                 WHERE parent_id = ?1 AND child_id = ?2 AND rel_type = ?3",
                params![parent_id, child_id, rel_type, props],
            )?;
        }
        tx.commit()?;
        Ok(created)
    }

    fn relationships_from(
        &self,
        parent: &NodeIdentity,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        self.relationships_where("p", parent, rel_type)
    }

    fn relationships_to(
        &self,
        child: &NodeIdentity,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        self.relationships_where("c", child, rel_type)
    }

    fn stats(&self) -> Result<GraphStats> {
        let conn = self.conn();
        let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        let relationships: i64 =
            conn.query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT label, COUNT(*) FROM node_labels GROUP BY label ORDER BY label",
        )?;
        let labels = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(GraphStats {
            nodes: nodes as u64,
            relationships: relationships as u64,
            labels,
        })
    }
}

impl SqliteGraphStore {
    /// `side` is the table alias (`p` or `c`) the identity is matched against.
    fn relationships_where(
        &self,
        side: &str,
        identity: &NodeIdentity,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT p.primary_label, p.id_property, p.id_value,
                    c.primary_label, c.id_property, c.id_value,
                    r.rel_type, r.properties
             FROM relationships r
             JOIN nodes p ON p.node_id = r.parent_id
             JOIN nodes c ON c.node_id = r.child_id
             WHERE {side}.primary_label = ?1 AND {side}.id_property = ?2 AND {side}.id_value = ?3
               AND (?4 IS NULL OR r.rel_type = ?4)
             ORDER BY r.rowid"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    identity.primary_label,
                    identity.id_property,
                    identity.id_value,
                    rel_type
                ],
                |row| {
                    Ok((
                        NodeIdentity::new(
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ),
                        NodeIdentity::new(
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ),
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(parent, child, rel_type, props)| {
                Ok(Relationship {
                    parent,
                    child,
                    rel_type,
                    properties: parse_properties(&props)?,
                })
            })
            .collect()
    }
}
