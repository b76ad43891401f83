use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: u32 = 1;

pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    Ok(())
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS nodes (
            node_id       INTEGER PRIMARY KEY,
            primary_label TEXT NOT NULL,
            id_property   TEXT NOT NULL,
            id_value      TEXT NOT NULL,
            properties    TEXT NOT NULL DEFAULT '{}',
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            UNIQUE (primary_label, id_property, id_value)
        );

        CREATE TABLE IF NOT EXISTS node_labels (
            node_id INTEGER NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
            label   TEXT NOT NULL,
            PRIMARY KEY (node_id, label)
        );

        CREATE TABLE IF NOT EXISTS relationships (
            parent_id  INTEGER NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
            child_id   INTEGER NOT NULL REFERENCES nodes(node_id) ON DELETE CASCADE,
            rel_type   TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            PRIMARY KEY (parent_id, child_id, rel_type)
        );
        ",
    )?;
    Ok(())
}

pub fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_node_labels_label ON node_labels(label);
        CREATE INDEX IF NOT EXISTS idx_relationships_child ON relationships(child_id, rel_type);
        ",
    )?;
    Ok(())
}

pub fn record_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![SCHEMA_VERSION, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    create_tables(conn)?;
    create_indexes(conn)?;
    record_version(conn)?;
    Ok(())
}
