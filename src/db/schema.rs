use anyhow::Result;
use rusqlite::Connection;
use std::time::Duration;

/// Applied to every connection, including pooled ones.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode answers with the resulting mode ("memory" for in-memory databases)
    let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS photos (
  id INTEGER PRIMARY KEY,
  filepath TEXT NOT NULL UNIQUE,
  scanned_for_faces INTEGER NOT NULL DEFAULT 0,
  is_hidden INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS people (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS faces (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  photo_id INTEGER NOT NULL,
  embedding_blob BLOB NOT NULL,
  bbox_json TEXT NOT NULL,
  confidence REAL NOT NULL DEFAULT 0,
  person_id INTEGER,
  is_deleted INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY(photo_id) REFERENCES photos(id) ON DELETE CASCADE,
  FOREIGN KEY(person_id) REFERENCES people(id) ON DELETE SET NULL,
  CHECK (is_deleted = 0 OR person_id IS NULL)
);
    "#,
    )?;

    // Databases created before hiding existed lack the column.
    if !has_column(conn, "photos", "is_hidden")? {
        conn.execute("ALTER TABLE photos ADD COLUMN is_hidden INTEGER NOT NULL DEFAULT 0", [])?;
    }
    if !has_column(conn, "faces", "confidence")? {
        conn.execute("ALTER TABLE faces ADD COLUMN confidence REAL NOT NULL DEFAULT 0", [])?;
    }
    // Face ids key the crop cache, so a deleted face's id must never be handed out again.
    if !uses_autoincrement(conn, "faces")? {
        rebuild_faces_with_autoincrement(conn)?;
    }
    conn.execute_batch(
        r#"
CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);
CREATE INDEX IF NOT EXISTS idx_faces_unknown ON faces(person_id, is_deleted);
CREATE INDEX IF NOT EXISTS idx_photos_unscanned ON photos(scanned_for_faces, is_hidden);
    "#,
    )?;

    Ok(())
}

fn uses_autoincrement(conn: &Connection, table: &str) -> Result<bool> {
    let sql: String = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(sql.to_ascii_uppercase().contains("AUTOINCREMENT"))
}

fn rebuild_faces_with_autoincrement(conn: &Connection) -> Result<()> {
    tracing::info!("Migrating faces table to non-reusable ids");
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        r#"
CREATE TABLE faces_new (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  photo_id INTEGER NOT NULL,
  embedding_blob BLOB NOT NULL,
  bbox_json TEXT NOT NULL,
  confidence REAL NOT NULL DEFAULT 0,
  person_id INTEGER,
  is_deleted INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY(photo_id) REFERENCES photos(id) ON DELETE CASCADE,
  FOREIGN KEY(person_id) REFERENCES people(id) ON DELETE SET NULL,
  CHECK (is_deleted = 0 OR person_id IS NULL)
);
INSERT INTO faces_new (id, photo_id, embedding_blob, bbox_json, confidence, person_id, is_deleted)
  SELECT id, photo_id, embedding_blob, bbox_json, confidence, person_id, is_deleted FROM faces;
DROP TABLE faces;
ALTER TABLE faces_new RENAME TO faces;
    "#,
    )?;
    tx.commit()?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in rows {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}
