use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::face::{BoundingBox, FaceId, PersonId, PhotoId};

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

// Photo catalog

pub fn upsert_photo(conn: &Connection, filepath: &str) -> Result<PhotoId> {
    conn.execute(
        "INSERT INTO photos (filepath) VALUES (?1) ON CONFLICT(filepath) DO NOTHING",
        params![filepath],
    )?;
    let id = conn.query_row(
        "SELECT id FROM photos WHERE filepath = ?1",
        params![filepath],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Registers every path in one transaction. Existing rows keep their scan state.
pub fn upsert_photos<S: AsRef<str>>(conn: &Connection, filepaths: &[S]) -> Result<Vec<PhotoId>> {
    let tx = conn.unchecked_transaction()?;
    let mut ids = Vec::with_capacity(filepaths.len());
    for path in filepaths {
        ids.push(upsert_photo(&tx, path.as_ref())?);
    }
    tx.commit()?;
    Ok(ids)
}

pub fn mark_scanned(conn: &Connection, photo_id: PhotoId) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE photos SET scanned_for_faces = 1 WHERE id = ?1",
        params![photo_id],
    )?;
    Ok(updated > 0)
}

pub fn set_photo_hidden(conn: &Connection, photo_id: PhotoId, hidden: bool) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE photos SET is_hidden = ?1 WHERE id = ?2",
        params![hidden as i64, photo_id],
    )?;
    Ok(updated > 0)
}

/// Hard-deletes a photo. Its faces go with it through the cascade; the ids of
/// those faces are returned so derived files can be cleaned up.
pub fn delete_photo(conn: &Connection, photo_id: PhotoId) -> Result<Vec<FaceId>> {
    let tx = conn.unchecked_transaction()?;
    let face_ids: Vec<FaceId> = {
        let mut stmt = tx.prepare("SELECT id FROM faces WHERE photo_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![photo_id], |row| row.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    tx.execute("DELETE FROM photos WHERE id = ?1", params![photo_id])?;
    tx.commit()?;
    Ok(face_ids)
}

// Faces

pub fn insert_face(
    conn: &Connection,
    photo_id: PhotoId,
    embedding: &[f32],
    bbox: &BoundingBox,
    confidence: f32,
) -> Result<FaceId> {
    let blob = encode_embedding(embedding);
    let bbox_json = serde_json::to_string(bbox).context("Failed to serialize bounding box")?;
    conn.execute(
        "INSERT INTO faces (photo_id, embedding_blob, bbox_json, confidence) VALUES (?1, ?2, ?3, ?4)",
        params![photo_id, blob, bbox_json, confidence as f64],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Removes faces left behind by an interrupted pass. Faces of a photo that was
/// already marked scanned are never touched.
pub fn delete_partial_faces(conn: &Connection, photo_id: PhotoId) -> Result<Vec<FaceId>> {
    let tx = conn.unchecked_transaction()?;
    let face_ids: Vec<FaceId> = {
        let mut stmt = tx.prepare(
            "SELECT f.id FROM faces f JOIN photos p ON p.id = f.photo_id
              WHERE f.photo_id = ?1 AND p.scanned_for_faces = 0 ORDER BY f.id",
        )?;
        let rows = stmt.query_map(params![photo_id], |row| row.get::<_, i64>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    if !face_ids.is_empty() {
        tx.execute("DELETE FROM faces WHERE photo_id = ?1", params![photo_id])?;
    }
    tx.commit()?;
    Ok(face_ids)
}

/// Assigns a face to a person and brings it back from the trash if needed.
pub fn link_face_to_person(conn: &Connection, face_id: FaceId, person_id: PersonId) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE faces SET person_id = ?1, is_deleted = 0 WHERE id = ?2",
        params![person_id, face_id],
    )?;
    Ok(updated > 0)
}

pub fn soft_delete_face(conn: &Connection, face_id: FaceId) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE faces SET is_deleted = 1, person_id = NULL WHERE id = ?1",
        params![face_id],
    )?;
    Ok(updated > 0)
}

/// Restored faces return to the unknown pool.
pub fn restore_face(conn: &Connection, face_id: FaceId) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE faces SET is_deleted = 0 WHERE id = ?1",
        params![face_id],
    )?;
    Ok(updated > 0)
}

// People

/// Create-or-get by exact name. `name` is expected to be trimmed already.
pub fn create_or_get_person(conn: &Connection, name: &str) -> Result<PersonId> {
    let created_at = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO people (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![name, created_at],
    )?;
    let id = conn.query_row("SELECT id FROM people WHERE name = ?1", params![name], |row| row.get(0))?;
    Ok(id)
}

/// Renames a person. When another person already carries `name`, the faces
/// of `person_id` move over to that person and `person_id` is removed. Returns
/// the id that now carries the name.
pub fn rename_person(conn: &Connection, person_id: PersonId, name: &str) -> Result<Option<PersonId>> {
    let tx = conn.unchecked_transaction()?;

    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM people WHERE id = ?1)",
        params![person_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(None);
    }

    let holder: Option<PersonId> = tx
        .query_row("SELECT id FROM people WHERE name = ?1", params![name], |row| row.get(0))
        .optional()?;

    let result = match holder {
        Some(target) if target != person_id => {
            let moved = tx.execute(
                "UPDATE faces SET person_id = ?1 WHERE person_id = ?2",
                params![target, person_id],
            )?;
            tx.execute("DELETE FROM people WHERE id = ?1", params![person_id])?;
            tracing::info!("Merged person {} into {} ({} faces moved)", person_id, target, moved);
            target
        }
        Some(_) => person_id,
        None => {
            tx.execute("UPDATE people SET name = ?1 WHERE id = ?2", params![name, person_id])?;
            person_id
        }
    };

    tx.commit()?;
    Ok(Some(result))
}

pub fn delete_person(conn: &Connection, person_id: PersonId) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    // Faces return to the unknown pool rather than relying on ON DELETE SET NULL,
    // which older databases created without foreign keys do not carry.
    tx.execute(
        "UPDATE faces SET person_id = NULL WHERE person_id = ?1",
        params![person_id],
    )?;
    let deleted = tx.execute("DELETE FROM people WHERE id = ?1", params![person_id])?;
    tx.commit()?;
    Ok(deleted > 0)
}
