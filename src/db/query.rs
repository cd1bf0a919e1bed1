use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::face::{
    BoundingBox, Face, FaceId, FaceState, PendingPhoto, Person, PersonId, Photo, PhotoId,
};

const FACE_SELECT: &str = "SELECT f.id, f.photo_id, p.filepath, f.embedding_blob, f.bbox_json, f.confidence, f.person_id, f.is_deleted
     FROM faces f JOIN photos p ON p.id = f.photo_id";

struct FaceRow {
    id: FaceId,
    photo_id: PhotoId,
    photo_path: String,
    embedding_blob: Vec<u8>,
    bbox_json: String,
    confidence: f64,
    person_id: Option<PersonId>,
    is_deleted: bool,
}

fn read_face_row(row: &Row<'_>) -> rusqlite::Result<FaceRow> {
    Ok(FaceRow {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        photo_path: row.get(2)?,
        embedding_blob: row.get(3)?,
        bbox_json: row.get(4)?,
        confidence: row.get(5)?,
        person_id: row.get(6)?,
        is_deleted: row.get::<_, i64>(7)? != 0,
    })
}

impl FaceRow {
    fn into_face(self) -> Result<Face> {
        let embedding = decode_embedding_blob(&self.embedding_blob)
            .with_context(|| format!("Corrupt embedding for face {}", self.id))?;
        let bbox: BoundingBox = serde_json::from_str(&self.bbox_json)
            .with_context(|| format!("Corrupt bounding box for face {}", self.id))?;
        Ok(Face {
            id: self.id,
            photo_id: self.photo_id,
            photo_path: self.photo_path,
            embedding,
            bbox,
            confidence: self.confidence as f32,
            state: FaceState::from_columns(self.person_id, self.is_deleted),
        })
    }
}

fn collect_faces(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Face>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, read_face_row)?;
    let mut out = Vec::new();
    for row in rows {
        let row = row?;
        let id = row.id;
        match row.into_face() {
            Ok(face) => out.push(face),
            Err(e) => {
                tracing::warn!("Skipping face {}: {:#}", id, e);
                continue;
            }
        }
    }
    Ok(out)
}

pub fn decode_embedding_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        anyhow::bail!("Embedding blob length is not a multiple of 4");
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

// Photos

pub fn unscanned_photos(conn: &Connection) -> Result<Vec<PendingPhoto>> {
    let mut stmt = conn.prepare(
        "SELECT id, filepath FROM photos WHERE scanned_for_faces = 0 AND is_hidden = 0 ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(PendingPhoto { id: row.get(0)?, filepath: row.get(1)? })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get("id")?,
        filepath: row.get("filepath")?,
        scanned_for_faces: row.get::<_, i64>("scanned_for_faces")? != 0,
        is_hidden: row.get::<_, i64>("is_hidden")? != 0,
    })
}

pub fn photo_by_path(conn: &Connection, filepath: &str) -> Result<Option<Photo>> {
    let photo = conn
        .query_row(
            "SELECT id, filepath, scanned_for_faces, is_hidden FROM photos WHERE filepath = ?1",
            params![filepath],
            row_to_photo,
        )
        .optional()?;
    Ok(photo)
}

pub fn hidden_photos(conn: &Connection) -> Result<Vec<Photo>> {
    let mut stmt = conn.prepare(
        "SELECT id, filepath, scanned_for_faces, is_hidden FROM photos WHERE is_hidden = 1 ORDER BY filepath",
    )?;
    let rows = stmt.query_map([], row_to_photo)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// Faces

pub fn get_face(conn: &Connection, face_id: FaceId) -> Result<Option<Face>> {
    let row = conn
        .query_row(&format!("{} WHERE f.id = ?1", FACE_SELECT), params![face_id], read_face_row)
        .optional()?;
    row.map(FaceRow::into_face).transpose()
}

/// Faces nobody has named yet, excluding trashed faces and hidden photos.
pub fn unknown_faces(conn: &Connection) -> Result<Vec<Face>> {
    collect_faces(
        conn,
        &format!(
            "{} WHERE f.person_id IS NULL AND f.is_deleted = 0 AND p.is_hidden = 0 ORDER BY f.id",
            FACE_SELECT
        ),
        [],
    )
}

pub fn deleted_faces(conn: &Connection) -> Result<Vec<Face>> {
    collect_faces(
        conn,
        &format!("{} WHERE f.is_deleted = 1 AND p.is_hidden = 0 ORDER BY f.id", FACE_SELECT),
        [],
    )
}

pub fn faces_for_person(conn: &Connection, person_id: PersonId) -> Result<Vec<Face>> {
    collect_faces(
        conn,
        &format!(
            "{} WHERE f.person_id = ?1 AND f.is_deleted = 0 AND p.is_hidden = 0 ORDER BY f.id",
            FACE_SELECT
        ),
        params![person_id],
    )
}

/// Unassigned, non-deleted embeddings. Photo visibility does not matter here.
pub fn encodings_for_clustering(conn: &Connection) -> Result<Vec<(FaceId, Vec<f32>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, embedding_blob FROM faces WHERE person_id IS NULL AND is_deleted = 0 ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?;
    let mut out = Vec::new();
    for row in rows {
        let (id, blob) = row?;
        match decode_embedding_blob(&blob) {
            Ok(embedding) => out.push((id, embedding)),
            Err(e) => {
                tracing::warn!("Failed to decode embedding for face {}: {}", id, e);
                continue;
            }
        }
    }
    Ok(out)
}

pub fn live_face_ids(conn: &Connection) -> Result<Vec<FaceId>> {
    let mut stmt = conn.prepare("SELECT id FROM faces ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// People

pub fn person_exists(conn: &Connection, person_id: PersonId) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM people WHERE id = ?1)",
        params![person_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

const PERSON_SELECT: &str = "SELECT pe.id, pe.name,
        (SELECT COUNT(*) FROM faces f WHERE f.person_id = pe.id AND f.is_deleted = 0) AS face_count
     FROM people pe";

fn row_to_person(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person { id: row.get(0)?, name: row.get(1)?, face_count: row.get(2)? })
}

pub fn list_people(conn: &Connection) -> Result<Vec<Person>> {
    let mut stmt = conn.prepare(&format!("{} ORDER BY pe.name COLLATE NOCASE, pe.id", PERSON_SELECT))?;
    let rows = stmt.query_map([], row_to_person)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn person_by_name(conn: &Connection, name: &str) -> Result<Option<Person>> {
    let person = conn
        .query_row(&format!("{} WHERE pe.name = ?1", PERSON_SELECT), params![name], row_to_person)
        .optional()?;
    Ok(person)
}
