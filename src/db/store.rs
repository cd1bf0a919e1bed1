use crate::db::{query, writer, DbPool, PooledConn};
use crate::error::{FaceError, Result};
use crate::models::face::{
    BoundingBox, Face, FaceId, PendingPhoto, Person, PersonChoice, PersonId, Photo, PhotoId,
};

/// Durable storage for photos, faces and people. Every call is atomic on its
/// own; `confirm_faces` and `soft_delete_faces` are atomic across all ids.
pub trait FaceStore: Send + Sync {
    fn unscanned_photos(&self) -> Result<Vec<PendingPhoto>>;
    fn mark_scanned(&self, photo_id: PhotoId) -> Result<()>;
    fn add_face(&self, photo_id: PhotoId, embedding: &[f32], bbox: &BoundingBox, confidence: f32) -> Result<FaceId>;
    /// Removes faces an interrupted pass left on a still-unscanned photo and
    /// returns their ids.
    fn discard_partial_faces(&self, photo_id: PhotoId) -> Result<Vec<FaceId>>;

    fn face(&self, face_id: FaceId) -> Result<Option<Face>>;
    fn unknown_faces(&self) -> Result<Vec<Face>>;
    fn encodings_for_clustering(&self) -> Result<Vec<(FaceId, Vec<f32>)>>;
    fn faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>>;
    fn deleted_faces(&self) -> Result<Vec<Face>>;
    fn live_face_ids(&self) -> Result<Vec<FaceId>>;

    fn link_face_to_person(&self, face_id: FaceId, person_id: PersonId) -> Result<()>;
    fn soft_delete(&self, face_id: FaceId) -> Result<()>;
    fn restore(&self, face_id: FaceId) -> Result<()>;
    fn confirm_faces(&self, face_ids: &[FaceId], choice: &PersonChoice) -> Result<PersonId>;
    fn soft_delete_faces(&self, face_ids: &[FaceId]) -> Result<()>;

    fn add_person(&self, name: &str) -> Result<PersonId>;
    fn people(&self) -> Result<Vec<Person>>;
    fn person_by_name(&self, name: &str) -> Result<Option<Person>>;
    fn rename_person(&self, person_id: PersonId, name: &str) -> Result<PersonId>;
    fn delete_person(&self, person_id: PersonId) -> Result<()>;
}

fn normalize_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FaceError::EmptyName);
    }
    Ok(name)
}

#[derive(Clone)]
pub struct SqliteFaceStore {
    pool: DbPool,
}

impl SqliteFaceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get()?)
    }

    pub fn upsert_photos<S: AsRef<str>>(&self, filepaths: &[S]) -> Result<Vec<PhotoId>> {
        Ok(writer::upsert_photos(&*self.conn()?, filepaths)?)
    }

    pub fn photo_by_path(&self, filepath: &str) -> Result<Option<Photo>> {
        Ok(query::photo_by_path(&*self.conn()?, filepath)?)
    }

    pub fn hide_photo(&self, photo_id: PhotoId) -> Result<bool> {
        Ok(writer::set_photo_hidden(&*self.conn()?, photo_id, true)?)
    }

    pub fn unhide_photo(&self, photo_id: PhotoId) -> Result<bool> {
        Ok(writer::set_photo_hidden(&*self.conn()?, photo_id, false)?)
    }

    pub fn hidden_photos(&self) -> Result<Vec<Photo>> {
        Ok(query::hidden_photos(&*self.conn()?)?)
    }

    /// Removes the photo and, through the cascade, its faces. Returns the ids
    /// of the removed faces.
    pub fn delete_photo_permanently(&self, photo_id: PhotoId) -> Result<Vec<FaceId>> {
        Ok(writer::delete_photo(&*self.conn()?, photo_id)?)
    }
}

impl FaceStore for SqliteFaceStore {
    fn unscanned_photos(&self) -> Result<Vec<PendingPhoto>> {
        Ok(query::unscanned_photos(&*self.conn()?)?)
    }

    fn mark_scanned(&self, photo_id: PhotoId) -> Result<()> {
        writer::mark_scanned(&*self.conn()?, photo_id)?;
        Ok(())
    }

    fn add_face(&self, photo_id: PhotoId, embedding: &[f32], bbox: &BoundingBox, confidence: f32) -> Result<FaceId> {
        Ok(writer::insert_face(&*self.conn()?, photo_id, embedding, bbox, confidence)?)
    }

    fn discard_partial_faces(&self, photo_id: PhotoId) -> Result<Vec<FaceId>> {
        Ok(writer::delete_partial_faces(&*self.conn()?, photo_id)?)
    }

    fn face(&self, face_id: FaceId) -> Result<Option<Face>> {
        Ok(query::get_face(&*self.conn()?, face_id)?)
    }

    fn unknown_faces(&self) -> Result<Vec<Face>> {
        Ok(query::unknown_faces(&*self.conn()?)?)
    }

    fn encodings_for_clustering(&self) -> Result<Vec<(FaceId, Vec<f32>)>> {
        Ok(query::encodings_for_clustering(&*self.conn()?)?)
    }

    fn faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>> {
        Ok(query::faces_for_person(&*self.conn()?, person_id)?)
    }

    fn deleted_faces(&self) -> Result<Vec<Face>> {
        Ok(query::deleted_faces(&*self.conn()?)?)
    }

    fn live_face_ids(&self) -> Result<Vec<FaceId>> {
        Ok(query::live_face_ids(&*self.conn()?)?)
    }

    fn link_face_to_person(&self, face_id: FaceId, person_id: PersonId) -> Result<()> {
        let conn = self.conn()?;
        if !query::person_exists(&conn, person_id)? {
            return Err(FaceError::PersonNotFound(person_id));
        }
        if !writer::link_face_to_person(&conn, face_id, person_id)? {
            return Err(FaceError::FaceNotFound(face_id));
        }
        Ok(())
    }

    fn soft_delete(&self, face_id: FaceId) -> Result<()> {
        if !writer::soft_delete_face(&*self.conn()?, face_id)? {
            return Err(FaceError::FaceNotFound(face_id));
        }
        Ok(())
    }

    fn restore(&self, face_id: FaceId) -> Result<()> {
        if !writer::restore_face(&*self.conn()?, face_id)? {
            return Err(FaceError::FaceNotFound(face_id));
        }
        Ok(())
    }

    fn confirm_faces(&self, face_ids: &[FaceId], choice: &PersonChoice) -> Result<PersonId> {
        let mut conn = self.conn()?;
        // Dropping the transaction on any early return rolls back, including a
        // person created for this confirmation.
        let tx = conn.transaction()?;
        let person_id = match choice {
            PersonChoice::New(name) => writer::create_or_get_person(&tx, normalize_name(name)?)?,
            PersonChoice::Existing(id) => {
                if !query::person_exists(&tx, *id)? {
                    return Err(FaceError::PersonNotFound(*id));
                }
                *id
            }
        };
        for &face_id in face_ids {
            if !writer::link_face_to_person(&tx, face_id, person_id)? {
                return Err(FaceError::FaceNotFound(face_id));
            }
        }
        tx.commit()?;
        tracing::debug!("Confirmed {} faces as person {}", face_ids.len(), person_id);
        Ok(person_id)
    }

    fn soft_delete_faces(&self, face_ids: &[FaceId]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for &face_id in face_ids {
            if !writer::soft_delete_face(&tx, face_id)? {
                return Err(FaceError::FaceNotFound(face_id));
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn add_person(&self, name: &str) -> Result<PersonId> {
        let name = normalize_name(name)?;
        Ok(writer::create_or_get_person(&*self.conn()?, name)?)
    }

    fn people(&self) -> Result<Vec<Person>> {
        Ok(query::list_people(&*self.conn()?)?)
    }

    fn person_by_name(&self, name: &str) -> Result<Option<Person>> {
        Ok(query::person_by_name(&*self.conn()?, name.trim())?)
    }

    fn rename_person(&self, person_id: PersonId, name: &str) -> Result<PersonId> {
        let name = normalize_name(name)?;
        writer::rename_person(&*self.conn()?, person_id, name)?.ok_or(FaceError::PersonNotFound(person_id))
    }

    fn delete_person(&self, person_id: PersonId) -> Result<()> {
        if !writer::delete_person(&*self.conn()?, person_id)? {
            return Err(FaceError::PersonNotFound(person_id));
        }
        Ok(())
    }
}
