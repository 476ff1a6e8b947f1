use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use timesift_core::ids::{CommentId, EventRowId, SearchIndexId, SketchId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Relational anchor for one search-index document within a sketch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: EventRowId,
    pub sketch_id: SketchId,
    pub searchindex_id: SearchIndexId,
    pub document_id: String,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: CommentId,
    pub event_id: EventRowId,
    pub user_id: Option<UserId>,
    pub comment: String,
    pub created_at: String,
}

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the event row for a document, creating it on first use.
    #[instrument(skip(self), fields(sketch_id = %sketch_id, searchindex_id = %searchindex_id))]
    pub fn get_or_create(
        &self,
        sketch_id: SketchId,
        searchindex_id: SearchIndexId,
        document_id: &str,
    ) -> Result<EventRow, StoreError> {
        self.db
            .with_transaction(|conn| get_or_create_in(conn, sketch_id, searchindex_id, document_id))
    }

    #[instrument(skip(self))]
    pub fn find(
        &self,
        sketch_id: SketchId,
        searchindex_id: SearchIndexId,
        document_id: &str,
    ) -> Result<Option<EventRow>, StoreError> {
        self.db.with_conn(|conn| find_in(conn, sketch_id, searchindex_id, document_id))
    }
}

fn find_in(
    conn: &Connection,
    sketch_id: SketchId,
    searchindex_id: SearchIndexId,
    document_id: &str,
) -> Result<Option<EventRow>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, created_at FROM events
             WHERE sketch_id = ?1 AND searchindex_id = ?2 AND document_id = ?3",
            rusqlite::params![sketch_id.get(), searchindex_id.get(), document_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    Ok(row.map(|(id, created_at)| EventRow {
        id: EventRowId::from_raw(id),
        sketch_id,
        searchindex_id,
        document_id: document_id.to_string(),
        created_at,
    }))
}

fn get_or_create_in(
    conn: &Connection,
    sketch_id: SketchId,
    searchindex_id: SearchIndexId,
    document_id: &str,
) -> Result<EventRow, StoreError> {
    if let Some(existing) = find_in(conn, sketch_id, searchindex_id, document_id)? {
        return Ok(existing);
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO events (sketch_id, searchindex_id, document_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![sketch_id.get(), searchindex_id.get(), document_id, now],
    )?;
    Ok(EventRow {
        id: EventRowId::from_raw(conn.last_insert_rowid()),
        sketch_id,
        searchindex_id,
        document_id: document_id.to_string(),
        created_at: now,
    })
}

pub struct CommentRepo {
    db: Database,
}

impl CommentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Attach a comment to a document, creating its event row if needed.
    /// Both writes commit together.
    #[instrument(skip(self, comment), fields(sketch_id = %sketch_id))]
    pub fn add_to_document(
        &self,
        sketch_id: SketchId,
        searchindex_id: SearchIndexId,
        document_id: &str,
        user_id: Option<UserId>,
        comment: &str,
    ) -> Result<CommentRow, StoreError> {
        self.db.with_transaction(|conn| {
            let event = get_or_create_in(conn, sketch_id, searchindex_id, document_id)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO comments (event_id, user_id, comment, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![event.id.get(), user_id.map(UserId::get), comment, now],
            )?;
            Ok(CommentRow {
                id: CommentId::from_raw(conn.last_insert_rowid()),
                event_id: event.id,
                user_id,
                comment: comment.to_string(),
                created_at: now,
            })
        })
    }

    /// Comments of an event row, oldest first.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub fn list(&self, event_id: EventRowId) -> Result<Vec<CommentRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_id, user_id, comment, created_at
                 FROM comments WHERE event_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([event_id.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(CommentRow {
                    id: CommentId::from_raw(row_helpers::get(row, 0, "comments", "id")?),
                    event_id: EventRowId::from_raw(row_helpers::get(row, 1, "comments", "event_id")?),
                    user_id: row_helpers::get_opt::<i64>(row, 2, "comments", "user_id")?
                        .map(UserId::from_raw),
                    comment: row_helpers::get(row, 3, "comments", "comment")?,
                    created_at: row_helpers::get(row, 4, "comments", "created_at")?,
                });
            }
            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketches::{SearchIndexRepo, SketchRepo};

    fn setup() -> (Database, SketchId, SearchIndexId) {
        let db = Database::in_memory().unwrap();
        let sketch = SketchRepo::new(db.clone()).create("s", "").unwrap();
        let index = SearchIndexRepo::new(db.clone()).create("i", "ts_i").unwrap();
        (db, sketch.id, index.id)
    }

    #[test]
    fn get_or_create_is_stable() {
        let (db, sketch_id, index_id) = setup();
        let repo = EventRepo::new(db);
        assert!(repo.find(sketch_id, index_id, "doc-1").unwrap().is_none());

        let first = repo.get_or_create(sketch_id, index_id, "doc-1").unwrap();
        let second = repo.get_or_create(sketch_id, index_id, "doc-1").unwrap();
        assert_eq!(first, second);

        let other = repo.get_or_create(sketch_id, index_id, "doc-2").unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn comment_creates_missing_event_row() {
        let (db, sketch_id, index_id) = setup();
        let comments = CommentRepo::new(db.clone());
        let row = comments
            .add_to_document(sketch_id, index_id, "doc-1", None, "looks like beaconing")
            .unwrap();
        assert!(row.user_id.is_none());

        let event = EventRepo::new(db).find(sketch_id, index_id, "doc-1").unwrap().unwrap();
        assert_eq!(row.event_id, event.id);
        assert_eq!(comments.list(event.id).unwrap(), vec![row]);
    }

    #[test]
    fn comments_share_one_event_row() {
        let (db, sketch_id, index_id) = setup();
        let comments = CommentRepo::new(db);
        let a = comments.add_to_document(sketch_id, index_id, "doc-1", None, "one").unwrap();
        let b = comments
            .add_to_document(sketch_id, index_id, "doc-1", Some(UserId::from_raw(4)), "two")
            .unwrap();
        assert_eq!(a.event_id, b.event_id);
        let listed = comments.list(a.event_id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].user_id, Some(UserId::from_raw(4)));
    }

    #[test]
    fn comment_on_unknown_sketch_fails() {
        let (db, _, index_id) = setup();
        let result = CommentRepo::new(db).add_to_document(
            SketchId::from_raw(404),
            index_id,
            "doc-1",
            None,
            "orphan",
        );
        assert!(matches!(result, Err(StoreError::Database(_))));
    }
}
