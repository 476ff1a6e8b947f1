use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use timesift_core::ids::{SearchIndexId, SketchId, TimelineId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SketchRow {
    pub id: SketchId,
    pub name: String,
    pub description: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchIndexRow {
    pub id: SearchIndexId,
    pub name: String,
    pub index_name: String,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineStatus {
    Active,
    Archived,
    Deleted,
}

impl std::fmt::Display for TimelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for TimelineStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown timeline status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimelineRow {
    pub id: TimelineId,
    pub sketch_id: SketchId,
    pub searchindex_id: SearchIndexId,
    pub name: String,
    pub status: TimelineStatus,
    pub created_at: String,
}

pub struct SketchRepo {
    db: Database,
}

impl SketchRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, name: &str, description: &str) -> Result<SketchRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sketches (name, description, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, description, now],
            )?;
            Ok(SketchRow {
                id: SketchId::from_raw(conn.last_insert_rowid()),
                name: name.to_string(),
                description: description.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(sketch_id = %id))]
    pub fn get(&self, id: SketchId) -> Result<SketchRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_at FROM sketches WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => Ok(SketchRow {
                    id: SketchId::from_raw(row_helpers::get(row, 0, "sketches", "id")?),
                    name: row_helpers::get(row, 1, "sketches", "name")?,
                    description: row_helpers::get(row, 2, "sketches", "description")?,
                    created_at: row_helpers::get(row, 3, "sketches", "created_at")?,
                }),
                None => Err(StoreError::NotFound(format!("sketch {id}"))),
            }
        })
    }
}

pub struct SearchIndexRepo {
    db: Database,
}

impl SearchIndexRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, name: &str, index_name: &str) -> Result<SearchIndexRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO search_indices (name, index_name, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![name, index_name, now],
            )?;
            Ok(SearchIndexRow {
                id: SearchIndexId::from_raw(conn.last_insert_rowid()),
                name: name.to_string(),
                index_name: index_name.to_string(),
                created_at: now,
            })
        })
    }

    /// Look up a search index by its backend index name.
    #[instrument(skip(self))]
    pub fn get_by_index_name(&self, index_name: &str) -> Result<SearchIndexRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, index_name, created_at FROM search_indices WHERE index_name = ?1",
            )?;
            let mut rows = stmt.query([index_name])?;
            match rows.next()? {
                Some(row) => Ok(SearchIndexRow {
                    id: SearchIndexId::from_raw(row_helpers::get(row, 0, "search_indices", "id")?),
                    name: row_helpers::get(row, 1, "search_indices", "name")?,
                    index_name: row_helpers::get(row, 2, "search_indices", "index_name")?,
                    created_at: row_helpers::get(row, 3, "search_indices", "created_at")?,
                }),
                None => Err(StoreError::NotFound(format!("search index {index_name}"))),
            }
        })
    }
}

pub struct TimelineRepo {
    db: Database,
}

impl TimelineRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Attach a search index to a sketch as an active timeline.
    #[instrument(skip(self), fields(sketch_id = %sketch_id, searchindex_id = %searchindex_id))]
    pub fn attach(
        &self,
        sketch_id: SketchId,
        searchindex_id: SearchIndexId,
        name: &str,
    ) -> Result<TimelineRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO timelines (sketch_id, searchindex_id, name, status, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4)",
                rusqlite::params![sketch_id.get(), searchindex_id.get(), name, now],
            )?;
            Ok(TimelineRow {
                id: TimelineId::from_raw(conn.last_insert_rowid()),
                sketch_id,
                searchindex_id,
                name: name.to_string(),
                status: TimelineStatus::Active,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(timeline_id = %id, status = %status))]
    pub fn update_status(&self, id: TimelineId, status: TimelineStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE timelines SET status = ?1 WHERE id = ?2",
                rusqlite::params![status.to_string(), id.get()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("timeline {id}")));
            }
            Ok(())
        })
    }

    /// Timelines of a sketch, oldest first.
    #[instrument(skip(self), fields(sketch_id = %sketch_id))]
    pub fn list(&self, sketch_id: SketchId) -> Result<Vec<TimelineRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sketch_id, searchindex_id, name, status, created_at
                 FROM timelines WHERE sketch_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([sketch_id.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let status: String = row_helpers::get(row, 4, "timelines", "status")?;
                results.push(TimelineRow {
                    id: TimelineId::from_raw(row_helpers::get(row, 0, "timelines", "id")?),
                    sketch_id: SketchId::from_raw(row_helpers::get(row, 1, "timelines", "sketch_id")?),
                    searchindex_id: SearchIndexId::from_raw(row_helpers::get(
                        row,
                        2,
                        "timelines",
                        "searchindex_id",
                    )?),
                    name: row_helpers::get(row, 3, "timelines", "name")?,
                    status: row_helpers::parse_enum(&status, "timelines", "status")?,
                    created_at: row_helpers::get(row, 5, "timelines", "created_at")?,
                });
            }
            Ok(results)
        })
    }

    /// Backend index names of the sketch's active timelines.
    #[instrument(skip(self), fields(sketch_id = %sketch_id))]
    pub fn active_index_names(&self, sketch_id: SketchId) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.index_name FROM timelines t
                 JOIN search_indices s ON s.id = t.searchindex_id
                 WHERE t.sketch_id = ?1 AND t.status = 'active'
                 ORDER BY t.id ASC",
            )?;
            let mut rows = stmt.query([sketch_id.get()])?;
            let mut names = Vec::new();
            while let Some(row) = rows.next()? {
                names.push(row_helpers::get(row, 0, "search_indices", "index_name")?);
            }
            Ok(names)
        })
    }
}
