use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use timesift_core::ids::{SketchId, UserId, ViewId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A saved search of a sketch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: ViewId,
    pub sketch_id: SketchId,
    pub user_id: Option<UserId>,
    pub searchtemplate_id: Option<i64>,
    pub name: String,
    pub query_string: Option<String>,
    pub query_dsl: Option<Value>,
    pub query_filter: Map<String, Value>,
    pub created_at: String,
}

/// Fields of a view about to be created.
#[derive(Clone, Debug)]
pub struct NewView {
    pub sketch_id: SketchId,
    pub user_id: Option<UserId>,
    pub name: String,
    pub query_string: Option<String>,
    pub query_dsl: Option<Value>,
    pub query_filter: Map<String, Value>,
}

impl NewView {
    pub fn new(sketch_id: SketchId, name: impl Into<String>) -> Self {
        Self {
            sketch_id,
            user_id: None,
            name: name.into(),
            query_string: None,
            query_dsl: None,
            query_filter: Map::new(),
        }
    }
}

/// Check a query filter and normalize it for storage.
///
/// Null-valued keys are dropped. Known keys must have the expected shape;
/// unknown keys pass through untouched.
pub fn validate_filter(filter: Map<String, Value>) -> Result<Map<String, Value>, StoreError> {
    let mut normalized = Map::new();
    for (key, value) in filter {
        if value.is_null() {
            continue;
        }
        let valid = match key.as_str() {
            "from" | "size" => value.as_u64().is_some(),
            "order" => matches!(value.as_str(), Some("asc") | Some("desc")),
            "time_start" | "time_end" => value.is_string(),
            "indices" | "exclude" => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            _ => true,
        };
        if !valid {
            return Err(StoreError::Invalid {
                field: "query_filter",
                reason: format!("bad value for {key}: {value}"),
            });
        }
        normalized.insert(key, value);
    }
    Ok(normalized)
}

pub struct ViewRepo {
    db: Database,
}

impl ViewRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate the filter and persist the view immediately.
    #[instrument(skip(self, view), fields(sketch_id = %view.sketch_id, name = %view.name))]
    pub fn create(&self, view: NewView) -> Result<ViewRow, StoreError> {
        let query_filter = validate_filter(view.query_filter)?;
        let filter_json = serde_json::to_string(&query_filter)?;
        let dsl_json = view.query_dsl.as_ref().map(serde_json::to_string).transpose()?;
        let now = Utc::now().to_rfc3339();

        self.db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO views (sketch_id, user_id, searchtemplate_id, name, query_string, query_dsl, query_filter, created_at)
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    view.sketch_id.get(),
                    view.user_id.map(UserId::get),
                    view.name,
                    view.query_string,
                    dsl_json,
                    filter_json,
                    now,
                ],
            )?;
            Ok(ViewRow {
                id: ViewId::from_raw(conn.last_insert_rowid()),
                sketch_id: view.sketch_id,
                user_id: view.user_id,
                searchtemplate_id: None,
                name: view.name,
                query_string: view.query_string,
                query_dsl: view.query_dsl,
                query_filter,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(view_id = %id))]
    pub fn get(&self, id: ViewId) -> Result<ViewRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sketch_id, user_id, searchtemplate_id, name, query_string, query_dsl, query_filter, created_at
                 FROM views WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_to_view(row),
                None => Err(StoreError::NotFound(format!("view {id}"))),
            }
        })
    }

    #[instrument(skip(self), fields(sketch_id = %sketch_id))]
    pub fn list(&self, sketch_id: SketchId) -> Result<Vec<ViewRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sketch_id, user_id, searchtemplate_id, name, query_string, query_dsl, query_filter, created_at
                 FROM views WHERE sketch_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([sketch_id.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_view(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_view(row: &rusqlite::Row<'_>) -> Result<ViewRow, StoreError> {
    let dsl: Option<String> = row_helpers::get_opt(row, 6, "views", "query_dsl")?;
    let filter: String = row_helpers::get(row, 7, "views", "query_filter")?;

    Ok(ViewRow {
        id: ViewId::from_raw(row_helpers::get(row, 0, "views", "id")?),
        sketch_id: SketchId::from_raw(row_helpers::get(row, 1, "views", "sketch_id")?),
        user_id: row_helpers::get_opt::<i64>(row, 2, "views", "user_id")?.map(UserId::from_raw),
        searchtemplate_id: row_helpers::get_opt(row, 3, "views", "searchtemplate_id")?,
        name: row_helpers::get(row, 4, "views", "name")?,
        query_string: row_helpers::get_opt(row, 5, "views", "query_string")?,
        query_dsl: dsl
            .map(|raw| row_helpers::parse_json(&raw, "views", "query_dsl"))
            .transpose()?,
        query_filter: row_helpers::parse_json_object(&filter, "views", "query_filter")?,
        created_at: row_helpers::get(row, 8, "views", "created_at")?,
    })
}
