use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use timesift_core::ids::{AnalysisId, SketchId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Started,
    Done,
    Error,
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Started => write!(f, "started"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown analysis status: {other}")),
        }
    }
}

/// Record of one analyzer instance run against a sketch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub id: AnalysisId,
    pub sketch_id: SketchId,
    pub analyzer_name: String,
    pub index_name: String,
    pub parameters: Map<String, Value>,
    pub status: AnalysisStatus,
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct AnalysisRepo {
    db: Database,
}

impl AnalysisRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, parameters), fields(sketch_id = %sketch_id))]
    pub fn create(
        &self,
        sketch_id: SketchId,
        analyzer_name: &str,
        index_name: &str,
        parameters: &Map<String, Value>,
    ) -> Result<AnalysisRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        let params_json = serde_json::to_string(parameters)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO analyses (sketch_id, analyzer_name, index_name, parameters, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
                rusqlite::params![sketch_id.get(), analyzer_name, index_name, params_json, now],
            )?;
            Ok(AnalysisRow {
                id: AnalysisId::from_raw(conn.last_insert_rowid()),
                sketch_id,
                analyzer_name: analyzer_name.to_string(),
                index_name: index_name.to_string(),
                parameters: parameters.clone(),
                status: AnalysisStatus::Pending,
                result: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Move an analysis to `status`, replacing its result text when given.
    #[instrument(skip(self, result), fields(analysis_id = %id, status = %status))]
    pub fn update_status(
        &self,
        id: AnalysisId,
        status: AnalysisStatus,
        result: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE analyses SET status = ?1, result = COALESCE(?2, result), updated_at = ?3 WHERE id = ?4",
                rusqlite::params![status.to_string(), result, now, id.get()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("analysis {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(analysis_id = %id))]
    pub fn get(&self, id: AnalysisId) -> Result<AnalysisRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sketch_id, analyzer_name, index_name, parameters, status, result, created_at, updated_at
                 FROM analyses WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_to_analysis(row),
                None => Err(StoreError::NotFound(format!("analysis {id}"))),
            }
        })
    }

    /// Analyses of a sketch, newest first.
    #[instrument(skip(self), fields(sketch_id = %sketch_id))]
    pub fn list(&self, sketch_id: SketchId) -> Result<Vec<AnalysisRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sketch_id, analyzer_name, index_name, parameters, status, result, created_at, updated_at
                 FROM analyses WHERE sketch_id = ?1 ORDER BY id DESC",
            )?;
            let mut rows = stmt.query([sketch_id.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_analysis(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> Result<AnalysisRow, StoreError> {
    let parameters: String = row_helpers::get(row, 4, "analyses", "parameters")?;
    let status: String = row_helpers::get(row, 5, "analyses", "status")?;

    Ok(AnalysisRow {
        id: AnalysisId::from_raw(row_helpers::get(row, 0, "analyses", "id")?),
        sketch_id: SketchId::from_raw(row_helpers::get(row, 1, "analyses", "sketch_id")?),
        analyzer_name: row_helpers::get(row, 2, "analyses", "analyzer_name")?,
        index_name: row_helpers::get(row, 3, "analyses", "index_name")?,
        parameters: row_helpers::parse_json_object(&parameters, "analyses", "parameters")?,
        status: row_helpers::parse_enum(&status, "analyses", "status")?,
        result: row_helpers::get_opt(row, 6, "analyses", "result")?,
        created_at: row_helpers::get(row, 7, "analyses", "created_at")?,
        updated_at: row_helpers::get(row, 8, "analyses", "updated_at")?,
    })
}
