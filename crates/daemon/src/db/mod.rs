use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use engine::reconcile::{self, Reconciliation};
use engine::{AssemblyError, ContentStatus, ScriptDescriptor, SegmentId, StatusCache};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct Database {
    pub(crate) conn: Mutex<Connection>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS scripts (
                project_id INTEGER PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                version INTEGER NOT NULL,
                descriptor_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS content_status (
                project_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                segment_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                asset_path TEXT,
                generated_at TEXT,
                error TEXT,
                PRIMARY KEY (project_id, kind, segment_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                payload_json TEXT,
                result_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn load_script(&self, project_id: i64) -> Result<Option<ScriptDescriptor>> {
        let conn = self.conn.lock().unwrap();
        read_script(&conn, project_id)
    }

    /// Replace the project's script. An existing script is only overwritten
    /// by a descriptor carrying the same version; the stored copy gets the
    /// next version.
    pub fn put_script(&self, project_id: i64, descriptor: &ScriptDescriptor) -> Result<ScriptDescriptor> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut next = descriptor.clone();
        if let Some(stored) = read_script(&tx, project_id)? {
            if stored.version != descriptor.version {
                return Err(AssemblyError::StaleState {
                    reason: format!(
                        "script version {} does not match stored version {}",
                        descriptor.version, stored.version
                    ),
                }
                .into());
            }
            next.version = stored.version + 1;
        }
        write_script(&tx, project_id, &next)?;

        tx.commit()?;
        Ok(next)
    }

    pub fn load_status(&self, project_id: i64) -> Result<StatusCache> {
        let conn = self.conn.lock().unwrap();
        read_status(&conn, project_id)
    }

    /// Script and status read under one lock.
    pub fn load_project(&self, project_id: i64) -> Result<Option<(ScriptDescriptor, StatusCache)>> {
        let conn = self.conn.lock().unwrap();
        let Some(descriptor) = read_script(&conn, project_id)? else {
            return Ok(None);
        };
        let status = read_status(&conn, project_id)?;
        Ok(Some((descriptor, status)))
    }

    /// Reconcile the stored script and status in one transaction. Returns
    /// `None` when the project has no script.
    pub fn reconcile_project(&self, project_id: i64) -> Result<Option<Reconciliation>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let Some(descriptor) = read_script(&tx, project_id)? else {
            return Ok(None);
        };
        let status = read_status(&tx, project_id)?;
        let reconciliation = reconcile::reconcile(&descriptor, &status);

        if !reconciliation.is_noop() {
            write_script(&tx, project_id, &reconciliation.descriptor)?;
            write_status(&tx, project_id, &reconciliation.status)?;
        }

        tx.commit()?;
        Ok(Some(reconciliation))
    }

    /// Apply script operations, then reconcile, all or nothing.
    pub fn edit_script<F>(&self, project_id: i64, edit: F) -> Result<Option<Reconciliation>>
    where
        F: FnOnce(&mut ScriptDescriptor) -> Result<()>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let Some(mut descriptor) = read_script(&tx, project_id)? else {
            return Ok(None);
        };
        edit(&mut descriptor)?;
        descriptor.version += 1;

        let status = read_status(&tx, project_id)?;
        let reconciliation = reconcile::reconcile(&descriptor, &status);
        write_script(&tx, project_id, &reconciliation.descriptor)?;
        write_status(&tx, project_id, &reconciliation.status)?;

        tx.commit()?;
        Ok(Some(reconciliation))
    }

    /// Run a status transition against the stored cache and persist the
    /// result. The transition sees the status as of this transaction.
    pub fn update_status<F>(&self, project_id: i64, transition: F) -> Result<StatusCache>
    where
        F: FnOnce(&StatusCache) -> engine::error::Result<StatusCache>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let status = read_status(&tx, project_id)?;
        let next = transition(&status)?;
        write_status(&tx, project_id, &next)?;

        tx.commit()?;
        Ok(next)
    }
}

fn read_script(conn: &Connection, project_id: i64) -> Result<Option<ScriptDescriptor>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT descriptor_json FROM scripts WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )
        .optional()?;

    json.map(|s| serde_json::from_str(&s).context("Failed to parse stored script descriptor"))
        .transpose()
}

fn write_script(conn: &Connection, project_id: i64, descriptor: &ScriptDescriptor) -> Result<()> {
    let json = serde_json::to_string(descriptor)?;
    conn.execute(
        "INSERT INTO scripts (project_id, schema_version, version, descriptor_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(project_id) DO UPDATE SET
            schema_version = excluded.schema_version,
            version = excluded.version,
            descriptor_json = excluded.descriptor_json,
            updated_at = excluded.updated_at",
        params![
            project_id,
            descriptor.schema_version,
            descriptor.version as i64,
            json,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

fn read_status(conn: &Connection, project_id: i64) -> Result<StatusCache> {
    let mut stmt = conn.prepare(
        "SELECT kind, segment_id, state, asset_path, generated_at, error
         FROM content_status WHERE project_id = ?1",
    )?;
    let records = stmt
        .query_map(params![project_id], status_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(StatusCache::from_records(records))
}

fn status_from_row(row: &Row) -> rusqlite::Result<ContentStatus> {
    let kind_str: String = row.get(0)?;
    let state_str: String = row.get(2)?;
    let asset_path: Option<String> = row.get(3)?;
    let generated_at_str: Option<String> = row.get(4)?;

    let kind = serde_json::from_str(&kind_str)
        .map_err(|_| rusqlite::Error::InvalidColumnType(0, "TEXT".to_string(), rusqlite::types::Type::Text))?;
    let state = serde_json::from_str(&state_str)
        .map_err(|_| rusqlite::Error::InvalidColumnType(2, "TEXT".to_string(), rusqlite::types::Type::Text))?;
    let generated_at = generated_at_str
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .map_err(|_| rusqlite::Error::InvalidColumnType(4, "TEXT".to_string(), rusqlite::types::Type::Text))?;

    Ok(ContentStatus {
        segment_id: SegmentId(row.get(1)?),
        kind,
        state,
        asset_path: asset_path.map(PathBuf::from),
        generated_at,
        error: row.get(5)?,
    })
}

fn write_status(conn: &Connection, project_id: i64, status: &StatusCache) -> Result<()> {
    conn.execute(
        "DELETE FROM content_status WHERE project_id = ?1",
        params![project_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO content_status
            (project_id, kind, segment_id, state, asset_path, generated_at, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for record in status.records() {
        stmt.execute(params![
            project_id,
            serde_json::to_string(&record.kind)?,
            record.segment_id.0,
            serde_json::to_string(&record.state)?,
            record.asset_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            record.generated_at.map(|t| t.to_rfc3339()),
            record.error,
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::script;
    use engine::reconcile::Drift;
    use engine::{GenerationState, StatusKey};

    #[test]
    fn put_script_is_versioned() {
        let db = Database::in_memory().unwrap();
        let stored = db.put_script(1, &script(3, 2.0, 0.0)).unwrap();
        assert_eq!(stored.version, 0);

        let mut edit = stored.clone();
        edit.visual_density = 0.5;
        let stored = db.put_script(1, &edit).unwrap();
        assert_eq!(stored.version, 1);

        // Writing over a newer copy is rejected
        let err = db.put_script(1, &edit).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AssemblyError>(),
            Some(AssemblyError::StaleState { .. })
        ));
        assert_eq!(db.load_script(1).unwrap().unwrap().visual_density, 0.5);
        assert!(db.load_script(2).unwrap().is_none());
    }

    #[test]
    fn reconcile_persists_status_and_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.put_script(7, &script(8, 2.0, 0.25)).unwrap();

        let first = db.reconcile_project(7).unwrap().unwrap();
        assert!(first
            .drifts
            .contains(&Drift::MissingVisual { segment_id: SegmentId(7) }));

        let status = db.load_status(7).unwrap();
        assert_eq!(
            status.visual_ids().into_iter().collect::<Vec<_>>(),
            vec![SegmentId(0), SegmentId(7)]
        );
        assert_eq!(status.len(), 10);

        let second = db.reconcile_project(7).unwrap().unwrap();
        assert!(second.is_noop());
        assert!(db.reconcile_project(8).unwrap().is_none());
    }

    #[test]
    fn status_round_trips_through_rows() {
        let db = Database::in_memory().unwrap();
        db.put_script(1, &script(2, 2.0, 1.0)).unwrap();
        db.reconcile_project(1).unwrap();

        let at = Utc::now();
        let key = StatusKey::visual(SegmentId(1));
        db.update_status(1, |s| s.mark_ready(key, PathBuf::from("broll/1.mp4"), at))
            .unwrap();

        let status = db.load_status(1).unwrap();
        let record = status.get(key).unwrap();
        assert_eq!(record.state, GenerationState::Ready);
        assert_eq!(record.asset_path, Some(PathBuf::from("broll/1.mp4")));
        assert_eq!(
            record.generated_at.map(|t| t.timestamp()),
            Some(at.timestamp())
        );
    }

    #[test]
    fn failed_transition_leaves_status_untouched() {
        let db = Database::in_memory().unwrap();
        db.put_script(1, &script(2, 2.0, 0.0)).unwrap();
        db.reconcile_project(1).unwrap();
        let before = db.load_status(1).unwrap();

        let missing = StatusKey::visual(SegmentId(9));
        assert!(db.update_status(1, |s| s.mark_generating(missing)).is_err());
        assert_eq!(db.load_status(1).unwrap(), before);
    }

    #[test]
    fn edit_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();
        db.put_script(1, &script(2, 2.0, 0.0)).unwrap();

        let result = db.edit_script(1, |d| {
            d.visual_density = 1.0;
            anyhow::bail!("rejected")
        });
        assert!(result.is_err());
        let stored = db.load_script(1).unwrap().unwrap();
        assert_eq!(stored.visual_density, 0.0);
        assert_eq!(stored.version, 0);

        let reconciled = db
            .edit_script(1, |d| {
                d.visual_density = 1.0;
                Ok(())
            })
            .unwrap()
            .unwrap();
        assert_eq!(reconciled.status.visual_ids().len(), 2);
        assert!(db.load_script(1).unwrap().unwrap().version >= 1);
    }
}
