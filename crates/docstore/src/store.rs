// Authoritative doc rows: flushed snapshots, versions, ranges, and the
// archive flag, keyed by doc id.
//
// The updater writes through here on flush and reads on cache misses.
// Every content write bumps `revision`; the archive bridge uses the
// observed revision as an optimistic lock.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use uuid::Uuid;

use vellum_common::ranges::Ranges;

use crate::error::DocstoreError;

const BOOTSTRAP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS docs (
    doc_id      TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    path_name   TEXT NOT NULL,
    snapshot    TEXT NULL,
    version     INTEGER NOT NULL DEFAULT 0,
    ranges      TEXT NULL,
    revision    INTEGER NOT NULL DEFAULT 0,
    in_s3       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_docs_project ON docs (project_id);

CREATE TABLE IF NOT EXISTS projects (
    project_id      TEXT PRIMARY KEY,
    last_updated_at INTEGER NOT NULL DEFAULT 0,
    last_updated_by TEXT NULL
);
"#;

/// A durable snapshot as the updater consumes it on load.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedDoc {
    pub snapshot: String,
    pub path_name: String,
    pub version: u64,
    pub ranges: Ranges,
    pub revision: i64,
}

/// Input for a flush write.
#[derive(Debug, Clone)]
pub struct UpsertDoc<'a> {
    pub snapshot: &'a str,
    pub path_name: &'a str,
    pub version: u64,
    pub ranges: &'a Ranges,
    /// Epoch milliseconds of the last edit carried by this flush.
    pub last_updated_at: i64,
    pub last_updated_by: Option<Uuid>,
}

/// Row state the archive bridge works from.
#[derive(Debug, Clone)]
pub struct DocForArchive {
    pub lines: Option<Vec<String>>,
    pub ranges: Ranges,
    pub revision: i64,
    pub archived: bool,
}

pub struct Docstore {
    conn: Mutex<Connection>,
}

impl Docstore {
    pub fn open(path: &Path) -> Result<Self, DocstoreError> {
        Self::bootstrap(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, DocstoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, DocstoreError> {
        conn.execute_batch(BOOTSTRAP_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Archival must never run as part of a write transaction.
    pub fn ensure_not_in_transaction(&self) -> Result<(), DocstoreError> {
        let conn = self.lock();
        if conn.is_autocommit() {
            Ok(())
        } else {
            Err(DocstoreError::InTransaction)
        }
    }

    /// Reads the live snapshot for a doc. Archived docs fail with
    /// `DocArchived`; the archive bridge's read-through path handles it.
    pub fn get_doc(&self, project_id: Uuid, doc_id: Uuid) -> Result<FlushedDoc, DocstoreError> {
        let conn = self.lock();
        let row = conn.query_row(
            "SELECT project_id, path_name, snapshot, version, ranges, revision, in_s3 \
             FROM docs WHERE doc_id = ?1",
            params![doc_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            },
        );

        let (row_project, path_name, snapshot, version, ranges, revision, archived) = match row {
            Ok(values) => values,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(DocstoreError::NotFound),
            Err(error) => return Err(error.into()),
        };

        if row_project != project_id.to_string() {
            return Err(DocstoreError::NotAuthorized);
        }
        if archived {
            return Err(DocstoreError::DocArchived);
        }
        let snapshot = snapshot.ok_or(DocstoreError::NoLines)?;

        Ok(FlushedDoc {
            snapshot,
            path_name,
            version: version as u64,
            ranges: decode_ranges(ranges.as_deref())?,
            revision,
        })
    }

    /// Persists a flushed snapshot, bumping the row revision and the
    /// project's `last_updated` pair when it moves forward in time.
    pub fn upsert_doc(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        doc: UpsertDoc<'_>,
    ) -> Result<(), DocstoreError> {
        let ranges = encode_ranges(doc.ranges)?;
        let conn = self.lock();

        let changed = conn.execute(
            "INSERT INTO docs (doc_id, project_id, path_name, snapshot, version, ranges, revision, in_s3) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 0) \
             ON CONFLICT(doc_id) DO UPDATE SET \
                 path_name = excluded.path_name, \
                 snapshot = excluded.snapshot, \
                 version = excluded.version, \
                 ranges = excluded.ranges, \
                 revision = docs.revision + 1, \
                 in_s3 = 0 \
             WHERE docs.project_id = excluded.project_id",
            params![
                doc_id.to_string(),
                project_id.to_string(),
                doc.path_name,
                doc.snapshot,
                doc.version as i64,
                ranges,
            ],
        )?;
        if changed == 0 {
            return Err(DocstoreError::NotAuthorized);
        }

        conn.execute(
            "INSERT INTO projects (project_id, last_updated_at, last_updated_by) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(project_id) DO UPDATE SET \
                 last_updated_at = excluded.last_updated_at, \
                 last_updated_by = excluded.last_updated_by \
             WHERE excluded.last_updated_at >= projects.last_updated_at",
            params![
                project_id.to_string(),
                doc.last_updated_at,
                doc.last_updated_by.map(|user| user.to_string()),
            ],
        )?;

        Ok(())
    }

    /// Puts archived content back on the row. A no-op when another
    /// restorer already won the race; `NotFound` when the row is gone.
    pub fn restore_archived_content(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        lines: &[String],
        ranges: &Ranges,
    ) -> Result<(), DocstoreError> {
        let snapshot = lines_to_snapshot(lines);
        let ranges = encode_ranges(ranges)?;
        let conn = self.lock();

        let changed = conn.execute(
            "UPDATE docs SET snapshot = ?1, ranges = ?2, in_s3 = 0, revision = revision + 1 \
             WHERE doc_id = ?3 AND project_id = ?4 AND in_s3 = 1",
            params![snapshot, ranges, doc_id.to_string(), project_id.to_string()],
        )?;
        if changed > 0 {
            return Ok(());
        }

        match self.doc_exists(&conn, project_id, doc_id)? {
            true => Ok(()),
            false => Err(DocstoreError::NotFound),
        }
    }

    pub fn fetch_for_archiving(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<DocForArchive, DocstoreError> {
        let conn = self.lock();
        let row = conn.query_row(
            "SELECT project_id, snapshot, ranges, revision, in_s3 FROM docs WHERE doc_id = ?1",
            params![doc_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        );

        let (row_project, snapshot, ranges, revision, archived) = match row {
            Ok(values) => values,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(DocstoreError::NotFound),
            Err(error) => return Err(error.into()),
        };
        if row_project != project_id.to_string() {
            return Err(DocstoreError::NotAuthorized);
        }

        Ok(DocForArchive {
            lines: snapshot.as_deref().map(snapshot_to_lines),
            ranges: decode_ranges(ranges.as_deref())?,
            revision,
            archived,
        })
    }

    /// Flips the archive flag and clears row content, conditional on the
    /// revision observed when the content was fetched. Returns false when
    /// a concurrent write advanced the row first.
    pub fn mark_archived(
        &self,
        project_id: Uuid,
        doc_id: Uuid,
        observed_revision: i64,
    ) -> Result<bool, DocstoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE docs SET in_s3 = 1, snapshot = NULL, ranges = NULL \
             WHERE doc_id = ?1 AND project_id = ?2 AND revision = ?3 AND in_s3 = 0",
            params![doc_id.to_string(), project_id.to_string(), observed_revision],
        )?;
        Ok(changed > 0)
    }

    pub fn is_archived(&self, project_id: Uuid, doc_id: Uuid) -> Result<bool, DocstoreError> {
        let conn = self.lock();
        let row = conn.query_row(
            "SELECT project_id, in_s3 FROM docs WHERE doc_id = ?1",
            params![doc_id.to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
        );
        match row {
            Ok((row_project, _)) if row_project != project_id.to_string() => {
                Err(DocstoreError::NotAuthorized)
            }
            Ok((_, archived)) => Ok(archived),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(DocstoreError::NotFound),
            Err(error) => Err(error.into()),
        }
    }

    /// One page of doc ids for a project, ordered for stable paging.
    pub fn project_doc_ids(
        &self,
        project_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Uuid>, DocstoreError> {
        let conn = self.lock();
        let mut statement = conn.prepare(
            "SELECT doc_id FROM docs WHERE project_id = ?1 ORDER BY doc_id LIMIT ?2 OFFSET ?3",
        )?;
        let rows = statement
            .query_map(params![project_id.to_string(), limit as i64, offset as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|raw| Uuid::parse_str(&raw).map_err(|_| DocstoreError::CorruptId(raw)))
            .collect()
    }

    pub fn project_last_updated(
        &self,
        project_id: Uuid,
    ) -> Result<Option<(i64, Option<Uuid>)>, DocstoreError> {
        let conn = self.lock();
        let row = conn.query_row(
            "SELECT last_updated_at, last_updated_by FROM projects WHERE project_id = ?1",
            params![project_id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        );
        match row {
            Ok((at, by)) => {
                let by = match by {
                    Some(raw) => {
                        Some(Uuid::parse_str(&raw).map_err(|_| DocstoreError::CorruptId(raw))?)
                    }
                    None => None,
                };
                Ok(Some((at, by)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn doc_exists(
        &self,
        conn: &Connection,
        project_id: Uuid,
        doc_id: Uuid,
    ) -> Result<bool, DocstoreError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM docs WHERE doc_id = ?1 AND project_id = ?2",
            params![doc_id.to_string(), project_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("docstore connection lock poisoned")
    }
}

/// Row content is a single string; archive blobs carry line arrays.
pub fn snapshot_to_lines(snapshot: &str) -> Vec<String> {
    snapshot.split('\n').map(ToOwned::to_owned).collect()
}

pub fn lines_to_snapshot(lines: &[String]) -> String {
    lines.join("\n")
}

fn encode_ranges(ranges: &Ranges) -> Result<Option<String>, DocstoreError> {
    if ranges.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(ranges)?))
}

fn decode_ranges(raw: Option<&str>) -> Result<Ranges, DocstoreError> {
    match raw {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(Ranges::default()),
    }
}
