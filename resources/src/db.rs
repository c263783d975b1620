//! The record table, stored in SQLite.
use std::{path::Path, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, instrument};

use crate::{
    path::ResourcePath,
    record::{now_millis, ResourceState, ResourceType, ROOT_ID, UNDEFINED_ID},
    Error,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resourcestore (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parentid INTEGER NULL REFERENCES resourcestore(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    path TEXT NOT NULL UNIQUE,
    content BLOB NULL,
    mtime INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS resourcestore_parentid_idx ON resourcestore(parentid);
CREATE TABLE IF NOT EXISTS resourcestore_lock (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    token TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
";

const STATE_COLUMNS: &str = "id, parentid, type, path, mtime";

/// A SQLite connection shared by everything opened on one store.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (and creates if needed) the database file at `path`.
    ///
    /// Several processes may open the same file, writers wait up to `timeout`
    /// for each other before failing with a storage error.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, Error> {
        if path == Path::new("/") {
            return Err(Error::InvalidRequest(
                "cowardly refusing to open / with sqlite".to_string(),
            ));
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, path = %path.display(), "opened database");

        Self::init(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, Error> {
        conn.pragma_update(None, "foreign_keys", true)?;
        create_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Runs `f` inside an immediate transaction, committing if it succeeds.
    /// The transaction is rolled back when `f` fails.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut conn = self.conn.lock();
        let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&txn)?;
        txn.commit()?;

        Ok(result)
    }
}

/// Ensures all tables and the root row are present.
fn create_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    conn.execute(
        "INSERT OR IGNORE INTO resourcestore (id, parentid, type, path, content, mtime)
         VALUES (?1, NULL, ?2, '', NULL, ?3)",
        params![ROOT_ID, ResourceType::Directory, now_millis()],
    )?;

    Ok(())
}

fn state_from_row(row: &Row) -> rusqlite::Result<ResourceState> {
    Ok(ResourceState {
        id: row.get(0)?,
        parent_id: row.get::<_, Option<i64>>(1)?.unwrap_or(UNDEFINED_ID),
        kind: row.get(2)?,
        path: ResourcePath::from_trusted(row.get(3)?),
        last_modified: row.get(4)?,
    })
}

/// Row level operations on the `resourcestore` table.
#[derive(Clone)]
pub struct RecordTable {
    db: Arc<Database>,
}

impl RecordTable {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Looks up the row at `path`. Returns the undefined state if there is none.
    pub fn find_by_path(&self, path: &ResourcePath) -> Result<ResourceState, Error> {
        self.db.with_conn(|conn| find_by_path(conn, path))
    }

    /// Creates `path` and all its missing ancestors as directories.
    /// Fails with a type conflict if any of them is a resource.
    #[instrument(skip(self), fields(resource.path = %path), err)]
    pub fn mkdirs(&self, path: &ResourcePath) -> Result<ResourceState, Error> {
        self.db
            .transaction(|txn| ensure_directories(txn, path, now_millis()))
    }

    /// Direct children of the directory with the given id, ordered by path.
    pub fn children(&self, id: i64) -> Result<Vec<ResourceState>, Error> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {STATE_COLUMNS} FROM resourcestore
                 WHERE parentid = ?1 AND id <> ?2 ORDER BY path"
            ))?;
            let rows = stmt.query_map([id, ROOT_ID], state_from_row)?;

            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// All rows strictly below `path`, ordered by path.
    pub fn descendants(&self, path: &ResourcePath) -> Result<Vec<ResourceState>, Error> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {STATE_COLUMNS} FROM resourcestore
                 WHERE substr(path, 1, length(?1)) = ?1 AND id <> ?2 ORDER BY path"
            ))?;
            let rows = stmt.query_map(params![path.descendant_prefix(), ROOT_ID], state_from_row)?;

            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Returns the content of a resource row together with its mtime.
    /// None if the row is gone or not a resource.
    pub fn content(&self, id: i64) -> Result<Option<(Vec<u8>, i64)>, Error> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT content, mtime FROM resourcestore WHERE id = ?1 AND type = ?2",
                    params![id, ResourceType::Resource],
                    |row| {
                        Ok((
                            row.get::<_, Option<Vec<u8>>>(0)?.unwrap_or_default(),
                            row.get(1)?,
                        ))
                    },
                )
                .optional()?)
        })
    }

    /// Replaces the content of an existing resource row and returns its new
    /// mtime, which is always greater than the previous one.
    pub fn write_content(&self, id: i64, content: &[u8]) -> Result<Option<i64>, Error> {
        self.db
            .transaction(|txn| write_content(txn, id, content, now_millis()))
    }

    /// Writes `content` at `path`, creating the resource and its ancestor
    /// directories if needed.
    #[instrument(
        skip(self, content),
        fields(resource.path = %path, content.len = content.len()),
        err
    )]
    pub fn upsert_resource(
        &self,
        path: &ResourcePath,
        content: &[u8],
    ) -> Result<ResourceState, Error> {
        self.db.transaction(|txn| {
            let now = now_millis();
            let existing = find_by_path(txn, path)?;
            match existing.kind {
                ResourceType::Resource => {
                    let mut state = existing;
                    if let Some(mtime) = write_content(txn, state.id, content, now)? {
                        state.last_modified = mtime;
                    }
                    Ok(state)
                }
                ResourceType::Directory => Err(Error::TypeConflict {
                    path: path.to_string(),
                    expected: ResourceType::Resource,
                    found: ResourceType::Directory,
                }),
                ResourceType::Undefined => {
                    let parent_path = path.parent().ok_or_else(|| {
                        Error::InvalidRequest("the root can not hold content".to_string())
                    })?;
                    let parent = ensure_directories(txn, &parent_path, now)?;
                    insert(
                        txn,
                        parent.id,
                        ResourceType::Resource,
                        path,
                        Some(content),
                        now,
                    )
                }
            }
        })
    }

    /// Deletes the row at `path` and every row below it.
    /// Returns the ids of the removed rows, empty if nothing existed.
    #[instrument(skip(self), fields(resource.path = %path), err)]
    pub fn delete_subtree(&self, path: &ResourcePath) -> Result<Vec<i64>, Error> {
        if path.is_root() {
            return Err(Error::InvalidRequest(
                "the root directory can not be removed".to_string(),
            ));
        }

        self.db.transaction(|txn| delete_subtree(txn, path))
    }

    /// Moves the row at `source` to `target`, rewriting the path of every
    /// descendant in the same transaction. Rows already at `target` are
    /// replaced, missing ancestors of `target` are created.
    ///
    /// Returns the moved row and the ids of the replaced rows, or None if
    /// there is nothing at `source`.
    #[instrument(skip(self), fields(resource.source = %source, resource.target = %target), err)]
    pub fn rename_subtree(
        &self,
        source: &ResourcePath,
        target: &ResourcePath,
    ) -> Result<Option<(ResourceState, Vec<i64>)>, Error> {
        if source.is_root() || target.is_root() {
            return Err(Error::InvalidRequest(
                "the root directory can not be moved".to_string(),
            ));
        }
        if target.is_descendant_of(source) || source.is_descendant_of(target) {
            return Err(Error::InvalidRequest(format!(
                "can not move {} to {}",
                source, target
            )));
        }

        self.db.transaction(|txn| {
            let now = now_millis();
            let moved = find_by_path(txn, source)?;
            if !moved.exists() {
                return Ok(None);
            }

            let replaced = delete_subtree(txn, target)?;
            let parent_path = target.parent().unwrap_or_default();
            let parent = ensure_directories(txn, &parent_path, now)?;

            let mtime: i64 = txn.query_row(
                "UPDATE resourcestore SET path = ?1, parentid = ?2, mtime = MAX(?3, mtime + 1)
                 WHERE id = ?4 RETURNING mtime",
                params![target.as_str(), parent.id, now, moved.id],
                |row| row.get(0),
            )?;

            let renamed = txn.execute(
                "UPDATE resourcestore SET path = ?1 || substr(path, length(?2) + 1)
                 WHERE substr(path, 1, length(?2)) = ?2",
                params![target.descendant_prefix(), source.descendant_prefix()],
            )?;
            debug!(descendants = renamed, "renamed subtree");

            Ok(Some((
                ResourceState {
                    id: moved.id,
                    parent_id: parent.id,
                    kind: moved.kind,
                    path: target.clone(),
                    last_modified: mtime,
                },
                replaced,
            )))
        })
    }

    /// Deletes every row whose path satisfies `predicate`, together with the
    /// rows below it. Returns the ids of the removed rows.
    pub fn purge_paths(
        &self,
        predicate: impl Fn(&ResourcePath) -> bool,
    ) -> Result<Vec<i64>, Error> {
        self.db.transaction(|txn| {
            let mut stmt = txn.prepare("SELECT path FROM resourcestore WHERE id <> ?1")?;
            let paths = stmt
                .query_map([ROOT_ID], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut removed = Vec::new();
            for path in paths.into_iter().map(ResourcePath::from_trusted) {
                if predicate(&path) {
                    removed.extend(delete_subtree(txn, &path)?);
                }
            }

            Ok(removed)
        })
    }
}

fn find_by_path(conn: &Connection, path: &ResourcePath) -> Result<ResourceState, Error> {
    let state = conn
        .query_row(
            &format!("SELECT {STATE_COLUMNS} FROM resourcestore WHERE path = ?1"),
            [path.as_str()],
            state_from_row,
        )
        .optional()?;

    Ok(state.unwrap_or_else(|| ResourceState::undefined(path.clone())))
}

fn insert(
    conn: &Connection,
    parent_id: i64,
    kind: ResourceType,
    path: &ResourcePath,
    content: Option<&[u8]>,
    now: i64,
) -> Result<ResourceState, Error> {
    let id = conn.query_row(
        "INSERT INTO resourcestore (parentid, type, path, content, mtime)
         VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
        params![parent_id, kind, path.as_str(), content, now],
        |row| row.get(0),
    )?;

    Ok(ResourceState {
        id,
        parent_id,
        kind,
        path: path.clone(),
        last_modified: now,
    })
}

/// Walks from the root down to `path`, inserting every missing directory.
fn ensure_directories(
    conn: &Connection,
    path: &ResourcePath,
    now: i64,
) -> Result<ResourceState, Error> {
    let mut current = find_by_path(conn, &ResourcePath::root())?;

    for dir in path.ancestors().skip(1).chain(std::iter::once(path.clone())) {
        if dir.is_root() {
            continue;
        }

        let existing = find_by_path(conn, &dir)?;
        current = match existing.kind {
            ResourceType::Directory => existing,
            ResourceType::Undefined => {
                insert(conn, current.id, ResourceType::Directory, &dir, None, now)?
            }
            ResourceType::Resource => {
                return Err(Error::TypeConflict {
                    path: dir.to_string(),
                    expected: ResourceType::Directory,
                    found: ResourceType::Resource,
                })
            }
        };
    }

    Ok(current)
}

fn write_content(
    conn: &Connection,
    id: i64,
    content: &[u8],
    now: i64,
) -> Result<Option<i64>, Error> {
    Ok(conn
        .query_row(
            "UPDATE resourcestore SET content = ?1, mtime = MAX(?2, mtime + 1)
             WHERE id = ?3 AND type = ?4 RETURNING mtime",
            params![content, now, id, ResourceType::Resource],
            |row| row.get(0),
        )
        .optional()?)
}

/// Deletes the row at `path` and all rows below it, returning their ids.
///
/// The ids are collected before deleting, rows removed by the cascade on
/// `parentid` don't show up in a `RETURNING` clause.
fn delete_subtree(conn: &Connection, path: &ResourcePath) -> Result<Vec<i64>, Error> {
    let prefix = path.descendant_prefix();

    let ids = conn
        .prepare_cached(
            "SELECT id FROM resourcestore
             WHERE (path = ?1 OR substr(path, 1, length(?2)) = ?2) AND id <> ?3",
        )?
        .query_map(params![path.as_str(), prefix, ROOT_ID], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;

    if !ids.is_empty() {
        conn.prepare_cached(
            "DELETE FROM resourcestore
             WHERE (path = ?1 OR substr(path, 1, length(?2)) = ?2) AND id <> ?3",
        )?
        .execute(params![path.as_str(), prefix, ROOT_ID])?;
    }

    Ok(ids)
}
