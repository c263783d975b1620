use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

use crate::{path::ResourcePath, Error};

/// Identity used for nodes without a backing row.
pub const UNDEFINED_ID: i64 = -1;

/// Identity of the root directory row.
pub const ROOT_ID: i64 = 0;

/// The type of a node, as seen by callers.
///
/// [ResourceType::Undefined] is never stored, it is what a lookup for a
/// missing row yields.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ResourceType {
    #[default]
    Undefined,
    Resource,
    Directory,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Undefined => "UNDEFINED",
            ResourceType::Resource => "RESOURCE",
            ResourceType::Directory => "DIRECTORY",
        }
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNDEFINED" => Ok(ResourceType::Undefined),
            "RESOURCE" => Ok(ResourceType::Resource),
            "DIRECTORY" => Ok(ResourceType::Directory),
            other => Err(Error::StorageError(format!(
                "unknown resource type {:?}",
                other
            ))),
        }
    }
}

impl ToSql for ResourceType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ResourceType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(std::io::Error::from(e))))
    }
}

/// The cached view of one row of the record table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceState {
    pub id: i64,
    pub parent_id: i64,
    pub kind: ResourceType,
    pub path: ResourcePath,
    /// Milliseconds since the unix epoch.
    pub last_modified: i64,
}

impl ResourceState {
    /// The state of a path nothing is stored at.
    pub fn undefined(path: ResourcePath) -> Self {
        Self {
            id: UNDEFINED_ID,
            parent_id: UNDEFINED_ID,
            kind: ResourceType::Undefined,
            path,
            last_modified: 0,
        }
    }

    pub fn exists(&self) -> bool {
        self.kind != ResourceType::Undefined
    }

    /// Copies the row fields of `other` into self. The path is kept, a
    /// refresh always looks up the same path.
    pub fn reset(&mut self, other: &ResourceState) {
        self.id = other.id;
        self.parent_id = other.parent_id;
        self.kind = other.kind;
        self.last_modified = other.last_modified;
    }

    /// Turns self into the undefined state for its path.
    pub fn mark_undefined(&mut self) {
        self.id = UNDEFINED_ID;
        self.parent_id = UNDEFINED_ID;
        self.kind = ResourceType::Undefined;
        self.last_modified = 0;
    }
}

/// The current wall clock time, in milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
