//! The local disk overlay of a store instance.
//!
//! The base directory holds these subdirectories:
//!  - `local/` is the root of the paths that never reach the database,
//!  - `mirror/` holds copies of database content, keyed by row id and sharded
//!    like `mirror/<id & 0xff in hex>/<id>`,
//!  - `tree/` holds directories materialized as a whole, by path,
//!  - `tmp/` stages every write before it's moved into place.
//!
//! Mirror files carry the row's mtime as their modification time, a mirror
//! file whose mtime differs from the row's is ignored.
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, instrument, warn};

use crate::{path::ResourcePath, record::ResourceState, Error};

#[derive(Clone)]
pub struct FileSystemCache {
    base: PathBuf,
    // Keeps a disposable base directory alive as long as any clone is.
    _temp: Option<Arc<TempDir>>,
}

impl FileSystemCache {
    /// Uses (and creates if needed) the directory at `base`.
    pub fn new(base: PathBuf) -> Result<Self, Error> {
        if base == Path::new("/") {
            return Err(Error::InvalidRequest(
                "cowardly refusing to use / as cache directory".to_string(),
            ));
        }

        for dir in ["local", "mirror", "tree", "tmp"] {
            fs::create_dir_all(base.join(dir))?;
        }

        Ok(Self { base, _temp: None })
    }

    /// Uses a fresh temporary directory, removed once the last clone is dropped.
    pub fn new_temporary() -> Result<Self, Error> {
        let temp = TempDir::new()?;
        let mut cache = Self::new(temp.path().to_owned())?;
        cache._temp = Some(Arc::new(temp));

        Ok(cache)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Where the local-only node at `path` lives.
    pub fn local_path(&self, path: &ResourcePath) -> PathBuf {
        let mut local = self.base.join("local");
        local.extend(path.components());
        local
    }

    /// Where the materialized copy of the directory at `path` lives.
    pub fn tree_path(&self, path: &ResourcePath) -> PathBuf {
        let mut tree = self.base.join("tree");
        tree.extend(path.components());
        tree
    }

    /// Where the mirrored content of row `id` lives.
    pub fn mirror_path(&self, id: i64) -> PathBuf {
        self.base
            .join("mirror")
            .join(format!("{:02x}", id & 0xff))
            .join(id.to_string())
    }

    /// Writes `content` to `dest`, replacing it atomically.
    /// If `mtime` is set, the file gets it as modification time.
    pub fn write_atomic(
        &self,
        dest: &Path,
        content: &[u8],
        mtime: Option<i64>,
    ) -> Result<(), Error> {
        let mut file = NamedTempFile::new_in(self.base.join("tmp"))?;
        file.write_all(content)?;
        if let Some(mtime) = mtime {
            file.as_file().set_modified(system_time(mtime))?;
        }
        file.persist(dest)?;

        Ok(())
    }

    /// Stores the content of the row described by `state` in the mirror.
    #[instrument(skip_all, fields(resource.id = state.id, resource.path = %state.path), err)]
    pub fn dump(&self, state: &ResourceState, content: &[u8]) -> Result<PathBuf, Error> {
        let dest = self.mirror_path(state.id);
        if let Some(shard) = dest.parent() {
            fs::create_dir_all(shard)?;
        }
        self.write_atomic(&dest, content, Some(state.last_modified))?;

        Ok(dest)
    }

    /// Returns the mirror file of `state` if it holds the content of exactly
    /// that version of the row.
    pub fn mirror_file(&self, state: &ResourceState) -> Result<Option<PathBuf>, Error> {
        let path = self.mirror_path(state.id);
        let modified = match fs::metadata(&path) {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if millis(modified) != state.last_modified {
            debug!(resource.id = state.id, "mirror is outdated");
            return Ok(None);
        }

        Ok(Some(path))
    }

    /// Reads mirrored content, if the mirror is up to date.
    pub fn read(&self, state: &ResourceState) -> Result<Option<Vec<u8>>, Error> {
        match self.mirror_file(state)? {
            Some(path) => match fs::read(path) {
                Ok(content) => Ok(Some(content)),
                // evicted in between
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            None => Ok(None),
        }
    }

    /// Moves the modification time of a mirror file to `mtime`, keeping a
    /// mirror valid across a rename of its row.
    pub fn retime(&self, id: i64, mtime: i64) -> Result<(), Error> {
        match fs::File::options().write(true).open(self.mirror_path(id)) {
            Ok(file) => Ok(file.set_modified(system_time(mtime))?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops the mirrored content of removed rows.
    pub fn evict(&self, ids: &[i64]) {
        for id in ids {
            match fs::remove_file(self.mirror_path(*id)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(resource.id = id, err = %e, "failed to evict mirror file"),
            }
        }
    }
}

fn system_time(mtime: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(mtime.max(0) as u64)
}

/// Milliseconds since the unix epoch, clamped to it.
pub(crate) fn millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
