use std::{fmt, fs, io, path::PathBuf, sync::Arc, time::Duration};

use tracing::{debug, info, instrument, warn};

use crate::{
    cache::FileSystemCache,
    db::{Database, RecordTable},
    handle::{ResourceHandle, StateRefresher, DEFAULT_REFRESH_INTERVAL},
    ignored::IgnoredPaths,
    lock::{Lock, LockProvider, MemoryLockProvider},
    path::ResourcePath,
    record::{ResourceState, ResourceType},
    resource::{FileSystemResource, Resource},
    Error,
};

/// The hierarchical resource store.
///
/// Paths below an ignored top-level directory live in the local overlay
/// only, everything else is a row in the record table. Cloning is cheap, all
/// clones share the same database, locks and overlay.
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    records: RecordTable,
    locks: Arc<dyn LockProvider>,
    cache: FileSystemCache,
    ignored: IgnoredPaths,
    refresh_interval: Duration,
}

fn lock_name(path: &ResourcePath) -> String {
    format!("resource:{}", path)
}

impl ResourceStore {
    pub fn new(
        records: RecordTable,
        locks: Arc<dyn LockProvider>,
        cache: FileSystemCache,
        ignored: IgnoredPaths,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                records,
                locks,
                cache,
                ignored,
                refresh_interval,
            }),
        }
    }

    /// A store on a private in-memory database with a disposable overlay.
    pub fn new_temporary() -> Result<Self, Error> {
        Ok(Self::new(
            RecordTable::new(Arc::new(Database::open_in_memory()?)),
            Arc::new(MemoryLockProvider::default()),
            FileSystemCache::new_temporary()?,
            IgnoredPaths::default(),
            DEFAULT_REFRESH_INTERVAL,
        ))
    }

    pub fn records(&self) -> &RecordTable {
        &self.inner.records
    }

    pub fn cache(&self) -> &FileSystemCache {
        &self.inner.cache
    }

    pub fn ignored(&self) -> &IgnoredPaths {
        &self.inner.ignored
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    /// Returns the node at `path`. A path nothing is stored at yields a
    /// resource of type [ResourceType::Undefined], never an error.
    pub fn get(&self, path: &str) -> Result<Resource, Error> {
        self.get_path(&ResourcePath::normalize(path)?)
    }

    pub fn get_path(&self, path: &ResourcePath) -> Result<Resource, Error> {
        if self.inner.ignored.matches(path) {
            return Ok(Resource::FileSystem(FileSystemResource::new(
                self.clone(),
                path.clone(),
            )));
        }

        let state = self.inner.records.find_by_path(path)?;
        Ok(Resource::Database(self.handle(state)))
    }

    fn handle(&self, state: ResourceState) -> ResourceHandle {
        ResourceHandle::new(state, self.clone(), self.inner.refresh_interval)
    }

    /// Removes the node at `path` and everything below it.
    /// Returns false if there was nothing to remove.
    #[instrument(skip(self), err)]
    pub fn remove(&self, path: &str) -> Result<bool, Error> {
        let path = ResourcePath::normalize(path)?;
        if path.is_root() {
            return Err(Error::InvalidRequest(
                "the root directory can not be removed".to_string(),
            ));
        }

        if self.inner.ignored.matches(&path) {
            return remove_local(&self.inner.cache.local_path(&path));
        }

        let _lock = self.inner.locks.acquire(&lock_name(&path))?;
        let removed = self.inner.records.delete_subtree(&path)?;
        self.inner.cache.evict(&removed);
        debug!(rows = removed.len(), "removed");

        Ok(!removed.is_empty())
    }

    /// Moves the node at `source` with everything below it to `target`,
    /// keeping the identity of every moved row.
    ///
    /// Moving a path onto itself succeeds without doing anything. Returns
    /// false if `source` does not exist, or if one path is below the other.
    /// An existing `target` is replaced. Moving between the database and the
    /// local-only directories is not supported.
    #[instrument(skip(self), err)]
    pub fn rename(&self, source: &str, target: &str) -> Result<bool, Error> {
        let source = ResourcePath::normalize(source)?;
        let target = ResourcePath::normalize(target)?;

        if source == target {
            return Ok(true);
        }

        let source_local = self.inner.ignored.matches(&source);
        if source_local != self.inner.ignored.matches(&target) {
            return Err(Error::Unsupported(format!(
                "can not move {} to {}: one is a local-only path",
                source, target
            )));
        }

        if target.is_descendant_of(&source) || source.is_descendant_of(&target) {
            warn!("can not move a path into itself or into one of its ancestors");
            return Ok(false);
        }

        if source_local {
            return self.rename_local(&source, &target);
        }

        let (first, second) = if source < target {
            (&source, &target)
        } else {
            (&target, &source)
        };
        let _first = self.inner.locks.acquire(&lock_name(first))?;
        let _second = self.inner.locks.acquire(&lock_name(second))?;

        let Some((moved, replaced)) = self.inner.records.rename_subtree(&source, &target)? else {
            debug!("nothing to move");
            return Ok(false);
        };

        self.inner.cache.evict(&replaced);
        if moved.kind == ResourceType::Resource {
            self.inner.cache.retime(moved.id, moved.last_modified)?;
        }

        Ok(true)
    }

    fn rename_local(&self, source: &ResourcePath, target: &ResourcePath) -> Result<bool, Error> {
        let cache = &self.inner.cache;
        let from = cache.local_path(source);
        if !from.exists() {
            return Ok(false);
        }

        let to = cache.local_path(target);
        remove_local(&to)?;
        ensure_local_parent(cache, target)?;
        fs::rename(from, to)?;

        Ok(true)
    }

    /// Creates `path` as a directory, along with all missing ancestors.
    pub fn mkdirs(&self, path: &str) -> Result<Resource, Error> {
        let resource = self.get(path)?;
        resource.mkdirs()?;
        Ok(resource)
    }

    /// Lists the direct children of the directory at `path`, ordered by path.
    pub fn list(&self, path: &str) -> Result<Vec<Resource>, Error> {
        self.get(path)?.list()
    }

    /// Reads the content of the resource at `path`.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.get(path)?.read()
    }

    /// Writes `content` to the resource at `path`, creating it and its
    /// missing ancestors if needed.
    pub fn write(&self, path: &str, content: &[u8]) -> Result<Resource, Error> {
        let resource = self.get(path)?;
        resource.write(content)?;
        Ok(resource)
    }

    /// Returns a local file holding the content of the resource at `path`.
    pub fn file(&self, path: &str) -> Result<PathBuf, Error> {
        self.get(path)?.file()
    }

    /// Returns a local directory holding the tree below `path`.
    pub fn dir(&self, path: &str) -> Result<PathBuf, Error> {
        self.get(path)?.dir()
    }

    /// Re-reads the state of `handle` from the record table right away.
    /// On failure the handle is left as it was.
    pub fn update_state(&self, handle: &ResourceHandle) -> Result<(), Error> {
        let state = self.refresh(&handle.cached_state())?;
        handle.apply(&state);
        Ok(())
    }

    /// Takes the per-path lock of `path`.
    pub fn lock(&self, path: &ResourcePath) -> Result<Lock, Error> {
        self.inner.locks.acquire(&lock_name(path))
    }

    /// Runs `f` while holding the lock called `name`.
    pub fn with_lock<T>(
        &self,
        name: &str,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut lock = self.inner.locks.acquire(name)?;
        let result = f();
        let released = lock.release();

        let value = result?;
        released?;
        Ok(value)
    }

    /// Creates the default resources that don't exist yet.
    ///
    /// Several instances may start at the same time, only the first one to
    /// get the lock called `lock_name` writes. Returns the paths this call
    /// created.
    #[instrument(skip(self, defaults), err)]
    pub fn initialize_defaults<'a, I>(
        &self,
        lock_name: &str,
        defaults: I,
    ) -> Result<Vec<ResourcePath>, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let defaults = defaults
            .into_iter()
            .map(|(path, content)| Ok((ResourcePath::normalize(path)?, content)))
            .collect::<Result<Vec<_>, Error>>()?;

        let missing = |defaults: &[(ResourcePath, &'a [u8])]| -> Result<Vec<_>, Error> {
            let mut missing = Vec::new();
            for (path, content) in defaults {
                let resource = self.get_path(path)?;
                if !resource.exists() {
                    missing.push((resource, *content));
                }
            }
            Ok(missing)
        };

        if missing(&defaults)?.is_empty() {
            return Ok(vec![]);
        }

        self.with_lock(lock_name, || {
            // someone else may have been faster
            let mut created = Vec::new();
            for (resource, content) in missing(&defaults)? {
                resource.write(content)?;
                created.push(resource.path().clone());
            }
            if !created.is_empty() {
                info!(created = created.len(), "initialized default resources");
            }
            Ok(created)
        })
    }

    /// Deletes rows below ignored directories.
    ///
    /// Such rows are left over by deployments that used to replicate these
    /// directories. They are never visible through the store, this frees the
    /// space they take. Returns the number of deleted rows.
    #[instrument(skip(self), err)]
    pub fn purge_ignored_rows(&self) -> Result<usize, Error> {
        let ignored = &self.inner.ignored;
        let removed = self.inner.records.purge_paths(|path| ignored.matches(path))?;
        self.inner.cache.evict(&removed);
        info!(rows = removed.len(), "purged rows below ignored directories");

        Ok(removed.len())
    }

    /// Children of a database directory, plus the local-only directories
    /// when listing the root.
    pub(crate) fn list_handle(&self, handle: &ResourceHandle) -> Result<Vec<Resource>, Error> {
        let state = handle.state();
        if state.kind != ResourceType::Directory {
            return Ok(vec![]);
        }

        let mut children: Vec<Resource> = self
            .inner
            .records
            .children(state.id)?
            .into_iter()
            .filter(|child| !self.inner.ignored.matches(&child.path))
            .map(|child| Resource::Database(self.handle(child)))
            .collect();

        if state.path.is_root() {
            for name in self.inner.ignored.names() {
                let path = ResourcePath::root().join(name)?;
                if self.inner.cache.local_path(&path).is_dir() {
                    children.push(Resource::FileSystem(FileSystemResource::new(
                        self.clone(),
                        path,
                    )));
                }
            }
            children.sort_by(|a, b| a.path().cmp(b.path()));
        }

        Ok(children)
    }

    #[instrument(skip_all, fields(resource.path = %handle.path()), err)]
    pub(crate) fn read_handle(&self, handle: &ResourceHandle) -> Result<Vec<u8>, Error> {
        let mut state = handle.state();
        expect_resource(&state)?;

        match self.inner.cache.read(&state) {
            Ok(Some(content)) => return Ok(content),
            Ok(None) => debug!("mirror miss"),
            Err(e) => warn!(err = %e, "failed to read mirror"),
        }

        let (content, last_modified) = match self.inner.records.content(state.id)? {
            Some(content) => content,
            None => {
                // gone since the last refresh, the path may hold something else now
                handle.invalidate();
                state = handle.state();
                expect_resource(&state)?;
                self.inner.records.content(state.id)?.ok_or_else(|| {
                    Error::InvalidRequest(format!("{} was replaced while reading", state.path))
                })?
            }
        };

        let state = ResourceState {
            last_modified,
            ..state
        };
        self.mirror(&state, &content);
        handle.apply(&state);

        Ok(content)
    }

    #[instrument(
        skip_all,
        fields(resource.path = %handle.path(), content.len = content.len()),
        err
    )]
    pub(crate) fn write_handle(
        &self,
        handle: &ResourceHandle,
        content: &[u8],
    ) -> Result<(), Error> {
        let state = handle.state();

        if state.kind == ResourceType::Resource {
            if let Some(last_modified) = self.inner.records.write_content(state.id, content)? {
                let state = ResourceState {
                    last_modified,
                    ..state
                };
                self.mirror(&state, content);
                handle.apply(&state);
                return Ok(());
            }
            debug!("resource vanished, recreating it");
        }

        let _lock = self.lock(&state.path)?;
        let written = self.inner.records.upsert_resource(&state.path, content)?;
        self.mirror(&written, content);
        handle.apply(&written);

        Ok(())
    }

    pub(crate) fn mkdirs_handle(&self, handle: &ResourceHandle) -> Result<(), Error> {
        let state = handle.state();
        if state.kind == ResourceType::Directory {
            return Ok(());
        }

        let _lock = self.lock(&state.path)?;
        let created = self.inner.records.mkdirs(&state.path)?;
        handle.apply(&created);

        Ok(())
    }

    /// A mirror file of the resource, created empty if it doesn't exist.
    pub(crate) fn file_handle(&self, handle: &ResourceHandle) -> Result<PathBuf, Error> {
        let mut state = handle.state();
        if state.kind == ResourceType::Undefined {
            self.write_handle(handle, &[])?;
            state = handle.state();
        }
        expect_resource(&state)?;

        if let Some(file) = self.inner.cache.mirror_file(&state)? {
            return Ok(file);
        }
        let content = self.read_handle(handle)?;

        self.inner.cache.dump(&handle.state(), &content)
    }

    /// Materializes the directory at `handle` with everything below it
    /// under the tree directory of the overlay, and returns its location.
    ///
    /// The directory is created if it doesn't exist. Every call rebuilds the
    /// tree from the record table.
    #[instrument(skip_all, fields(resource.path = %handle.path()), err)]
    pub(crate) fn dir_handle(&self, handle: &ResourceHandle) -> Result<PathBuf, Error> {
        let _lock = self.lock(handle.path())?;

        let mut state = handle.state();
        if state.kind == ResourceType::Undefined {
            self.mkdirs_handle(handle)?;
            state = handle.state();
        }
        if state.kind != ResourceType::Directory {
            return Err(Error::TypeConflict {
                path: state.path.to_string(),
                expected: ResourceType::Directory,
                found: state.kind,
            });
        }

        let cache = &self.inner.cache;
        let tree = cache.tree_path(&state.path);
        remove_local(&tree)?;
        fs::create_dir_all(&tree)?;

        let depth = state.path.components().count();
        let mut files = 0;
        for row in self.inner.records.descendants(&state.path)? {
            if self.inner.ignored.matches(&row.path) {
                continue;
            }

            let mut dest = tree.clone();
            dest.extend(row.path.components().skip(depth));

            match row.kind {
                ResourceType::Directory => fs::create_dir_all(&dest)?,
                _ => {
                    let content = match cache.read(&row) {
                        Ok(Some(content)) => content,
                        _ => match self.inner.records.content(row.id)? {
                            Some((content, _)) => content,
                            None => continue,
                        },
                    };
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    cache.write_atomic(&dest, &content, Some(row.last_modified))?;
                    files += 1;
                }
            }
        }
        debug!(files, "materialized directory");

        Ok(tree)
    }

    /// Copies content to the mirror. The record table is authoritative, a
    /// failed copy only costs a later read from the database.
    fn mirror(&self, state: &ResourceState, content: &[u8]) {
        if let Err(e) = self.inner.cache.dump(state, content) {
            warn!(resource.id = state.id, err = %e, "failed to mirror resource content");
        }
    }

    pub(crate) fn delete_handle(&self, handle: &ResourceHandle) -> Result<bool, Error> {
        let removed = self.remove(handle.path().as_str())?;
        handle.mark_undefined();
        Ok(removed)
    }

    pub(crate) fn rename_handle(
        &self,
        handle: &ResourceHandle,
        target: &str,
    ) -> Result<bool, Error> {
        let renamed = self.rename(handle.path().as_str(), target)?;
        if renamed {
            self.update_state(handle)?;
        }
        Ok(renamed)
    }
}

impl StateRefresher for ResourceStore {
    fn refresh(&self, current: &ResourceState) -> Result<ResourceState, Error> {
        self.inner.records.find_by_path(&current.path)
    }
}

impl fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceStore")
            .field("cache", &self.inner.cache.base())
            .field("ignored", &self.inner.ignored)
            .field("refresh_interval", &self.inner.refresh_interval)
            .finish()
    }
}

fn expect_resource(state: &ResourceState) -> Result<(), Error> {
    match state.kind {
        ResourceType::Resource => Ok(()),
        ResourceType::Undefined => Err(Error::InvalidRequest(format!(
            "{} does not exist",
            state.path
        ))),
        ResourceType::Directory => Err(Error::TypeConflict {
            path: state.path.to_string(),
            expected: ResourceType::Resource,
            found: ResourceType::Directory,
        }),
    }
}

/// Removes a local file or directory tree. Returns false if there was none.
pub(crate) fn remove_local(path: &std::path::Path) -> Result<bool, Error> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    result?;

    Ok(true)
}

/// Creates the local parent directories of `path`.
/// Fails with a type conflict if one of them is a file.
pub(crate) fn ensure_local_parent(
    cache: &FileSystemCache,
    path: &ResourcePath,
) -> Result<(), Error> {
    for ancestor in path.ancestors().skip(1) {
        let local = cache.local_path(&ancestor);
        if local.is_file() {
            return Err(Error::TypeConflict {
                path: ancestor.to_string(),
                expected: ResourceType::Directory,
                found: ResourceType::Resource,
            });
        }
    }

    if let Some(parent) = cache.local_path(path).parent() {
        fs::create_dir_all(parent)?;
    }

    Ok(())
}
