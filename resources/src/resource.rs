use std::{fs, io, path::PathBuf};

use crate::{
    cache::millis,
    handle::ResourceHandle,
    lock::Lock,
    path::ResourcePath,
    record::ResourceType,
    store::{ensure_local_parent, remove_local, ResourceStore},
    Error,
};

/// A node of the store, as handed out to callers.
///
/// Paths below an ignored directory are [Resource::FileSystem], backed by the
/// local overlay only. Everything else is a [Resource::Database] handle.
#[derive(Clone, Debug)]
pub enum Resource {
    Database(ResourceHandle),
    FileSystem(FileSystemResource),
}

impl Resource {
    fn store(&self) -> &ResourceStore {
        match self {
            Resource::Database(handle) => handle.store(),
            Resource::FileSystem(resource) => &resource.store,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        match self {
            Resource::Database(handle) => handle.path(),
            Resource::FileSystem(resource) => &resource.path,
        }
    }

    pub fn name(&self) -> &str {
        self.path().name()
    }

    pub fn kind(&self) -> ResourceType {
        match self {
            Resource::Database(handle) => handle.kind(),
            Resource::FileSystem(resource) => resource.kind(),
        }
    }

    /// Milliseconds since the unix epoch, 0 if the resource doesn't exist.
    pub fn last_modified(&self) -> i64 {
        match self {
            Resource::Database(handle) => handle.last_modified(),
            Resource::FileSystem(resource) => resource.last_modified(),
        }
    }

    pub fn exists(&self) -> bool {
        self.kind() != ResourceType::Undefined
    }

    pub fn is_filesystem_only(&self) -> bool {
        matches!(self, Resource::FileSystem(_))
    }

    /// The containing directory. None for the root.
    pub fn parent(&self) -> Result<Option<Resource>, Error> {
        self.path()
            .parent()
            .map(|parent| self.store().get_path(&parent))
            .transpose()
    }

    /// The node at the relative path `child` below this one.
    pub fn get(&self, child: &str) -> Result<Resource, Error> {
        self.store().get_path(&self.path().join(child)?)
    }

    /// The direct children, ordered by path. Empty unless this is a directory.
    pub fn list(&self) -> Result<Vec<Resource>, Error> {
        match self {
            Resource::Database(handle) => handle.store().list_handle(handle),
            Resource::FileSystem(resource) => resource.list(),
        }
    }

    pub fn read(&self) -> Result<Vec<u8>, Error> {
        match self {
            Resource::Database(handle) => handle.store().read_handle(handle),
            Resource::FileSystem(resource) => resource.read(),
        }
    }

    /// Replaces the content, creating the resource and its ancestors if
    /// needed.
    pub fn write(&self, content: &[u8]) -> Result<(), Error> {
        match self {
            Resource::Database(handle) => handle.store().write_handle(handle, content),
            Resource::FileSystem(resource) => resource.write(content),
        }
    }

    pub fn mkdirs(&self) -> Result<(), Error> {
        match self {
            Resource::Database(handle) => handle.store().mkdirs_handle(handle),
            Resource::FileSystem(resource) => resource.mkdirs(),
        }
    }

    /// Removes the resource, or the directory with everything below it.
    pub fn delete(&self) -> Result<bool, Error> {
        match self {
            Resource::Database(handle) => handle.store().delete_handle(handle),
            Resource::FileSystem(resource) => resource.delete(),
        }
    }

    /// Moves this node to `target`, see [ResourceStore::rename].
    pub fn rename_to(&self, target: &str) -> Result<bool, Error> {
        match self {
            Resource::Database(handle) => handle.store().rename_handle(handle, target),
            Resource::FileSystem(resource) => {
                resource.store.rename(resource.path.as_str(), target)
            }
        }
    }

    /// A local file holding the content, created empty if the resource
    /// doesn't exist yet.
    ///
    /// For database-backed resources this is a copy, changes to it are not
    /// written back.
    pub fn file(&self) -> Result<PathBuf, Error> {
        match self {
            Resource::Database(handle) => handle.store().file_handle(handle),
            Resource::FileSystem(resource) => resource.file(),
        }
    }

    /// A local directory holding this directory with everything below it,
    /// created if the directory doesn't exist yet.
    ///
    /// For database-backed directories this is a copy taken now, changes to
    /// it are not written back.
    pub fn dir(&self) -> Result<PathBuf, Error> {
        match self {
            Resource::Database(handle) => handle.store().dir_handle(handle),
            Resource::FileSystem(resource) => resource.dir(),
        }
    }

    /// Takes the lock serializing structural changes of this path.
    pub fn lock(&self) -> Result<Lock, Error> {
        self.store().lock(self.path())
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.is_filesystem_only() == other.is_filesystem_only()
            && self.path() == other.path()
            && self.kind() == other.kind()
    }
}

/// A node below an ignored directory, stored in the local overlay of this
/// instance only.
#[derive(Clone, Debug)]
pub struct FileSystemResource {
    store: ResourceStore,
    path: ResourcePath,
}

impl FileSystemResource {
    pub fn new(store: ResourceStore, path: ResourcePath) -> Self {
        Self { store, path }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Where this node lives on disk.
    pub fn local_path(&self) -> PathBuf {
        self.store.cache().local_path(&self.path)
    }

    fn metadata(&self) -> Option<fs::Metadata> {
        fs::metadata(self.local_path()).ok()
    }

    pub fn kind(&self) -> ResourceType {
        match self.metadata() {
            Some(metadata) if metadata.is_dir() => ResourceType::Directory,
            Some(_) => ResourceType::Resource,
            None => ResourceType::Undefined,
        }
    }

    pub fn last_modified(&self) -> i64 {
        self.metadata()
            .and_then(|metadata| metadata.modified().ok())
            .map(millis)
            .unwrap_or_default()
    }

    fn conflict(&self, expected: ResourceType, found: ResourceType) -> Error {
        Error::TypeConflict {
            path: self.path.to_string(),
            expected,
            found,
        }
    }

    pub fn list(&self) -> Result<Vec<Resource>, Error> {
        let entries = match fs::read_dir(self.local_path()) {
            Ok(entries) => entries,
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || self.kind() != ResourceType::Directory =>
            {
                return Ok(vec![])
            }
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            // names that aren't valid path components can't be addressed
            let Some(child) = entry
                .file_name()
                .to_str()
                .and_then(|name| self.path.join(name).ok())
            else {
                continue;
            };
            children.push(Resource::FileSystem(Self::new(self.store.clone(), child)));
        }
        children.sort_by(|a, b| a.path().cmp(b.path()));

        Ok(children)
    }

    pub fn read(&self) -> Result<Vec<u8>, Error> {
        match self.kind() {
            ResourceType::Resource => Ok(fs::read(self.local_path())?),
            ResourceType::Directory => {
                Err(self.conflict(ResourceType::Resource, ResourceType::Directory))
            }
            ResourceType::Undefined => Err(Error::InvalidRequest(format!(
                "{} does not exist",
                self.path
            ))),
        }
    }

    pub fn write(&self, content: &[u8]) -> Result<(), Error> {
        if self.kind() == ResourceType::Directory {
            return Err(self.conflict(ResourceType::Resource, ResourceType::Directory));
        }

        let cache = self.store.cache();
        ensure_local_parent(cache, &self.path)?;
        cache.write_atomic(&self.local_path(), content, None)
    }

    pub fn mkdirs(&self) -> Result<(), Error> {
        match self.kind() {
            ResourceType::Directory => Ok(()),
            ResourceType::Resource => {
                Err(self.conflict(ResourceType::Directory, ResourceType::Resource))
            }
            ResourceType::Undefined => {
                ensure_local_parent(self.store.cache(), &self.path)?;
                Ok(fs::create_dir_all(self.local_path())?)
            }
        }
    }

    pub fn file(&self) -> Result<PathBuf, Error> {
        match self.kind() {
            ResourceType::Resource => Ok(self.local_path()),
            ResourceType::Directory => {
                Err(self.conflict(ResourceType::Resource, ResourceType::Directory))
            }
            ResourceType::Undefined => {
                self.write(&[])?;
                Ok(self.local_path())
            }
        }
    }

    pub fn dir(&self) -> Result<PathBuf, Error> {
        self.mkdirs()?;
        Ok(self.local_path())
    }

    pub fn delete(&self) -> Result<bool, Error> {
        remove_local(&self.local_path())
    }
}
