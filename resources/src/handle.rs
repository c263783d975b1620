use std::{
    fmt,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    path::ResourcePath,
    record::{ResourceState, ResourceType},
    store::ResourceStore,
    Error,
};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Produces the current state of a path from the backing storage.
pub trait StateRefresher: Send + Sync {
    /// Returns the state the record table currently holds for
    /// `current.path`, or the undefined state if there is no row.
    fn refresh(&self, current: &ResourceState) -> Result<ResourceState, Error>;
}

struct Cached {
    state: ResourceState,
    /// None if the state needs to be refreshed on next observation.
    last_checked: Option<Instant>,
}

/// A caller-held view of one database-backed path.
///
/// The handle caches the row state and re-reads it through its store at most
/// once per `refresh_interval`. Handles for the same path are independent of
/// each other, they only converge through the record table.
pub struct ResourceHandle<S = ResourceStore> {
    path: ResourcePath,
    cached: Mutex<Cached>,
    refresh_interval: Duration,
    store: S,
}

impl<S: StateRefresher> ResourceHandle<S> {
    /// Creates a handle from a state that was just read.
    pub fn new(state: ResourceState, store: S, refresh_interval: Duration) -> Self {
        Self {
            path: state.path.clone(),
            cached: Mutex::new(Cached {
                state,
                last_checked: Some(Instant::now()),
            }),
            refresh_interval,
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Re-reads the state if the last check is older than the refresh
    /// interval.
    ///
    /// A failing refresh is logged and leaves the cached state as it was, the
    /// next observation tries again.
    pub fn update_state_if_stale(&self) {
        let mut cached = self.cached.lock();
        let fresh = cached
            .last_checked
            .is_some_and(|checked| checked.elapsed() < self.refresh_interval);
        if fresh {
            return;
        }

        match self.store.refresh(&cached.state) {
            Ok(state) => {
                if state.kind != cached.state.kind {
                    debug!(
                        resource.path = %self.path,
                        from = %cached.state.kind,
                        to = %state.kind,
                        "resource changed type"
                    );
                }
                cached.state.reset(&state);
                cached.last_checked = Some(Instant::now());
            }
            Err(e) => {
                warn!(resource.path = %self.path, err = %e, "failed to refresh resource state");
            }
        }
    }

    /// Replaces the cached state with one that was just read or written.
    pub fn apply(&self, state: &ResourceState) {
        let mut cached = self.cached.lock();
        cached.state.reset(state);
        cached.last_checked = Some(Instant::now());
    }

    /// Records that the path was just removed.
    pub fn mark_undefined(&self) {
        let mut cached = self.cached.lock();
        cached.state.mark_undefined();
        cached.last_checked = Some(Instant::now());
    }

    /// Forces a refresh on the next observation.
    pub fn invalidate(&self) {
        self.cached.lock().last_checked = None;
    }

    /// A copy of the (refreshed if stale) state.
    pub fn state(&self) -> ResourceState {
        self.update_state_if_stale();
        self.cached.lock().state.clone()
    }

    /// The state as cached, without refreshing it.
    pub fn cached_state(&self) -> ResourceState {
        self.cached.lock().state.clone()
    }

    pub fn kind(&self) -> ResourceType {
        self.state().kind
    }

    pub fn last_modified(&self) -> i64 {
        self.state().last_modified
    }

    pub fn id(&self) -> i64 {
        self.state().id
    }

    pub fn parent_id(&self) -> i64 {
        self.state().parent_id
    }

    pub fn exists(&self) -> bool {
        self.kind() != ResourceType::Undefined
    }

    pub fn is_file(&self) -> bool {
        self.kind() == ResourceType::Resource
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == ResourceType::Directory
    }

    pub fn is_undefined(&self) -> bool {
        self.kind() == ResourceType::Undefined
    }
}

impl<S: Clone> Clone for ResourceHandle<S> {
    fn clone(&self) -> Self {
        let cached = self.cached.lock();
        Self {
            path: self.path.clone(),
            cached: Mutex::new(Cached {
                state: cached.state.clone(),
                last_checked: cached.last_checked,
            }),
            refresh_interval: self.refresh_interval,
            store: self.store.clone(),
        }
    }
}

impl<S> fmt::Debug for ResourceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cached.lock();
        f.debug_struct("ResourceHandle")
            .field("state", &cached.state)
            .field("last_checked", &cached.last_checked)
            .finish()
    }
}
