mod errors;

pub mod cache;
pub mod config;
pub mod db;
pub mod handle;
pub mod ignored;
pub mod lock;
pub mod path;
pub mod record;
pub mod resource;
pub mod store;

pub use config::{from_addr, ResourceStoreConfig};
pub use errors::Error;
pub use handle::{ResourceHandle, StateRefresher};
pub use lock::{Lock, LockProvider};
pub use path::ResourcePath;
pub use record::{ResourceState, ResourceType, ROOT_ID, UNDEFINED_ID};
pub use resource::{FileSystemResource, Resource};
pub use store::ResourceStore;

#[cfg(test)]
mod tests;

// https://github.com/la10736/rstest/tree/master/rstest_reuse#use-rstest_reuse-at-the-top-of-your-crate
#[cfg(test)]
#[allow(clippy::single_component_path_imports)]
use rstest_reuse;
