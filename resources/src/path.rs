//! Contains data structures to deal with paths in the resource store.
//!
//! Paths are always relative, use `/` as separator and never carry a leading
//! or trailing slash. The empty path addresses the root directory.
use std::{
    borrow::Borrow,
    fmt::{self, Debug, Display},
    str::FromStr,
};

use crate::Error;

/// Checks a single path component.
/// Disallows the empty string, `.`, `..`, slashes, backslashes and null bytes.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// Represents a validated, owned path in the resource store.
#[derive(Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourcePath {
    inner: String,
}

impl ResourcePath {
    /// The path of the root directory.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a caller supplied path.
    ///
    /// A single leading and a single trailing slash are stripped, so `/a/b/`
    /// and `a/b` address the same node. Every remaining component must be a
    /// valid name.
    pub fn normalize(path: &str) -> Result<Self, Error> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

        if !trimmed.is_empty() {
            if let Some(component) = trimmed.split('/').find(|c| !is_valid_name(c)) {
                return Err(Error::InvalidRequest(format!(
                    "invalid path {:?}: bad component {:?}",
                    path, component
                )));
            }
        }

        Ok(Self {
            inner: trimmed.to_owned(),
        })
    }

    /// Wraps a path read back from the record table, without validating it.
    pub(crate) fn from_trusted(inner: String) -> Self {
        Self { inner }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the path without its final component, if there is one.
    ///
    /// Note that the parent of a bare name is the root, and the root is the
    /// only path without a parent.
    pub fn parent(&self) -> Option<ResourcePath> {
        if self.inner.is_empty() {
            return None;
        }

        Some(match self.inner.rsplit_once('/') {
            Some((parent, _name)) => Self::from_trusted(parent.to_owned()),
            None => Self::root(),
        })
    }

    /// Returns the final component, or the empty string for the root.
    pub fn name(&self) -> &str {
        self.inner
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.inner)
    }

    /// Creates a new path with the (possibly multi-component) relative
    /// `child` adjoined to self.
    pub fn join(&self, child: &str) -> Result<ResourcePath, Error> {
        let child = Self::normalize(child)?;
        if child.is_root() {
            return Ok(self.clone());
        }
        if self.is_root() {
            return Ok(child);
        }

        Ok(Self::from_trusted(format!("{}/{}", self.inner, child.inner)))
    }

    /// Provides an iterator over the components of the path.
    /// The root yields nothing.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.inner.split('/').filter(|c| !c.is_empty())
    }

    /// Provides an iterator over all proper ancestors, starting at the root.
    pub fn ancestors(&self) -> impl Iterator<Item = ResourcePath> + '_ {
        (!self.is_root()).then(Self::root).into_iter().chain(
            self.inner
                .match_indices('/')
                .map(|(idx, _)| Self::from_trusted(self.inner[..idx].to_owned())),
        )
    }

    /// Whether self is strictly below `ancestor`.
    /// Every path but the root is a descendant of the root.
    pub fn is_descendant_of(&self, ancestor: &ResourcePath) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }

        self.inner
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// The prefix all descendants of self start with.
    pub(crate) fn descendant_prefix(&self) -> String {
        if self.is_root() {
            String::new()
        } else {
            format!("{}/", self.inner)
        }
    }
}

impl Debug for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl AsRef<str> for ResourcePath {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl Borrow<str> for ResourcePath {
    fn borrow(&self) -> &str {
        &self.inner
    }
}

impl FromStr for ResourcePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<ResourcePath, Self::Err> {
        Self::normalize(s)
    }
}

impl TryFrom<&str> for ResourcePath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::normalize(value)
    }
}
