use std::collections::BTreeSet;

use crate::{path::is_valid_name, path::ResourcePath, Error};

/// Top-level directories kept out of the record table by default.
pub const DEFAULT_IGNORED_DIRECTORIES: [&str; 5] = ["temp", "tmp", "legendsamples", "data", "logs"];

/// Routes whole top-level subtrees away from the record table.
///
/// A path matches if its first component is one of the configured names.
/// The root never matches.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IgnoredPaths {
    names: BTreeSet<String>,
}

impl IgnoredPaths {
    pub fn new<I, S>(names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref().trim();
                if !is_valid_name(name) {
                    return Err(Error::InvalidRequest(format!(
                        "invalid ignored directory name {:?}",
                        name
                    )));
                }
                Ok(name.to_owned())
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { names })
    }

    pub fn matches(&self, path: &ResourcePath) -> bool {
        path.components()
            .next()
            .is_some_and(|first| self.names.contains(first))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for IgnoredPaths {
    fn default() -> Self {
        Self {
            names: DEFAULT_IGNORED_DIRECTORIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
