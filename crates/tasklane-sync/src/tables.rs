//! Mapping from local table names to remote tables.
//!
//! With no aliases configured every well-formed local name maps to itself.
//! Once aliases exist the map is closed: only listed tables are uploaded
//! (list `tasks=tasks` to keep an identity mapping).

use std::collections::BTreeMap;
use tasklane_core::Config;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMap {
    aliases: BTreeMap<String, String>,
}

impl TableMap {
    /// Identity mapping for every valid table name.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Closed mapping from `(local, remote)` pairs. Later pairs win.
    #[must_use]
    pub fn with_aliases<I, L, R>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (L, R)>,
        L: Into<String>,
        R: Into<String>,
    {
        Self {
            aliases: pairs
                .into_iter()
                .map(|(local, remote)| (local.into(), remote.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::with_aliases(config.table_aliases.iter().cloned())
    }

    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Remote table for `local`, or `None` when it must not be uploaded.
    #[must_use]
    pub fn resolve<'a>(&'a self, local: &'a str) -> Option<&'a str> {
        let remote = if self.aliases.is_empty() {
            local
        } else {
            self.aliases.get(local)?.as_str()
        };
        is_valid_table_name(remote).then_some(remote)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, the names that are safe as a URL path segment.
fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_maps_valid_names_to_themselves() {
        let map = TableMap::passthrough();
        assert_eq!(map.resolve("tasks"), Some("tasks"));
        assert_eq!(map.resolve("task_groups"), Some("task_groups"));
        assert_eq!(map.resolve(""), None);
        assert_eq!(map.resolve("../admin"), None);
        assert_eq!(map.resolve("1tasks"), None);
    }

    #[test]
    fn aliases_close_the_map() {
        let map = TableMap::with_aliases([("todo", "tasks"), ("lane", "columns")]);
        assert_eq!(map.resolve("todo"), Some("tasks"));
        assert_eq!(map.resolve("lane"), Some("columns"));
        assert_eq!(map.resolve("tasks"), None);
        assert!(!map.is_passthrough());
    }

    #[test]
    fn invalid_alias_targets_are_unresolved() {
        let map = TableMap::with_aliases([("todo", "tasks?select=*")]);
        assert_eq!(map.resolve("todo"), None);
    }
}
