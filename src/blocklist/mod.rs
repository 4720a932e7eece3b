//! Block groups and the derived suffix index.
//!
//! A [`BlockGroup`] is a named, switchable set of domains. The
//! [`BlockListIndex`] is the union of the domains of every enabled group and is
//! what the query path consults.
//!
//! # Example
//!
//! ```
//! use nullroute::blocklist::{BlockGroup, BlockListIndex};
//!
//! let groups = [
//!     BlockGroup::new("ads", ["example.com"]).enabled(true),
//!     BlockGroup::new("social", ["social.net"]),
//! ];
//! let index = BlockListIndex::rebuild(&groups);
//! assert!(index.is_blocked("ads.example.com."));
//! assert!(!index.is_blocked("social.net"));
//! ```

pub mod hosts;
pub mod manager;

use std::collections::HashSet;

use serde::Deserialize;

pub use manager::{BlocklistManager, ManagerError, SharedIndex};

/// A named set of domains that can be switched on and off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockGroup {
    /// Group name. Filled from the configuration table key.
    #[serde(skip)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, alias = "on")]
    pub enabled: bool,

    /// Also mirror the domains into the OS hosts file.
    #[serde(default, alias = "kernel")]
    pub managed_at_kernel_level: bool,

    #[serde(default, alias = "hosts")]
    pub domains: Vec<String>,
}

impl BlockGroup {
    /// Create a disabled group with the given domains.
    pub fn new<I, S>(name: impl Into<String>, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            domains: domains.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn kernel(mut self, managed: bool) -> Self {
        self.managed_at_kernel_level = managed;
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Set of blocked domain suffixes.
///
/// Matching is plain string suffix matching: `notexample.com` is blocked by
/// `example.com`. Suffixes are stored lowercase without a trailing dot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockListIndex {
    suffixes: HashSet<String>,
}

impl BlockListIndex {
    /// Union the domains of every enabled group.
    ///
    /// Blank entries are skipped since an empty suffix matches every name.
    pub fn rebuild<'a, I>(groups: I) -> Self
    where
        I: IntoIterator<Item = &'a BlockGroup>,
    {
        Self::from_suffixes(
            groups
                .into_iter()
                .filter(|group| group.enabled)
                .flat_map(|group| group.domains.iter()),
        )
    }

    /// Build an index directly from suffixes.
    pub fn from_suffixes<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = suffixes
            .into_iter()
            .filter_map(|suffix| normalize(suffix.as_ref()))
            .collect();

        Self { suffixes }
    }

    /// Check if a query name is blocked.
    #[inline]
    pub fn is_blocked(&self, name: &str) -> bool {
        self.matching_suffix(name).is_some()
    }

    /// Return the suffix that blocks `name`, if any.
    pub fn matching_suffix(&self, name: &str) -> Option<&str> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        self.suffixes
            .iter()
            .find(|suffix| name.ends_with(suffix.as_str()))
            .map(String::as_str)
    }

    #[inline]
    pub fn contains(&self, suffix: &str) -> bool {
        normalize(suffix).is_some_and(|suffix| self.suffixes.contains(&suffix))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.suffixes.iter().map(String::as_str)
    }
}

fn normalize(suffix: &str) -> Option<String> {
    let suffix = suffix.trim().trim_end_matches('.');
    if suffix.is_empty() {
        None
    } else {
        Some(suffix.to_ascii_lowercase())
    }
}
