//! Block group manager with atomic index publication.
//!
//! Query handlers hold a [`SharedIndex`] and load the current
//! [`BlockListIndex`] once per query. Every group change builds a complete new
//! index and swaps it in, so a handler never observes a half-built set.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use super::{BlockGroup, BlockListIndex};

/// Atomically replaceable handle to the current index.
pub type SharedIndex = Arc<ArcSwap<BlockListIndex>>;

/// Error type for block group manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Group with the given name was not found.
    #[error("unknown block group: {0:?}")]
    UnknownGroup(String),
}

/// Owns the block groups and publishes the derived index.
///
/// # Example
///
/// ```
/// use nullroute::blocklist::{BlockGroup, BlocklistManager};
///
/// let manager = BlocklistManager::new([BlockGroup::new("ads", ["ads.net"])]);
/// let index = manager.index();
/// assert!(!index.load().is_blocked("ads.net"));
///
/// manager.set_group_enabled("ads", true).unwrap();
/// assert!(index.load().is_blocked("ads.net"));
/// ```
pub struct BlocklistManager {
    groups: RwLock<BTreeMap<String, BlockGroup>>,
    index: SharedIndex,
}

impl BlocklistManager {
    /// Create a manager and build the initial index.
    pub fn new<I>(groups: I) -> Self
    where
        I: IntoIterator<Item = BlockGroup>,
    {
        let groups: BTreeMap<String, BlockGroup> = groups
            .into_iter()
            .map(|group| (group.name.clone(), group))
            .collect();
        let index = BlockListIndex::rebuild(groups.values());

        tracing::info!(
            groups = groups.len(),
            suffixes = index.len(),
            "built block list index"
        );

        Self {
            groups: RwLock::new(groups),
            index: Arc::new(ArcSwap::from_pointee(index)),
        }
    }

    /// Shared handle for query handlers.
    #[must_use]
    pub fn index(&self) -> SharedIndex {
        Arc::clone(&self.index)
    }

    /// The index currently published.
    #[must_use]
    pub fn current(&self) -> Arc<BlockListIndex> {
        self.index.load_full()
    }

    /// Enable or disable a group and republish the index.
    ///
    /// Returns whether the flag actually changed.
    pub fn set_group_enabled(&self, name: &str, enabled: bool) -> Result<bool, ManagerError> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownGroup(name.to_string()))?;

        if group.enabled == enabled {
            return Ok(false);
        }
        group.enabled = enabled;
        tracing::info!(group = %name, enabled, "block group toggled");

        self.publish(&groups);
        Ok(true)
    }

    /// Flip a group and return its new state.
    pub fn toggle_group(&self, name: &str) -> Result<bool, ManagerError> {
        let mut groups = self.groups.write();
        let group = groups
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownGroup(name.to_string()))?;

        group.enabled = !group.enabled;
        let enabled = group.enabled;
        tracing::info!(group = %name, enabled, "block group toggled");

        self.publish(&groups);
        Ok(enabled)
    }

    /// Replace every group, as after a configuration reload.
    pub fn replace_groups<I>(&self, groups: I)
    where
        I: IntoIterator<Item = BlockGroup>,
    {
        let mut current = self.groups.write();
        *current = groups
            .into_iter()
            .map(|group| (group.name.clone(), group))
            .collect();
        self.publish(&current);
    }

    /// Copy of a single group.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<BlockGroup> {
        self.groups.read().get(name).cloned()
    }

    /// Copy of all groups, ordered by name.
    #[must_use]
    pub fn groups(&self) -> Vec<BlockGroup> {
        self.groups.read().values().cloned().collect()
    }

    // Called with the groups write lock held so concurrent toggles publish in order.
    fn publish(&self, groups: &BTreeMap<String, BlockGroup>) {
        let index = BlockListIndex::rebuild(groups.values());
        tracing::info!(suffixes = index.len(), "rebuilt block list index");
        self.index.store(Arc::new(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BlocklistManager {
        BlocklistManager::new([
            BlockGroup::new("ads", ["ads.net", "example.com"]).enabled(true),
            BlockGroup::new("social", ["social.net"]),
        ])
    }

    #[test]
    fn should_build_initial_index_from_enabled_groups() {
        let manager = manager();

        let index = manager.current();
        assert_eq!(index.len(), 2);
        assert!(index.is_blocked("ads.example.com"));
        assert!(!index.is_blocked("social.net"));
    }

    #[test]
    fn should_publish_new_index_when_group_enabled() {
        let manager = manager();
        let shared = manager.index();

        assert!(manager.set_group_enabled("social", true).unwrap());

        assert!(shared.load().is_blocked("www.social.net"));
        assert_eq!(shared.load().len(), 3);
    }

    #[test]
    fn should_report_unchanged_when_flag_already_set() {
        let manager = manager();
        let before = manager.current();

        assert!(!manager.set_group_enabled("ads", true).unwrap());
        assert!(Arc::ptr_eq(&before, &manager.current()));
    }

    #[test]
    fn should_restore_exact_index_after_toggle_off_and_on() {
        let manager = manager();
        let before = manager.current();

        assert!(!manager.toggle_group("ads").unwrap());
        assert!(manager.current().is_empty());

        assert!(manager.toggle_group("ads").unwrap());
        assert_eq!(*manager.current(), *before);
    }

    #[test]
    fn should_keep_old_snapshot_alive_for_existing_readers() {
        let manager = manager();
        let held = manager.current();

        manager.set_group_enabled("ads", false).unwrap();

        assert!(held.is_blocked("ads.net"));
        assert!(!manager.current().is_blocked("ads.net"));
    }

    #[test]
    fn should_return_error_for_unknown_group() {
        let manager = manager();

        let result = manager.set_group_enabled("nope", true);
        assert!(matches!(result, Err(ManagerError::UnknownGroup(_))));
        assert!(matches!(
            manager.toggle_group("nope"),
            Err(ManagerError::UnknownGroup(_))
        ));
    }

    #[test]
    fn should_replace_all_groups() {
        let manager = manager();

        manager.replace_groups([BlockGroup::new("video", ["video.tv"]).enabled(true)]);

        assert_eq!(manager.groups().len(), 1);
        assert!(manager.group("ads").is_none());
        assert!(manager.current().is_blocked("cdn.video.tv"));
        assert!(!manager.current().is_blocked("ads.net"));
    }

    #[test]
    fn should_not_lose_concurrent_toggles() {
        let manager = manager();
        let before = manager.current();

        // even number of flips per thread, so the group ends where it started
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        manager.toggle_group("social").unwrap();
                    }
                });
            }
        });

        assert!(!manager.group("social").unwrap().enabled);
        assert_eq!(*manager.current(), *before);
    }
}
