use crate::error::MfsError;
use crate::inum::InodeNumber;
use crate::mfs::Mfs;
use crate::mnode::LinkRef;
use alloc::collections::BTreeMap;
use alloc::collections::btree_map::Entry;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_sync::SpinLock;

/// Directory contents: names to inode numbers. Every entry owns one link of
/// the node it names.
pub struct MDir {
    entries: SpinLock<BTreeMap<String, InodeNumber>>,
}

impl MDir {
    pub(crate) const fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Adds `name`, taking over `link`.
    ///
    /// # Errors
    /// [`MfsError::Exists`] if `name` is taken; `link` is released.
    pub fn insert(&self, name: &str, link: LinkRef) -> Result<(), MfsError> {
        let inum = link.inum();
        let inserted = self
            .entries
            .with_lock(|entries| match entries.entry(name.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(inum);
                    true
                }
                Entry::Occupied(_) => false,
            });
        if !inserted {
            return Err(MfsError::Exists(name.to_string()));
        }
        let _ = link.commit();
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<InodeNumber> {
        self.entries.with_lock(|entries| entries.get(name).copied())
    }

    /// Removes `name` and releases the link it held.
    ///
    /// The target is resolved first; if that fails the entry stays.
    ///
    /// # Errors
    /// [`MfsError::NoEntry`] if `name` is absent, or whatever loading the
    /// target from `fs` reports.
    pub fn remove(&self, fs: &Arc<Mfs>, name: &str) -> Result<InodeNumber, MfsError> {
        loop {
            let inum = self
                .lookup(name)
                .ok_or_else(|| MfsError::NoEntry(name.to_string()))?;
            let node = fs.get(inum)?;
            let removed = self.entries.with_lock(|entries| {
                if entries.get(name) != Some(&inum) {
                    return false;
                }
                entries.remove(name);
                true
            });
            if removed {
                node.unlink();
                return Ok(inum);
            }
            // renamed over meanwhile
        }
    }

    /// Entry names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries
            .with_lock(|entries| entries.keys().cloned().collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.with_lock(|entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for MDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MDir").field("entries", &self.len()).finish()
    }
}
