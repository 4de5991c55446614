//! Inode to path mapping.
//!
//! The kernel addresses nodes by `u64` inode while the core works on paths;
//! this table bridges the two. Entries carry the kernel's lookup count and
//! are dropped when it reaches zero via `forget`. The root is inode 1,
//! preinstalled and never dropped.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub const ROOT_INODE: u64 = 1;

struct Entry {
    path: String,
    nlookup: u64,
}

#[derive(Default)]
struct Maps {
    by_ino: HashMap<u64, Entry>,
    by_path: HashMap<String, u64>,
}

pub struct InodeTable {
    next: AtomicU64,
    maps: RwLock<Maps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut maps = Maps::default();
        maps.by_ino.insert(
            ROOT_INODE,
            Entry {
                path: "/".to_string(),
                nlookup: 1,
            },
        );
        maps.by_path.insert("/".to_string(), ROOT_INODE);
        Self {
            next: AtomicU64::new(ROOT_INODE + 1),
            maps: RwLock::new(maps),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.maps
            .read()
            .unwrap()
            .by_ino
            .get(&ino)
            .map(|e| e.path.clone())
    }

    /// Inode for a path, allocating one if the path is new. Does not touch
    /// the lookup count; use it for listing inode numbers.
    pub fn assign(&self, path: &str) -> u64 {
        if path == "/" {
            return ROOT_INODE;
        }
        let mut maps = self.maps.write().unwrap();
        if let Some(ino) = maps.by_path.get(path) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        maps.by_ino.insert(
            ino,
            Entry {
                path: path.to_string(),
                nlookup: 0,
            },
        );
        maps.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Like [`assign`](Self::assign) but also counts one kernel lookup.
    /// Call when handing the inode out in a `ReplyEntry`.
    pub fn acquire(&self, path: &str) -> u64 {
        if path == "/" {
            return ROOT_INODE;
        }
        let mut maps = self.maps.write().unwrap();
        if let Some(&ino) = maps.by_path.get(path) {
            if let Some(entry) = maps.by_ino.get_mut(&ino) {
                entry.nlookup += 1;
            }
            return ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        maps.by_ino.insert(
            ino,
            Entry {
                path: path.to_string(),
                nlookup: 1,
            },
        );
        maps.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Kernel dropped `nlookup` references; the entry goes away at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut maps = self.maps.write().unwrap();
        let remove = match maps.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.nlookup = entry.nlookup.saturating_sub(nlookup);
                entry.nlookup == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = maps.by_ino.remove(&ino) {
                maps.by_path.remove(&entry.path);
            }
        }
    }

    /// Removes a path eagerly after unlink/rmdir so a recreated path gets a
    /// fresh inode. A later `forget` for the old inode is a no-op.
    pub fn drop_path(&self, path: &str) {
        let mut maps = self.maps.write().unwrap();
        if let Some(ino) = maps.by_path.remove(path) {
            maps.by_ino.remove(&ino);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
