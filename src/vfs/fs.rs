//! Path-level filesystem core.
//!
//! [`EtcdFs`] composes the key mapper, the store client, the handle table and
//! the inode table into the operations the FUSE adapter dispatches to. All
//! methods take paths (absolute, normalized) or handle ids; inode resolution
//! happens in the adapter.
//!
//! Directory-ness is inferred: an exact key is a file, a prefix with keys
//! under it is a directory. A path carrying both resolves as a file; the
//! exact key shadows the prefix. Empty directories exist only through the
//! hidden sentinel key written by `mkdir`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::store::KvStore;
use crate::vfs::error::{FsError, FsResult};
use crate::vfs::handle::{FileBuffer, HandleTable};
use crate::vfs::inode::InodeTable;
use crate::vfs::path::{self, DIR_SENTINEL, KeyMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

/// Synthesized metadata: derived from store probes, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: NodeKind,
    pub size: u64,
}

/// One listing entry. `.` and `..` are the adapter's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// How a file is being opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
}

/// The keyspace-as-filesystem core, generic over the store backend.
pub struct EtcdFs<S> {
    store: S,
    keys: KeyMap,
    inodes: InodeTable,
    handles: HandleTable,
}

impl<S: KvStore> EtcdFs<S> {
    /// `base` is the store key the mount root maps to; see [`KeyMap::new`].
    pub fn new(store: S, base: impl Into<String>) -> Self {
        Self {
            store,
            keys: KeyMap::new(base),
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn reserved(path: &str) -> bool {
        path.rsplit('/').next() == Some(DIR_SENTINEL)
    }

    /// Type and size of a path. The root is a directory without a store
    /// round trip; everything else probes the exact key first, then the
    /// prefix.
    pub async fn stat(&self, path: &str) -> FsResult<Stat> {
        if path == "/" {
            return Ok(Stat {
                kind: NodeKind::Dir,
                size: 0,
            });
        }
        if Self::reserved(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        let key = self.keys.key_for(path);
        if let Some(value) = self.store.get(&key).await? {
            return Ok(Stat {
                kind: NodeKind::File,
                size: value.len() as u64,
            });
        }
        let keys = self.store.list(&self.keys.prefix_for(path)).await?;
        if keys.is_empty() {
            Err(FsError::NotFound(path.to_string()))
        } else {
            Ok(Stat {
                kind: NodeKind::Dir,
                size: 0,
            })
        }
    }

    /// Immediate children of a directory, deduplicated and sorted, sentinel
    /// excluded. Multiple keys under one subdirectory collapse to a single
    /// entry.
    pub async fn list_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        if Self::reserved(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        if path != "/" {
            let key = self.keys.key_for(path);
            if self.store.get(&key).await?.is_some() {
                return Err(FsError::NotADirectory(path.to_string()));
            }
        }
        let prefix = self.keys.prefix_for(path);
        let keys = self.store.list(&prefix).await?;
        if keys.is_empty() && path != "/" {
            return Err(FsError::NotFound(path.to_string()));
        }
        let mut children: BTreeMap<String, NodeKind> = BTreeMap::new();
        for key in &keys {
            let Some(name) = path::child_of(&prefix, key) else {
                continue;
            };
            if name == DIR_SENTINEL {
                continue;
            }
            let deeper = key.len() > prefix.len() + name.len();
            let kind = if deeper { NodeKind::Dir } else { NodeKind::File };
            children
                .entry(name.to_string())
                .and_modify(|existing| {
                    // an exact key shadows same-named deeper keys
                    if !deeper {
                        *existing = NodeKind::File;
                    }
                })
                .or_insert(kind);
        }
        Ok(children
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// Child names only.
    pub async fn list_children(&self, path: &str) -> FsResult<Vec<String>> {
        Ok(self
            .list_dir(path)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// Opens a file and returns its handle id. The whole current value is
    /// materialized into the handle's buffer; a created file lives only in
    /// memory until its first flush.
    pub async fn open(&self, path: &str, opts: OpenOptions) -> FsResult<u64> {
        if path == "/" {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        if Self::reserved(path) {
            return Err(if opts.create {
                FsError::NotSupported
            } else {
                FsError::NotFound(path.to_string())
            });
        }
        let key = self.keys.key_for(path);
        let buffer = match self.store.get(&key).await? {
            Some(value) => {
                if opts.create && opts.exclusive {
                    return Err(FsError::AlreadyExists(path.to_string()));
                }
                if opts.truncate {
                    FileBuffer::new(key, Vec::new(), true)
                } else {
                    FileBuffer::new(key, value, false)
                }
            }
            None => {
                let keys = self.store.list(&self.keys.prefix_for(path)).await?;
                if !keys.is_empty() {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                if !opts.create {
                    return Err(FsError::NotFound(path.to_string()));
                }
                FileBuffer::new(key, Vec::new(), true)
            }
        };
        let fh = self.handles.insert(buffer);
        debug!(path, fh, "open");
        Ok(fh)
    }

    fn handle(&self, fh: u64) -> FsResult<Arc<Mutex<FileBuffer>>> {
        self.handles.get(fh).ok_or(FsError::StaleHandle(fh))
    }

    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let buffer = self.handle(fh)?;
        let guard = buffer.lock().await;
        Ok(guard.read_at(offset, size).to_vec())
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let buffer = self.handle(fh)?;
        let mut guard = buffer.lock().await;
        Ok(guard.write_at(offset, data))
    }

    pub async fn truncate_handle(&self, fh: u64, size: u64) -> FsResult<()> {
        let buffer = self.handle(fh)?;
        buffer.lock().await.truncate_to(size);
        Ok(())
    }

    /// Current buffer length. For a freshly created file this is the only
    /// size there is; the store has no key yet.
    pub async fn handle_size(&self, fh: u64) -> FsResult<u64> {
        let buffer = self.handle(fh)?;
        let size = buffer.lock().await.data.len() as u64;
        Ok(size)
    }

    /// Truncate without an open handle: fetch, resize, write back as one
    /// operation.
    pub async fn truncate_path(&self, path: &str, size: u64) -> FsResult<()> {
        if Self::reserved(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        let key = self.keys.key_for(path);
        match self.store.get(&key).await? {
            Some(mut value) => {
                value.resize(size as usize, 0);
                self.store.put(&key, value).await?;
                Ok(())
            }
            None => {
                let keys = self.store.list(&self.keys.prefix_for(path)).await?;
                if keys.is_empty() && path != "/" {
                    Err(FsError::NotFound(path.to_string()))
                } else {
                    Err(FsError::IsADirectory(path.to_string()))
                }
            }
        }
    }

    /// Writes the buffer back if it is dirty; a clean buffer is a no-op. On
    /// store failure the buffer stays dirty so the flush can be retried.
    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        let buffer = self.handle(fh)?;
        let mut guard = buffer.lock().await;
        if !guard.dirty {
            return Ok(());
        }
        // the one store call the handle lock is held across
        self.store.put(&guard.key, guard.data.clone()).await?;
        guard.dirty = false;
        debug!(key = %guard.key, bytes = guard.data.len(), fh, "flush");
        Ok(())
    }

    /// Flush, then drop the handle. On flush failure the handle survives so
    /// a retried release can still persist the buffer.
    pub async fn release(&self, fh: u64) -> FsResult<()> {
        self.flush(fh).await?;
        self.handles.remove(fh);
        Ok(())
    }

    /// Creates an empty directory by writing its sentinel key.
    pub async fn mkdir(&self, path: &str) -> FsResult<()> {
        if path == "/" {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        if Self::reserved(path) {
            return Err(FsError::NotSupported);
        }
        match self.stat(path).await {
            Ok(_) => return Err(FsError::AlreadyExists(path.to_string())),
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let parent = path::parent(path);
        match self.stat(parent).await?.kind {
            NodeKind::Dir => {}
            NodeKind::File => return Err(FsError::NotADirectory(parent.to_string())),
        }
        self.store
            .put(&self.keys.sentinel_key(path), Vec::new())
            .await?;
        debug!(path, "mkdir");
        Ok(())
    }

    /// Removes an empty directory: any live child fails the call, then the
    /// sentinel (if present) is deleted.
    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        if path == "/" {
            return Err(FsError::NotSupported);
        }
        if Self::reserved(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        match self.stat(path).await?.kind {
            NodeKind::Dir => {}
            NodeKind::File => return Err(FsError::NotADirectory(path.to_string())),
        }
        let children = self.list_children(path).await?;
        if !children.is_empty() {
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }
        // directories that exist only as prefixes have no sentinel to delete
        self.store.delete(&self.keys.sentinel_key(path)).await?;
        self.inodes.drop_path(path);
        debug!(path, "rmdir");
        Ok(())
    }

    /// Deletes a file's key.
    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        if path == "/" {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        if Self::reserved(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        let key = self.keys.key_for(path);
        if self.store.delete(&key).await? {
            self.inodes.drop_path(path);
            debug!(path, "unlink");
            return Ok(());
        }
        let keys = self.store.list(&self.keys.prefix_for(path)).await?;
        if keys.is_empty() {
            Err(FsError::NotFound(path.to_string()))
        } else {
            Err(FsError::IsADirectory(path.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn fs() -> EtcdFs<MemStore> {
        EtcdFs::new(MemStore::new(), "")
    }

    #[tokio::test]
    async fn stat_missing_is_not_found() {
        let fs = fs();
        assert!(matches!(
            fs.stat("/nope").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.stat("/a/b/c").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn root_is_always_a_directory() {
        let fs = fs();
        let stat = fs.stat("/").await.unwrap();
        assert_eq!(stat.kind, NodeKind::Dir);
        assert!(fs.list_children("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn roundtrip_new_file() {
        let fs = fs();
        let fh = fs
            .open("/greeting", OpenOptions { create: true, ..Default::default() })
            .await
            .unwrap();
        fs.write(fh, 0, b"hello world").await.unwrap();
        fs.release(fh).await.unwrap();

        let fh = fs.open("/greeting", OpenOptions::default()).await.unwrap();
        assert_eq!(fs.read(fh, 0, 11).await.unwrap(), b"hello world");
        fs.release(fh).await.unwrap();

        let stat = fs.stat("/greeting").await.unwrap();
        assert_eq!(stat.kind, NodeKind::File);
        assert_eq!(stat.size, 11);
    }

    #[tokio::test]
    async fn partial_write_overlays_existing_value() {
        let fs = fs();
        fs.store().put("/f", b"abcdef".to_vec()).await.unwrap();

        let fh = fs.open("/f", OpenOptions::default()).await.unwrap();
        fs.write(fh, 2, b"XY").await.unwrap();
        fs.release(fh).await.unwrap();

        assert_eq!(fs.store().get("/f").await.unwrap().unwrap(), b"abXYef");
    }

    #[tokio::test]
    async fn directory_collapse() {
        let fs = fs();
        fs.store().put("/a/b/c", vec![1]).await.unwrap();
        fs.store().put("/a/b/d", vec![2]).await.unwrap();

        assert_eq!(fs.list_children("/a").await.unwrap(), vec!["b"]);
        assert_eq!(fs.list_children("/a/b").await.unwrap(), vec!["c", "d"]);
        assert_eq!(fs.stat("/a").await.unwrap().kind, NodeKind::Dir);
        assert_eq!(fs.stat("/a/b/c").await.unwrap().kind, NodeKind::File);
    }

    #[tokio::test]
    async fn listing_reports_kinds() {
        let fs = fs();
        fs.store().put("/dir/sub/leaf", vec![]).await.unwrap();
        fs.store().put("/dir/file", b"x".to_vec()).await.unwrap();

        let entries = fs.list_dir("/dir").await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "file".into(), kind: NodeKind::File },
                DirEntry { name: "sub".into(), kind: NodeKind::Dir },
            ]
        );
    }

    #[tokio::test]
    async fn exact_key_shadows_prefix() {
        let fs = fs();
        fs.store().put("/x", b"file".to_vec()).await.unwrap();
        fs.store().put("/x/y", b"deep".to_vec()).await.unwrap();

        assert_eq!(fs.stat("/x").await.unwrap().kind, NodeKind::File);
        let entries = fs.list_dir("/").await.unwrap();
        assert_eq!(
            entries,
            vec![DirEntry { name: "x".into(), kind: NodeKind::File }]
        );
        assert!(matches!(
            fs.list_dir("/x").await,
            Err(FsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn idempotent_flush() {
        let fs = fs();
        let fh = fs
            .open("/f", OpenOptions { create: true, ..Default::default() })
            .await
            .unwrap();
        fs.write(fh, 0, b"data").await.unwrap();

        let before = fs.store().put_count();
        fs.flush(fh).await.unwrap();
        fs.flush(fh).await.unwrap();
        assert_eq!(fs.store().put_count(), before + 1);

        // release after a clean flush issues no further put
        fs.release(fh).await.unwrap();
        assert_eq!(fs.store().put_count(), before + 1);
    }

    #[tokio::test]
    async fn flush_failure_keeps_buffer_for_retry() {
        let fs = fs();
        let fh = fs
            .open("/f", OpenOptions { create: true, ..Default::default() })
            .await
            .unwrap();
        fs.write(fh, 0, b"precious").await.unwrap();

        fs.store().set_fail_puts(true);
        assert!(matches!(fs.flush(fh).await, Err(FsError::IOError(_))));
        assert!(matches!(fs.release(fh).await, Err(FsError::IOError(_))));

        fs.store().set_fail_puts(false);
        fs.release(fh).await.unwrap();
        assert_eq!(fs.store().get("/f").await.unwrap().unwrap(), b"precious");
        assert!(matches!(fs.read(fh, 0, 1).await, Err(FsError::StaleHandle(_))));
    }

    #[tokio::test]
    async fn rmdir_refuses_live_children() {
        let fs = fs();
        fs.mkdir("/d").await.unwrap();
        let fh = fs
            .open("/d/f", OpenOptions { create: true, ..Default::default() })
            .await
            .unwrap();
        fs.release(fh).await.unwrap();

        assert!(matches!(
            fs.rmdir("/d").await,
            Err(FsError::DirectoryNotEmpty(_))
        ));

        fs.unlink("/d/f").await.unwrap();
        fs.rmdir("/d").await.unwrap();
        assert!(matches!(fs.stat("/d").await, Err(FsError::NotFound(_))));
        assert!(fs.store().keys().await.is_empty());
    }

    #[tokio::test]
    async fn rmdir_of_prefix_only_directory() {
        let fs = fs();
        fs.store().put("/d/f", vec![]).await.unwrap();
        assert!(matches!(
            fs.rmdir("/d").await,
            Err(FsError::DirectoryNotEmpty(_))
        ));
        fs.unlink("/d/f").await.unwrap();
        // the directory vanished with its last key
        assert!(matches!(fs.rmdir("/d").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn mkdir_semantics() {
        let fs = fs();
        fs.mkdir("/d").await.unwrap();
        assert_eq!(fs.stat("/d").await.unwrap().kind, NodeKind::Dir);
        assert!(fs.list_children("/d").await.unwrap().is_empty());
        assert!(matches!(
            fs.mkdir("/d").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.mkdir("/missing/sub").await,
            Err(FsError::NotFound(_))
        ));

        fs.store().put("/file", vec![]).await.unwrap();
        assert!(matches!(
            fs.mkdir("/file/sub").await,
            Err(FsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn truncate_handle_growth_zero_pads() {
        let fs = fs();
        fs.store().put("/f", b"abc".to_vec()).await.unwrap();
        let fh = fs.open("/f", OpenOptions::default()).await.unwrap();
        fs.truncate_handle(fh, 5).await.unwrap();
        assert_eq!(fs.read(fh, 0, 10).await.unwrap(), b"abc\0\0");
        fs.release(fh).await.unwrap();
        assert_eq!(fs.store().get("/f").await.unwrap().unwrap(), b"abc\0\0");
    }

    #[tokio::test]
    async fn truncate_path_writes_back_immediately() {
        let fs = fs();
        fs.store().put("/f", b"abcdef".to_vec()).await.unwrap();
        fs.truncate_path("/f", 2).await.unwrap();
        assert_eq!(fs.store().get("/f").await.unwrap().unwrap(), b"ab");

        assert!(matches!(
            fs.truncate_path("/nope", 0).await,
            Err(FsError::NotFound(_))
        ));
        fs.store().put("/d/x", vec![]).await.unwrap();
        assert!(matches!(
            fs.truncate_path("/d", 0).await,
            Err(FsError::IsADirectory(_))
        ));
    }

    #[tokio::test]
    async fn open_error_cases() {
        let fs = fs();
        assert!(matches!(
            fs.open("/nope", OpenOptions::default()).await,
            Err(FsError::NotFound(_))
        ));

        fs.store().put("/d/x", vec![]).await.unwrap();
        assert!(matches!(
            fs.open("/d", OpenOptions::default()).await,
            Err(FsError::IsADirectory(_))
        ));
        assert!(matches!(
            fs.open("/", OpenOptions::default()).await,
            Err(FsError::IsADirectory(_))
        ));

        fs.store().put("/f", b"old".to_vec()).await.unwrap();
        let fh = fs
            .open("/f", OpenOptions { create: true, exclusive: true, ..Default::default() })
            .await;
        assert!(matches!(fh, Err(FsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn open_with_truncate_discards_content() {
        let fs = fs();
        fs.store().put("/f", b"old content".to_vec()).await.unwrap();
        let fh = fs
            .open("/f", OpenOptions { truncate: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(fs.read(fh, 0, 100).await.unwrap(), b"");
        fs.release(fh).await.unwrap();
        assert_eq!(fs.store().get("/f").await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn unlink_semantics() {
        let fs = fs();
        assert!(matches!(
            fs.unlink("/nope").await,
            Err(FsError::NotFound(_))
        ));

        fs.store().put("/d/x", vec![]).await.unwrap();
        assert!(matches!(
            fs.unlink("/d").await,
            Err(FsError::IsADirectory(_))
        ));

        fs.store().put("/f", b"x".to_vec()).await.unwrap();
        fs.unlink("/f").await.unwrap();
        assert!(matches!(fs.stat("/f").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn sentinel_is_invisible() {
        let fs = fs();
        fs.mkdir("/d").await.unwrap();
        assert!(fs.list_children("/d").await.unwrap().is_empty());
        let hidden = format!("/d/{DIR_SENTINEL}");
        assert!(matches!(
            fs.stat(&hidden).await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.open(&hidden, OpenOptions::default()).await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            fs.open(&hidden, OpenOptions { create: true, ..Default::default() }).await,
            Err(FsError::NotSupported)
        ));
    }

    #[tokio::test]
    async fn base_key_prefixes_everything() {
        let fs = EtcdFs::new(MemStore::new(), "/base");
        fs.mkdir("/d").await.unwrap();
        let fh = fs
            .open("/d/f", OpenOptions { create: true, ..Default::default() })
            .await
            .unwrap();
        fs.write(fh, 0, b"v").await.unwrap();
        fs.release(fh).await.unwrap();

        let mut keys = fs.store().keys().await;
        keys.sort();
        assert_eq!(
            keys,
            vec![format!("/base/d/{DIR_SENTINEL}"), "/base/d/f".to_string()]
        );
    }

    #[tokio::test]
    async fn independent_handles_last_writer_wins() {
        let fs = fs();
        fs.store().put("/f", b"seed".to_vec()).await.unwrap();
        let first = fs.open("/f", OpenOptions::default()).await.unwrap();
        let second = fs.open("/f", OpenOptions::default()).await.unwrap();

        fs.write(first, 0, b"AAAA").await.unwrap();
        fs.write(second, 0, b"BB").await.unwrap();
        fs.release(first).await.unwrap();
        fs.release(second).await.unwrap();

        // the second flush replaced the first wholesale
        assert_eq!(fs.store().get("/f").await.unwrap().unwrap(), b"BBed");
    }
}
