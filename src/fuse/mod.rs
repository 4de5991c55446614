//! FUSE adapter.
//!
//! Implements [`rfuse3::raw::Filesystem`] for [`EtcdFs`]. This layer resolves
//! inode numbers to paths, decodes kernel open flags into [`OpenOptions`] and
//! synthesizes `FileAttr`s; all filesystem semantics live below in
//! [`crate::vfs`]. Operations a flat keyspace cannot honor (rename, links,
//! xattrs, statfs) fail with `ENOSYS` rather than pretending to succeed.

use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
    ReplyWrite, ReplyXAttr,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, SetAttr, Timestamp};
use tracing::debug;

use crate::store::KvStore;
use crate::vfs::error::FsError;
use crate::vfs::fs::{EtcdFs, NodeKind, OpenOptions, Stat};
use crate::vfs::path;

pub mod mount;

/// Kernel-side cache lifetime for entries and attributes. Other clients can
/// mutate the store behind our back, so keep it short.
const TTL: Duration = Duration::from_secs(1);

fn kind_to_fuse(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Dir => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

/// Attributes are synthesized: permissions are fixed, timestamps are "now",
/// ownership mirrors the caller.
fn stat_to_attr(ino: u64, stat: &Stat, req: &Request) -> FileAttr {
    let now = Timestamp::from(SystemTime::now());
    let (perm, nlink) = match stat.kind {
        NodeKind::Dir => (0o755, 2),
        NodeKind::File => (0o644, 1),
    };
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        #[cfg(target_os = "macos")]
        crtime: now,
        kind: kind_to_fuse(stat.kind),
        perm,
        nlink,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

/// Store keys are UTF-8; names the kernel hands us that are not cannot map
/// to any key. Lookups miss, creates are invalid.
fn utf8_name(name: &OsStr, errno: i32) -> rfuse3::Result<&str> {
    name.to_str().ok_or_else(|| Errno::from(errno))
}

impl<S: KvStore> EtcdFs<S> {
    fn resolve(&self, inode: u64) -> rfuse3::Result<String> {
        self.inodes()
            .path_of(inode)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr, bad_name: i32) -> rfuse3::Result<String> {
        let dir = self.resolve(parent)?;
        let name = utf8_name(name, bad_name)?;
        Ok(path::join(&dir, name))
    }
}

impl<S> Filesystem for EtcdFs<S>
where
    S: KvStore + Send + Sync + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = rfuse3::Result<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = rfuse3::Result<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> rfuse3::Result<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> rfuse3::Result<ReplyEntry> {
        let child = self.child_path(parent, name, libc::ENOENT)?;
        let stat = self.stat(&child).await?;
        let ino = self.inodes().acquire(&child);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: stat_to_attr(ino, &stat, &req),
            generation: 0,
        })
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes().forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes().forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        req: Request,
        inode: u64,
        fh: Option<u64>,
        _flags: u32,
    ) -> rfuse3::Result<ReplyAttr> {
        let path = self.resolve(inode)?;
        // With an open handle the buffer is the truth; a freshly created
        // file has no store key until its first flush.
        if let Some(fh) = fh {
            if let Ok(size) = self.handle_size(fh).await {
                let stat = Stat {
                    kind: NodeKind::File,
                    size,
                };
                return Ok(ReplyAttr {
                    ttl: TTL,
                    attr: stat_to_attr(inode, &stat, &req),
                });
            }
        }
        let stat = self.stat(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: stat_to_attr(inode, &stat, &req),
        })
    }

    async fn setattr(
        &self,
        req: Request,
        inode: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> rfuse3::Result<ReplyAttr> {
        let path = self.resolve(inode)?;
        if let Some(size) = set_attr.size {
            match fh {
                Some(fh) => self.truncate_handle(fh, size).await?,
                None => self.truncate_path(&path, size).await?,
            }
            let stat = Stat {
                kind: NodeKind::File,
                size,
            };
            return Ok(ReplyAttr {
                ttl: TTL,
                attr: stat_to_attr(inode, &stat, &req),
            });
        }
        if set_attr.mode.is_some()
            || set_attr.uid.is_some()
            || set_attr.gid.is_some()
            || set_attr.atime.is_some()
            || set_attr.mtime.is_some()
        {
            debug!(path, "setattr: no backing for modes, ownership or times");
            return Err(FsError::NotSupported.into());
        }
        let stat = self.stat(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: stat_to_attr(inode, &stat, &req),
        })
    }

    async fn readlink(&self, _req: Request, inode: u64) -> rfuse3::Result<ReplyData> {
        debug!(inode, "readlink is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _link: &OsStr,
    ) -> rfuse3::Result<ReplyEntry> {
        debug!(parent, ?name, "symlink is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> rfuse3::Result<ReplyEntry> {
        debug!(parent, ?name, "mknod is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> rfuse3::Result<ReplyEntry> {
        let child = self.child_path(parent, name, libc::EINVAL)?;
        self.mkdir(&child).await?;
        let ino = self.inodes().acquire(&child);
        let stat = Stat {
            kind: NodeKind::Dir,
            size: 0,
        };
        Ok(ReplyEntry {
            ttl: TTL,
            attr: stat_to_attr(ino, &stat, &req),
            generation: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> rfuse3::Result<()> {
        let child = self.child_path(parent, name, libc::ENOENT)?;
        self.unlink(&child).await?;
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> rfuse3::Result<()> {
        let child = self.child_path(parent, name, libc::ENOENT)?;
        self.rmdir(&child).await?;
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> rfuse3::Result<()> {
        debug!(parent, ?name, new_parent, ?new_name, "rename is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn link(
        &self,
        _req: Request,
        inode: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> rfuse3::Result<ReplyEntry> {
        debug!(inode, new_parent, ?new_name, "link is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> rfuse3::Result<ReplyOpen> {
        let path = self.resolve(inode)?;
        let opts = OpenOptions {
            truncate: flags as i32 & libc::O_TRUNC != 0,
            ..Default::default()
        };
        let fh = self.open(&path, opts).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> rfuse3::Result<ReplyData> {
        let data = self.read(fh, offset, size).await?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> rfuse3::Result<ReplyWrite> {
        let written = self.write(fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, inode: u64) -> rfuse3::Result<ReplyStatFs> {
        // block and inode counts of a keyspace are meaningless
        debug!(inode, "statfs is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> rfuse3::Result<()> {
        self.release(fh).await?;
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> rfuse3::Result<()> {
        self.flush(fh).await?;
        Ok(())
    }

    async fn setxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> rfuse3::Result<()> {
        debug!(inode, ?name, "setxattr is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn getxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        _size: u32,
    ) -> rfuse3::Result<ReplyXAttr> {
        debug!(inode, ?name, "getxattr is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn listxattr(&self, _req: Request, inode: u64, _size: u32) -> rfuse3::Result<ReplyXAttr> {
        debug!(inode, "listxattr is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn removexattr(&self, _req: Request, inode: u64, name: &OsStr) -> rfuse3::Result<()> {
        debug!(inode, ?name, "removexattr is not supported");
        Err(FsError::NotSupported.into())
    }

    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> rfuse3::Result<()> {
        self.flush(fh).await?;
        Ok(())
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> rfuse3::Result<ReplyOpen> {
        let path = self.resolve(inode)?;
        match self.stat(&path).await?.kind {
            // directory listings are stateless, no handle to allocate
            NodeKind::Dir => Ok(ReplyOpen { fh: 0, flags: 0 }),
            NodeKind::File => Err(FsError::NotADirectory(path).into()),
        }
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> rfuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let dir = self.resolve(parent)?;
        let children = self.list_dir(&dir).await?;

        // entry offsets are 1-based positions; a resume offset k means
        // everything at position <= k was already delivered
        let start = offset as usize;
        let mut entries = Vec::new();
        if start < 1 {
            entries.push(Ok(DirectoryEntry {
                inode: parent,
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
            }));
        }
        if start < 2 {
            let parent_path = path::parent(&dir);
            let parent_ino = self.inodes().assign(parent_path);
            entries.push(Ok(DirectoryEntry {
                inode: parent_ino,
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
            }));
        }
        for (i, child) in children.into_iter().enumerate() {
            let entry_offset = (i + 3) as i64;
            if entry_offset as usize <= start {
                continue;
            }
            let child_path = path::join(&dir, &child.name);
            let ino = self.inodes().assign(&child_path);
            entries.push(Ok(DirectoryEntry {
                inode: ino,
                kind: kind_to_fuse(child.kind),
                name: child.name.into(),
                offset: entry_offset,
            }));
        }
        Ok(ReplyDirectory {
            entries: Box::pin(stream::iter(entries)),
        })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> rfuse3::Result<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> rfuse3::Result<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, inode: u64, _mask: u32) -> rfuse3::Result<()> {
        let path = self.resolve(inode)?;
        self.stat(&path).await?;
        Ok(())
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> rfuse3::Result<ReplyCreated> {
        let child = self.child_path(parent, name, libc::EINVAL)?;
        let flags = flags as i32;
        let opts = OpenOptions {
            create: true,
            exclusive: flags & libc::O_EXCL != 0,
            truncate: flags & libc::O_TRUNC != 0,
        };
        let fh = self.open(&child, opts).await?;
        let size = self.handle_size(fh).await?;
        let ino = self.inodes().acquire(&child);
        let stat = Stat {
            kind: NodeKind::File,
            size,
        };
        Ok(ReplyCreated {
            ttl: TTL,
            attr: stat_to_attr(ino, &stat, &req),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> rfuse3::Result<()> {
        Ok(())
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> rfuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let dir = self.resolve(parent)?;
        let children = self.list_dir(&dir).await?;

        let dir_stat = Stat {
            kind: NodeKind::Dir,
            size: 0,
        };
        let start = offset as usize;
        let mut entries = Vec::new();
        if start < 1 {
            entries.push(Ok(DirectoryEntryPlus {
                inode: parent,
                generation: 0,
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
                attr: stat_to_attr(parent, &dir_stat, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }
        if start < 2 {
            let parent_path = path::parent(&dir);
            let parent_ino = self.inodes().assign(parent_path);
            entries.push(Ok(DirectoryEntryPlus {
                inode: parent_ino,
                generation: 0,
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
                attr: stat_to_attr(parent_ino, &dir_stat, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }
        for (i, child) in children.into_iter().enumerate() {
            let entry_offset = (i + 3) as i64;
            if entry_offset as usize <= start {
                continue;
            }
            let child_path = path::join(&dir, &child.name);
            let stat = match child.kind {
                NodeKind::Dir => Stat {
                    kind: NodeKind::Dir,
                    size: 0,
                },
                NodeKind::File => match self.stat(&child_path).await {
                    Ok(stat) => stat,
                    // deleted between listing and stat
                    Err(_) => continue,
                },
            };
            // the kernel counts readdirplus entries like lookups
            let ino = self.inodes().acquire(&child_path);
            entries.push(Ok(DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind: kind_to_fuse(stat.kind),
                name: child.name.into(),
                offset: entry_offset,
                attr: stat_to_attr(ino, &stat, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }
        Ok(ReplyDirectoryPlus {
            entries: Box::pin(stream::iter(entries)),
        })
    }
}
