//! Mount helpers, thin wrappers over the rfuse3 raw session API.
//!
//! Only Linux gets a real mount; unprivileged mounting goes through
//! fusermount3, so no root is required as long as /dev/fuse is usable.

use std::path::Path;

#[cfg(target_os = "linux")]
use rfuse3::MountOptions;

use crate::store::KvStore;
use crate::vfs::fs::EtcdFs;

#[cfg(target_os = "linux")]
fn default_mount_options() -> MountOptions {
    let mut options = MountOptions::default();
    options.fs_name("etcdfs");
    // conservative defaults: no allow_other, mountpoint must be empty
    options
}

#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<S>(
    fs: EtcdFs<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: KvStore + Send + Sync + 'static,
{
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<S>(
    _fs: EtcdFs<S>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: KvStore + Send + Sync + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
