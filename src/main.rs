use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::signal;
use tracing::info;

use etcdfs::fuse::mount::mount_unprivileged;
use etcdfs::store::EtcdStore;
use etcdfs::vfs::fs::EtcdFs;

#[derive(Parser, Debug)]
#[command(
    name = "etcdfs",
    version,
    about = "Mount an etcd v3 keyspace as a POSIX filesystem"
)]
struct Args {
    /// Directory to mount on; must exist and be empty
    mountpoint: PathBuf,
    /// etcd endpoint; repeat for a multi-member cluster
    #[arg(short, long, default_value = "http://127.0.0.1:2379")]
    endpoint: Vec<String>,
    /// Base key the mount root maps to ("/" mounts the whole keyspace)
    #[arg(short, long, default_value = "/")]
    basedir: String,
    /// Log at debug level instead of info
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("etcdfs={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if !args.mountpoint.is_dir() {
        bail!(
            "mountpoint {} does not exist or is not a directory",
            args.mountpoint.display()
        );
    }

    let store = EtcdStore::connect(&args.endpoint)
        .await
        .with_context(|| format!("connecting to {:?}", args.endpoint))?;
    info!(
        mountpoint = %args.mountpoint.display(),
        endpoints = ?args.endpoint,
        basedir = %args.basedir,
        "mounting"
    );
    let fs = EtcdFs::new(store, args.basedir);
    // surface an unreachable cluster before the kernel is involved
    fs.list_children("/").await.context("probing the keyspace")?;

    let mut mount_handle = mount_unprivileged(fs, &args.mountpoint)
        .await
        .context("mounting; is fusermount3 installed and /dev/fuse usable?")?;

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("fuse session ended")?,
        _ = signal::ctrl_c() => {
            info!("unmounting");
            mount_handle.unmount().await.context("unmounting")?;
        }
    }
    Ok(())
}
