//! Mount an etcd v3 keyspace as a POSIX filesystem over FUSE.
//!
//! Keys are paths: an exact key is a file, a key prefix with keys under it
//! is a directory. [`vfs`] holds the path-level semantics, [`fuse`] the
//! kernel adapter and [`store`] the client for the backing cluster.

pub mod fuse;
pub mod store;
pub mod vfs;
