//! Path-level filesystem semantics on top of a flat key-value namespace.
//!
//! This layer owns the mapping between POSIX paths and store keys, the
//! derivation of directories from key prefixes, and the in-memory write
//! buffers behind open file handles. It knows nothing about FUSE; the
//! adapter in [`crate::fuse`] translates kernel requests into calls here.

pub mod error;
pub mod fs;
pub mod handle;
pub mod inode;
pub mod path;
