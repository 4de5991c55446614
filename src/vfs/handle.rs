//! Open-file handles.
//!
//! Opening a file materializes the full store value into a private buffer.
//! Reads, writes and truncates mutate the buffer under the handle's own
//! lock; flush writes the whole buffer back as a single put. Two handles on
//! the same key never share a buffer, so concurrent opens race with
//! last-writer-wins semantics.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

/// Buffered contents of one open file.
pub struct FileBuffer {
    /// Store key the buffer flushes back to, fixed at open time.
    pub key: String,
    pub data: Vec<u8>,
    /// Set by write/truncate, cleared by a successful flush.
    pub dirty: bool,
}

impl FileBuffer {
    pub fn new(key: String, data: Vec<u8>, dirty: bool) -> Self {
        Self { key, data, dirty }
    }

    /// Clipped read: offsets past the end yield an empty slice, a range
    /// crossing the end is shortened.
    pub fn read_at(&self, offset: u64, size: u32) -> &[u8] {
        let len = self.data.len() as u64;
        if offset >= len {
            return &[];
        }
        let start = offset as usize;
        let end = len.min(offset + u64::from(size)) as usize;
        &self.data[start..end]
    }

    /// Overwrites `[offset, offset + src.len())`, zero-filling any gap
    /// between the current end and `offset`. Returns the count written,
    /// always the full request.
    pub fn write_at(&mut self, offset: u64, src: &[u8]) -> u32 {
        let start = offset as usize;
        let end = start + src.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(src);
        self.dirty = true;
        src.len() as u32
    }

    /// Grows with zero bytes or discards the tail.
    pub fn truncate_to(&mut self, size: u64) {
        self.data.resize(size as usize, 0);
        self.dirty = true;
    }
}

/// Registry of live handles. Ids are process-unique and never reused.
///
/// The table lock is sync and held only to clone the `Arc` out; the async
/// mutex inside serializes all access to one buffer without blocking
/// unrelated handles.
#[derive(Default)]
pub struct HandleTable {
    next: AtomicU64,
    map: RwLock<HashMap<u64, Arc<Mutex<FileBuffer>>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, buffer: FileBuffer) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.map
            .write()
            .unwrap()
            .insert(fh, Arc::new(Mutex::new(buffer)));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<Mutex<FileBuffer>>> {
        self.map.read().unwrap().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<Mutex<FileBuffer>>> {
        self.map.write().unwrap().remove(&fh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_is_clipped() {
        let buf = FileBuffer::new("/k".into(), b"abcdef".to_vec(), false);
        assert_eq!(buf.read_at(0, 6), b"abcdef");
        assert_eq!(buf.read_at(2, 2), b"cd");
        assert_eq!(buf.read_at(4, 100), b"ef");
        assert_eq!(buf.read_at(6, 1), b"");
        assert_eq!(buf.read_at(100, 1), b"");
    }

    #[test]
    fn write_overwrites_and_grows() {
        let mut buf = FileBuffer::new("/k".into(), b"abcdef".to_vec(), false);
        assert_eq!(buf.write_at(2, b"XY"), 2);
        assert_eq!(buf.data, b"abXYef");
        assert!(buf.dirty);

        assert_eq!(buf.write_at(8, b"zz"), 2);
        assert_eq!(buf.data, b"abXYef\0\0zz");
    }

    #[test]
    fn truncate_pads_and_cuts() {
        let mut buf = FileBuffer::new("/k".into(), b"abc".to_vec(), false);
        buf.truncate_to(5);
        assert_eq!(buf.data, b"abc\0\0");
        assert!(buf.dirty);
        buf.truncate_to(1);
        assert_eq!(buf.data, b"a");
    }

    #[test]
    fn handles_are_unique_and_removable() {
        let table = HandleTable::new();
        let a = table.insert(FileBuffer::new("/a".into(), vec![], false));
        let b = table.insert(FileBuffer::new("/b".into(), vec![], false));
        assert_ne!(a, b);
        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }
}
