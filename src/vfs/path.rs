//! Path to key translation.
//!
//! Every mounted path maps to exactly one store key: the configured base key
//! concatenated with the path. The mapping is pure; nothing here touches the
//! store.

/// Reserved child key name that makes an otherwise empty prefix resolve as a
/// directory. Never shown in listings, never addressable as a path.
pub const DIR_SENTINEL: &str = ".etcdfs_dir";

/// Maps absolute, normalized paths (`/`, `/a/b`) to store keys and back.
#[derive(Debug, Clone)]
pub struct KeyMap {
    base: String,
}

impl KeyMap {
    /// `base` is prepended verbatim to every path; a trailing `/` is trimmed
    /// so `/registry` and `/registry/` behave the same. An empty base mounts
    /// the keyspace under `/` (keys `/a/b` style).
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self { base }
    }

    /// Store key for a path. Total over well-formed paths.
    pub fn key_for(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Listing prefix for a path: the key with a trailing separator.
    pub fn prefix_for(&self, path: &str) -> String {
        let key = self.key_for(path);
        if key.ends_with('/') {
            key
        } else {
            format!("{key}/")
        }
    }

    /// Path for a key, if the key lives under this base.
    pub fn relative<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.base)
    }

    /// Key of the empty-directory sentinel for a directory path.
    pub fn sentinel_key(&self, path: &str) -> String {
        format!("{}{}", self.prefix_for(path), DIR_SENTINEL)
    }
}

/// Appends a name to a directory path.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Parent directory of a path; the root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((p, _)) => p,
    }
}

/// Immediate child name a key contributes under a listing prefix.
///
/// `a/b/c` under prefix `a/` yields `b`; a key equal to the prefix or outside
/// it yields nothing. The caller tells files from directories by whether the
/// key continues past the name.
pub fn child_of<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('/') {
        Some(("", _)) => None,
        Some((name, _)) => Some(name),
        None => Some(rest),
    }
}
