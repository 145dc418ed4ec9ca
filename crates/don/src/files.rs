//! File index: path interning, change detection, and glob expansion.
//!
//! File values on the heap carry a [`FileId`] into this table. The cache
//! records a [`FileStatus`] per dependency and re-stats the path on lookup
//! to decide whether an entry is still current.

use std::{fs, io, path::Path, time::UNIX_EPOCH};

use ahash::AHashMap;

/// Index into the file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u32);

impl FileId {
    #[inline]
    pub(crate) fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Append-only table of file paths referenced during a build.
#[derive(Debug, Default)]
pub struct FileTable {
    paths: Vec<Box<str>>,
    lookup: AHashMap<Box<str>, FileId>,
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a path, returning the existing id when already present.
    pub fn add(&mut self, path: &str) -> FileId {
        if let Some(&id) = self.lookup.get(path) {
            return id;
        }
        let boxed: Box<str> = path.into();
        self.paths.push(boxed.clone());
        let id = FileId(u32::try_from(self.paths.len() - 1).expect("file table overflow"));
        self.lookup.insert(boxed, id);
        id
    }

    /// Returns the path for an id.
    ///
    /// # Panics
    /// Panics if the id did not come from this table.
    #[must_use]
    pub fn name(&self, id: FileId) -> &str {
        &self.paths[id.0 as usize]
    }

    /// Expands a glob pattern into file ids, sorted by path.
    ///
    /// Only the final path segment may contain a wildcard, and at most one
    /// `*`. A pattern without a wildcard matches the file itself when it
    /// exists. Unreadable directories expand to nothing.
    pub fn glob(&mut self, pattern: &str) -> Vec<FileId> {
        let (dir, file_pattern) = match pattern.rfind('/') {
            Some(pos) => (&pattern[..pos], &pattern[pos + 1..]),
            None => (".", pattern),
        };
        if !file_pattern.contains('*') {
            return if Path::new(pattern).exists() {
                vec![self.add(pattern)]
            } else {
                vec![]
            };
        }
        let Ok(entries) = fs::read_dir(dir) else {
            return vec![];
        };
        let mut matches: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| glob_match(file_pattern, name))
            .map(|name| {
                if dir == "." && !pattern.starts_with("./") {
                    name
                } else {
                    format!("{dir}/{name}")
                }
            })
            .collect();
        matches.sort_unstable();
        matches.iter().map(|path| self.add(path)).collect()
    }
}

/// Matches one path segment against a pattern with at most one `*`.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    match pattern.find('*') {
        Some(star) => {
            let (prefix, suffix) = (&pattern[..star], &pattern[star + 1..]);
            name.len() >= prefix.len() + suffix.len() && name.starts_with(prefix) && name.ends_with(suffix)
        }
        None => pattern == name,
    }
}

/// Snapshot of a file's metadata, recorded in cache entries.
///
/// The byte encoding is fixed at 32 bytes, host-endian, matching the
/// cache file's portability contract (none across architectures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStatus {
    pub exists: bool,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
}

/// Encoded size of a [`FileStatus`] in a cache entry.
pub const FILE_STATUS_SIZE: usize = 32;

impl FileStatus {
    /// Stats a path. A missing file is a valid status, not an error.
    #[must_use]
    pub fn capture(path: &str) -> Self {
        match fs::metadata(path) {
            Ok(meta) => {
                let (sec, nsec) = meta
                    .modified()
                    .ok()
                    .and_then(|mtime| match mtime.duration_since(UNIX_EPOCH) {
                        Ok(d) => Some((i64::try_from(d.as_secs()).ok()?, d.subsec_nanos())),
                        Err(_) => None,
                    })
                    .unwrap_or((0, 0));
                Self {
                    exists: true,
                    size: meta.len(),
                    mtime_sec: sec,
                    mtime_nsec: nsec,
                }
            }
            Err(_) => Self::default(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&u64::from(self.exists).to_ne_bytes());
        out.extend_from_slice(&self.size.to_ne_bytes());
        out.extend_from_slice(&self.mtime_sec.to_ne_bytes());
        out.extend_from_slice(&u64::from(self.mtime_nsec).to_ne_bytes());
    }

    /// Decodes a status from a cache entry.
    ///
    /// # Errors
    /// Fails when fewer than [`FILE_STATUS_SIZE`] bytes remain.
    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < FILE_STATUS_SIZE {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated file status"));
        }
        let field = |i: usize| -> [u8; 8] { bytes[i * 8..i * 8 + 8].try_into().expect("sliced to length") };
        Ok(Self {
            exists: u64::from_ne_bytes(field(0)) != 0,
            size: u64::from_ne_bytes(field(1)),
            mtime_sec: i64::from_ne_bytes(field(2)),
            mtime_nsec: u64::from_ne_bytes(field(3)) as u32,
        })
    }
}

/// Returns true when `path` no longer matches the recorded status.
///
/// A stat failure on an existing record counts as changed.
#[must_use]
pub fn has_changed(path: &str, recorded: &FileStatus) -> bool {
    FileStatus::capture(path) != *recorded
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write as _;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn glob_segment_matching() {
        assert!(glob_match("*.c", "main.c"));
        assert!(glob_match("main.*", "main.c"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("*.c", "main.h"));
        assert!(!glob_match("a*b", "acx"));
        assert!(glob_match("a*b", "ab"));
        assert!(!glob_match("ab*cd", "abd"));
    }

    #[test]
    fn glob_expands_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.src", "a.src", "c.txt"] {
            File::create(dir.path().join(name)).unwrap();
        }
        let mut table = FileTable::new();
        let base = dir.path().to_str().unwrap();
        let files = table.glob(&format!("{base}/*.src"));
        let names: Vec<&str> = files.iter().map(|&id| table.name(id)).collect();
        assert_eq!(names, vec![format!("{base}/a.src"), format!("{base}/b.src")]);
    }

    #[test]
    fn status_round_trip_and_change_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dep.txt");
        let path_str = path.to_str().unwrap();
        File::create(&path).unwrap().write_all(b"one").unwrap();

        let status = FileStatus::capture(path_str);
        assert!(status.exists);
        assert_eq!(status.size, 3);

        let mut encoded = Vec::new();
        status.encode(&mut encoded);
        assert_eq!(encoded.len(), FILE_STATUS_SIZE);
        assert_eq!(FileStatus::decode(&encoded).unwrap(), status);

        assert!(!has_changed(path_str, &status));
        File::create(&path).unwrap().write_all(b"longer").unwrap();
        assert!(has_changed(path_str, &status));
    }

    #[test]
    fn missing_file_status() {
        let status = FileStatus::capture("/definitely/not/here");
        assert!(!status.exists);
        assert!(!has_changed("/definitely/not/here", &status));
    }
}
