//! The persistent result cache.
//!
//! Artifacts are addressed by a 30-byte digest; each digest owns a
//! directory `<c0><c1>/<c2..c47>` under the cache root (base-32 path
//! encoding) and a variable-length entry record in one of up to three
//! index files.
//!
//! The tri-file index makes appends crash-safe: a session reads one
//! index and appends new entries to a second; shutdown compacts the
//! read index into the write index and deletes it. Finding three valid
//! files at startup means a rebuild was interrupted; the newest is
//! discarded and the rebuild re-run. The rebuild decision is a pure
//! function of the three sequence numbers ([`plan_startup`]) so it can
//! be tested without touching a file system.
//!
//! Entry records are host-endian; cache files are not portable across
//! architectures.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read as _, Write as _},
    path::{Path, PathBuf},
};

use crate::{
    files::{FILE_STATUS_SIZE, FileStatus, has_changed},
    heap::Heap,
    intern::Interner,
    value::VRef,
};

/// Bytes of the truncated digest. Divisible by 5 for base-32 encoding.
pub const DIGEST_SIZE: usize = 30;

/// Characters in an encoded digest.
pub const FILENAME_LENGTH: usize = DIGEST_SIZE / 5 * 8;

/// Index file magic, `"\0non"` read host-endian on little-endian machines.
const TAG: u32 = 0x646f_6e00;

/// Index header: one ignored byte (padded to 8), an ignored size, the
/// sequence number, and the tag.
const HEADER_SIZE: usize = 24;

const TABLE_SIZE: usize = 0x10000;
const TABLE_MASK: usize = 0xffff;

/// Fixed part of an entry record: size, digest, dependency count, and
/// the three payload lengths.
const ENTRY_PROLOG: usize = 8 + DIGEST_SIZE + 16;

/// The effectful side of the startup protocol, derived from the three
/// sequence numbers alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildPlan {
    /// Slot whose file is deleted first (interrupted rebuild leftover).
    pub delete: Option<usize>,
    /// Concatenate `sources` (in sequence order) into `dest`.
    pub rebuild: Option<Rebuild>,
    /// Slot to load as the read index when no rebuild is needed.
    pub read: Option<usize>,
    /// Slot and sequence number of the fresh write index.
    pub write: (usize, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebuild {
    pub sources: [usize; 2],
    pub dest: usize,
    pub sequence: u32,
}

/// Decides what startup must do, given each slot's sequence number
/// (`None` for a missing or invalid file).
#[must_use]
pub fn plan_startup(mut seqs: [Option<u32>; 3]) -> RebuildPlan {
    let mut delete = None;
    if seqs.iter().all(Option::is_some) {
        // A prior rebuild was interrupted; drop the file it was writing,
        // which carries the strictly largest sequence number.
        let newest = (0..3)
            .max_by_key(|&slot| seqs[slot].expect("all present"))
            .expect("three slots");
        seqs[newest] = None;
        delete = Some(newest);
    }

    let survivors: Vec<usize> = (0..3).filter(|&slot| seqs[slot].is_some()).collect();
    match survivors[..] {
        [a, b] => {
            let (lo, hi) = if seqs[a] < seqs[b] { (a, b) } else { (b, a) };
            let dest = (0..3).find(|&slot| seqs[slot].is_none()).expect("one slot free");
            let top = seqs[hi].expect("survivor");
            RebuildPlan {
                delete,
                rebuild: Some(Rebuild {
                    sources: [lo, hi],
                    dest,
                    sequence: top + 1,
                }),
                read: None,
                write: (lo, top + 2),
            }
        }
        [only] => {
            let write_slot = (0..3).find(|&slot| slot != only).expect("two slots free");
            RebuildPlan {
                delete,
                rebuild: None,
                read: Some(only),
                write: (write_slot, seqs[only].expect("survivor") + 1),
            }
        }
        [] => RebuildPlan {
            delete,
            rebuild: None,
            read: None,
            write: (0, 1),
        },
        _ => unreachable!("at most two survivors after the delete step"),
    }
}

/// Parsed view of one entry record.
struct EntryView<'a> {
    size: usize,
    digest: &'a [u8],
    deps: Vec<(String, FileStatus)>,
    data: &'a [u8],
    out: &'a [u8],
    err: &'a [u8],
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(bytes[offset..offset + 8].try_into().expect("sliced to length"))
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(bytes[offset..offset + 4].try_into().expect("sliced to length"))
}

fn parse_entry(bytes: &[u8]) -> io::Result<EntryView<'_>> {
    if bytes.len() < ENTRY_PROLOG {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated cache entry"));
    }
    let size = usize::try_from(read_u64(bytes, 0)).expect("entry size fits usize");
    let digest = &bytes[8..8 + DIGEST_SIZE];
    let dep_count = read_u32(bytes, 8 + DIGEST_SIZE) as usize;
    let out_len = read_u32(bytes, 8 + DIGEST_SIZE + 4) as usize;
    let err_len = read_u32(bytes, 8 + DIGEST_SIZE + 8) as usize;
    let data_len = read_u32(bytes, 8 + DIGEST_SIZE + 12) as usize;

    let mut cursor = ENTRY_PROLOG;
    let mut path_lengths = Vec::with_capacity(dep_count);
    let mut statuses = Vec::with_capacity(dep_count);
    for _ in 0..dep_count {
        if bytes.len() < cursor + 4 + FILE_STATUS_SIZE {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated cache entry"));
        }
        path_lengths.push(read_u32(bytes, cursor) as usize);
        statuses.push(FileStatus::decode(&bytes[cursor + 4..])?);
        cursor += 4 + FILE_STATUS_SIZE;
    }
    let mut deps = Vec::with_capacity(dep_count);
    for (length, status) in path_lengths.into_iter().zip(statuses) {
        if bytes.len() < cursor + length {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated cache entry"));
        }
        let path = String::from_utf8_lossy(&bytes[cursor..cursor + length]).into_owned();
        deps.push((path, status));
        cursor += length;
    }
    if bytes.len() < cursor + data_len + out_len + err_len || size < cursor + data_len + out_len + err_len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated cache entry"));
    }
    let data = &bytes[cursor..cursor + data_len];
    let out = &bytes[cursor + data_len..cursor + data_len + out_len];
    let err = &bytes[cursor + data_len + out_len..cursor + data_len + out_len + err_len];
    Ok(EntryView {
        size,
        digest,
        deps,
        data,
        out,
        err,
    })
}

/// Result of a cache lookup. `uptodate` is false on a miss or when any
/// recorded dependency changed; the value refs are null in that case.
#[derive(Debug)]
pub struct CacheLookup {
    /// Artifact directory for this digest (created on a miss).
    pub path: String,
    pub uptodate: bool,
    pub out: VRef,
    pub err: VRef,
    pub data: VRef,
}

#[derive(Clone, Copy)]
struct TableSlot {
    digest: [u8; DIGEST_SIZE],
    /// Entry offset + 1; 0 marks an empty slot.
    entry: usize,
}

/// The open cache: artifact tree plus the in-memory index.
pub struct Cache {
    dir: PathBuf,
    /// Entries of the read index, loaded once at startup.
    old_entries: Vec<u8>,
    /// Entries appended this session, also written through to the write
    /// index file.
    new_entries: Vec<u8>,
    table: Vec<TableSlot>,
    entry_count: usize,
    /// Offsets into `old_entries` superseded this session; compaction
    /// skips them at shutdown.
    removed: Vec<usize>,
    read_path: Option<PathBuf>,
    write_file: File,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("dir", &self.dir)
            .field("entries", &self.entry_count)
            .field("old_bytes", &self.old_entries.len())
            .field("new_bytes", &self.new_entries.len())
            .finish()
    }
}

fn index_path(dir: &Path, slot: usize) -> PathBuf {
    dir.join(format!("index{}", slot + 1))
}

fn write_header(file: &mut File, sequence: u32) -> io::Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    header[16..20].copy_from_slice(&sequence.to_ne_bytes());
    header[20..24].copy_from_slice(&TAG.to_ne_bytes());
    file.write_all(&header)
}

/// Reads an index file's body, deleting the file when the header is
/// invalid. Returns the sequence number and entry bytes.
fn open_index(path: &Path) -> io::Result<Option<(u32, Vec<u8>)>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.len() <= HEADER_SIZE {
        fs::remove_file(path)?;
        return Ok(None);
    }
    let sequence = read_u32(&bytes, 16);
    let tag = read_u32(&bytes, 20);
    if tag != TAG || sequence == 0 {
        fs::remove_file(path)?;
        return Ok(None);
    }
    bytes.drain(..HEADER_SIZE);
    Ok(Some((sequence, bytes)))
}

impl Cache {
    /// Opens (and if necessary repairs) the cache under `dir`.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let mut bodies: [Option<(u32, Vec<u8>)>; 3] = [None, None, None];
        for slot in 0..3 {
            bodies[slot] = open_index(&index_path(dir, slot))?;
        }
        let seqs = [
            bodies[0].as_ref().map(|(s, _)| *s),
            bodies[1].as_ref().map(|(s, _)| *s),
            bodies[2].as_ref().map(|(s, _)| *s),
        ];
        let plan = plan_startup(seqs);

        if let Some(slot) = plan.delete {
            fs::remove_file(index_path(dir, slot))?;
            bodies[slot] = None;
        }

        let mut old_entries = Vec::new();
        let mut read_path = None;
        if let Some(rebuild) = &plan.rebuild {
            let dest_path = index_path(dir, rebuild.dest);
            let mut dest = OpenOptions::new().create(true).truncate(true).write(true).open(&dest_path)?;
            write_header(&mut dest, rebuild.sequence)?;
            for &source in &rebuild.sources {
                let (_, body) = bodies[source].as_ref().expect("rebuild source present");
                dest.write_all(body)?;
            }
            drop(dest);
            let Some((_, body)) = open_index(&dest_path)? else {
                return Err(io::Error::other("error reopening rebuilt cache index"));
            };
            for &source in &rebuild.sources {
                fs::remove_file(index_path(dir, source))?;
            }
            old_entries = body;
            read_path = Some(dest_path);
        } else if let Some(slot) = plan.read {
            let (_, body) = bodies[slot].take().expect("read slot present");
            old_entries = body;
            read_path = Some(index_path(dir, slot));
        }

        let (write_slot, write_seq) = plan.write;
        let mut write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(index_path(dir, write_slot))?;
        write_header(&mut write_file, write_seq)?;

        let mut cache = Self {
            dir: dir.to_owned(),
            old_entries,
            new_entries: Vec::new(),
            table: vec![
                TableSlot {
                    digest: [0; DIGEST_SIZE],
                    entry: 0,
                };
                TABLE_SIZE
            ],
            entry_count: 0,
            removed: Vec::new(),
            read_path,
            write_file,
        };
        cache.build_table()?;
        Ok(cache)
    }

    /// Indexes every entry of the read segment. A digest appearing twice
    /// keeps the later record and marks the earlier one removed.
    fn build_table(&mut self) -> io::Result<()> {
        let mut offset = 0;
        while offset < self.old_entries.len() {
            let entry = parse_entry(&self.old_entries[offset..])?;
            let size = entry.size;
            let mut digest = [0u8; DIGEST_SIZE];
            digest.copy_from_slice(entry.digest);
            let mut slot = table_index(&digest);
            loop {
                if self.table[slot].entry == 0 {
                    assert!(self.entry_count < TABLE_MASK, "cache index table full");
                    self.entry_count += 1;
                    break;
                }
                if self.table[slot].digest == digest {
                    self.removed.push(self.table[slot].entry - 1);
                    break;
                }
                slot = (slot + 1) & TABLE_MASK;
            }
            self.table[slot].digest = digest;
            self.table[slot].entry = offset + 1;
            offset += size;
        }
        Ok(())
    }

    fn entry_bytes(&self, offset: usize) -> &[u8] {
        if offset < self.old_entries.len() {
            &self.old_entries[offset..]
        } else {
            &self.new_entries[offset - self.old_entries.len()..]
        }
    }

    /// Artifact directory path for a digest, relative to the cache root.
    fn artifact_path(&self, digest: &[u8; DIGEST_SIZE]) -> String {
        let mut encoded = String::with_capacity(FILENAME_LENGTH);
        crate::base32::encode(digest, &mut encoded);
        format!("{}/{}/{}", self.dir.display(), &encoded[..2], &encoded[2..])
    }

    /// Looks up a digest and verifies its recorded dependencies.
    ///
    /// On a miss the artifact directory is created so the caller can
    /// populate it; on a hit with a changed dependency `uptodate` is
    /// false and the stale entry is left for a later `set_uptodate` to
    /// supersede.
    pub fn get(&mut self, heap: &mut Heap, digest: &[u8; DIGEST_SIZE]) -> io::Result<CacheLookup> {
        let path = self.artifact_path(digest);
        let miss = |path: String| CacheLookup {
            path,
            uptodate: false,
            out: VRef::NULL,
            err: VRef::NULL,
            data: VRef::NULL,
        };

        let mut slot = table_index(digest);
        let entry_offset = loop {
            if self.table[slot].entry == 0 {
                fs::create_dir_all(&path)?;
                return Ok(miss(path));
            }
            if &self.table[slot].digest == digest {
                break self.table[slot].entry - 1;
            }
            slot = (slot + 1) & TABLE_MASK;
        };

        let entry = parse_entry(self.entry_bytes(entry_offset))?;
        for (dep_path, status) in &entry.deps {
            if has_changed(dep_path, status) {
                return Ok(miss(path));
            }
        }

        let out = heap.create_string(entry.out);
        let err = heap.create_string(entry.err);
        let data = heap.create_string(entry.data);
        Ok(CacheLookup {
            path,
            uptodate: true,
            out,
            err,
            data,
        })
    }

    /// Records a fresh result for the digest encoded in `path`.
    ///
    /// `deps` is a collection of file values whose current status is
    /// captured into the entry; `out`, `err`, and `data` are rendered as
    /// strings. The entry is appended in memory and written through to
    /// the write index for durability.
    pub fn set_uptodate(
        &mut self,
        heap: &Heap,
        interns: &Interner,
        path: &str,
        deps: VRef,
        out: VRef,
        err: VRef,
        data: VRef,
    ) -> io::Result<()> {
        // The digest comes back out of the artifact path.
        assert!(path.len() > FILENAME_LENGTH, "artifact path too short");
        let tail = &path.as_bytes()[path.len() - FILENAME_LENGTH - 1..];
        assert_eq!(tail[2], b'/', "malformed artifact path");
        let mut encoded = Vec::with_capacity(FILENAME_LENGTH);
        encoded.extend_from_slice(&tail[..2]);
        encoded.extend_from_slice(&tail[3..]);
        let mut digest_bytes = Vec::with_capacity(DIGEST_SIZE);
        crate::base32::decode(&encoded, &mut digest_bytes);
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&digest_bytes);

        // Claim or supersede the table slot.
        assert!(self.entry_count < TABLE_MASK, "cache index table full");
        let mut slot = table_index(&digest);
        loop {
            if self.table[slot].entry == 0 {
                self.entry_count += 1;
                self.table[slot].digest = digest;
                break;
            }
            if self.table[slot].digest == digest {
                let offset = self.table[slot].entry - 1;
                if offset < self.old_entries.len() {
                    self.note_removed(offset);
                }
                break;
            }
            slot = (slot + 1) & TABLE_MASK;
        }
        self.table[slot].entry = self.old_entries.len() + self.new_entries.len() + 1;

        // Serialise the entry.
        let start = self.new_entries.len();
        self.new_entries.extend_from_slice(&[0u8; 8]); // size, patched below
        self.new_entries.extend_from_slice(&digest);
        let dep_count = heap.collection_size(deps);
        self.new_entries
            .extend_from_slice(&u32::try_from(dep_count).expect("dependency count fits").to_ne_bytes());
        let out_len = heap.string_length(interns, out);
        let err_len = heap.string_length(interns, err);
        let data_len = heap.string_length(interns, data);
        self.new_entries
            .extend_from_slice(&u32::try_from(out_len).expect("output fits").to_ne_bytes());
        self.new_entries
            .extend_from_slice(&u32::try_from(err_len).expect("output fits").to_ne_bytes());
        self.new_entries
            .extend_from_slice(&u32::try_from(data_len).expect("output fits").to_ne_bytes());

        let mut dep_paths: Vec<String> = Vec::with_capacity(dep_count);
        for dep in heap.iterate(deps) {
            dep_paths.push(heap.render(interns, dep));
        }
        for dep_path in &dep_paths {
            self.new_entries
                .extend_from_slice(&u32::try_from(dep_path.len()).expect("path fits").to_ne_bytes());
            FileStatus::capture(dep_path).encode(&mut self.new_entries);
        }
        for dep_path in &dep_paths {
            self.new_entries.extend_from_slice(dep_path.as_bytes());
        }
        heap.write_string(interns, data, &mut self.new_entries);
        heap.write_string(interns, out, &mut self.new_entries);
        heap.write_string(interns, err, &mut self.new_entries);

        let size = self.new_entries.len() - start;
        self.new_entries[start..start + 8].copy_from_slice(&(size as u64).to_ne_bytes());

        // Write-through; an error here is fatal for the build.
        self.write_file.write_all(&self.new_entries[start..])?;
        Ok(())
    }

    /// Records a superseded old-segment offset, keeping the list free of
    /// duplicates so the shutdown sort stays strictly increasing.
    fn note_removed(&mut self, offset: usize) {
        if !self.removed.contains(&offset) {
            self.removed.push(offset);
        }
    }

    /// Compacts the read index into the write index and retires it. The
    /// write index becomes the next session's read index.
    pub fn close(mut self) -> io::Result<()> {
        self.removed.sort_unstable();
        let mut removed = self.removed.iter().copied().peekable();
        let mut offset = 0;
        let mut write_start = 0;
        let mut last: Option<usize> = None;
        while offset < self.old_entries.len() {
            let size = usize::try_from(read_u64(&self.old_entries, offset)).expect("entry size fits usize");
            if removed.peek() == Some(&offset) {
                if let Some(previous) = last {
                    assert!(previous < offset, "removed offsets must be strictly increasing");
                }
                last = Some(offset);
                removed.next();
                if write_start < offset {
                    self.write_file.write_all(&self.old_entries[write_start..offset])?;
                }
                write_start = offset + size;
            }
            offset += size;
        }
        if write_start < self.old_entries.len() {
            self.write_file.write_all(&self.old_entries[write_start..])?;
        }
        self.write_file.flush()?;
        drop(self.write_file);
        if let Some(read_path) = self.read_path {
            fs::remove_file(read_path)?;
        }
        Ok(())
    }
}

fn table_index(digest: &[u8; DIGEST_SIZE]) -> usize {
    usize::try_from(read_u64(digest, 0)).expect("eight bytes fit usize") & TABLE_MASK
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plan_with_no_files_starts_fresh() {
        let plan = plan_startup([None, None, None]);
        assert_eq!(plan.delete, None);
        assert_eq!(plan.rebuild, None);
        assert_eq!(plan.read, None);
        assert_eq!(plan.write, (0, 1));
    }

    #[test]
    fn plan_with_one_file_reads_it() {
        let plan = plan_startup([None, Some(7), None]);
        assert_eq!(plan.read, Some(1));
        assert_eq!(plan.write, (0, 8));

        let plan = plan_startup([Some(3), None, None]);
        assert_eq!(plan.read, Some(0));
        assert_eq!(plan.write, (1, 4));
    }

    #[test]
    fn plan_with_two_files_rebuilds_into_the_free_slot() {
        let plan = plan_startup([Some(4), Some(3), None]);
        assert_eq!(
            plan.rebuild,
            Some(Rebuild {
                sources: [1, 0],
                dest: 2,
                sequence: 5,
            })
        );
        assert_eq!(plan.read, None);
        // The write index reuses the lower-sequence source's slot.
        assert_eq!(plan.write, (1, 6));
    }

    #[test]
    fn plan_with_three_files_deletes_the_newest_first() {
        let plan = plan_startup([Some(2), Some(3), Some(9)]);
        assert_eq!(plan.delete, Some(2));
        assert_eq!(
            plan.rebuild,
            Some(Rebuild {
                sources: [0, 1],
                dest: 2,
                sequence: 4,
            })
        );
        assert_eq!(plan.write, (0, 5));
    }

    #[test]
    fn plan_is_idempotent_across_crash_points() {
        // Whatever the combination, the plan always ends with exactly
        // one read source (or a rebuild producing one) and a write slot
        // distinct from it.
        for a in [None, Some(1)] {
            for b in [None, Some(2)] {
                for c in [None, Some(3)] {
                    let plan = plan_startup([a, b, c]);
                    if let Some(rebuild) = &plan.rebuild {
                        assert!(!rebuild.sources.contains(&rebuild.dest));
                        assert_ne!(plan.write.0, rebuild.dest);
                    } else if let Some(read) = plan.read {
                        assert_ne!(plan.write.0, read);
                    }
                }
            }
        }
    }

    #[test]
    fn entry_round_trip() {
        let mut heap = Heap::new();
        let interns = Interner::new();
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).unwrap();

        let digest = [7u8; DIGEST_SIZE];
        let lookup = cache.get(&mut heap, &digest).unwrap();
        assert!(!lookup.uptodate);
        assert!(Path::new(&lookup.path).is_dir());

        let out = heap.create_string(b"compiled 3 files");
        let err = heap.create_string(b"");
        let data = heap.create_string(b"artifact-list");
        let deps = heap.singles().empty_list;
        cache
            .set_uptodate(&heap, &interns, &lookup.path, deps, out, err, data)
            .unwrap();

        let hit = cache.get(&mut heap, &digest).unwrap();
        assert!(hit.uptodate);
        assert_eq!(heap.render(&interns, hit.out), "compiled 3 files");
        assert_eq!(heap.render(&interns, hit.data), "artifact-list");
        cache.close().unwrap();
    }

    #[test]
    fn cache_survives_restart() {
        let mut heap = Heap::new();
        let interns = Interner::new();
        let dir = tempfile::tempdir().unwrap();
        let digest = [1u8; DIGEST_SIZE];

        {
            let mut cache = Cache::open(dir.path()).unwrap();
            let lookup = cache.get(&mut heap, &digest).unwrap();
            let out = heap.create_string(b"hello");
            let empty = heap.singles().empty_string;
            let deps = heap.singles().empty_list;
            cache
                .set_uptodate(&heap, &interns, &lookup.path, deps, out, empty, empty)
                .unwrap();
            cache.close().unwrap();
        }
        {
            let mut cache = Cache::open(dir.path()).unwrap();
            let hit = cache.get(&mut heap, &digest).unwrap();
            assert!(hit.uptodate);
            assert_eq!(heap.render(&interns, hit.out), "hello");
            cache.close().unwrap();
        }
    }

    #[test]
    fn changed_dependency_invalidates() {
        use std::io::Write as _;

        let mut heap = Heap::new();
        let interns = Interner::new();
        let dir = tempfile::tempdir().unwrap();
        let dep_file = dir.path().join("input.txt");
        std::fs::File::create(&dep_file).unwrap().write_all(b"v1").unwrap();
        let dep_path = dep_file.to_str().unwrap().to_owned();

        let mut cache = Cache::open(dir.path().join("cache").as_path()).unwrap();
        let digest = [9u8; DIGEST_SIZE];
        let lookup = cache.get(&mut heap, &digest).unwrap();
        let dep = heap.create_file(&dep_path);
        let deps = heap.create_array(&[dep]);
        let out = heap.create_string(b"ok");
        let empty = heap.singles().empty_string;
        cache
            .set_uptodate(&heap, &interns, &lookup.path, deps, out, empty, empty)
            .unwrap();

        assert!(cache.get(&mut heap, &digest).unwrap().uptodate);
        std::fs::File::create(&dep_file).unwrap().write_all(b"changed").unwrap();
        assert!(!cache.get(&mut heap, &digest).unwrap().uptodate);
        cache.close().unwrap();
    }

    #[test]
    fn superseded_entries_are_compacted_away() {
        let mut heap = Heap::new();
        let interns = Interner::new();
        let dir = tempfile::tempdir().unwrap();
        let digest = [5u8; DIGEST_SIZE];

        // Session 1 records a value; session 2 supersedes it; session 3
        // must see only the newer value, with the old record compacted
        // out of the surviving index.
        for (round, text) in [(1, "first"), (2, "second")] {
            let mut cache = Cache::open(dir.path()).unwrap();
            let lookup = cache.get(&mut heap, &digest).unwrap();
            if round == 2 {
                assert!(lookup.uptodate);
            }
            let out = heap.create_string(text.as_bytes());
            let empty = heap.singles().empty_string;
            let deps = heap.singles().empty_list;
            cache
                .set_uptodate(&heap, &interns, &lookup.path, deps, out, empty, empty)
                .unwrap();
            cache.close().unwrap();
        }

        let mut cache = Cache::open(dir.path()).unwrap();
        let hit = cache.get(&mut heap, &digest).unwrap();
        assert!(hit.uptodate);
        assert_eq!(heap.render(&interns, hit.out), "second");
        cache.close().unwrap();
    }

    #[test]
    fn rebuild_merges_two_indices_in_sequence_order() {
        // Simulate a crash that left index1 and index2 behind, the
        // second superseding the first, then verify startup merges them
        // into index3 and opens a fresh write index in index1's slot.
        let mut heap = Heap::new();
        let interns = Interner::new();
        let dir = tempfile::tempdir().unwrap();
        let digest = [3u8; DIGEST_SIZE];

        let build_index = |path: &Path, sequence: u32, text: &str, heap: &mut Heap, interns: &Interner| {
            use std::io::Write as _;

            let mut scratch = Cache::open(&path.join("scratch")).unwrap();
            let lookup = scratch.get(heap, &digest).unwrap();
            let out = heap.create_string(text.as_bytes());
            let empty = heap.singles().empty_string;
            let deps = heap.singles().empty_list;
            scratch
                .set_uptodate(heap, interns, &lookup.path, deps, out, empty, empty)
                .unwrap();
            // Steal the written entry bytes for a hand-built index file.
            let entries = scratch.new_entries.clone();
            let mut file = File::create(path.join(format!("index{sequence}"))).unwrap();
            write_header(&mut file, sequence).unwrap();
            file.write_all(&entries).unwrap();
        };
        build_index(dir.path(), 1, "old", &mut heap, &interns);
        build_index(dir.path(), 2, "new", &mut heap, &interns);
        fs::remove_dir_all(dir.path().join("scratch")).unwrap();

        let mut cache = Cache::open(dir.path()).unwrap();
        assert!(dir.path().join("index3").exists(), "rebuilt index");
        assert!(dir.path().join("index1").exists(), "fresh write index");
        assert!(!dir.path().join("index2").exists(), "source deleted");
        let hit = cache.get(&mut heap, &digest).unwrap();
        assert!(hit.uptodate);
        assert_eq!(heap.render(&interns, hit.out), "new");
        cache.close().unwrap();
    }

    #[test]
    fn invalid_header_is_deleted_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("index1");
        fs::write(&bogus, b"not a cache index but long enough to pass the size check....").unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        drop(cache);
        // The corrupt file was replaced by the fresh write index.
        let bytes = fs::read(&bogus).unwrap();
        assert_eq!(read_u32(&bytes, 20), TAG);
    }
}
