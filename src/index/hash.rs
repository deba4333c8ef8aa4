use crate::config::HashConfig;
use crate::error::{OmnidexError, OmnidexResult};
use crate::index::{EntryCodec, IndexKind, Key, KeyIndex};
use crate::storage::codec::CommonCodec;
use crate::storage::Rid;
use crate::utils::atomic_file;
use bytes::BytesMut;
use log::debug;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const DIR_FILE: &str = "hash.dir";
pub const BUCKETS_FILE: &str = "hash.buckets";

const NO_BUCKET: i64 = -1;
/// Directory growth stops here; beyond it full buckets chain instead.
const MAX_GLOBAL_DEPTH: u32 = 28;

#[derive(Debug, Clone)]
struct Bucket {
    local_depth: u32,
    overflow: i64,
    entries: Vec<(Key, Rid)>,
}

/// Extendible hashing over two files: a directory of `2^g` bucket pointers
/// (rewritten wholesale and renamed on every change, so a crash never leaves
/// a half-grown directory) and a bucket file of fixed-size records with
/// per-bucket local depth and an overflow pointer for the pathological
/// all-identical-hash case. Point lookups only; the only index family that
/// may enforce key uniqueness.
#[derive(Debug)]
pub struct ExtendibleHashIndex {
    dir_path: PathBuf,
    buckets: Mutex<File>,
    codec: EntryCodec,
    config: HashConfig,
    global_depth: u32,
    directory: Vec<u64>,
    bucket_count: u64,
}

impl ExtendibleHashIndex {
    pub fn create(dir: &Path, codec: EntryCodec, config: HashConfig) -> OmnidexResult<Self> {
        let dir_path = dir.join(DIR_FILE);
        let buckets_path = dir.join(BUCKETS_FILE);
        let buckets = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&buckets_path)?;
        let mut index = ExtendibleHashIndex {
            dir_path,
            buckets: Mutex::new(buckets),
            codec,
            config,
            global_depth: 0,
            directory: Vec::new(),
            bucket_count: 0,
        };
        let first = index.alloc_bucket(0)?;
        index.directory = vec![first];
        index.persist_directory()?;
        Ok(index)
    }

    pub fn open(dir: &Path, codec: EntryCodec, config: HashConfig) -> OmnidexResult<Self> {
        let dir_path = dir.join(DIR_FILE);
        let buckets_path = dir.join(BUCKETS_FILE);
        let buckets = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&buckets_path)?;
        let bytes = std::fs::read(&dir_path)?;
        let (global_depth, _) = CommonCodec::decode_u32(&bytes)?;
        let mut directory = Vec::with_capacity(1 << global_depth);
        let mut offset = 4;
        for _ in 0..(1u64 << global_depth) {
            let (id, _) = CommonCodec::decode_u64(&bytes[offset..])?;
            directory.push(id);
            offset += 8;
        }
        let bucket_bytes = bucket_bytes(&codec, &config) as u64;
        let bucket_count = buckets.metadata()?.len() / bucket_bytes;
        Ok(ExtendibleHashIndex {
            dir_path,
            buckets: Mutex::new(buckets),
            codec,
            config,
            global_depth,
            directory,
            bucket_count,
        })
    }

    pub fn global_depth(&self) -> u32 {
        self.global_depth
    }

    pub fn directory_len(&self) -> usize {
        self.directory.len()
    }

    pub fn local_depth_of_slot(&self, slot: usize) -> OmnidexResult<u32> {
        Ok(self.read_bucket(self.directory[slot])?.local_depth)
    }

    fn hash(key: &Key) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn dir_slot(&self, h: u64) -> usize {
        if self.global_depth == 0 {
            0
        } else {
            (h as usize) & ((1usize << self.global_depth) - 1)
        }
    }

    fn bucket_bytes(&self) -> usize {
        bucket_bytes(&self.codec, &self.config)
    }

    fn read_bucket(&self, id: u64) -> OmnidexResult<Bucket> {
        let mut buf = vec![0u8; self.bucket_bytes()];
        let mut file = self.buckets.lock();
        file.seek(SeekFrom::Start(id * self.bucket_bytes() as u64))?;
        file.read_exact(&mut buf)?;
        drop(file);

        let (local_depth, _) = CommonCodec::decode_u32(&buf)?;
        let (count, _) = CommonCodec::decode_u32(&buf[4..])?;
        let (overflow, _) = CommonCodec::decode_i64(&buf[8..])?;
        if count as usize > self.config.bucket_size {
            return Err(OmnidexError::Internal(format!(
                "hash bucket {} claims {} entries with bucket size {}",
                id, count, self.config.bucket_size
            )));
        }
        let mut entries = Vec::with_capacity(count as usize);
        let mut offset = 16;
        for _ in 0..count {
            entries.push(self.codec.decode(&buf[offset..offset + self.codec.entry_size()])?);
            offset += self.codec.entry_size();
        }
        Ok(Bucket {
            local_depth,
            overflow,
            entries,
        })
    }

    fn write_bucket(&self, id: u64, bucket: &Bucket) -> OmnidexResult<()> {
        let mut buf = BytesMut::with_capacity(self.bucket_bytes());
        buf.extend_from_slice(&CommonCodec::encode_u32(bucket.local_depth));
        buf.extend_from_slice(&CommonCodec::encode_u32(bucket.entries.len() as u32));
        buf.extend_from_slice(&CommonCodec::encode_i64(bucket.overflow));
        for (key, rid) in &bucket.entries {
            self.codec.encode(key, *rid, &mut buf);
        }
        buf.resize(self.bucket_bytes(), 0);
        let mut file = self.buckets.lock();
        file.seek(SeekFrom::Start(id * self.bucket_bytes() as u64))?;
        file.write_all(&buf)?;
        Ok(())
    }

    fn alloc_bucket(&mut self, local_depth: u32) -> OmnidexResult<u64> {
        let id = self.bucket_count;
        self.bucket_count += 1;
        self.write_bucket(
            id,
            &Bucket {
                local_depth,
                overflow: NO_BUCKET,
                entries: Vec::new(),
            },
        )?;
        Ok(id)
    }

    fn persist_directory(&self) -> OmnidexResult<()> {
        let mut buf = BytesMut::with_capacity(4 + self.directory.len() * 8);
        buf.extend_from_slice(&CommonCodec::encode_u32(self.global_depth));
        for id in &self.directory {
            buf.extend_from_slice(&CommonCodec::encode_u64(*id));
        }
        atomic_file::write_atomic(&self.dir_path, &buf)
    }

    /// Entries of a primary bucket together with its overflow chain.
    fn collect_chain(&self, id: u64) -> OmnidexResult<Vec<(Key, Rid)>> {
        let mut out = Vec::new();
        let mut cur = id as i64;
        while cur != NO_BUCKET {
            let bucket = self.read_bucket(cur as u64)?;
            out.extend(bucket.entries);
            cur = bucket.overflow;
        }
        Ok(out)
    }

    fn append_into_chain(&mut self, id: u64, key: Key, rid: Rid) -> OmnidexResult<()> {
        let mut cur = id;
        loop {
            let mut bucket = self.read_bucket(cur)?;
            if bucket.entries.len() < self.config.bucket_size {
                bucket.entries.push((key, rid));
                return self.write_bucket(cur, &bucket);
            }
            if bucket.overflow == NO_BUCKET {
                let local = bucket.local_depth;
                let fresh = self.alloc_bucket(local)?;
                bucket.overflow = fresh as i64;
                self.write_bucket(cur, &bucket)?;
                let mut chained = self.read_bucket(fresh)?;
                chained.entries.push((key, rid));
                return self.write_bucket(fresh, &chained);
            }
            cur = bucket.overflow as u64;
        }
    }

    fn double_directory(&mut self) -> OmnidexResult<()> {
        let clone = self.directory.clone();
        self.directory.extend_from_slice(&clone);
        self.global_depth += 1;
        debug!(
            "hash directory doubled to depth {} ({} slots)",
            self.global_depth,
            self.directory.len()
        );
        self.persist_directory()
    }

    /// Split the bucket behind `dir_idx`: bump its local depth, move the
    /// entries whose hash has bit `local` set into a fresh bucket, and
    /// redirect exactly half of the old bucket's directory pointers.
    fn split_bucket(&mut self, dir_idx: usize) -> OmnidexResult<()> {
        let bucket_id = self.directory[dir_idx];
        let bucket = self.read_bucket(bucket_id)?;
        let local = bucket.local_depth;
        if local == self.global_depth {
            self.double_directory()?;
        }

        let all = self.collect_chain(bucket_id)?;
        let new_local = local + 1;
        let new_id = self.alloc_bucket(new_local)?;
        self.write_bucket(
            bucket_id,
            &Bucket {
                local_depth: new_local,
                overflow: NO_BUCKET,
                entries: Vec::new(),
            },
        )?;

        for i in 0..self.directory.len() {
            if self.directory[i] == bucket_id && ((i >> local) & 1) == 1 {
                self.directory[i] = new_id;
            }
        }
        self.persist_directory()?;

        for (key, rid) in all {
            let target = if ((Self::hash(&key) >> local) & 1) == 1 {
                new_id
            } else {
                bucket_id
            };
            self.append_into_chain(target, key, rid)?;
        }
        Ok(())
    }

    /// Merge `dir_idx`'s bucket with its buddy when both sit at the same
    /// local depth, carry no overflow and fit into one bucket together.
    fn try_merge(&mut self, dir_idx: usize) -> OmnidexResult<()> {
        let bucket_id = self.directory[dir_idx];
        let bucket = self.read_bucket(bucket_id)?;
        let local = bucket.local_depth;
        if local == 0 || bucket.overflow != NO_BUCKET {
            return Ok(());
        }
        let pattern = dir_idx & ((1usize << local) - 1);
        let buddy_idx = pattern ^ (1usize << (local - 1));
        let buddy_id = self.directory[buddy_idx];
        if buddy_id == bucket_id {
            return Ok(());
        }
        let buddy = self.read_bucket(buddy_id)?;
        if buddy.local_depth != local
            || buddy.overflow != NO_BUCKET
            || bucket.entries.len() + buddy.entries.len() > self.config.bucket_size
        {
            return Ok(());
        }

        let mut merged = bucket.entries;
        merged.extend(buddy.entries);
        self.write_bucket(
            bucket_id,
            &Bucket {
                local_depth: local - 1,
                overflow: NO_BUCKET,
                entries: merged,
            },
        )?;
        for slot in self.directory.iter_mut() {
            if *slot == buddy_id {
                *slot = bucket_id;
            }
        }
        debug!("hash buddies merged at local depth {}", local - 1);
        self.persist_directory()
    }

    fn lookup(&self, key: &Key) -> OmnidexResult<Vec<Rid>> {
        let slot = self.dir_slot(Self::hash(key));
        let mut rids = Vec::new();
        let mut cur = self.directory[slot] as i64;
        while cur != NO_BUCKET {
            let bucket = self.read_bucket(cur as u64)?;
            for (k, rid) in &bucket.entries {
                if k == key {
                    rids.push(*rid);
                }
            }
            cur = bucket.overflow;
        }
        Ok(rids)
    }
}

impl KeyIndex for ExtendibleHashIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Hash
    }

    fn insert(&mut self, key: Key, rid: Rid) -> OmnidexResult<()> {
        if self.config.unique && !self.lookup(&key)?.is_empty() {
            return Err(OmnidexError::DuplicateKey(key.to_string()));
        }
        let h = Self::hash(&key);
        loop {
            let slot = self.dir_slot(h);
            let bucket_id = self.directory[slot];
            let bucket = self.read_bucket(bucket_id)?;
            if bucket.entries.len() < self.config.bucket_size {
                let mut bucket = bucket;
                bucket.entries.push((key, rid));
                return self.write_bucket(bucket_id, &bucket);
            }

            // Splitting cannot separate identical hashes, and the directory
            // is capped; both cases fall back to an overflow chain.
            let identical = bucket
                .entries
                .iter()
                .all(|(k, _)| Self::hash(k) == h);
            if (identical && bucket.overflow != NO_BUCKET)
                || (identical && bucket.entries.len() >= self.config.bucket_size)
                || self.global_depth >= MAX_GLOBAL_DEPTH
            {
                return self.append_into_chain(bucket_id, key, rid);
            }
            self.split_bucket(slot)?;
        }
    }

    fn search(&self, key: &Key) -> OmnidexResult<Vec<Rid>> {
        self.lookup(key)
    }

    fn range(&self, _lo: &Key, _hi: &Key) -> OmnidexResult<Vec<(Key, Rid)>> {
        Err(OmnidexError::Internal(
            "extendible hash has no key order to range over".to_string(),
        ))
    }

    fn delete(&mut self, key: &Key) -> OmnidexResult<Vec<Rid>> {
        let slot = self.dir_slot(Self::hash(key));
        let mut removed = Vec::new();
        let mut cur = self.directory[slot] as i64;
        while cur != NO_BUCKET {
            let mut bucket = self.read_bucket(cur as u64)?;
            let before = bucket.entries.len();
            bucket.entries.retain(|(k, rid)| {
                if k == key {
                    removed.push(*rid);
                    false
                } else {
                    true
                }
            });
            let next = bucket.overflow;
            if bucket.entries.len() != before {
                self.write_bucket(cur as u64, &bucket)?;
            }
            cur = next;
        }
        if !removed.is_empty() {
            self.try_merge(slot)?;
        }
        Ok(removed)
    }

    fn entries(&self) -> OmnidexResult<Vec<(Key, Rid)>> {
        let mut seen: HashSet<u64> = HashSet::new();
        let mut out = Vec::new();
        for id in &self.directory {
            if seen.insert(*id) {
                out.extend(self.collect_chain(*id)?);
            }
        }
        Ok(out)
    }
}

fn bucket_bytes(codec: &EntryCodec, config: &HashConfig) -> usize {
    4 + 4 + 8 + config.bucket_size * codec.entry_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataType;
    use tempfile::TempDir;

    fn new_index(dir: &Path, bucket_size: usize, unique: bool) -> ExtendibleHashIndex {
        ExtendibleHashIndex::create(
            dir,
            EntryCodec::new(DataType::Int, 12),
            HashConfig {
                bucket_size,
                unique,
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_and_point_lookup() {
        let dir = TempDir::new().unwrap();
        let mut index = new_index(dir.path(), 4, false);
        for i in 0..200i64 {
            index.insert(Key::Int(i), i as Rid).unwrap();
        }
        for i in 0..200i64 {
            assert_eq!(index.search(&Key::Int(i)).unwrap(), vec![i as Rid]);
        }
        assert!(index.search(&Key::Int(777)).unwrap().is_empty());
    }

    #[test]
    fn directory_and_local_depth_invariants_hold() {
        let dir = TempDir::new().unwrap();
        let mut index = new_index(dir.path(), 4, false);
        for i in 0..500i64 {
            index.insert(Key::Int(i), i as Rid).unwrap();
        }
        let g = index.global_depth();
        assert_eq!(index.directory_len(), 1usize << g);
        // Each bucket with local depth l is pointed to by 2^(g-l) slots.
        let mut pointer_counts: std::collections::HashMap<u64, usize> =
            std::collections::HashMap::new();
        for slot in 0..index.directory_len() {
            *pointer_counts.entry(index.directory[slot]).or_default() += 1;
        }
        for (id, count) in pointer_counts {
            let bucket = index.read_bucket(id).unwrap();
            assert!(bucket.local_depth <= g);
            assert_eq!(count, 1usize << (g - bucket.local_depth));
        }
    }

    #[test]
    fn unique_enforcement_and_idempotent_delete() {
        let dir = TempDir::new().unwrap();
        let mut index = new_index(dir.path(), 8, true);
        index.insert(Key::Text("a1".into()), 0).unwrap();
        assert!(matches!(
            index.insert(Key::Text("a1".into()), 1),
            Err(OmnidexError::DuplicateKey(_))
        ));
        assert_eq!(index.delete(&Key::Text("a1".into())).unwrap(), vec![0]);
        assert!(index.delete(&Key::Text("a1".into())).unwrap().is_empty());
    }

    #[test]
    fn duplicates_allowed_when_not_unique() {
        let dir = TempDir::new().unwrap();
        let mut index = new_index(dir.path(), 2, false);
        for rid in 0..5 {
            index.insert(Key::Int(42), rid).unwrap();
        }
        let mut rids = index.search(&Key::Int(42)).unwrap();
        rids.sort_unstable();
        assert_eq!(rids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reopen_restores_directory_and_buckets() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = new_index(dir.path(), 4, false);
            for i in 0..100i64 {
                index.insert(Key::Int(i), i as Rid).unwrap();
            }
        }
        let index = ExtendibleHashIndex::open(
            dir.path(),
            EntryCodec::new(DataType::Int, 12),
            HashConfig {
                bucket_size: 4,
                unique: false,
            },
        )
        .unwrap();
        assert_eq!(index.search(&Key::Int(73)).unwrap(), vec![73]);
        assert_eq!(index.entries().unwrap().len(), 100);
    }

    #[test]
    fn range_is_rejected() {
        let dir = TempDir::new().unwrap();
        let index = new_index(dir.path(), 4, false);
        assert!(index.range(&Key::Int(0), &Key::Int(10)).is_err());
    }
}
