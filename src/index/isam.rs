use crate::config::IsamConfig;
use crate::error::{OmnidexError, OmnidexResult};
use crate::index::{EntryCodec, IndexKind, Key, KeyIndex};
use crate::storage::codec::{CommonCodec, FieldCodec};
use crate::storage::Rid;
use bytes::BytesMut;
use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const DATA_FILE: &str = "isam.data";
pub const LEAF_FILE: &str = "isam.lf";
pub const ROOT_FILE: &str = "isam.rt";

const NO_PAGE: i64 = -1;

#[derive(Debug, Clone)]
struct PageSlot {
    live: bool,
    key: Key,
    rid: Rid,
}

#[derive(Debug, Clone)]
struct DataPage {
    overflow: i64,
    slots: Vec<PageSlot>,
}

/// Static two-level ISAM: data pages packed once from sorted input, a leaf
/// index of first-keys per data page, and a root index of first-keys per
/// leaf page, both frozen at build time. Later inserts go to per-page
/// overflow chains; the sparse index is never rebuilt, so long chains are a
/// diagnosable cost rather than a failure.
#[derive(Debug)]
pub struct IsamIndex {
    dir: std::path::PathBuf,
    data: Mutex<File>,
    codec: EntryCodec,
    config: IsamConfig,
    unique: bool,
    /// (first key, data page) per primary page, loaded from `isam.lf`.
    leaf: Vec<(Key, u64)>,
    /// (first key, leaf page index) per chunk of leaf entries, from `isam.rt`.
    root: Vec<(Key, u64)>,
    page_count: u64,
    primary_pages: u64,
}

impl IsamIndex {
    /// One pass over input already sorted by key.
    pub fn build(
        dir: &Path,
        codec: EntryCodec,
        config: IsamConfig,
        unique: bool,
        sorted: &[(Key, Rid)],
    ) -> OmnidexResult<Self> {
        if unique {
            for pair in sorted.windows(2) {
                if pair[0].0 == pair[1].0 {
                    return Err(OmnidexError::DuplicateKey(pair[0].0.to_string()));
                }
            }
        }
        let bf = config.blocking_factor;
        let data_path = dir.join(DATA_FILE);
        let mut data = open_rw(&data_path)?;

        let mut leaf: Vec<(Key, u64)> = Vec::new();
        for (page_idx, chunk) in sorted.chunks(bf.max(1)).enumerate() {
            leaf.push((chunk[0].0.clone(), page_idx as u64));
            let page = DataPage {
                overflow: NO_PAGE,
                slots: chunk
                    .iter()
                    .map(|(key, rid)| PageSlot {
                        live: true,
                        key: key.clone(),
                        rid: *rid,
                    })
                    .collect(),
            };
            data.write_all(&encode_page(&codec, bf, &page))?;
        }
        data.sync_all()?;

        let root: Vec<(Key, u64)> = leaf
            .chunks(bf.max(1))
            .enumerate()
            .map(|(i, chunk)| (chunk[0].0.clone(), i as u64))
            .collect();

        write_sparse(&dir.join(LEAF_FILE), &codec, &leaf)?;
        write_sparse(&dir.join(ROOT_FILE), &codec, &root)?;
        debug!(
            "isam build: {} entries, {} data pages, {} root entries",
            sorted.len(),
            leaf.len(),
            root.len()
        );

        let page_count = leaf.len() as u64;
        Ok(IsamIndex {
            dir: dir.to_path_buf(),
            data: Mutex::new(data),
            codec,
            config,
            unique,
            leaf,
            root,
            page_count,
            primary_pages: page_count,
        })
    }

    pub fn open(
        dir: &Path,
        codec: EntryCodec,
        config: IsamConfig,
        unique: bool,
    ) -> OmnidexResult<Self> {
        let data_path = dir.join(DATA_FILE);
        let data = open_rw(&data_path)?;
        let leaf = read_sparse(&dir.join(LEAF_FILE), &codec)?;
        let root = read_sparse(&dir.join(ROOT_FILE), &codec)?;
        let page_size = page_size(&codec, config.blocking_factor) as u64;
        let page_count = data.metadata()?.len() / page_size;
        Ok(IsamIndex {
            dir: dir.to_path_buf(),
            data: Mutex::new(data),
            codec,
            config,
            unique,
            primary_pages: leaf.len() as u64,
            leaf,
            root,
            page_count,
        })
    }

    fn page_bytes(&self) -> usize {
        page_size(&self.codec, self.config.blocking_factor)
    }

    fn read_page(&self, idx: u64) -> OmnidexResult<DataPage> {
        let mut buf = vec![0u8; self.page_bytes()];
        let mut data = self.data.lock();
        data.seek(SeekFrom::Start(idx * self.page_bytes() as u64))?;
        data.read_exact(&mut buf)?;
        drop(data);
        decode_page(&self.codec, self.config.blocking_factor, &buf)
    }

    fn write_page(&self, idx: u64, page: &DataPage) -> OmnidexResult<()> {
        let bytes = encode_page(&self.codec, self.config.blocking_factor, page);
        let mut data = self.data.lock();
        data.seek(SeekFrom::Start(idx * self.page_bytes() as u64))?;
        data.write_all(&bytes)?;
        Ok(())
    }

    fn append_page(&mut self, page: &DataPage) -> OmnidexResult<u64> {
        let idx = self.page_count;
        self.write_page(idx, page)?;
        self.page_count += 1;
        Ok(idx)
    }

    /// Root -> leaf descent to the primary page that may hold `key`.
    /// Starts one page early so duplicates crossing a page boundary are
    /// still found.
    fn descend(&self, key: &Key) -> u64 {
        if self.leaf.is_empty() {
            return 0;
        }
        let chunk = self
            .root
            .partition_point(|(first, _)| first < key)
            .saturating_sub(1);
        let bf = self.config.blocking_factor.max(1);
        let leaf_lo = chunk * bf;
        let leaf_hi = (leaf_lo + bf).min(self.leaf.len());
        let within = self.leaf[leaf_lo..leaf_hi]
            .partition_point(|(first, _)| first < key)
            .saturating_sub(1);
        (leaf_lo + within) as u64
    }

    fn root_of(&self, leaf: &[(Key, u64)]) -> Vec<(Key, u64)> {
        leaf.chunks(self.config.blocking_factor.max(1))
            .enumerate()
            .map(|(i, chunk)| (chunk[0].0.clone(), i as u64))
            .collect()
    }

    /// Visit a primary page followed by its overflow chain.
    fn visit_chain(
        &self,
        page_idx: u64,
        mut visit: impl FnMut(u64, &DataPage),
    ) -> OmnidexResult<()> {
        let mut cur = page_idx as i64;
        while cur != NO_PAGE {
            let page = self.read_page(cur as u64)?;
            let next = page.overflow;
            visit(cur as u64, &page);
            cur = next;
        }
        Ok(())
    }
}

impl KeyIndex for IsamIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Isam
    }

    fn insert(&mut self, key: Key, rid: Rid) -> OmnidexResult<()> {
        if self.unique && !self.search(&key)?.is_empty() {
            return Err(OmnidexError::DuplicateKey(key.to_string()));
        }
        if self.leaf.is_empty() {
            // Empty build: bootstrap a single primary page.
            let page = DataPage {
                overflow: NO_PAGE,
                slots: vec![PageSlot {
                    live: true,
                    key: key.clone(),
                    rid,
                }],
            };
            self.append_page(&page)?;
            self.leaf.push((key, 0));
            self.primary_pages = 1;
            // An empty build had no sparse index to freeze; write one now.
            self.root = self.root_of(&self.leaf);
            write_sparse(&self.dir.join(LEAF_FILE), &self.codec, &self.leaf)?;
            write_sparse(&self.dir.join(ROOT_FILE), &self.codec, &self.root)?;
            return Ok(());
        }

        let target = self.descend(&key);
        let mut page = self.read_page(target)?;
        if page.slots.len() < self.config.blocking_factor {
            let at = page.slots.partition_point(|s| s.key <= key);
            page.slots.insert(
                at,
                PageSlot {
                    live: true,
                    key,
                    rid,
                },
            );
            return self.write_page(target, &page);
        }

        // Primary page full: append to the overflow chain.
        let mut cur = target;
        loop {
            let mut chain_page = if cur == target {
                page.clone()
            } else {
                self.read_page(cur)?
            };
            if chain_page.overflow == NO_PAGE {
                if chain_page.slots.len() < self.config.blocking_factor {
                    chain_page.slots.push(PageSlot {
                        live: true,
                        key,
                        rid,
                    });
                    return self.write_page(cur, &chain_page);
                }
                let fresh = DataPage {
                    overflow: NO_PAGE,
                    slots: vec![PageSlot {
                        live: true,
                        key,
                        rid,
                    }],
                };
                let fresh_idx = self.append_page(&fresh)?;
                chain_page.overflow = fresh_idx as i64;
                return self.write_page(cur, &chain_page);
            }
            cur = chain_page.overflow as u64;
        }
    }

    fn search(&self, key: &Key) -> OmnidexResult<Vec<Rid>> {
        if self.leaf.is_empty() {
            return Ok(Vec::new());
        }
        let mut rids = Vec::new();
        let mut page_idx = self.descend(key);
        while page_idx < self.primary_pages {
            if self.leaf[page_idx as usize].0 > *key {
                break;
            }
            self.visit_chain(page_idx, |_, page| {
                for slot in &page.slots {
                    if slot.live && slot.key == *key {
                        rids.push(slot.rid);
                    }
                }
            })?;
            page_idx += 1;
        }
        Ok(rids)
    }

    fn range(&self, lo: &Key, hi: &Key) -> OmnidexResult<Vec<(Key, Rid)>> {
        if self.leaf.is_empty() || lo > hi {
            return Ok(Vec::new());
        }
        let mut out: Vec<(Key, Rid)> = Vec::new();
        let mut page_idx = self.descend(lo);
        while page_idx < self.primary_pages {
            if self.leaf[page_idx as usize].0 > *hi {
                break;
            }
            self.visit_chain(page_idx, |_, page| {
                for slot in &page.slots {
                    if slot.live && slot.key >= *lo && slot.key <= *hi {
                        out.push((slot.key.clone(), slot.rid));
                    }
                }
            })?;
            page_idx += 1;
        }
        // Chains are unsorted; restore key order for the emitted run.
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn delete(&mut self, key: &Key) -> OmnidexResult<Vec<Rid>> {
        if self.leaf.is_empty() {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        let mut page_idx = self.descend(key);
        while page_idx < self.primary_pages {
            if self.leaf[page_idx as usize].0 > *key {
                break;
            }
            let mut chain: Vec<u64> = Vec::new();
            self.visit_chain(page_idx, |idx, _| chain.push(idx))?;
            for idx in chain {
                let mut page = self.read_page(idx)?;
                let mut dirty = false;
                for slot in page.slots.iter_mut() {
                    if slot.live && slot.key == *key {
                        slot.live = false;
                        removed.push(slot.rid);
                        dirty = true;
                    }
                }
                if dirty {
                    self.write_page(idx, &page)?;
                }
            }
            page_idx += 1;
        }
        Ok(removed)
    }

    fn entries(&self) -> OmnidexResult<Vec<(Key, Rid)>> {
        let mut out: Vec<(Key, Rid)> = Vec::new();
        for page_idx in 0..self.primary_pages {
            let mut group: Vec<(Key, Rid)> = Vec::new();
            self.visit_chain(page_idx, |_, page| {
                for slot in &page.slots {
                    if slot.live {
                        group.push((slot.key.clone(), slot.rid));
                    }
                }
            })?;
            group.sort_by(|a, b| a.0.cmp(&b.0));
            out.extend(group);
        }
        Ok(out)
    }
}

fn page_size(codec: &EntryCodec, blocking_factor: usize) -> usize {
    4 + 8 + blocking_factor * (1 + codec.entry_size())
}

fn encode_page(codec: &EntryCodec, blocking_factor: usize, page: &DataPage) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(page_size(codec, blocking_factor));
    buf.extend_from_slice(&CommonCodec::encode_u32(page.slots.len() as u32));
    buf.extend_from_slice(&CommonCodec::encode_i64(page.overflow));
    for slot in &page.slots {
        buf.extend_from_slice(&[slot.live as u8]);
        codec.encode(&slot.key, slot.rid, &mut buf);
    }
    buf.resize(page_size(codec, blocking_factor), 0);
    buf.to_vec()
}

fn decode_page(codec: &EntryCodec, blocking_factor: usize, bytes: &[u8]) -> OmnidexResult<DataPage> {
    let (count, _) = CommonCodec::decode_u32(bytes)?;
    let (overflow, _) = CommonCodec::decode_i64(&bytes[4..])?;
    if count as usize > blocking_factor {
        return Err(OmnidexError::Internal(format!(
            "isam page claims {} slots with blocking factor {}",
            count, blocking_factor
        )));
    }
    let mut slots = Vec::with_capacity(count as usize);
    let mut offset = 12;
    let slot_bytes = 1 + codec.entry_size();
    for _ in 0..count {
        let live = bytes[offset] != 0;
        let (key, rid) = codec.decode(&bytes[offset + 1..offset + slot_bytes])?;
        slots.push(PageSlot { live, key, rid });
        offset += slot_bytes;
    }
    Ok(DataPage { overflow, slots })
}

fn write_sparse(path: &Path, codec: &EntryCodec, entries: &[(Key, u64)]) -> OmnidexResult<()> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&CommonCodec::encode_u32(entries.len() as u32));
    for (key, page) in entries {
        FieldCodec::encode_padded(&key.to_string(), codec.key_width, &mut buf);
        buf.extend_from_slice(&CommonCodec::encode_u64(*page));
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

fn read_sparse(path: &Path, codec: &EntryCodec) -> OmnidexResult<Vec<(Key, u64)>> {
    let bytes = std::fs::read(path)?;
    let (count, _) = CommonCodec::decode_u32(&bytes)?;
    let mut out = Vec::with_capacity(count as usize);
    let mut offset = 4;
    for _ in 0..count {
        let key = Key::parse(
            &FieldCodec::decode_padded(&bytes[offset..offset + codec.key_width]),
            codec.data_type,
        )?;
        offset += codec.key_width;
        let (page, _) = CommonCodec::decode_u64(&bytes[offset..])?;
        offset += 8;
        out.push((key, page));
    }
    Ok(out)
}

fn open_rw(path: &Path) -> OmnidexResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataType;
    use tempfile::TempDir;

    fn sorted_entries(n: i64) -> Vec<(Key, Rid)> {
        (0..n).map(|i| (Key::Int(i), i as Rid)).collect()
    }

    fn small_config() -> IsamConfig {
        IsamConfig { blocking_factor: 4 }
    }

    #[test]
    fn build_and_point_search() {
        let dir = TempDir::new().unwrap();
        let index = IsamIndex::build(
            dir.path(),
            EntryCodec::new(DataType::Int, 12),
            small_config(),
            false,
            &sorted_entries(50),
        )
        .unwrap();
        assert_eq!(index.search(&Key::Int(0)).unwrap(), vec![0]);
        assert_eq!(index.search(&Key::Int(33)).unwrap(), vec![33]);
        assert_eq!(index.search(&Key::Int(49)).unwrap(), vec![49]);
        assert!(index.search(&Key::Int(50)).unwrap().is_empty());
    }

    #[test]
    fn inserts_overflow_into_chains_without_rebuilding() {
        let dir = TempDir::new().unwrap();
        let mut index = IsamIndex::build(
            dir.path(),
            EntryCodec::new(DataType::Int, 12),
            small_config(),
            false,
            &sorted_entries(8),
        )
        .unwrap();
        let primary_before = index.primary_pages;
        // All of these land in the page holding keys 0..4, forcing a chain.
        for (i, v) in [1i64, 1, 2, 3, 1].iter().enumerate() {
            index.insert(Key::Int(*v), 100 + i as Rid).unwrap();
        }
        assert_eq!(index.primary_pages, primary_before);
        let ones = index.search(&Key::Int(1)).unwrap();
        assert_eq!(ones.len(), 4);
        assert!(ones.contains(&1) && ones.contains(&100));
    }

    #[test]
    fn range_spans_pages_and_chains_in_key_order() {
        let dir = TempDir::new().unwrap();
        let mut index = IsamIndex::build(
            dir.path(),
            EntryCodec::new(DataType::Int, 12),
            small_config(),
            false,
            &sorted_entries(20),
        )
        .unwrap();
        for _ in 0..6 {
            index.insert(Key::Int(7), 999).unwrap();
        }
        let keys: Vec<i64> = index
            .range(&Key::Int(5), &Key::Int(10))
            .unwrap()
            .into_iter()
            .map(|(k, _)| match k {
                Key::Int(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![5, 6, 7, 7, 7, 7, 7, 7, 7, 8, 9, 10]);
    }

    #[test]
    fn delete_tombstones_in_page_and_chain() {
        let dir = TempDir::new().unwrap();
        let mut index = IsamIndex::build(
            dir.path(),
            EntryCodec::new(DataType::Int, 12),
            small_config(),
            false,
            &sorted_entries(10),
        )
        .unwrap();
        index.insert(Key::Int(2), 42).unwrap();
        let removed = index.delete(&Key::Int(2)).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(index.search(&Key::Int(2)).unwrap().is_empty());
        assert!(index.delete(&Key::Int(2)).unwrap().is_empty());
    }

    #[test]
    fn reopen_reads_frozen_index() {
        let dir = TempDir::new().unwrap();
        {
            IsamIndex::build(
                dir.path(),
                EntryCodec::new(DataType::Int, 12),
                small_config(),
                false,
                &sorted_entries(30),
            )
            .unwrap();
        }
        let index = IsamIndex::open(
            dir.path(),
            EntryCodec::new(DataType::Int, 12),
            small_config(),
            false,
        )
        .unwrap();
        assert_eq!(index.search(&Key::Int(21)).unwrap(), vec![21]);
        assert_eq!(index.entries().unwrap().len(), 30);
    }
}
