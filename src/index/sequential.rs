use crate::config::SequentialConfig;
use crate::error::{OmnidexError, OmnidexResult};
use crate::index::{EntryCodec, IndexKind, Key, KeyIndex};
use crate::storage::codec::CommonCodec;
use crate::storage::Rid;
use crate::utils::atomic_file;
use bytes::BytesMut;
use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAIN_FILE: &str = "main.seq";
pub const AUX_FILE: &str = "aux.seq";

const MAIN_HEADER: u64 = 8;
const NO_SLOT: i64 = -1;

/// One slot of the sequential files: live flag, the entry, and the link to
/// the next slot in key order. Aux slots share the position space with main
/// (aux position = main_count + aux index).
#[derive(Debug, Clone)]
struct Slot {
    live: bool,
    key: Key,
    rid: Rid,
    next: i64,
}

/// Sequential-with-auxiliary index: an ordered main file binary-searched by
/// key, an unordered auxiliary file for recent inserts, and a linked list
/// threading both in key order. When the auxiliary area crosses its bound
/// the two files are merged and the main file rewritten atomically.
#[derive(Debug)]
pub struct SequentialIndex {
    main_path: PathBuf,
    aux_path: PathBuf,
    main: Mutex<File>,
    aux: Mutex<File>,
    codec: EntryCodec,
    config: SequentialConfig,
    unique: bool,
    main_count: u64,
    aux_count: u64,
    head: i64,
}

impl SequentialIndex {
    pub fn create(
        dir: &Path,
        codec: EntryCodec,
        config: SequentialConfig,
        unique: bool,
    ) -> OmnidexResult<Self> {
        let main_path = dir.join(MAIN_FILE);
        let aux_path = dir.join(AUX_FILE);
        let mut main = open_rw(&main_path, true)?;
        main.write_all(&CommonCodec::encode_i64(NO_SLOT))?;
        main.sync_all()?;
        let aux = open_rw(&aux_path, true)?;
        Ok(SequentialIndex {
            main_path,
            aux_path,
            main: Mutex::new(main),
            aux: Mutex::new(aux),
            codec,
            config,
            unique,
            main_count: 0,
            aux_count: 0,
            head: NO_SLOT,
        })
    }

    pub fn open(
        dir: &Path,
        codec: EntryCodec,
        config: SequentialConfig,
        unique: bool,
    ) -> OmnidexResult<Self> {
        let main_path = dir.join(MAIN_FILE);
        let aux_path = dir.join(AUX_FILE);
        let mut main = open_rw(&main_path, false)?;
        let aux = open_rw(&aux_path, false)?;
        let mut header = [0u8; MAIN_HEADER as usize];
        main.seek(SeekFrom::Start(0))?;
        main.read_exact(&mut header)?;
        let (head, _) = CommonCodec::decode_i64(&header)?;
        let slot = Self::slot_size_of(&codec) as u64;
        let main_count = (main.metadata()?.len() - MAIN_HEADER) / slot;
        let aux_count = aux.metadata()?.len() / slot;
        Ok(SequentialIndex {
            main_path,
            aux_path,
            main: Mutex::new(main),
            aux: Mutex::new(aux),
            codec,
            config,
            unique,
            main_count,
            aux_count,
            head,
        })
    }

    /// Build the main file directly from entries already sorted by key.
    pub fn bulk_load(&mut self, sorted: &[(Key, Rid)]) -> OmnidexResult<()> {
        self.rewrite_main(sorted, || Ok(()))
    }

    fn slot_size_of(codec: &EntryCodec) -> usize {
        1 + codec.entry_size() + 8
    }

    fn slot_size(&self) -> usize {
        Self::slot_size_of(&self.codec)
    }

    fn encode_slot(&self, slot: &Slot) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.slot_size());
        buf.extend_from_slice(&[slot.live as u8]);
        self.codec.encode(&slot.key, slot.rid, &mut buf);
        buf.extend_from_slice(&CommonCodec::encode_i64(slot.next));
        buf.to_vec()
    }

    fn decode_slot(&self, bytes: &[u8]) -> OmnidexResult<Slot> {
        let live = bytes[0] != 0;
        let (key, rid) = self.codec.decode(&bytes[1..1 + self.codec.entry_size()])?;
        let (next, _) = CommonCodec::decode_i64(&bytes[1 + self.codec.entry_size()..])?;
        Ok(Slot {
            live,
            key,
            rid,
            next,
        })
    }

    fn read_slot(&self, pos: u64) -> OmnidexResult<Slot> {
        let slot_size = self.slot_size() as u64;
        let mut buf = vec![0u8; self.slot_size()];
        if pos < self.main_count {
            let mut main = self.main.lock();
            main.seek(SeekFrom::Start(MAIN_HEADER + pos * slot_size))?;
            main.read_exact(&mut buf)?;
        } else {
            let idx = pos - self.main_count;
            let mut aux = self.aux.lock();
            aux.seek(SeekFrom::Start(idx * slot_size))?;
            aux.read_exact(&mut buf)?;
        }
        self.decode_slot(&buf)
    }

    fn write_slot(&self, pos: u64, slot: &Slot) -> OmnidexResult<()> {
        let bytes = self.encode_slot(slot);
        let slot_size = self.slot_size() as u64;
        if pos < self.main_count {
            let mut main = self.main.lock();
            main.seek(SeekFrom::Start(MAIN_HEADER + pos * slot_size))?;
            main.write_all(&bytes)?;
        } else {
            let idx = pos - self.main_count;
            let mut aux = self.aux.lock();
            aux.seek(SeekFrom::Start(idx * slot_size))?;
            aux.write_all(&bytes)?;
        }
        Ok(())
    }

    fn write_head(&mut self, head: i64) -> OmnidexResult<()> {
        let mut main = self.main.lock();
        main.seek(SeekFrom::Start(0))?;
        main.write_all(&CommonCodec::encode_i64(head))?;
        drop(main);
        self.head = head;
        Ok(())
    }

    /// First main slot whose key is >= `key`, ignoring links and liveness.
    fn lower_bound_main(&self, key: &Key) -> OmnidexResult<u64> {
        let (mut lo, mut hi) = (0u64, self.main_count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.read_slot(mid)?.key < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn aux_scan(
        &self,
        mut visit: impl FnMut(u64, &Slot) -> bool,
    ) -> OmnidexResult<()> {
        for idx in 0..self.aux_count {
            let pos = self.main_count + idx;
            let slot = self.read_slot(pos)?;
            if !visit(pos, &slot) {
                break;
            }
        }
        Ok(())
    }

    /// Merge main and aux into a fresh sorted main file, dropping
    /// tombstones, then clear aux. `before_rename` is the fault-injection
    /// hook of the atomic-rename pattern.
    fn rebuild_with_hook(
        &mut self,
        before_rename: impl FnOnce() -> OmnidexResult<()>,
    ) -> OmnidexResult<()> {
        let mut live: Vec<(Key, Rid)> = Vec::new();
        for pos in 0..self.main_count + self.aux_count {
            let slot = self.read_slot(pos)?;
            if slot.live {
                live.push((slot.key, slot.rid));
            }
        }
        live.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(
            "sequential rebuild: {} main + {} aux -> {} live entries",
            self.main_count,
            self.aux_count,
            live.len()
        );
        self.rewrite_main(&live, before_rename)
    }

    fn rewrite_main(
        &mut self,
        sorted: &[(Key, Rid)],
        before_rename: impl FnOnce() -> OmnidexResult<()>,
    ) -> OmnidexResult<()> {
        let head = if sorted.is_empty() { NO_SLOT } else { 0 };
        let mut bytes = Vec::with_capacity(
            MAIN_HEADER as usize + sorted.len() * self.slot_size(),
        );
        bytes.extend_from_slice(&CommonCodec::encode_i64(head));
        for (i, (key, rid)) in sorted.iter().enumerate() {
            let next = if i + 1 < sorted.len() {
                (i + 1) as i64
            } else {
                NO_SLOT
            };
            bytes.extend_from_slice(&self.encode_slot(&Slot {
                live: true,
                key: key.clone(),
                rid: *rid,
                next,
            }));
        }
        atomic_file::write_atomic_hooked(&self.main_path, &bytes, before_rename)?;

        // The rename retired the old inode; reopen both handles fresh.
        *self.main.lock() = open_rw(&self.main_path, false)?;
        *self.aux.lock() = open_rw(&self.aux_path, true)?;
        self.main_count = sorted.len() as u64;
        self.aux_count = 0;
        self.head = head;
        Ok(())
    }

    pub fn rebuild(&mut self) -> OmnidexResult<()> {
        self.rebuild_with_hook(|| Ok(()))
    }

    #[doc(hidden)]
    pub fn rebuild_failing_before_rename(&mut self) -> OmnidexResult<()> {
        self.rebuild_with_hook(|| {
            Err(OmnidexError::Io(std::io::Error::other(
                "injected failure before rename",
            )))
        })
    }

    pub fn aux_len(&self) -> u64 {
        self.aux_count
    }

    pub fn main_len(&self) -> u64 {
        self.main_count
    }
}

impl KeyIndex for SequentialIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Sequential
    }

    fn insert(&mut self, key: Key, rid: Rid) -> OmnidexResult<()> {
        if self.unique && !self.search(&key)?.is_empty() {
            return Err(OmnidexError::DuplicateKey(key.to_string()));
        }
        if self.aux_count as usize >= self.config.rebuild_threshold(self.main_count as usize) {
            self.rebuild()?;
        }

        // Walk the linked order to find the first node with a larger key;
        // duplicates keep insertion order by inserting after equals.
        let mut prev: Option<u64> = None;
        let mut cur = self.head;
        while cur != NO_SLOT {
            let node = self.read_slot(cur as u64)?;
            if node.key > key {
                break;
            }
            prev = Some(cur as u64);
            cur = node.next;
        }

        let pos = self.main_count + self.aux_count;
        let slot_size = self.slot_size() as u64;
        {
            let slot = Slot {
                live: true,
                key,
                rid,
                next: cur,
            };
            let bytes = self.encode_slot(&slot);
            let mut aux = self.aux.lock();
            aux.seek(SeekFrom::Start(self.aux_count * slot_size))?;
            aux.write_all(&bytes)?;
        }
        self.aux_count += 1;

        match prev {
            None => self.write_head(pos as i64)?,
            Some(prev_pos) => {
                let mut prev_slot = self.read_slot(prev_pos)?;
                prev_slot.next = pos as i64;
                self.write_slot(prev_pos, &prev_slot)?;
            }
        }
        Ok(())
    }

    fn search(&self, key: &Key) -> OmnidexResult<Vec<Rid>> {
        let mut rids = Vec::new();
        let mut pos = self.lower_bound_main(key)?;
        while pos < self.main_count {
            let slot = self.read_slot(pos)?;
            if slot.key != *key {
                break;
            }
            if slot.live {
                rids.push(slot.rid);
            }
            pos += 1;
        }
        self.aux_scan(|_, slot| {
            if slot.live && slot.key == *key {
                rids.push(slot.rid);
            }
            true
        })?;
        Ok(rids)
    }

    fn range(&self, lo: &Key, hi: &Key) -> OmnidexResult<Vec<(Key, Rid)>> {
        let mut out: Vec<(Key, Rid)> = Vec::new();
        let mut pos = self.lower_bound_main(lo)?;
        while pos < self.main_count {
            let slot = self.read_slot(pos)?;
            if slot.key > *hi {
                break;
            }
            if slot.live {
                out.push((slot.key, slot.rid));
            }
            pos += 1;
        }
        let mut from_aux: Vec<(Key, Rid)> = Vec::new();
        self.aux_scan(|_, slot| {
            if slot.live && slot.key >= *lo && slot.key <= *hi {
                from_aux.push((slot.key.clone(), slot.rid));
            }
            true
        })?;
        from_aux.sort_by(|a, b| a.0.cmp(&b.0));
        // Stable merge: main entries precede aux entries on equal keys.
        let mut merged = Vec::with_capacity(out.len() + from_aux.len());
        let (mut i, mut j) = (0, 0);
        while i < out.len() && j < from_aux.len() {
            if from_aux[j].0 < out[i].0 {
                merged.push(from_aux[j].clone());
                j += 1;
            } else {
                merged.push(out[i].clone());
                i += 1;
            }
        }
        merged.extend_from_slice(&out[i..]);
        merged.extend_from_slice(&from_aux[j..]);
        Ok(merged)
    }

    fn delete(&mut self, key: &Key) -> OmnidexResult<Vec<Rid>> {
        let mut removed = Vec::new();
        let mut cur = self.head;
        while cur != NO_SLOT {
            let mut node = self.read_slot(cur as u64)?;
            if node.key > *key {
                break;
            }
            if node.live && node.key == *key {
                node.live = false;
                self.write_slot(cur as u64, &node)?;
                removed.push(node.rid);
            }
            cur = node.next;
        }
        Ok(removed)
    }

    fn entries(&self) -> OmnidexResult<Vec<(Key, Rid)>> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while cur != NO_SLOT {
            let slot = self.read_slot(cur as u64)?;
            if slot.live {
                out.push((slot.key.clone(), slot.rid));
            }
            cur = slot.next;
        }
        Ok(out)
    }
}

fn open_rw(path: &Path, truncate: bool) -> OmnidexResult<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if truncate {
        options.truncate(true);
    }
    Ok(options.open(path)?)
}
