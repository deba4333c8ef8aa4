use crate::error::{OmnidexError, OmnidexResult};
use crate::storage::codec::{CommonCodec, FieldCodec};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Stable integer identifier of a record; equals its slot index.
pub type Rid = u64;

pub const RECORD_FILE: &str = "records.dat";

const MAGIC: u32 = 0x4F4D4E58; // "OMNX"
const HEADER_SIZE: u64 = 8;

const SLOT_LIVE: u8 = 1;
const SLOT_TOMBSTONE: u8 = 0;

/// The record store: fixed-width slots addressed by `rid`, each slot a
/// live/tombstone byte followed by the fields right-padded to their
/// declared widths. The store is the single source of truth for rows;
/// indexes only hold `(key, rid)` entries resolved through it.
#[derive(Debug)]
pub struct RecordFile {
    inner: Mutex<Inner>,
    widths: Vec<usize>,
    slot_size: u64,
}

#[derive(Debug)]
struct Inner {
    file: File,
    len: u64,
}

impl RecordFile {
    pub fn create(path: &Path, widths: Vec<usize>) -> OmnidexResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let slot_size = Self::slot_size_for(&widths);
        file.write_all(&CommonCodec::encode_u32(MAGIC))?;
        file.write_all(&CommonCodec::encode_u32(slot_size as u32))?;
        file.sync_all()?;
        Ok(RecordFile {
            inner: Mutex::new(Inner { file, len: 0 }),
            widths,
            slot_size,
        })
    }

    pub fn open(path: &Path, widths: Vec<usize>) -> OmnidexResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let slot_size = Self::slot_size_for(&widths);
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let (magic, _) = CommonCodec::decode_u32(&header[0..4])?;
        let (stored_slot, _) = CommonCodec::decode_u32(&header[4..8])?;
        if magic != MAGIC || stored_slot as u64 != slot_size {
            return Err(OmnidexError::Internal(format!(
                "record file {:?} does not match schema layout",
                path
            )));
        }
        let bytes = file.metadata()?.len().saturating_sub(HEADER_SIZE);
        if bytes % slot_size != 0 {
            return Err(OmnidexError::Internal(format!(
                "record file {:?} has a partial trailing slot",
                path
            )));
        }
        let len = bytes / slot_size;
        Ok(RecordFile {
            inner: Mutex::new(Inner { file, len }),
            widths,
            slot_size,
        })
    }

    fn slot_size_for(widths: &[usize]) -> u64 {
        1 + widths.iter().sum::<usize>() as u64
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encode_slot(&self, fields: &[String]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.slot_size as usize);
        buf.extend_from_slice(&[SLOT_LIVE]);
        for (idx, width) in self.widths.iter().enumerate() {
            let value = fields.get(idx).map(String::as_str).unwrap_or("");
            FieldCodec::encode_padded(value, *width, &mut buf);
        }
        buf.to_vec()
    }

    fn decode_slot(&self, bytes: &[u8], rid: Rid) -> Option<Vec<String>> {
        match bytes[0] {
            SLOT_LIVE => {}
            SLOT_TOMBSTONE => return None,
            flag => panic!("record {} has a corrupt tombstone byte {:#x}", rid, flag),
        }
        let mut fields = Vec::with_capacity(self.widths.len());
        let mut offset = 1;
        for width in &self.widths {
            fields.push(FieldCodec::decode_padded(&bytes[offset..offset + width]));
            offset += width;
        }
        Some(fields)
    }

    /// Append a row, returning its rid. Fields beyond the schema are
    /// dropped; missing trailing fields become empty strings.
    pub fn append(&self, fields: &[String]) -> OmnidexResult<Rid> {
        let slot = self.encode_slot(fields);
        let mut inner = self.inner.lock();
        let rid = inner.len;
        inner
            .file
            .seek(SeekFrom::Start(HEADER_SIZE + rid * self.slot_size))?;
        inner.file.write_all(&slot)?;
        inner.len += 1;
        Ok(rid)
    }

    /// Read a record; `None` means the slot is tombstoned.
    pub fn read(&self, rid: Rid) -> OmnidexResult<Option<Vec<String>>> {
        let mut inner = self.inner.lock();
        if rid >= inner.len {
            return Err(OmnidexError::Internal(format!(
                "rid {} out of range ({} slots)",
                rid, inner.len
            )));
        }
        let mut buf = vec![0u8; self.slot_size as usize];
        inner
            .file
            .seek(SeekFrom::Start(HEADER_SIZE + rid * self.slot_size))?;
        inner.file.read_exact(&mut buf)?;
        drop(inner);
        Ok(self.decode_slot(&buf, rid))
    }

    /// Mark a record deleted. Idempotent.
    pub fn tombstone(&self, rid: Rid) -> OmnidexResult<()> {
        let mut inner = self.inner.lock();
        if rid >= inner.len {
            return Err(OmnidexError::Internal(format!(
                "rid {} out of range ({} slots)",
                rid, inner.len
            )));
        }
        inner
            .file
            .seek(SeekFrom::Start(HEADER_SIZE + rid * self.slot_size))?;
        inner.file.write_all(&[SLOT_TOMBSTONE])?;
        Ok(())
    }

    pub fn sync(&self) -> OmnidexResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    /// Iterate live records in rid order, skipping tombstones.
    pub fn scan(&self) -> RecordScan<'_> {
        RecordScan {
            store: self,
            next: 0,
            end: self.len(),
        }
    }
}

pub struct RecordScan<'a> {
    store: &'a RecordFile,
    next: Rid,
    end: Rid,
}

impl Iterator for RecordScan<'_> {
    type Item = OmnidexResult<(Rid, Vec<String>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.end {
            let rid = self.next;
            self.next += 1;
            match self.store.read(rid) {
                Ok(Some(fields)) => return Some(Ok((rid, fields))),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn append_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RECORD_FILE);
        let store = RecordFile::create(&path, vec![8, 16]).unwrap();

        let r0 = store.append(&row(&["1", "ana"])).unwrap();
        let r1 = store.append(&row(&["2", "benito"])).unwrap();
        assert_eq!((r0, r1), (0, 1));
        assert_eq!(store.read(r1).unwrap().unwrap(), row(&["2", "benito"]));
    }

    #[test]
    fn tombstone_hides_record_and_scan_skips_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RECORD_FILE);
        let store = RecordFile::create(&path, vec![8]).unwrap();
        for v in ["a", "b", "c"] {
            store.append(&row(&[v])).unwrap();
        }
        store.tombstone(1).unwrap();
        store.tombstone(1).unwrap(); // idempotent

        assert!(store.read(1).unwrap().is_none());
        let live: Vec<Rid> = store
            .scan()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(live, vec![0, 2]);
    }

    #[test]
    fn reopen_preserves_slots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RECORD_FILE);
        {
            let store = RecordFile::create(&path, vec![8, 8]).unwrap();
            store.append(&row(&["1", "x"])).unwrap();
            store.append(&row(&["2", "y"])).unwrap();
            store.sync().unwrap();
        }
        let store = RecordFile::open(&path, vec![8, 8]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read(0).unwrap().unwrap(), row(&["1", "x"]));
    }

    #[test]
    fn missing_trailing_fields_become_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RECORD_FILE);
        let store = RecordFile::create(&path, vec![4, 4]).unwrap();
        let rid = store.append(&row(&["z"])).unwrap();
        assert_eq!(store.read(rid).unwrap().unwrap(), row(&["z", ""]));
    }
}
