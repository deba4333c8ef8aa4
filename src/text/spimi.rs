use crate::error::{OmnidexError, OmnidexResult};
use crate::text::{idf_weight, tf_weight};
use crate::utils::atomic_file;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const DICT_FILE: &str = "dict";
pub const POST_FILE: &str = "post";
pub const NORMS_FILE: &str = "norms";

/// Bytes of one posting on disk: doc_id u64 + raw tf u32, big-endian.
pub const POSTING_BYTES: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictEntry {
    pub df: u32,
    /// Byte offset of the term's posting run in the posting file.
    pub offset: u64,
    /// Number of postings in the run.
    pub len: u32,
}

/// The persisted dictionary: term -> posting-run descriptor, plus the
/// document count the index was finalized with.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Dictionary {
    pub doc_count: u64,
    pub entries: BTreeMap<String, DictEntry>,
}

pub fn load_dictionary(dir: &Path) -> OmnidexResult<Dictionary> {
    let bytes = fs::read(dir.join(DICT_FILE))?;
    Ok(bincode::deserialize(&bytes)?)
}

pub fn load_norms(dir: &Path) -> OmnidexResult<HashMap<u64, f64>> {
    let bytes = fs::read(dir.join(NORMS_FILE))?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Read one term's posting run `(doc_id, tf)` from an open posting file.
pub fn read_postings(
    post: &mut File,
    entry: &DictEntry,
) -> OmnidexResult<Vec<(u64, u32)>> {
    let mut buf = vec![0u8; (entry.len as u64 * POSTING_BYTES) as usize];
    post.seek(SeekFrom::Start(entry.offset))?;
    post.read_exact(&mut buf)?;
    let mut out = Vec::with_capacity(entry.len as usize);
    for chunk in buf.chunks_exact(POSTING_BYTES as usize) {
        let doc = u64::from_be_bytes(chunk[0..8].try_into().expect("chunk is 12 bytes"));
        let tf = u32::from_be_bytes(chunk[8..12].try_into().expect("chunk is 12 bytes"));
        out.push((doc, tf));
    }
    Ok(out)
}

/// Writes a finalized index: the posting file, the dictionary and the
/// per-document norms, all staged as temp files and renamed at the end so
/// a failure mid-way never clobbers the previous artifacts.
struct IndexWriter {
    dir: PathBuf,
    post: BufWriter<File>,
    offset: u64,
    doc_count: u64,
    entries: BTreeMap<String, DictEntry>,
    norms_sq: HashMap<u64, f64>,
}

impl IndexWriter {
    fn new(dir: &Path, doc_count: u64) -> OmnidexResult<Self> {
        fs::create_dir_all(dir)?;
        let post = BufWriter::new(File::create(dir.join(format!("{POST_FILE}.tmp")))?);
        Ok(IndexWriter {
            dir: dir.to_path_buf(),
            post,
            offset: 0,
            doc_count,
            entries: BTreeMap::new(),
            norms_sq: HashMap::new(),
        })
    }

    /// Append one term's merged posting run. Postings must arrive in
    /// ascending doc order; same-doc duplicates are summed here.
    fn add_term(&mut self, term: String, mut postings: Vec<(u64, u32)>) -> OmnidexResult<()> {
        if postings.is_empty() {
            return Ok(());
        }
        postings.sort_by_key(|(doc, _)| *doc);
        let mut merged: Vec<(u64, u32)> = Vec::with_capacity(postings.len());
        for (doc, tf) in postings {
            match merged.last_mut() {
                Some((last_doc, last_tf)) if *last_doc == doc => *last_tf += tf,
                _ => merged.push((doc, tf)),
            }
        }

        let df = merged.len() as u32;
        let idf = idf_weight(self.doc_count, df);
        for (doc, tf) in &merged {
            self.post.write_all(&doc.to_be_bytes())?;
            self.post.write_all(&tf.to_be_bytes())?;
            let w = tf_weight(*tf) * idf;
            *self.norms_sq.entry(*doc).or_insert(0.0) += w * w;
        }
        self.entries.insert(
            term,
            DictEntry {
                df,
                offset: self.offset,
                len: df,
            },
        );
        self.offset += merged.len() as u64 * POSTING_BYTES;
        Ok(())
    }

    fn finish(mut self) -> OmnidexResult<()> {
        self.post.flush()?;
        self.post.get_ref().sync_all()?;
        drop(self.post);

        let dict = Dictionary {
            doc_count: self.doc_count,
            entries: self.entries,
        };
        let norms: HashMap<u64, f64> = self
            .norms_sq
            .into_iter()
            .map(|(doc, sq)| (doc, sq.sqrt()))
            .collect();
        atomic_file::write_atomic(&self.dir.join(DICT_FILE), &bincode::serialize(&dict)?)?;
        atomic_file::write_atomic(&self.dir.join(NORMS_FILE), &bincode::serialize(&norms)?)?;
        fs::rename(
            self.dir.join(format!("{POST_FILE}.tmp")),
            self.dir.join(POST_FILE),
        )?;
        Ok(())
    }
}

/// Rewrite the persistent index from already-merged postings in ascending
/// term order. The delta merge and tombstone rebuild paths feed this.
pub fn build_from_postings(
    dir: &Path,
    doc_count: u64,
    terms: impl IntoIterator<Item = (String, Vec<(u64, u32)>)>,
) -> OmnidexResult<()> {
    let mut writer = IndexWriter::new(dir, doc_count)?;
    for (term, postings) in terms {
        writer.add_term(term, postings)?;
    }
    writer.finish()
}

/// Single-pass in-memory index builder: postings accumulate in memory and
/// spill to sorted block files whenever the memory bound is crossed; the
/// blocks are then merged heap-first into the final index.
pub struct SpimiBuilder {
    dir: PathBuf,
    memory_limit: usize,
    memory_used: usize,
    postings: BTreeMap<String, Vec<(u64, u32)>>,
    blocks: Vec<PathBuf>,
    doc_count: u64,
}

impl SpimiBuilder {
    pub fn new(dir: &Path, memory_limit: usize) -> OmnidexResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(SpimiBuilder {
            dir: dir.to_path_buf(),
            memory_limit: memory_limit.max(4096),
            memory_used: 0,
            postings: BTreeMap::new(),
            blocks: Vec::new(),
            doc_count: 0,
        })
    }

    pub fn add_document(&mut self, doc_id: u64, terms: &[String]) -> OmnidexResult<()> {
        self.doc_count += 1;
        let mut tf: HashMap<&str, u32> = HashMap::new();
        for term in terms {
            *tf.entry(term.as_str()).or_insert(0) += 1;
        }
        for (term, count) in tf {
            match self.postings.get_mut(term) {
                Some(list) => list.push((doc_id, count)),
                None => {
                    self.memory_used += term.len() + 48;
                    self.postings
                        .insert(term.to_string(), vec![(doc_id, count)]);
                }
            }
            self.memory_used += POSTING_BYTES as usize;
        }
        if self.memory_used >= self.memory_limit {
            self.spill_block()?;
        }
        Ok(())
    }

    /// Sorted terms go out as one block file of bincode records.
    fn spill_block(&mut self) -> OmnidexResult<()> {
        if self.postings.is_empty() {
            return Ok(());
        }
        let path = self.dir.join(format!("block_{:04}.tmp", self.blocks.len()));
        let mut writer = BufWriter::new(File::create(&path)?);
        for (term, postings) in std::mem::take(&mut self.postings) {
            bincode::serialize_into(&mut writer, &(term, postings))?;
        }
        writer.flush()?;
        debug!(
            "spimi block {} spilled (~{} bytes of postings)",
            self.blocks.len(),
            self.memory_used
        );
        self.blocks.push(path);
        self.memory_used = 0;
        Ok(())
    }

    /// Merge all blocks into the final dictionary/posting/norms artifacts.
    pub fn finish(mut self) -> OmnidexResult<()> {
        self.spill_block()?;
        let blocks = std::mem::take(&mut self.blocks);
        debug!(
            "spimi merge: {} blocks, {} documents",
            blocks.len(),
            self.doc_count
        );

        let mut readers: Vec<BlockReader> = Vec::with_capacity(blocks.len());
        for path in &blocks {
            readers.push(BlockReader::open(path)?);
        }

        let mut heap: BinaryHeap<std::cmp::Reverse<(String, usize)>> = BinaryHeap::new();
        for (idx, reader) in readers.iter().enumerate() {
            if let Some((term, _)) = &reader.current {
                heap.push(std::cmp::Reverse((term.clone(), idx)));
            }
        }

        let mut writer = IndexWriter::new(&self.dir, self.doc_count)?;
        while let Some(std::cmp::Reverse((term, idx))) = heap.pop() {
            let mut postings = readers[idx]
                .take_current()
                .expect("heap entry has a current record")
                .1;
            if let Some((next_term, _)) = &readers[idx].advance()? {
                heap.push(std::cmp::Reverse((next_term.clone(), idx)));
            }
            // Pull the same term from every other block before writing.
            while let Some(std::cmp::Reverse((peek_term, peek_idx))) = heap.peek() {
                if *peek_term != term {
                    break;
                }
                let peek_idx = *peek_idx;
                heap.pop();
                postings.extend(
                    readers[peek_idx]
                        .take_current()
                        .expect("heap entry has a current record")
                        .1,
                );
                if let Some((next_term, _)) = &readers[peek_idx].advance()? {
                    heap.push(std::cmp::Reverse((next_term.clone(), peek_idx)));
                }
            }
            writer.add_term(term, postings)?;
        }
        writer.finish()?;

        for path in blocks {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }
}

struct BlockReader {
    reader: BufReader<File>,
    current: Option<(String, Vec<(u64, u32)>)>,
}

impl BlockReader {
    fn open(path: &Path) -> OmnidexResult<Self> {
        let mut reader = BlockReader {
            reader: BufReader::new(File::open(path)?),
            current: None,
        };
        reader.advance()?;
        Ok(reader)
    }

    fn take_current(&mut self) -> Option<(String, Vec<(u64, u32)>)> {
        self.current.take()
    }

    fn advance(&mut self) -> OmnidexResult<&Option<(String, Vec<(u64, u32)>)>> {
        self.current = match bincode::deserialize_from(&mut self.reader) {
            Ok(record) => Some(record),
            Err(err) => match err.as_ref() {
                bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    None
                }
                _ => return Err(OmnidexError::Bincode(err)),
            },
        };
        Ok(&self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn build_merge_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut builder = SpimiBuilder::new(dir.path(), 4096).unwrap();
        builder.add_document(0, &terms(&["love", "light"])).unwrap();
        builder
            .add_document(1, &terms(&["light", "shadow"]))
            .unwrap();
        builder.finish().unwrap();

        let dict = load_dictionary(dir.path()).unwrap();
        assert_eq!(dict.doc_count, 2);
        assert_eq!(dict.entries["light"].df, 2);
        assert_eq!(dict.entries["love"].df, 1);

        let mut post = File::open(dir.path().join(POST_FILE)).unwrap();
        let light = read_postings(&mut post, &dict.entries["light"]).unwrap();
        assert_eq!(light, vec![(0, 1), (1, 1)]);

        let norms = load_norms(dir.path()).unwrap();
        // "light" appears everywhere, so only "love"/"shadow" carry weight.
        let expected = tf_weight(1) * idf_weight(2, 1);
        assert!((norms[&0] - expected).abs() < 1e-9);
        assert!((norms[&1] - expected).abs() < 1e-9);
    }

    #[test]
    fn repeated_terms_accumulate_tf() {
        let dir = TempDir::new().unwrap();
        let mut builder = SpimiBuilder::new(dir.path(), 1 << 20).unwrap();
        builder
            .add_document(3, &terms(&["eco", "eco", "eco"]))
            .unwrap();
        builder.finish().unwrap();
        let dict = load_dictionary(dir.path()).unwrap();
        let mut post = File::open(dir.path().join(POST_FILE)).unwrap();
        assert_eq!(
            read_postings(&mut post, &dict.entries["eco"]).unwrap(),
            vec![(3, 3)]
        );
    }

    #[test]
    fn multi_block_merge_keeps_doc_order() {
        let dir = TempDir::new().unwrap();
        let mut builder = SpimiBuilder::new(dir.path(), 4096).unwrap();
        for doc in 0..200u64 {
            builder
                .add_document(doc, &terms(&["alpha", "beta"]))
                .unwrap();
        }
        builder.finish().unwrap();
        let dict = load_dictionary(dir.path()).unwrap();
        let mut post = File::open(dir.path().join(POST_FILE)).unwrap();
        let alpha = read_postings(&mut post, &dict.entries["alpha"]).unwrap();
        assert_eq!(alpha.len(), 200);
        assert!(alpha.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn empty_input_yields_empty_artifacts() {
        let dir = TempDir::new().unwrap();
        SpimiBuilder::new(dir.path(), 4096).unwrap().finish().unwrap();
        let dict = load_dictionary(dir.path()).unwrap();
        assert_eq!(dict.doc_count, 0);
        assert!(dict.entries.is_empty());
    }
}
