use crate::config::SpimiConfig;
use crate::error::OmnidexResult;
use crate::storage::Rid;
use crate::text::spimi::{
    self, build_from_postings, load_dictionary, load_norms, Dictionary, SpimiBuilder, POST_FILE,
};
use crate::text::{idf_weight, tf_weight, Analyzer};
use crate::utils::atomic_file;
use crate::utils::cancel::CancelToken;
use crate::utils::topk::TopK;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const SPIMI_DIR: &str = "spimi";
const TOMB_FILE: &str = "tomb";

/// In-memory side index for documents inserted since the last merge.
#[derive(Debug, Default)]
struct DeltaIndex {
    postings: HashMap<String, Vec<(Rid, u32)>>,
    /// doc -> term frequencies, kept to recompute the doc's norm on demand.
    docs: HashMap<Rid, HashMap<String, u32>>,
}

/// The SPIMI-built text index plus its incremental machinery: queries
/// merge the persistent artifacts with the in-memory delta and consult the
/// tombstone set; once the delta grows past its threshold it is folded
/// into a fresh persistent index (which is also when dfs and norms shake
/// off tombstoned documents).
pub struct TextIndex {
    dir: PathBuf,
    config: SpimiConfig,
    analyzer: Analyzer,
    /// Declared text fields. With more than one, terms are additionally
    /// indexed as `field:term` so a query can scope to a single field.
    fields: Vec<String>,
    dict: Dictionary,
    norms: HashMap<Rid, f64>,
    post: Mutex<File>,
    delta: DeltaIndex,
    tombstones: HashSet<Rid>,
}

impl std::fmt::Debug for TextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextIndex")
            .field("dir", &self.dir)
            .field("fields", &self.fields)
            .field("terms", &self.dict.entries.len())
            .field("doc_count", &self.dict.doc_count)
            .field("delta_docs", &self.delta.docs.len())
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}

impl TextIndex {
    /// Build the persistent index from a stream of `(rid, field values)`
    /// where values align with `fields`, then open it.
    pub fn build(
        table_dir: &Path,
        config: SpimiConfig,
        fields: Vec<String>,
        docs: impl IntoIterator<Item = (Rid, Vec<String>)>,
    ) -> OmnidexResult<Self> {
        let dir = table_dir.join(SPIMI_DIR);
        let analyzer = Analyzer::new(config.language, config.stem);
        let mut builder = SpimiBuilder::new(&dir, config.block_memory_bytes)?;
        for (rid, values) in docs {
            let terms = doc_terms(&analyzer, &fields, &values);
            builder.add_document(rid, &terms)?;
        }
        builder.finish()?;
        Self::open(table_dir, config, fields)
    }

    pub fn open(
        table_dir: &Path,
        config: SpimiConfig,
        fields: Vec<String>,
    ) -> OmnidexResult<Self> {
        let dir = table_dir.join(SPIMI_DIR);
        let dict = load_dictionary(&dir)?;
        let norms = load_norms(&dir)?;
        let post = File::open(dir.join(POST_FILE))?;
        let tombstones = match fs::read(dir.join(TOMB_FILE)) {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(TextIndex {
            dir,
            analyzer: Analyzer::new(config.language, config.stem),
            config,
            fields,
            dict,
            norms,
            post: Mutex::new(post),
            delta: DeltaIndex::default(),
            tombstones,
        })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Live documents: persistent minus tombstoned, plus the delta.
    fn live_docs(&self) -> u64 {
        self.dict.doc_count + self.delta.docs.len() as u64 - self.tombstones.len() as u64
    }

    fn df(&self, term: &str) -> u32 {
        let persistent = self.dict.entries.get(term).map(|e| e.df).unwrap_or(0);
        let delta = self
            .delta
            .postings
            .get(term)
            .map(|p| p.len() as u32)
            .unwrap_or(0);
        persistent + delta
    }

    pub fn insert(&mut self, rid: Rid, values: &[String]) -> OmnidexResult<()> {
        let terms = doc_terms(&self.analyzer, &self.fields, values);
        let mut tf: HashMap<String, u32> = HashMap::new();
        for term in terms {
            *tf.entry(term).or_insert(0) += 1;
        }
        for (term, count) in &tf {
            self.delta
                .postings
                .entry(term.clone())
                .or_default()
                .push((rid, *count));
        }
        self.delta.docs.insert(rid, tf);
        if self.delta.docs.len() >= self.config.delta_merge_threshold {
            self.merge_delta()?;
        }
        Ok(())
    }

    /// Tombstone a document. Delta documents drop out entirely; persistent
    /// ones are filtered at query time until the next merge.
    pub fn remove(&mut self, rid: Rid) -> OmnidexResult<()> {
        if self.delta.docs.remove(&rid).is_some() {
            for postings in self.delta.postings.values_mut() {
                postings.retain(|(doc, _)| *doc != rid);
            }
            self.delta.postings.retain(|_, postings| !postings.is_empty());
            return Ok(());
        }
        if self.norms.contains_key(&rid) && self.tombstones.insert(rid) {
            self.persist_tombstones()?;
        }
        Ok(())
    }

    fn persist_tombstones(&self) -> OmnidexResult<()> {
        atomic_file::write_atomic(
            &self.dir.join(TOMB_FILE),
            &bincode::serialize(&self.tombstones)?,
        )
    }

    /// Fold the delta into the persistent index. Tombstoned documents are
    /// dropped and every df/norm is recomputed, which is also where idf
    /// catches up with deletions.
    pub fn merge_delta(&mut self) -> OmnidexResult<()> {
        let doc_count = self.live_docs();
        debug!(
            "text index merge: {} delta docs into {} persistent terms",
            self.delta.docs.len(),
            self.dict.entries.len()
        );
        let mut union: BTreeMap<String, Vec<(Rid, u32)>> = BTreeMap::new();
        {
            let mut post = self.post.lock();
            for (term, entry) in &self.dict.entries {
                let postings: Vec<(Rid, u32)> = spimi::read_postings(&mut post, entry)?
                    .into_iter()
                    .filter(|(doc, _)| !self.tombstones.contains(doc))
                    .collect();
                if !postings.is_empty() {
                    union.insert(term.clone(), postings);
                }
            }
        }
        for (term, postings) in std::mem::take(&mut self.delta.postings) {
            union.entry(term).or_default().extend(postings);
        }
        self.delta.docs.clear();

        build_from_postings(&self.dir, doc_count, union)?;
        self.dict = load_dictionary(&self.dir)?;
        self.norms = load_norms(&self.dir)?;
        *self.post.lock() = File::open(self.dir.join(POST_FILE))?;
        self.tombstones.clear();
        self.persist_tombstones()
    }

    fn delta_norm(&self, rid: Rid, doc_count: u64) -> f64 {
        let Some(tf_map) = self.delta.docs.get(&rid) else {
            return 0.0;
        };
        let mut sq = 0.0;
        for (term, tf) in tf_map {
            let w = tf_weight(*tf) * idf_weight(doc_count, self.df(term));
            sq += w * w;
        }
        sq.sqrt()
    }

    /// Rank documents by TF-IDF cosine similarity against the query text.
    /// `field_scope` narrows a multi-field index to one declared field.
    /// Ties resolve to the smaller doc id.
    pub fn query(
        &self,
        field_scope: Option<&str>,
        text: &str,
        k: usize,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<Vec<(Rid, f64)>> {
        let tokens = self.analyzer.tokenize(text);
        let tokens: Vec<String> = match field_scope {
            Some(field) if self.fields.len() > 1 => tokens
                .into_iter()
                .map(|t| format!("{}:{}", field.to_ascii_lowercase(), t))
                .collect(),
            _ => tokens,
        };
        let mut query_tf: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokens {
            *query_tf.entry(token).or_insert(0) += 1;
        }

        let doc_count = self.live_docs();
        let mut scores: HashMap<Rid, f64> = HashMap::new();
        for (term, tfq) in &query_tf {
            if let Some(token) = cancel {
                token.checkpoint()?;
            }
            let df = self.df(term);
            if df == 0 {
                continue;
            }
            let idf = idf_weight(doc_count, df);
            let wq = tf_weight(*tfq) * idf;
            if let Some(entry) = self.dict.entries.get(term) {
                let postings = {
                    let mut post = self.post.lock();
                    spimi::read_postings(&mut post, entry)?
                };
                for (doc, tf) in postings {
                    if self.tombstones.contains(&doc) {
                        continue;
                    }
                    *scores.entry(doc).or_insert(0.0) += wq * tf_weight(tf) * idf;
                }
            }
            if let Some(postings) = self.delta.postings.get(term) {
                for (doc, tf) in postings {
                    *scores.entry(*doc).or_insert(0.0) += wq * tf_weight(*tf) * idf;
                }
            }
        }

        let mut topk = TopK::new(k);
        for (doc, score) in scores {
            let norm = if self.delta.docs.contains_key(&doc) {
                self.delta_norm(doc, doc_count)
            } else {
                self.norms.get(&doc).copied().unwrap_or(0.0)
            };
            let cosine = if norm > 0.0 { score / norm } else { 0.0 };
            topk.push(doc, cosine);
        }
        Ok(topk.into_sorted())
    }
}

/// Terms for one document: the union of all text fields, plus per-field
/// qualified terms when the table declares more than one field.
fn doc_terms(analyzer: &Analyzer, fields: &[String], values: &[String]) -> Vec<String> {
    let joined = values.join(" ");
    let mut terms = analyzer.tokenize(&joined);
    if fields.len() > 1 {
        for (field, value) in fields.iter().zip(values.iter()) {
            let field = field.to_ascii_lowercase();
            for term in analyzer.tokenize(value) {
                terms.push(format!("{}:{}", field, term));
            }
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Language;
    use tempfile::TempDir;

    fn english_config() -> SpimiConfig {
        SpimiConfig {
            language: Language::English,
            stem: false,
            block_memory_bytes: 1 << 20,
            delta_merge_threshold: 1024,
        }
    }

    fn build_two_docs(dir: &Path) -> TextIndex {
        TextIndex::build(
            dir,
            english_config(),
            vec!["lyrics".to_string()],
            vec![
                (0, vec!["love and light".to_string()]),
                (1, vec!["light and shadow".to_string()]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn ranking_follows_tfidf_cosine() {
        let dir = TempDir::new().unwrap();
        let index = build_two_docs(dir.path());

        let hits = index.query(None, "light love", 10, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0, "the love document outranks shadow");
        assert!(hits[0].1 > hits[1].1);

        let hits = index.query(None, "shadow", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn delta_inserts_are_visible_without_a_merge() {
        let dir = TempDir::new().unwrap();
        let mut index = build_two_docs(dir.path());
        index
            .insert(2, vec!["shadow puppet".to_string()].as_slice())
            .unwrap();
        let hits = index.query(None, "puppet", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 2);
        // Both the persistent and the delta doc match "shadow".
        let hits = index.query(None, "shadow", 10, None).unwrap();
        let docs: Vec<Rid> = hits.iter().map(|(doc, _)| *doc).collect();
        assert!(docs.contains(&1) && docs.contains(&2));
    }

    #[test]
    fn tombstoned_documents_vanish_from_results() {
        let dir = TempDir::new().unwrap();
        let mut index = build_two_docs(dir.path());
        index.remove(1).unwrap();
        assert!(index.query(None, "shadow", 10, None).unwrap().is_empty());
        // Idempotent.
        index.remove(1).unwrap();
    }

    #[test]
    fn merge_folds_delta_and_drops_tombstones() {
        let dir = TempDir::new().unwrap();
        let mut index = build_two_docs(dir.path());
        index
            .insert(2, vec!["pure light".to_string()].as_slice())
            .unwrap();
        index.remove(0).unwrap();
        index.merge_delta().unwrap();

        assert_eq!(index.dict.doc_count, 2);
        assert!(index.query(None, "love", 10, None).unwrap().is_empty());
        let hits = index.query(None, "light", 10, None).unwrap();
        let docs: Vec<Rid> = hits.iter().map(|(doc, _)| *doc).collect();
        assert_eq!(docs, vec![1, 2]);
    }

    #[test]
    fn multi_field_queries_scope_with_field_prefix() {
        let dir = TempDir::new().unwrap();
        let index = TextIndex::build(
            dir.path(),
            english_config(),
            vec!["title".to_string(), "artist".to_string()],
            vec![
                (0, vec!["Blue Train".to_string(), "Coltrane".to_string()]),
                (1, vec!["Giant Steps".to_string(), "Blue Note".to_string()]),
            ],
        )
        .unwrap();

        // Unscoped: both documents mention "blue" somewhere.
        let hits = index.query(None, "blue", 10, None).unwrap();
        assert_eq!(hits.len(), 2);

        // Scoped to the title field: only doc 0.
        let hits = index.query(Some("title"), "blue", 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
    }

    #[test]
    fn reopen_preserves_query_results() {
        let dir = TempDir::new().unwrap();
        build_two_docs(dir.path());
        let index = TextIndex::open(
            dir.path(),
            english_config(),
            vec!["lyrics".to_string()],
        )
        .unwrap();
        let hits = index.query(None, "shadow", 10, None).unwrap();
        assert_eq!(hits[0].0, 1);
    }
}
