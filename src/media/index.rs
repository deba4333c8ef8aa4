use crate::error::{OmnidexError, OmnidexResult};
use crate::media::codebook::Codebook;
use crate::media::extractor::Descriptors;
use crate::storage::Rid;
use crate::text::idf_weight;
use crate::utils::atomic_file;
use crate::utils::cancel::CancelToken;
use crate::utils::topk::TopK;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

pub const MEDIA_DIR: &str = "mm";
const HIST_FILE: &str = "hist";
const INV_FILE: &str = "inv";

/// Which kNN enumeration strategy a similarity query uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    /// Score every live asset.
    Sequential,
    /// Score only assets sharing a non-zero word with the query. Returns
    /// the same ranking: cosine is zero on disjoint supports.
    Inverted,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InvertedFile {
    /// word -> number of assets with that word non-zero (as built; shakes
    /// off tombstones only at rebuild).
    df: HashMap<u32, u32>,
    /// word -> [(asset, normalized histogram value)]
    postings: HashMap<u32, Vec<(Rid, f32)>>,
    tombstones: HashSet<Rid>,
}

/// Bag-of-words retrieval over one table's assets: ℓ₂-normalized
/// histograms, an inverted file over non-zero words, and cosine kNN with
/// idf weighting. Both enumeration paths share one scoring definition, so
/// they rank identically; for identity codebooks (dense global vectors,
/// where df ≈ N would zero every component) idf is flat.
#[derive(Debug)]
pub struct MediaIndex {
    dir: PathBuf,
    codebook: Codebook,
    histograms: BTreeMap<Rid, Vec<(u32, f32)>>,
    inv: InvertedFile,
}

impl MediaIndex {
    pub fn build(
        table_dir: &Path,
        codebook: Codebook,
        assets: impl IntoIterator<Item = (Rid, Descriptors)>,
    ) -> OmnidexResult<Self> {
        let dir = table_dir.join(MEDIA_DIR);
        std::fs::create_dir_all(&dir)?;
        let mut index = MediaIndex {
            dir,
            codebook,
            histograms: BTreeMap::new(),
            inv: InvertedFile::default(),
        };
        for (rid, descriptors) in assets {
            index.add_asset(rid, &descriptors)?;
        }
        debug!(
            "media index built: {} assets, {} distinct words",
            index.histograms.len(),
            index.inv.postings.len()
        );
        index.codebook.save(&index.dir)?;
        index.persist()?;
        Ok(index)
    }

    pub fn open(table_dir: &Path) -> OmnidexResult<Self> {
        let dir = table_dir.join(MEDIA_DIR);
        let codebook = Codebook::load(&dir)?;
        let histograms = bincode::deserialize(&std::fs::read(dir.join(HIST_FILE))?)?;
        let inv = bincode::deserialize(&std::fs::read(dir.join(INV_FILE))?)?;
        Ok(MediaIndex {
            dir,
            codebook,
            histograms,
            inv,
        })
    }

    pub fn persist(&self) -> OmnidexResult<()> {
        atomic_file::write_atomic(
            &self.dir.join(HIST_FILE),
            &bincode::serialize(&self.histograms)?,
        )?;
        atomic_file::write_atomic(&self.dir.join(INV_FILE), &bincode::serialize(&self.inv)?)
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    pub fn histogram(&self, descriptors: &Descriptors) -> OmnidexResult<Vec<(u32, f32)>> {
        self.codebook.histogram(descriptors)
    }

    fn add_asset(&mut self, rid: Rid, descriptors: &Descriptors) -> OmnidexResult<()> {
        let hist = self.codebook.histogram(descriptors)?;
        for (word, value) in &hist {
            *self.inv.df.entry(*word).or_insert(0) += 1;
            self.inv
                .postings
                .entry(*word)
                .or_default()
                .push((rid, *value));
        }
        self.histograms.insert(rid, hist);
        Ok(())
    }

    /// Insert an asset against the existing (immutable) codebook.
    pub fn insert(&mut self, rid: Rid, descriptors: &Descriptors) -> OmnidexResult<()> {
        if self.histograms.contains_key(&rid) {
            return Err(OmnidexError::Internal(format!(
                "asset {} already indexed",
                rid
            )));
        }
        self.inv.tombstones.remove(&rid);
        self.add_asset(rid, descriptors)
    }

    /// Tombstone an asset. The codebook is never refit; dfs stay as built
    /// until the next full rebuild.
    pub fn remove(&mut self, rid: Rid) -> bool {
        if self.histograms.contains_key(&rid) {
            self.inv.tombstones.insert(rid)
        } else {
            false
        }
    }

    pub fn live_assets(&self) -> u64 {
        (self.histograms.len() - self.inv.tombstones.len()) as u64
    }

    fn is_live(&self, rid: Rid) -> bool {
        !self.inv.tombstones.contains(&rid)
    }

    /// Word weight multiplier shared by every scoring site.
    fn word_idf(&self, word: u32, live: u64) -> f64 {
        match self.codebook {
            Codebook::Identity { .. } => 1.0,
            Codebook::KMeans { .. } => {
                idf_weight(live, self.inv.df.get(&word).copied().unwrap_or(0))
            }
        }
    }

    fn weighted_norm(&self, hist: &[(u32, f32)], live: u64) -> f64 {
        hist.iter()
            .map(|(word, value)| {
                let w = *value as f64 * self.word_idf(*word, live);
                w * w
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Idf-weighted cosine between the query histogram and one asset.
    fn cosine(
        &self,
        query: &[(u32, f32)],
        query_norm: f64,
        hist: &[(u32, f32)],
        live: u64,
    ) -> f64 {
        if query_norm == 0.0 {
            return 0.0;
        }
        let hist_norm = self.weighted_norm(hist, live);
        if hist_norm == 0.0 {
            return 0.0;
        }
        let mut dot = 0.0f64;
        let (mut i, mut j) = (0, 0);
        while i < query.len() && j < hist.len() {
            match query[i].0.cmp(&hist[j].0) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    let idf = self.word_idf(query[i].0, live);
                    dot += (query[i].1 as f64 * idf) * (hist[j].1 as f64 * idf);
                    i += 1;
                    j += 1;
                }
            }
        }
        dot / (query_norm * hist_norm)
    }

    pub fn knn(
        &self,
        query: &[(u32, f32)],
        k: usize,
        method: SearchMethod,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<Vec<(Rid, f64)>> {
        match method {
            SearchMethod::Sequential => self.knn_sequential(query, k, cancel),
            SearchMethod::Inverted => self.knn_inverted(query, k, cancel),
        }
    }

    /// Exhaustive cosine over every live asset.
    fn knn_sequential(
        &self,
        query: &[(u32, f32)],
        k: usize,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<Vec<(Rid, f64)>> {
        let live = self.live_assets();
        let query_norm = self.weighted_norm(query, live);
        let mut topk = TopK::new(k);
        for (rid, hist) in &self.histograms {
            if let Some(token) = cancel {
                token.checkpoint()?;
            }
            if !self.is_live(*rid) {
                continue;
            }
            topk.push(*rid, self.cosine(query, query_norm, hist, live));
        }
        Ok(topk.into_sorted())
    }

    /// Inverted-file kNN: only assets sharing at least one non-zero word
    /// with the query are scored. When that candidate set cannot fill the
    /// top-k (or only at score zero), the remaining live assets are pushed
    /// at zero so the ranking matches the sequential path exactly.
    fn knn_inverted(
        &self,
        query: &[(u32, f32)],
        k: usize,
        cancel: Option<&CancelToken>,
    ) -> OmnidexResult<Vec<(Rid, f64)>> {
        let live = self.live_assets();
        let query_norm = self.weighted_norm(query, live);
        let mut candidates: HashSet<Rid> = HashSet::new();
        for (word, _) in query {
            if let Some(token) = cancel {
                token.checkpoint()?;
            }
            if let Some(postings) = self.inv.postings.get(word) {
                for (rid, _) in postings {
                    if self.is_live(*rid) {
                        candidates.insert(*rid);
                    }
                }
            }
        }

        let mut topk = TopK::new(k);
        for rid in &candidates {
            let hist = &self.histograms[rid];
            topk.push(*rid, self.cosine(query, query_norm, hist, live));
        }
        if topk.threshold().map_or(true, |t| t <= 0.0) {
            for rid in self.histograms.keys() {
                if self.is_live(*rid) && !candidates.contains(rid) {
                    topk.push(*rid, 0.0);
                }
            }
        }
        Ok(topk.into_sorted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use tempfile::TempDir;

    /// Spec-style fixture: a codebook of 8 words and three unit histograms
    /// h1=(1,0,..), h2=(0,1,..), h3=(1,1,0,..)/√2 via global vectors.
    fn unit_fixture(dir: &Path) -> MediaIndex {
        let inv = 1.0 / 2.0f32.sqrt();
        MediaIndex::build(
            dir,
            Codebook::Identity { dim: 8 },
            vec![
                (0, Descriptors::Global(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
                (1, Descriptors::Global(vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
                (2, Descriptors::Global(vec![inv, inv, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn inverted_and_sequential_rank_identically() {
        let dir = TempDir::new().unwrap();
        let index = unit_fixture(dir.path());
        let query = vec![(0u32, 1.0f32)];

        let sequential = index.knn(&query, 3, SearchMethod::Sequential, None).unwrap();
        let inverted = index.knn(&query, 3, SearchMethod::Inverted, None).unwrap();

        let seq_ids: Vec<Rid> = sequential.iter().map(|(rid, _)| *rid).collect();
        let inv_ids: Vec<Rid> = inverted.iter().map(|(rid, _)| *rid).collect();
        assert_eq!(seq_ids, vec![0, 2, 1]);
        assert_eq!(seq_ids, inv_ids);
        for (a, b) in sequential.iter().zip(inverted.iter()) {
            assert!((a.1 - b.1).abs() < 1e-12);
        }
    }

    #[test]
    fn cosine_scores_match_geometry() {
        let dir = TempDir::new().unwrap();
        let index = unit_fixture(dir.path());
        let query = vec![(0u32, 1.0f32)];
        let hits = index.knn(&query, 3, SearchMethod::Sequential, None).unwrap();
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert!((hits[1].1 - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(hits[2].1.abs() < 1e-12);
    }

    #[test]
    fn tombstoned_assets_leave_both_paths() {
        let dir = TempDir::new().unwrap();
        let mut index = unit_fixture(dir.path());
        assert!(index.remove(2));
        assert!(!index.remove(2) || index.live_assets() == 2);
        let query = vec![(0u32, 1.0f32)];
        for method in [SearchMethod::Sequential, SearchMethod::Inverted] {
            let ids: Vec<Rid> = index
                .knn(&query, 3, method, None)
                .unwrap()
                .iter()
                .map(|(rid, _)| *rid)
                .collect();
            assert_eq!(ids, vec![0, 1]);
        }
    }

    #[test]
    fn bag_of_words_end_to_end() {
        let dir = TempDir::new().unwrap();
        let sets = vec![
            vec![vec![0.0f32, 0.0], vec![0.1, 0.1]],
            vec![vec![10.0, 10.0], vec![10.1, 9.9]],
            vec![vec![0.0, 0.1], vec![10.0, 10.1]],
        ];
        let codebook = Codebook::train(
            &sets,
            &MediaConfig {
                clusters: 2,
                training_sample: 100,
                kmeans_iterations: 10,
            },
        )
        .unwrap();
        let index = MediaIndex::build(
            dir.path(),
            codebook,
            sets.iter()
                .cloned()
                .enumerate()
                .map(|(i, set)| (i as Rid, Descriptors::Local(set))),
        )
        .unwrap();

        // Query near the origin cluster: asset 0 first, the mixed asset 2
        // over the far asset 1; both paths agree.
        let query = index
            .histogram(&Descriptors::Local(vec![vec![0.05f32, 0.05]]))
            .unwrap();
        let seq = index.knn(&query, 3, SearchMethod::Sequential, None).unwrap();
        let inv = index.knn(&query, 3, SearchMethod::Inverted, None).unwrap();
        assert_eq!(seq[0].0, 0);
        assert_eq!(
            seq.iter().map(|(r, _)| *r).collect::<Vec<_>>(),
            inv.iter().map(|(r, _)| *r).collect::<Vec<_>>()
        );
    }

    #[test]
    fn insert_after_build_uses_the_frozen_codebook() {
        let dir = TempDir::new().unwrap();
        let mut index = unit_fixture(dir.path());
        index
            .insert(
                7,
                &Descriptors::Global(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            )
            .unwrap();
        let query = vec![(0u32, 1.0f32)];
        let hits = index.knn(&query, 2, SearchMethod::Inverted, None).unwrap();
        let ids: Vec<Rid> = hits.iter().map(|(rid, _)| *rid).collect();
        // Identical vectors tie at 1.0; the smaller rid wins.
        assert_eq!(ids, vec![0, 7]);
    }

    #[test]
    fn persist_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = unit_fixture(dir.path());
            index.remove(1);
            index.persist().unwrap();
        }
        let index = MediaIndex::open(dir.path()).unwrap();
        assert_eq!(index.live_assets(), 2);
        let query = vec![(1u32, 1.0f32)];
        let ids: Vec<Rid> = index
            .knn(&query, 3, SearchMethod::Sequential, None)
            .unwrap()
            .iter()
            .map(|(rid, _)| *rid)
            .collect();
        // Asset 1 is tombstoned; only the mixed asset shares word 1.
        assert_eq!(ids, vec![2, 0]);
    }
}
