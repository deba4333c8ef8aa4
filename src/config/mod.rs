use serde::{Deserialize, Serialize};

/// Tuning for the sequential-with-auxiliary index.
#[derive(Debug, Clone, Copy)]
pub struct SequentialConfig {
    /// Auxiliary entries tolerated before a rebuild, as a fraction of main.
    pub aux_factor: f64,
    /// Lower bound for the rebuild threshold so tiny tables batch a little.
    pub aux_min: usize,
}

impl Default for SequentialConfig {
    fn default() -> Self {
        SequentialConfig {
            aux_factor: 0.1,
            aux_min: 8,
        }
    }
}

impl SequentialConfig {
    pub fn rebuild_threshold(&self, main_len: usize) -> usize {
        ((main_len as f64 * self.aux_factor) as usize).max(self.aux_min)
    }
}

/// Tuning for the two-level ISAM index.
#[derive(Debug, Clone, Copy)]
pub struct IsamConfig {
    /// Blocking factor: entries per data page.
    pub blocking_factor: usize,
}

impl Default for IsamConfig {
    fn default() -> Self {
        IsamConfig {
            blocking_factor: 32,
        }
    }
}

/// Tuning for the extendible-hash index.
#[derive(Debug, Clone, Copy)]
pub struct HashConfig {
    /// Entries per bucket before a split.
    pub bucket_size: usize,
    /// Reject duplicate keys.
    pub unique: bool,
}

impl Default for HashConfig {
    fn default() -> Self {
        HashConfig {
            bucket_size: 32,
            unique: false,
        }
    }
}

/// Tuning for the B+ tree index.
#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Tree order m: internal fanout bound, m-1 keys per node.
    pub order: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig { order: 128 }
    }
}

/// Tuning for the R-tree index.
#[derive(Debug, Clone, Copy)]
pub struct RTreeConfig {
    /// Maximum entries per node before a quadratic split.
    pub max_entries: usize,
}

impl Default for RTreeConfig {
    fn default() -> Self {
        RTreeConfig { max_entries: 16 }
    }
}

/// Language profile for text normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Spanish,
    English,
}

impl Default for Language {
    fn default() -> Self {
        Language::Spanish
    }
}

/// Tuning for the SPIMI text index.
#[derive(Debug, Clone, Copy)]
pub struct SpimiConfig {
    pub language: Language,
    /// Apply Snowball stemming after stopword removal.
    pub stem: bool,
    /// Approximate bytes of in-memory postings before a block spill.
    pub block_memory_bytes: usize,
    /// Delta documents tolerated before merging into the persistent index.
    pub delta_merge_threshold: usize,
}

impl Default for SpimiConfig {
    fn default() -> Self {
        SpimiConfig {
            language: Language::default(),
            stem: false,
            block_memory_bytes: 16 * 1024 * 1024,
            delta_merge_threshold: 1024,
        }
    }
}

/// Tuning for the multimedia index.
#[derive(Debug, Clone, Copy)]
pub struct MediaConfig {
    /// Codebook size (visual/acoustic words).
    pub clusters: usize,
    /// Upper bound on descriptors sampled for k-means training.
    pub training_sample: usize,
    /// k-means refinement iterations.
    pub kmeans_iterations: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            clusters: 256,
            training_sample: 50_000,
            kmeans_iterations: 20,
        }
    }
}
