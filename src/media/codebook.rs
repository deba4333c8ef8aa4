use crate::config::MediaConfig;
use crate::error::{OmnidexError, OmnidexResult};
use crate::media::extractor::Descriptors;
use crate::utils::atomic_file;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CODEBOOK_FILE: &str = "codebook";

/// Training is seeded so a rebuilt table reproduces its codebook.
const TRAINING_SEED: u64 = 0x5EED_CB00;

/// The visual/acoustic vocabulary. Immutable once built: removing assets
/// never retrains it. For extractors that already yield one global vector
/// per asset the codebook is the identity and the vector is the histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Codebook {
    Identity {
        dim: usize,
    },
    KMeans {
        k: usize,
        dim: usize,
        /// Flat centroid arena: centroid `c` is `centroids[c*dim..(c+1)*dim]`.
        centroids: Vec<f32>,
    },
}

impl Codebook {
    /// Number of words a histogram spans.
    pub fn words(&self) -> usize {
        match self {
            Codebook::Identity { dim } => *dim,
            Codebook::KMeans { k, .. } => *k,
        }
    }

    pub fn save(&self, media_dir: &Path) -> OmnidexResult<()> {
        atomic_file::write_atomic(
            &media_dir.join(CODEBOOK_FILE),
            &bincode::serialize(self)?,
        )
    }

    pub fn load(media_dir: &Path) -> OmnidexResult<Self> {
        let bytes = std::fs::read(media_dir.join(CODEBOOK_FILE))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Train over a bounded random sample of descriptors drawn from all
    /// assets. `sets` holds each asset's local descriptors.
    pub fn train(sets: &[Vec<Vec<f32>>], config: &MediaConfig) -> OmnidexResult<Self> {
        let mut pool: Vec<&[f32]> = sets
            .iter()
            .flat_map(|set| set.iter().map(|v| v.as_slice()))
            .collect();
        let Some(dim) = pool.first().map(|v| v.len()) else {
            return Err(OmnidexError::Build(
                "no descriptors to train a codebook on".to_string(),
            ));
        };
        if pool.iter().any(|v| v.len() != dim) {
            return Err(OmnidexError::Build(
                "descriptors disagree on dimensionality".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(TRAINING_SEED);
        if pool.len() > config.training_sample {
            pool.shuffle(&mut rng);
            pool.truncate(config.training_sample);
        }
        let mut data = Vec::with_capacity(pool.len() * dim);
        for v in &pool {
            data.extend_from_slice(v);
        }
        let k = config.clusters.min(pool.len()).max(1);
        debug!(
            "codebook training: {} sampled descriptors, dim {}, k {}",
            pool.len(),
            dim,
            k
        );
        let centroids = kmeans(&data, dim, k, config.kmeans_iterations, &mut rng);
        Ok(Codebook::KMeans { k, dim, centroids })
    }

    /// Nearest-centroid word id for one descriptor.
    pub fn assign(&self, v: &[f32]) -> OmnidexResult<usize> {
        match self {
            Codebook::Identity { .. } => Err(OmnidexError::Internal(
                "identity codebook does not assign words".to_string(),
            )),
            Codebook::KMeans { k, dim, centroids } => {
                if v.len() != *dim {
                    return Err(OmnidexError::Build(format!(
                        "descriptor has dimension {}, codebook expects {}",
                        v.len(),
                        dim
                    )));
                }
                let mut best = 0usize;
                let mut best_dist = f32::MAX;
                for c in 0..*k {
                    let centroid = &centroids[c * dim..(c + 1) * dim];
                    let d = sq_dist(v, centroid);
                    if d < best_dist {
                        best_dist = d;
                        best = c;
                    }
                }
                Ok(best)
            }
        }
    }

    /// Bag-of-words histogram for one asset, ℓ₂-normalized, sparse
    /// `(word, value)` pairs in ascending word order.
    pub fn histogram(&self, descriptors: &Descriptors) -> OmnidexResult<Vec<(u32, f32)>> {
        let raw: Vec<(u32, f32)> = match (self, descriptors) {
            (Codebook::Identity { dim }, Descriptors::Global(v)) => {
                if v.len() != *dim {
                    return Err(OmnidexError::Build(format!(
                        "global vector has dimension {}, table expects {}",
                        v.len(),
                        dim
                    )));
                }
                v.iter()
                    .enumerate()
                    .filter(|(_, x)| **x != 0.0)
                    .map(|(i, x)| (i as u32, *x))
                    .collect()
            }
            (Codebook::KMeans { k, .. }, Descriptors::Local(set)) => {
                let mut counts = vec![0u32; *k];
                for v in set {
                    counts[self.assign(v)?] += 1;
                }
                counts
                    .into_iter()
                    .enumerate()
                    .filter(|(_, c)| *c > 0)
                    .map(|(i, c)| (i as u32, c as f32))
                    .collect()
            }
            (Codebook::Identity { .. }, Descriptors::Local(_)) => {
                return Err(OmnidexError::Build(
                    "local descriptors offered to a global-vector table".to_string(),
                ))
            }
            (Codebook::KMeans { .. }, Descriptors::Global(_)) => {
                return Err(OmnidexError::Build(
                    "global vector offered to a bag-of-words table".to_string(),
                ))
            }
        };
        Ok(l2_normalize(raw))
    }
}

pub fn l2_normalize(mut hist: Vec<(u32, f32)>) -> Vec<(u32, f32)> {
    let norm = hist
        .iter()
        .map(|(_, x)| (*x as f64) * (*x as f64))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        for (_, x) in hist.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
    hist
}

fn sq_dist(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

/// K-means with k-means++ initialization over a flat descriptor arena.
fn kmeans(data: &[f32], dim: usize, k: usize, iterations: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len() / dim;
    if n <= k {
        let mut centroids = vec![0.0f32; k * dim];
        centroids[..n * dim].copy_from_slice(&data[..n * dim]);
        return centroids;
    }

    // Seeding: first centroid uniform, the rest weighted by distance².
    let mut centroids = vec![0.0f32; k * dim];
    let first = rng.gen_range(0..n);
    centroids[..dim].copy_from_slice(&data[first * dim..(first + 1) * dim]);
    let mut min_dists = vec![f32::MAX; n];

    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        let mut total = 0.0f64;
        for i in 0..n {
            let point = &data[i * dim..(i + 1) * dim];
            let d = sq_dist(point, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }
        if total < 1e-30 {
            let idx = rng.gen_range(0..n);
            centroids[c * dim..(c + 1) * dim]
                .copy_from_slice(&data[idx * dim..(idx + 1) * dim]);
            continue;
        }
        let threshold = rng.gen_range(0.0..1.0) * total;
        let mut cumulative = 0.0f64;
        let mut chosen = n - 1;
        for (i, d) in min_dists.iter().enumerate() {
            cumulative += *d as f64;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids[c * dim..(c + 1) * dim]
            .copy_from_slice(&data[chosen * dim..(chosen + 1) * dim]);
    }

    // Lloyd refinement.
    let mut assignments = vec![0usize; n];
    for _ in 0..iterations {
        for i in 0..n {
            let point = &data[i * dim..(i + 1) * dim];
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for c in 0..k {
                let d = sq_dist(point, &centroids[c * dim..(c + 1) * dim]);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            assignments[i] = best;
        }

        let mut counts = vec![0u32; k];
        let mut sums = vec![0.0f32; k * dim];
        for i in 0..n {
            let c = assignments[i];
            counts[c] += 1;
            let point = &data[i * dim..(i + 1) * dim];
            let acc = &mut sums[c * dim..(c + 1) * dim];
            for d in 0..dim {
                acc[d] += point[d];
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for d in 0..dim {
                    centroids[c * dim + d] = sums[c * dim + d] / counts[c] as f32;
                }
            }
        }
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn clustered_sets() -> Vec<Vec<Vec<f32>>> {
        // Two tight clusters around (0,0) and (10,10).
        vec![
            vec![vec![0.0, 0.1], vec![0.1, 0.0], vec![-0.1, 0.1]],
            vec![vec![10.0, 10.1], vec![10.1, 9.9], vec![9.9, 10.0]],
        ]
    }

    fn small_config(k: usize) -> MediaConfig {
        MediaConfig {
            clusters: k,
            training_sample: 1000,
            kmeans_iterations: 10,
        }
    }

    #[test]
    fn kmeans_separates_obvious_clusters() {
        let sets = clustered_sets();
        let codebook = Codebook::train(&sets, &small_config(2)).unwrap();
        let near_origin = codebook.assign(&[0.05, 0.05]).unwrap();
        let near_ten = codebook.assign(&[10.0, 10.0]).unwrap();
        assert_ne!(near_origin, near_ten);
    }

    #[test]
    fn histogram_is_l2_normalized() {
        let sets = clustered_sets();
        let codebook = Codebook::train(&sets, &small_config(2)).unwrap();
        let hist = codebook
            .histogram(&Descriptors::Local(sets[0].clone()))
            .unwrap();
        let norm: f64 = hist.iter().map(|(_, x)| (*x as f64).powi(2)).sum();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn identity_codebook_passes_global_vectors_through() {
        let codebook = Codebook::Identity { dim: 4 };
        let hist = codebook
            .histogram(&Descriptors::Global(vec![3.0, 0.0, 4.0, 0.0]))
            .unwrap();
        assert_eq!(hist.len(), 2);
        assert!((hist[0].1 - 0.6).abs() < 1e-6);
        assert!((hist[1].1 - 0.8).abs() < 1e-6);
    }

    #[test]
    fn dimension_mismatch_is_a_build_error() {
        let codebook = Codebook::Identity { dim: 4 };
        assert!(matches!(
            codebook.histogram(&Descriptors::Global(vec![1.0, 2.0])),
            Err(OmnidexError::Build(_))
        ));
    }

    #[test]
    fn training_is_reproducible_and_persists() {
        let sets = clustered_sets();
        let a = Codebook::train(&sets, &small_config(2)).unwrap();
        let b = Codebook::train(&sets, &small_config(2)).unwrap();
        let (Codebook::KMeans { centroids: ca, .. }, Codebook::KMeans { centroids: cb, .. }) =
            (&a, &b)
        else {
            panic!("trained codebooks are k-means");
        };
        assert_eq!(ca, cb);

        let dir = TempDir::new().unwrap();
        a.save(dir.path()).unwrap();
        let loaded = Codebook::load(dir.path()).unwrap();
        assert_eq!(loaded.words(), 2);
    }
}
