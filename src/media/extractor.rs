use crate::error::OmnidexResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Identity of a feature extractor: name, version and parameters. Stored
/// in table metadata at build time; a query descriptor produced under a
/// different identity is rejected rather than silently mis-scored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorId {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl ExtractorId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        ExtractorId {
            name: name.into(),
            version: version.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// What an extractor yields for one asset: either a set of local
/// descriptors (SIFT-like, one vector per keypoint/frame) that go through
/// the codebook, or a single global vector used as the histogram directly.
#[derive(Debug, Clone)]
pub enum Descriptors {
    Local(Vec<Vec<f32>>),
    Global(Vec<f32>),
}

impl Descriptors {
    pub fn dimension(&self) -> Option<usize> {
        match self {
            Descriptors::Local(set) => set.first().map(|v| v.len()),
            Descriptors::Global(v) => Some(v.len()),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Descriptors::Global(_))
    }
}

/// The seam to the external feature-extraction collaborators. The engine
/// is blind to how vectors are produced; it only fixes their identity.
pub trait FeatureExtractor: Send + Sync {
    fn id(&self) -> ExtractorId;

    fn extract(&self, asset_path: &Path) -> OmnidexResult<Descriptors>;
}
