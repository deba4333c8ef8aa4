use crate::catalog::Schema;
use crate::config::Language;
use crate::error::OmnidexResult;
use crate::index::IndexKind;
use crate::media::extractor::ExtractorId;
use crate::utils::atomic_file;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const META_FILE: &str = "meta.json";

/// Which media family a multimedia table stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

/// The single primary index bound to a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexBinding {
    pub kind: IndexKind,
    /// Indexed field name(s): one for key indexes, one or two for rtree
    /// (a geo2d field, or a lat/lon float pair), one or more for spimi.
    pub fields: Vec<String>,
    pub unique: bool,
    /// Distances are Haversine kilometers when set (rtree only).
    pub geographic: bool,
}

/// Per-table manifest persisted as `meta.json` in the table directory.
/// Everything needed to reopen the table: layout, index binding and the
/// text/media parameters the artifacts were built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub schema: Schema,
    pub index: IndexBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<ExtractorId>,
}

impl TableMeta {
    pub fn save(&self, table_dir: &Path) -> OmnidexResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_file::write_atomic(&table_dir.join(META_FILE), &bytes)
    }

    pub fn load(table_dir: &Path) -> OmnidexResult<Self> {
        let bytes = fs::read(table_dir.join(META_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
