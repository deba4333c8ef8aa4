pub mod codebook;
pub mod extractor;
pub mod index;

pub use codebook::Codebook;
pub use extractor::{Descriptors, ExtractorId, FeatureExtractor};
pub use index::{MediaIndex, SearchMethod, MEDIA_DIR};
