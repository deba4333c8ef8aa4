pub mod codec;
pub mod record_file;

pub use record_file::{RecordFile, Rid, RECORD_FILE};
