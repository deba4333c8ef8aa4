mod meta;
mod schema;

pub use meta::{IndexBinding, MediaKind, TableMeta, META_FILE};
pub use schema::{Column, DataType, Schema};
