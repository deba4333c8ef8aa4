//! Omnidex is a self-contained multimodal database engine: tables bound to
//! delimited record files are served by a family of on-disk indexes
//! (sequential-with-auxiliary, two-level ISAM, extendible hashing, B+ tree,
//! R-tree), a SPIMI-built inverted text index with TF-IDF cosine ranking,
//! and a bag-of-words multimedia retrieval layer. A small SQL dialect
//! routes parsed statements to the table's primary index and rehydrates
//! matches from the record store.
//!
//! ```no_run
//! use omnidex::Engine;
//!
//! let engine = Engine::open("./data")?;
//! engine.execute(r#"CREATE TABLE students FROM FILE "s.csv" USING INDEX btree(id)"#)?;
//! let out = engine.execute(r#"SELECT * FROM students WHERE id = 42"#)?;
//! println!("{} rows in {:?}", out.count, out.elapsed);
//! # Ok::<(), omnidex::OmnidexError>(())
//! ```

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod ingest;
pub mod media;
pub mod sql;
pub mod storage;
pub mod text;
pub mod utils;

pub use engine::{Engine, QueryOutput, DEFAULT_LIMIT};
pub use error::{OmnidexError, OmnidexResult};
