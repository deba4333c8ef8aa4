pub mod parser;
pub mod token;

pub use parser::{parse, parse_point, Literal, Predicate, SpatialParam, Statement};
